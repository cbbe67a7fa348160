/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The shadow node tree. Nodes are arena-allocated and identified by
//! [NodeId]; a node is exclusively owned by its parent and symlinks are
//! plain target strings, never back-edges, so the tree stays acyclic.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::Local;
use chrono::NaiveDateTime;
use chrono::TimeZone;
use nix::sys::stat::FileStat;
use nix::sys::stat::Mode;
use nix::sys::stat::SFlag;
use nix::sys::time::TimeVal;

use crate::nix_io;
use crate::now_secs;
use crate::Error;
use crate::FileFormat;
use crate::Meta;
use crate::PathPolicy;
use crate::Result;

const UTIME_FORMAT: &str = "%Y%m%d%H%M.%S";
const COPY_CHUNK: usize = 16 * 1024;

/// Index of a node in the shadow tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// The root of every [ShadowFs].
pub const ROOT: NodeId = NodeId(0);

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    name: String,
    children: BTreeMap<String, NodeId>,
    link: Option<String>,
    meta: Meta,
}

/// The shadow filesystem: an arena of nodes rooted at `/`, the write-policy
/// gate, and the syscall/access counters.
pub struct ShadowFs {
    nodes: Vec<Node>,
    policy: PathPolicy,
    statcalls: u64,
    accesses: u64,
}

impl ShadowFs {
    pub fn new(policy: PathPolicy) -> Result<Self> {
        let mut fs = Self {
            nodes: vec![Node {
                parent: None,
                name: String::new(),
                children: BTreeMap::new(),
                link: None,
                meta: Meta::fresh(),
            }],
            policy,
            statcalls: 0,
            accesses: 0,
        };
        fs.refresh(ROOT)?;
        Ok(fs)
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: PathPolicy) {
        self.policy = policy;
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn meta(&self, id: NodeId) -> Meta {
        self.node(id).meta
    }

    pub fn format(&self, id: NodeId) -> FileFormat {
        self.node(id).meta.format()
    }

    pub fn exists(&self, id: NodeId) -> bool {
        self.node(id).meta.exists()
    }

    pub fn link(&self, id: NodeId) -> Option<&str> {
        self.node(id).link.as_deref()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Full path of a node: its parent chain joined with `/`. The root's
    /// path is `/`.
    pub fn path(&self, id: NodeId) -> String {
        let mut node = id;
        let mut path = self.node(id).name.clone();
        while let Some(parent) = self.node(node).parent {
            path = format!("{}/{}", self.node(parent).name, path);
            node = parent;
        }
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        path
    }

    pub fn statcalls(&self) -> u64 {
        self.statcalls
    }

    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    /// Nodes reachable from the root.
    pub fn instances(&self) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            total += 1;
            stack.extend(self.node(id).children.values().copied());
        }
        total
    }

    /// Percentage of lookups served from the cache.
    pub fn hit_ratio(&self) -> f64 {
        if self.accesses == 0 {
            100.0
        } else {
            100.0 - (100.0 * self.statcalls as f64) / self.accesses as f64
        }
    }

    fn os_lstat(&mut self, path: &str) -> Result<Option<FileStat>> {
        self.statcalls += 1;
        self.policy.readable(Some(path), None);
        tracing::trace!("lstat {path}");
        match nix::sys::stat::lstat(Path::new(path)) {
            Ok(st) => Ok(Some(st)),
            Err(nix::errno::Errno::ENOENT) => Ok(None),
            Err(e) => Err(Error::Syscall {
                cmd: format!("lstat {path:?}"),
                source: nix_io(e),
            }),
        }
    }

    fn write_call<T>(
        &mut self,
        path: &str,
        cmd: &str,
        f: impl FnOnce() -> std::io::Result<T>,
    ) -> Result<Option<T>> {
        if self.policy.writable(Some(path), Some(cmd))? {
            f().map(Some).map_err(|e| Error::Syscall {
                cmd: cmd.to_string(),
                source: e,
            })
        } else {
            Ok(None)
        }
    }

    fn new_child(&mut self, parent: NodeId, name: &str, meta: Meta) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: Some(parent),
            name: name.to_string(),
            children: BTreeMap::new(),
            link: None,
            meta,
        });
        self.node_mut(parent).children.insert(name.to_string(), id);
        if meta.format() == FileFormat::Symlink && meta.exists() {
            let path = self.path(id);
            let target = std::fs::read_link(&path)?;
            self.node_mut(id).link = Some(target.to_string_lossy().into_owned());
        }
        Ok(id)
    }

    /// Walk `path` from `base`. Absolute paths restart at `root`, `..` stops
    /// at `root`, and symlink segments are resolved relative to their parent
    /// node. `links` carries the set of symlink nodes already followed;
    /// revisiting one is a resolution cycle.
    fn walk(
        &mut self,
        base: Option<NodeId>,
        root: NodeId,
        path: &str,
        links: &mut HashSet<NodeId>,
    ) -> Result<Option<NodeId>> {
        self.accesses += 1;
        let mut node = if path.starts_with('/') { Some(root) } else { base };
        for name in path.split('/') {
            let Some(mut cur) = node else { break };
            if self.node(cur).link.is_some() {
                if !links.insert(cur) {
                    return Err(Error::SymlinkLoop {
                        path: self.path(cur),
                        unreachable: path.to_string(),
                    });
                }
                let target = self.node(cur).link.clone().unwrap_or_default();
                let parent = self.node(cur).parent.unwrap_or(root);
                match self.walk(Some(parent), root, &target, links)? {
                    Some(n) => cur = n,
                    None => {
                        node = None;
                        break;
                    }
                }
            }
            if name.is_empty() || name == "." {
                node = Some(cur);
            } else if let Some(&child) = self.node(cur).children.get(name) {
                node = Some(child);
            } else if name == ".." {
                node = Some(if cur == root {
                    cur
                } else {
                    self.node(cur).parent.unwrap_or(root)
                });
            } else {
                let child_path = join(&self.path(cur), name);
                node = match self.os_lstat(&child_path)? {
                    Some(st) => Some(self.new_child(cur, name, Meta::from_stat(&st))?),
                    None => None,
                };
            }
        }
        Ok(node)
    }

    /// Soft lookup: `None` when the path does not exist.
    pub fn lookup(&mut self, base: NodeId, path: &str) -> Result<Option<NodeId>> {
        let mut links = HashSet::new();
        self.walk(Some(base), base, path, &mut links)
    }

    /// Lookup that plans the final component if missing: the parent chain
    /// must exist, and a new placeholder node carrying only `fmt`'s type
    /// bits is created for an absent last segment. An existing node of a
    /// different format is an error.
    pub fn lookup_default(&mut self, base: NodeId, path: &str, fmt: FileFormat) -> Result<NodeId> {
        let mut links = HashSet::new();
        let (head, tail) = split_path(path);
        let head_node = self.walk(Some(base), base, head, &mut links)?;
        let head_node = match head_node {
            Some(h) if self.node(h).link.is_some() => self.walk(Some(h), base, "", &mut links)?,
            other => other,
        };
        let Some(head_node) = head_node else {
            return Err(Error::NotFound(head.to_string()));
        };
        let node = if tail.is_empty() {
            head_node
        } else {
            match self.walk(Some(head_node), base, tail, &mut links)? {
                Some(n) => n,
                None => {
                    let meta = Meta {
                        mode: fmt.bits(),
                        ..Meta::fresh()
                    };
                    self.new_child(head_node, tail, meta)?
                }
            }
        };
        if fmt != FileFormat::None && self.format(node) != fmt {
            return Err(Error::FormatMismatch {
                path: self.path(node),
                expected: fmt.as_str(),
                actual: self.format(node).as_str(),
            });
        }
        Ok(node)
    }

    /// Like [lookup](Self::lookup) but follows a trailing symlink.
    pub fn resolve(&mut self, base: NodeId, path: &str) -> Result<Option<NodeId>> {
        let mut links = HashSet::new();
        match self.walk(Some(base), base, path, &mut links)? {
            None => Ok(None),
            Some(n) => self.walk(Some(n), base, "", &mut links),
        }
    }

    /// Follow a node's symlink (if it is one) to its final target,
    /// resolving absolute targets against the tree root. Non-symlink nodes
    /// resolve to themselves.
    pub fn resolve_node(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        let mut links = HashSet::new();
        self.walk(Some(id), ROOT, "", &mut links)
    }

    /// Union of the on-disk directory listing and the already materialized
    /// children, sorted. A missing directory contributes only the children.
    pub fn list_dir(&mut self, id: NodeId) -> Result<Vec<String>> {
        let path = self.path(id);
        self.policy.readable(Some(&path), None);
        let mut entries = BTreeSet::new();
        match std::fs::read_dir(&path) {
            Ok(iter) => {
                for entry in iter {
                    entries.insert(entry?.file_name().to_string_lossy().into_owned());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        entries.extend(self.node(id).children.keys().cloned());
        Ok(entries.into_iter().collect())
    }

    pub fn list_dir_at(&mut self, base: NodeId, path: &str) -> Result<Vec<String>> {
        match self.resolve(base, path)? {
            Some(id) => self.list_dir(id),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    /// Create the directory if the node does not exist yet, otherwise
    /// reconcile permissions. Ownership arguments of `None` leave the
    /// corresponding attribute unchanged.
    pub fn mkdir(
        &mut self,
        id: NodeId,
        mode: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        let mode = mode & 0o7777;
        if !self.exists(id) {
            let path = self.path(id);
            let cmd = format!("mkdir -m {mode:o} {path:?}");
            let p = path.clone();
            self.write_call(&path, &cmd, move || {
                nix::unistd::mkdir(Path::new(&p), Mode::from_bits_truncate(mode)).map_err(nix_io)
            })?;
            let node = self.node_mut(id);
            node.meta.mode = node.meta.format().bits() | mode;
        } else if self.format(id) == FileFormat::Directory {
            self.chmod(id, mode)?;
        } else {
            return Err(Error::FormatMismatch {
                path: self.path(id),
                expected: FileFormat::Directory.as_str(),
                actual: self.format(id).as_str(),
            });
        }
        self.chown(id, uid, gid)
    }

    pub fn mkdir_at(
        &mut self,
        base: NodeId,
        path: &str,
        mode: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<NodeId> {
        let id = self.lookup_default(base, path, FileFormat::Directory)?;
        self.mkdir(id, mode, uid, gid)?;
        Ok(id)
    }

    /// Idempotent recursive mkdir along `path`.
    pub fn make_dirs(&mut self, base: NodeId, path: &str, mode: u32) -> Result<NodeId> {
        let mode = mode & 0o7777;
        let mut links = HashSet::new();
        let mut node = base;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            node = match self.walk(Some(node), base, name, &mut links)? {
                Some(child) => child,
                None => self.mkdir_at(node, name, mode, None, None)?,
            };
        }
        Ok(node)
    }

    /// Make `id` a symlink to `target`, creating it on disk when missing.
    pub fn symlink(&mut self, id: NodeId, target: &str) -> Result<()> {
        if !self.exists(id) || self.link(id) != Some(target) {
            let path = self.path(id);
            let cmd = format!("ln -sf {target:?} {path:?}");
            let (t, p) = (target.to_string(), path.clone());
            self.write_call(&path, &cmd, move || std::os::unix::fs::symlink(&t, &p))?;
            let node = self.node_mut(id);
            node.meta.mode = FileFormat::Symlink.bits() | 0o777;
            node.meta.size = target.len() as u64;
            node.link = Some(target.to_string());
        }
        Ok(())
    }

    pub fn symlink_at(&mut self, base: NodeId, path: &str, target: &str) -> Result<NodeId> {
        let id = self.lookup_default(base, path, FileFormat::Symlink)?;
        self.symlink(id, target)?;
        Ok(id)
    }

    /// Create a character or block device node (selected by the file-type
    /// bits of `mode`). An existing node must match type and device number.
    pub fn mknod(&mut self, id: NodeId, mode: u32, rdev: u64) -> Result<()> {
        let fmt = FileFormat::from_mode(mode);
        if !self.exists(id) {
            let path = self.path(id);
            let devtype = match fmt {
                FileFormat::CharDevice => "c",
                FileFormat::BlockDevice => "b",
                _ => "?",
            };
            let cmd = format!(
                "mknod -m {:o} {:?} {} {} {}",
                mode & 0o7777,
                path,
                devtype,
                nix::sys::stat::major(rdev),
                nix::sys::stat::minor(rdev),
            );
            let p = path.clone();
            self.write_call(&path, &cmd, move || {
                nix::sys::stat::mknod(
                    Path::new(&p),
                    SFlag::from_bits_truncate(mode & SFlag::S_IFMT.bits()),
                    Mode::from_bits_truncate(mode),
                    rdev,
                )
                .map_err(nix_io)
            })?;
            let node = self.node_mut(id);
            node.meta.mode = mode;
            node.meta.rdev = rdev;
        } else {
            if self.format(id) != fmt {
                return Err(Error::FormatMismatch {
                    path: self.path(id),
                    expected: fmt.as_str(),
                    actual: self.format(id).as_str(),
                });
            }
            if self.meta(id).rdev != rdev {
                return Err(Error::DeviceMismatch {
                    path: self.path(id),
                    expected: rdev,
                    actual: self.meta(id).rdev,
                });
            }
            self.chmod(id, mode)?;
        }
        Ok(())
    }

    pub fn mknod_at(&mut self, base: NodeId, path: &str, mode: u32, rdev: u64) -> Result<NodeId> {
        let id = self.lookup_default(base, path, FileFormat::from_mode(mode))?;
        self.mknod(id, mode, rdev)?;
        Ok(id)
    }

    /// Byte-for-byte copy of a regular file in 16 KiB chunks. Ungated; used
    /// by [copy2](Self::copy2) under the write gate.
    pub fn copy_data(&mut self, src: NodeId, dst: NodeId) -> Result<u64> {
        if src == dst {
            return Ok(0);
        }
        copy_chunks(&self.path(src), &self.path(dst)).map_err(Error::Io)
    }

    /// Copy data and metadata of a regular file: contents, then ownership,
    /// mode, flags and timestamps. Verifies the cache against the disk
    /// afterwards.
    pub fn copy2(&mut self, src: NodeId, dst: NodeId) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        if self.format(src) != FileFormat::Regular {
            return Err(Error::FormatMismatch {
                path: self.path(src),
                expected: FileFormat::Regular.as_str(),
                actual: self.format(src).as_str(),
            });
        }
        if self.exists(dst) && self.format(dst) != FileFormat::Regular {
            return Err(Error::FormatMismatch {
                path: self.path(dst),
                expected: FileFormat::Regular.as_str(),
                actual: self.format(dst).as_str(),
            });
        }
        let src_meta = self.meta(src);
        let src_path = self.path(src);
        let dst_path = self.path(dst);
        let cmd = format!("cp -p {src_path} {dst_path}");
        {
            let node = self.node_mut(dst);
            node.meta.size = src_meta.size;
            node.meta.uid = src_meta.uid;
            node.meta.gid = src_meta.gid;
            node.meta.flags = src_meta.flags;
            node.meta.mode = src_meta.mode;
            node.meta.atime = src_meta.atime;
            node.meta.mtime = src_meta.mtime;
        }
        let (s, d) = (src_path.clone(), dst_path.clone());
        let copied = self.write_call(&dst_path, &cmd, move || copy_chunks(&s, &d))?;
        if let Some(bytes) = copied {
            tracing::trace!("copied {bytes} bytes {src_path} -> {dst_path}");
        }
        if copied.is_some() {
            let syscall = |e: std::io::Error| Error::Syscall {
                cmd: cmd.clone(),
                source: e,
            };
            std::os::unix::fs::lchown(&dst_path, Some(src_meta.uid), Some(src_meta.gid))
                .map_err(syscall)?;
            std::fs::set_permissions(
                &dst_path,
                std::fs::Permissions::from_mode(src_meta.perm()),
            )
            .map_err(syscall)?;
            nix::sys::stat::utimes(
                Path::new(&dst_path),
                &timeval(src_meta.atime),
                &timeval(src_meta.mtime),
            )
            .map_err(|e| syscall(nix_io(e)))?;
            self.check_cache(dst)?;
        }
        Ok(())
    }

    /// `cp -p src dst` through the cache.
    pub fn cp_p(&mut self, base: NodeId, src: &str, dst: &str) -> Result<NodeId> {
        let src_id = self
            .lookup(base, src)?
            .ok_or_else(|| Error::NotFound(src.to_string()))?;
        let dst_id = self.lookup_default(base, dst, self.format(src_id))?;
        self.copy2(src_id, dst_id)?;
        Ok(dst_id)
    }

    /// Unlink a non-directory and clear its node.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        if self.format(id) == FileFormat::Directory {
            return Err(Error::FormatMismatch {
                path: self.path(id),
                expected: "non-dir",
                actual: FileFormat::Directory.as_str(),
            });
        }
        let path = self.path(id);
        let cmd = format!("rm -f {path:?}");
        let p = path.clone();
        self.write_call(&path, &cmd, move || std::fs::remove_file(&p))?;
        self.clear(id);
        Ok(())
    }

    /// Remove an empty directory and clear its node.
    pub fn rmdir(&mut self, id: NodeId) -> Result<()> {
        if self.format(id) != FileFormat::Directory {
            return Err(Error::FormatMismatch {
                path: self.path(id),
                expected: FileFormat::Directory.as_str(),
                actual: self.format(id).as_str(),
            });
        }
        let path = self.path(id);
        let cmd = format!("rmdir {path:?}");
        let p = path.clone();
        self.write_call(&path, &cmd, move || std::fs::remove_dir(&p))?;
        self.clear(id);
        Ok(())
    }

    /// Recursive removal. Refuses paths fewer than three `/`s deep, which
    /// keeps it off `/`, top-level directories and their immediate
    /// children.
    pub fn rm_rf(&mut self, base: NodeId, path: &str) -> Result<()> {
        let Some(id) = self.walk(Some(base), base, path, &mut HashSet::new())? else {
            return Ok(());
        };
        if !self.exists(id) {
            return Ok(());
        }
        if self.format(id) == FileFormat::Directory {
            let full = self.path(id);
            if full.matches('/').count() <= 2 {
                return Err(Error::NearRoot(full));
            }
            for name in self.list_dir(id)? {
                self.rm_rf(id, &name)?;
            }
            self.rmdir(id)
        } else {
            self.remove(id)
        }
    }

    /// Detach a node: drop it from its parent, orphan its children, zero
    /// its metadata.
    fn clear(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.node_mut(child).parent = None;
        }
        if let Some(parent) = self.node(id).parent {
            let name = self.node(id).name.clone();
            self.node_mut(parent).children.remove(&name);
        }
        let node = self.node_mut(id);
        node.children.clear();
        node.parent = None;
        node.link = None;
        node.name = String::new();
        node.meta = Meta {
            mode: 0,
            ino: 0,
            dev: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0.0,
            mtime: 0.0,
            ctime: 0.0,
            blocks: 0,
            blksize: 0,
            rdev: 0,
            flags: 0,
        };
    }

    /// Reconcile ownership. `None` leaves the attribute unchanged; no
    /// syscall is issued when nothing changes.
    pub fn chown(&mut self, id: NodeId, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let meta = self.meta(id);
        let uid = uid.unwrap_or(meta.uid);
        let gid = gid.unwrap_or(meta.gid);
        if uid != meta.uid || gid != meta.gid {
            let path = self.path(id);
            let mut spec = String::new();
            if uid != meta.uid {
                spec.push_str(&uid.to_string());
            }
            if gid != meta.gid {
                spec.push(':');
                spec.push_str(&gid.to_string());
            }
            let cmd = format!("chown {spec} {path:?}");
            let p = path.clone();
            self.write_call(&path, &cmd, move || {
                std::os::unix::fs::lchown(&p, Some(uid), Some(gid))
            })?;
            let node = self.node_mut(id);
            node.meta.uid = uid;
            node.meta.gid = gid;
        }
        Ok(())
    }

    /// Reconcile permission bits.
    pub fn chmod(&mut self, id: NodeId, mode: u32) -> Result<()> {
        let mode = mode & 0o7777;
        if self.meta(id).perm() != mode {
            let path = self.path(id);
            let cmd = format!("chmod {mode:o} {path:?}");
            let p = path.clone();
            self.write_call(&path, &cmd, move || {
                std::fs::set_permissions(&p, std::fs::Permissions::from_mode(mode))
            })?;
            let node = self.node_mut(id);
            node.meta.mode = node.meta.format().bits() | mode;
        }
        Ok(())
    }

    /// Reconcile the modification time, tolerating 0.5 s of drift.
    /// `None` means now.
    pub fn utime(&mut self, id: NodeId, mtime: Option<f64>) -> Result<()> {
        let mtime = mtime.unwrap_or_else(now_secs);
        if (mtime - self.meta(id).mtime).abs() < 0.5 {
            return Ok(());
        }
        let path = self.path(id);
        let stamp = Local
            .timestamp_opt(mtime as i64, 0)
            .single()
            .map(|t| t.format(UTIME_FORMAT).to_string())
            .unwrap_or_default();
        let cmd = format!("touch -m -t {stamp} {path:?}");
        let p = path.clone();
        self.write_call(&path, &cmd, move || {
            nix::sys::stat::utimes(Path::new(&p), &timeval(mtime), &timeval(mtime))
                .map_err(nix_io)
        })?;
        let node = self.node_mut(id);
        node.meta.atime = mtime;
        node.meta.mtime = mtime;
        Ok(())
    }

    /// `--touch` accepts a `%Y%m%d%H%M.%S` timestamp in local time.
    pub fn utime_str(&mut self, id: NodeId, stamp: &str) -> Result<()> {
        let naive = NaiveDateTime::parse_from_str(stamp, UTIME_FORMAT)
            .map_err(|_| Error::BadTimestamp(stamp.to_string()))?;
        let when = Local
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| Error::BadTimestamp(stamp.to_string()))?;
        self.utime(id, Some(when.timestamp() as f64))
    }

    /// Reconcile the flags word. Linux exposes no `chflags(2)`, so only the
    /// cache is updated here.
    pub fn chflags(&mut self, id: NodeId, flags: u64) -> Result<()> {
        if self.meta(id).flags != flags {
            self.node_mut(id).meta.flags = flags;
        }
        Ok(())
    }

    /// Re-read the node's stat record from disk. A vanished entry leaves
    /// the cached values in place.
    pub fn refresh(&mut self, id: NodeId) -> Result<()> {
        let path = self.path(id);
        if let Some(st) = self.os_lstat(&path)? {
            self.node_mut(id).meta = Meta::from_stat(&st);
            if self.format(id) == FileFormat::Symlink {
                let target = std::fs::read_link(&path)?;
                self.node_mut(id).link = Some(target.to_string_lossy().into_owned());
            } else {
                self.node_mut(id).link = None;
            }
        }
        Ok(())
    }

    /// Verify that the cached record still matches the disk. Checks link
    /// target, mode, uid, gid and rdev; for anything that is not a
    /// directory or symlink also size and mtime (0.5 s epsilon).
    pub fn check_cache(&mut self, id: NodeId) -> Result<()> {
        let old_meta = self.meta(id);
        let old_link = self.node(id).link.clone();
        let check_content = !matches!(
            old_meta.format(),
            FileFormat::Directory | FileFormat::Symlink
        );
        self.refresh(id)?;
        let meta = self.meta(id);
        let link = self.node(id).link.clone();
        let mut diff = Vec::new();
        if link != old_link {
            diff.push(format!("link: {old_link:?} != {link:?}"));
        }
        if meta.mode != old_meta.mode {
            diff.push(format!("mode: {:o} != {:o}", old_meta.mode, meta.mode));
        }
        if meta.uid != old_meta.uid {
            diff.push(format!("uid: {} != {}", old_meta.uid, meta.uid));
        }
        if meta.gid != old_meta.gid {
            diff.push(format!("gid: {} != {}", old_meta.gid, meta.gid));
        }
        if meta.rdev != old_meta.rdev {
            diff.push(format!("rdev: {} != {}", old_meta.rdev, meta.rdev));
        }
        if check_content {
            if meta.size != old_meta.size {
                diff.push(format!("size: {} != {}", old_meta.size, meta.size));
            }
            if (meta.mtime - old_meta.mtime).abs() > 0.5 {
                diff.push(format!("mtime: {} != {}", old_meta.mtime, meta.mtime));
            }
        }
        if !diff.is_empty() {
            return Err(Error::CacheDrift {
                path: self.path(id),
                diff: diff.join(", "),
            });
        }
        Ok(())
    }

    /// Ordering used to decide whether a destination needs re-cloning.
    /// Non-existent sorts after existing; then permissions, uid, gid, size;
    /// ties break on the symlink target or on mtime with a 0.5 s epsilon.
    pub fn compare(&self, a: Option<NodeId>, b: Option<NodeId>) -> Ordering {
        let a_exists = a.map_or(false, |n| self.exists(n));
        let b_exists = b.map_or(false, |n| self.exists(n));
        let (a, b) = match (a_exists, b_exists) {
            (false, false) => return Ordering::Equal,
            (false, true) => return Ordering::Greater,
            (true, false) => return Ordering::Less,
            (true, true) => (a.expect("exists"), b.expect("exists")),
        };
        let (am, bm) = (self.meta(a), self.meta(b));
        am.perm()
            .cmp(&bm.perm())
            .then(am.uid.cmp(&bm.uid))
            .then(am.gid.cmp(&bm.gid))
            .then(am.size.cmp(&bm.size))
            .then_with(|| {
                if am.format() == FileFormat::Symlink {
                    self.node(a).link.cmp(&self.node(b).link)
                } else if (am.mtime - bm.mtime).abs() > 0.5 {
                    am.mtime
                        .partial_cmp(&bm.mtime)
                        .unwrap_or(Ordering::Equal)
                } else {
                    Ordering::Equal
                }
            })
    }
}

fn timeval(t: f64) -> TimeVal {
    let secs = t.floor();
    let micros = (((t - secs) * 1e6) as i64).clamp(0, 999_999);
    TimeVal::new(secs as i64, micros)
}

fn copy_chunks(src: &str, dst: &str) -> std::io::Result<u64> {
    let mut fsrc = File::open(src)?;
    let mut fdst = File::create(dst)?;
    let mut buf = [0u8; COPY_CHUNK];
    let mut written = 0u64;
    loop {
        let n = fsrc.read(&mut buf)?;
        if n == 0 {
            break;
        }
        fdst.write_all(&buf[..n])?;
        written += n as u64;
    }
    Ok(written)
}

fn join(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// `os.path.split` semantics: `"/a/b"` -> `("/a", "b")`, `"/a"` -> `("/",
/// "a")`, `"a"` -> `("", "a")`.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        None => ("", path),
        Some(i) => {
            let (head, tail) = (&path[..i + 1], &path[i + 1..]);
            let stripped = head.trim_end_matches('/');
            if stripped.is_empty() {
                (head, tail)
            } else {
                (stripped, tail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::FileFormat;

    fn harness() -> (TempDir, ShadowFs) {
        let tmp = TempDir::new().expect("mktemp");
        let policy = PathPolicy::new(
            Regex::new(r"^[a-z][-a-z0-9_\.\@]*\$?$").unwrap(),
            Regex::new(&format!("^{}($|/)", regex::escape(&tmp.path().to_string_lossy()))).unwrap(),
            false,
            false,
        );
        let fs = ShadowFs::new(policy).expect("shadow fs");
        (tmp, fs)
    }

    fn tpath(tmp: &TempDir, rel: &str) -> String {
        format!("{}/{}", tmp.path().to_string_lossy(), rel)
    }

    #[rstest]
    #[case("/a/b", "/a", "b")]
    #[case("/a", "/", "a")]
    #[case("a", "", "a")]
    #[case("/", "/", "")]
    #[case("", "", "")]
    #[case("a/b/c", "a/b", "c")]
    fn split_path_behaves_like_os_path_split(
        #[case] path: &str,
        #[case] head: &str,
        #[case] tail: &str,
    ) {
        assert_eq!(split_path(path), (head, tail));
    }

    #[test]
    fn lookup_walks_and_caches() {
        let (tmp, mut fs) = harness();
        std::fs::create_dir(tpath(&tmp, "d")).unwrap();
        std::fs::write(tpath(&tmp, "d/f"), b"hello").unwrap();

        let id = fs
            .lookup(ROOT, &tpath(&tmp, "d/f"))
            .unwrap()
            .expect("found");
        assert_eq!(fs.format(id), FileFormat::Regular);
        assert_eq!(fs.meta(id).size, 5);
        assert_eq!(fs.path(id), tpath(&tmp, "d/f"));

        // second lookup is served from the cache
        let before = fs.statcalls();
        let again = fs.lookup(ROOT, &tpath(&tmp, "d/f")).unwrap().unwrap();
        assert_eq!(again, id);
        assert_eq!(fs.statcalls(), before);
    }

    #[test]
    fn lookup_missing_is_soft() {
        let (tmp, mut fs) = harness();
        assert!(fs.lookup(ROOT, &tpath(&tmp, "nope")).unwrap().is_none());
    }

    #[test]
    fn lookup_default_plans_a_placeholder() {
        let (tmp, mut fs) = harness();
        let id = fs
            .lookup_default(ROOT, &tpath(&tmp, "planned"), FileFormat::Directory)
            .unwrap();
        assert!(!fs.exists(id));
        assert_eq!(fs.format(id), FileFormat::Directory);
    }

    #[test]
    fn lookup_default_rejects_wrong_format() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        assert!(matches!(
            fs.lookup_default(ROOT, &tpath(&tmp, "f"), FileFormat::Directory),
            Err(Error::FormatMismatch { .. })
        ));
    }

    #[test]
    fn dot_and_dotdot_walk() {
        let (tmp, mut fs) = harness();
        std::fs::create_dir_all(tpath(&tmp, "a/b")).unwrap();
        let b = fs.lookup(ROOT, &tpath(&tmp, "a/./b/..")).unwrap().unwrap();
        assert_eq!(fs.path(b), tpath(&tmp, "a"));
        // root's parent is root
        let r = fs.lookup(ROOT, "/..").unwrap().unwrap();
        assert_eq!(r, ROOT);
    }

    #[test]
    fn symlinks_resolve_relative_to_their_parent() {
        let (tmp, mut fs) = harness();
        std::fs::create_dir(tpath(&tmp, "real")).unwrap();
        std::fs::write(tpath(&tmp, "real/f"), b"x").unwrap();
        std::os::unix::fs::symlink("real", tpath(&tmp, "alias")).unwrap();

        let f = fs
            .resolve(ROOT, &tpath(&tmp, "alias/f"))
            .unwrap()
            .expect("resolved through link");
        assert_eq!(fs.path(f), tpath(&tmp, "real/f"));
    }

    #[test]
    fn symlink_cycle_detected() {
        let (tmp, mut fs) = harness();
        // resolving the target walks back through the link itself
        std::os::unix::fs::symlink("loop/inner", tpath(&tmp, "loop")).unwrap();
        assert!(matches!(
            fs.resolve(ROOT, &tpath(&tmp, "loop")),
            Err(Error::SymlinkLoop { .. })
        ));
        // a mutual pair whose targets traverse each other trips it too
        std::os::unix::fs::symlink("b/x", tpath(&tmp, "a")).unwrap();
        std::os::unix::fs::symlink("a/x", tpath(&tmp, "b")).unwrap();
        assert!(matches!(
            fs.resolve(ROOT, &tpath(&tmp, "a")),
            Err(Error::SymlinkLoop { .. })
        ));
    }

    #[test]
    fn mkdir_creates_and_reconciles() {
        let (tmp, mut fs) = harness();
        let id = fs
            .mkdir_at(ROOT, &tpath(&tmp, "d"), 0o750, None, None)
            .unwrap();
        assert!(fs.exists(id));
        let on_disk = std::fs::metadata(tpath(&tmp, "d")).unwrap();
        assert_eq!(on_disk.permissions().mode() & 0o7777, 0o750);

        // second call only reconciles; here it changes the mode
        fs.mkdir_at(ROOT, &tpath(&tmp, "d"), 0o755, None, None).unwrap();
        let on_disk = std::fs::metadata(tpath(&tmp, "d")).unwrap();
        assert_eq!(on_disk.permissions().mode() & 0o7777, 0o755);
    }

    #[test]
    fn make_dirs_is_idempotent() {
        let (tmp, mut fs) = harness();
        fs.make_dirs(ROOT, &tpath(&tmp, "x/y/z"), 0o750).unwrap();
        assert!(std::fs::metadata(tpath(&tmp, "x/y/z")).unwrap().is_dir());
        fs.make_dirs(ROOT, &tpath(&tmp, "x/y/z"), 0o750).unwrap();
    }

    #[test]
    fn symlink_records_target_and_size() {
        let (tmp, mut fs) = harness();
        let id = fs
            .symlink_at(ROOT, &tpath(&tmp, "lnk"), "target/path")
            .unwrap();
        assert_eq!(fs.link(id), Some("target/path"));
        assert_eq!(fs.meta(id).size, "target/path".len() as u64);
        assert_eq!(
            std::fs::read_link(tpath(&tmp, "lnk")).unwrap().to_string_lossy(),
            "target/path"
        );
    }

    #[test]
    fn copy2_preserves_metadata() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "src"), b"payload").unwrap();
        std::fs::set_permissions(
            tpath(&tmp, "src"),
            std::fs::Permissions::from_mode(0o640),
        )
        .unwrap();

        let src = fs.lookup(ROOT, &tpath(&tmp, "src")).unwrap().unwrap();
        let dst = fs
            .lookup_default(ROOT, &tpath(&tmp, "dst"), FileFormat::Regular)
            .unwrap();
        fs.copy2(src, dst).unwrap();

        assert_eq!(std::fs::read(tpath(&tmp, "dst")).unwrap(), b"payload");
        let meta = std::fs::metadata(tpath(&tmp, "dst")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
        // the cache verified itself against the disk already
        fs.check_cache(dst).unwrap();
    }

    #[test]
    fn remove_detaches_the_node() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        let id = fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().unwrap();
        fs.remove(id).unwrap();
        assert!(!std::fs::metadata(tpath(&tmp, "f")).is_ok());
        // a fresh lookup sees the file gone, and can re-plan it
        assert!(fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().is_none());
        let planned = fs
            .lookup_default(ROOT, &tpath(&tmp, "f"), FileFormat::Regular)
            .unwrap();
        assert!(!fs.exists(planned));
    }

    #[test]
    fn rm_rf_refuses_shallow_paths() {
        let (_tmp, mut fs) = harness();
        // "/tmp" is one slash deep, "/tmp/<dir>" two: both refused
        assert!(matches!(fs.rm_rf(ROOT, "/tmp"), Err(Error::NearRoot(_))));
        let guard = TempDir::new_in("/tmp").unwrap();
        let guard_path = guard.path().to_string_lossy().into_owned();
        if guard_path.matches('/').count() == 2 {
            assert!(matches!(
                fs.rm_rf(ROOT, &guard_path),
                Err(Error::NearRoot(_))
            ));
        }
    }

    #[test]
    fn rm_rf_removes_trees() {
        let (tmp, mut fs) = harness();
        std::fs::create_dir_all(tpath(&tmp, "t/a/b")).unwrap();
        std::fs::write(tpath(&tmp, "t/a/f"), b"x").unwrap();
        fs.rm_rf(ROOT, &tpath(&tmp, "t")).unwrap();
        assert!(!std::path::Path::new(&tpath(&tmp, "t")).exists());
    }

    #[test]
    fn chown_chmod_noop_when_unchanged() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        let id = fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().unwrap();
        let meta = fs.meta(id);
        // same values: no syscall, no error even outside any write window
        fs.chown(id, Some(meta.uid), Some(meta.gid)).unwrap();
        fs.chown(id, None, None).unwrap();
        fs.chmod(id, meta.perm()).unwrap();
    }

    #[test]
    fn utime_tolerates_drift() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        let id = fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().unwrap();
        let mtime = fs.meta(id).mtime;
        fs.utime(id, Some(mtime + 0.4)).unwrap();
        assert_eq!(fs.meta(id).mtime, mtime);
        fs.utime(id, Some(mtime - 3600.0)).unwrap();
        assert!((fs.meta(id).mtime - (mtime - 3600.0)).abs() < 0.5);
        fs.check_cache(id).unwrap();
    }

    #[test]
    fn utime_str_parses_touch_format() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        let id = fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().unwrap();
        fs.utime_str(id, "202001020304.05").unwrap();
        assert!(matches!(
            fs.utime_str(id, "not-a-stamp"),
            Err(Error::BadTimestamp(_))
        ));
    }

    #[test]
    fn check_cache_detects_drift() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        let id = fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().unwrap();
        fs.check_cache(id).unwrap();
        // mutate behind the cache's back
        std::fs::set_permissions(
            tpath(&tmp, "f"),
            std::fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        // refresh inside check_cache picks up the new mode and reports it
        fs.node_mut(id).meta.mode = FileFormat::Regular.bits() | 0o644;
        assert!(matches!(fs.check_cache(id), Err(Error::CacheDrift { .. })));
    }

    #[test]
    fn list_dir_unions_disk_and_planned() {
        let (tmp, mut fs) = harness();
        std::fs::create_dir(tpath(&tmp, "d")).unwrap();
        std::fs::write(tpath(&tmp, "d/on-disk"), b"x").unwrap();
        let d = fs.lookup(ROOT, &tpath(&tmp, "d")).unwrap().unwrap();
        fs.lookup_default(d, "planned", FileFormat::Regular).unwrap();
        assert_eq!(fs.list_dir(d).unwrap(), vec!["on-disk", "planned"]);
    }

    #[test]
    fn compare_orders_missing_after_existing() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "f"), b"x").unwrap();
        let id = fs.lookup(ROOT, &tpath(&tmp, "f")).unwrap().unwrap();
        assert_eq!(fs.compare(Some(id), None), Ordering::Less);
        assert_eq!(fs.compare(None, Some(id)), Ordering::Greater);
        assert_eq!(fs.compare(None, None), Ordering::Equal);
        assert_eq!(fs.compare(Some(id), Some(id)), Ordering::Equal);
    }

    #[test]
    fn compare_spots_content_change() {
        let (tmp, mut fs) = harness();
        std::fs::write(tpath(&tmp, "a"), b"same").unwrap();
        std::fs::write(tpath(&tmp, "b"), b"different").unwrap();
        let a = fs.lookup(ROOT, &tpath(&tmp, "a")).unwrap().unwrap();
        let b = fs.lookup(ROOT, &tpath(&tmp, "b")).unwrap().unwrap();
        assert_ne!(fs.compare(Some(a), Some(b)), Ordering::Equal);
    }

    #[test]
    fn test_mode_updates_cache_without_touching_disk() {
        let tmp = TempDir::new().unwrap();
        let policy = PathPolicy::new(
            Regex::new(r"^[a-z].*$").unwrap(),
            Regex::new(&format!("^{}($|/)", regex::escape(&tmp.path().to_string_lossy())))
                .unwrap(),
            true,
            false,
        );
        let mut fs = ShadowFs::new(policy).unwrap();
        let dir = format!("{}/planned", tmp.path().to_string_lossy());
        let id = fs.mkdir_at(ROOT, &dir, 0o750, None, None).unwrap();
        // cache says directory-with-mode, disk has nothing
        assert_eq!(fs.meta(id).perm(), 0o750);
        assert!(!std::path::Path::new(&dir).exists());
    }

    #[test]
    fn policy_violation_surfaces() {
        let (_tmp, mut fs) = harness();
        // /etc is outside the write window of the harness policy
        let id = fs
            .lookup_default(ROOT, "/etc/jail-sfs-test-file", FileFormat::Regular)
            .unwrap();
        let err = fs.symlink(id, "whatever");
        assert!(matches!(err, Err(Error::PolicyViolation { .. })));
    }
}
