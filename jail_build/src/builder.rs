/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The jail builder: per-command semantics for populating a jail from the
//! host filesystem. Every filesystem mutation is routed through the shadow
//! tree, which enforces the write policy and keeps the dry-run cache
//! coherent.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Instant;

use jail_sfs::FileFormat;
use jail_sfs::NodeId;
use jail_sfs::PathPolicy;
use jail_sfs::ShadowFs;
use jail_sfs::ROOT;
use nix::sys::resource::getrusage;
use nix::sys::resource::UsageWho;
use nix::sys::stat::makedev;
use nix::sys::stat::major;
use nix::sys::stat::minor;
use nix::unistd::Gid;
use nix::unistd::Group;
use nix::unistd::Uid;
use nix::unistd::User;

use crate::config::JailConfig;
use crate::fmt::abs_path;
use crate::fmt::dirname;
use crate::fmt::human_bytes;
use crate::fmt::join;
use crate::fmt::parse_number;
use crate::fmt::substitute;
use crate::fmt::unescape;
use crate::output_text;
use crate::pcall;
use crate::resolver::DependencyResolver;
use crate::Error;
use crate::Result;

pub struct Jail {
    pub cfg: JailConfig,
    pub(crate) fs: ShadowFs,
    pub(crate) resolver: DependencyResolver,
    /// Lazily created node for `{jailhome}`; cloning resolves source paths
    /// against it so `/bin/sh` lands at `{jailhome}/bin/sh`.
    pub(crate) jailhome: Option<NodeId>,
    pub(crate) src_done: HashSet<String>,
    pub(crate) dst_uids: BTreeMap<u32, User>,
    pub(crate) dst_gids: BTreeMap<u32, Group>,
    pub(crate) updated_jailbase: bool,
    pub(crate) updated_passwd: bool,
    dns_added: bool,
    thread_added: bool,
    /// One-shot `--try` window: set to 2, decremented before each queued
    /// command, so exactly the next command's failure downgrades to a
    /// warning.
    pub try_next: u32,
    start: Instant,
}

impl Jail {
    pub fn new(cfg: JailConfig) -> Result<Self> {
        let policy = PathPolicy::new(
            cfg.validname_rx.clone(),
            cfg.writepath_rx.clone(),
            cfg.test,
            cfg.verbose,
        );
        Ok(Self {
            fs: ShadowFs::new(policy)?,
            resolver: DependencyResolver::new(),
            jailhome: None,
            src_done: HashSet::new(),
            dst_uids: BTreeMap::new(),
            dst_gids: BTreeMap::new(),
            updated_jailbase: false,
            updated_passwd: false,
            dns_added: false,
            thread_added: false,
            try_next: 0,
            start: Instant::now(),
            cfg,
        })
    }

    /// Push the current config into the shadow tree's policy gate. Called
    /// once parsing is done, before queued commands run.
    pub fn sync_policy(&mut self) {
        self.fs.set_policy(PathPolicy::new(
            self.cfg.validname_rx.clone(),
            self.cfg.writepath_rx.clone(),
            self.cfg.test,
            self.cfg.verbose,
        ));
    }

    pub fn fs(&self) -> &ShadowFs {
        &self.fs
    }

    pub fn resolver_mut(&mut self) -> &mut DependencyResolver {
        &mut self.resolver
    }

    /// The resolver and shadow tree together, for callers that drive a
    /// system examination by hand.
    pub fn parts_mut(&mut self) -> (&mut DependencyResolver, &mut ShadowFs) {
        (&mut self.resolver, &mut self.fs)
    }

    pub fn log(&self, msg: &str) {
        tracing::debug!("{msg}");
        if self.cfg.test || self.cfg.verbose {
            eprintln!("## {msg}");
        }
    }

    /// Substitute `{key}` properties and string escapes.
    pub fn subprops(&self, s: &str) -> Result<String> {
        substitute(&unescape(s), &self.cfg.fmt_map())
    }

    /// Normalize a source path and let the first `$JAILBASE`-flavored path
    /// provision the shared jail base directories.
    pub(crate) fn srcpath(&mut self, path: &str) -> Result<String> {
        let path = abs_path(&self.subprops(path)?);
        self.update_jailbase(Some(&path), &format!("srcpath {path:?}"))?;
        Ok(path)
    }

    pub(crate) fn dstpath(&mut self, path: &str) -> Result<String> {
        Ok(abs_path(&self.subprops(path)?))
    }

    pub(crate) fn srcstat(&mut self, path: &str) -> Result<Option<NodeId>> {
        Ok(self.fs.lookup(ROOT, path)?.filter(|n| self.fs.exists(*n)))
    }

    /// Soft destination lookup; observed ownership feeds the uid/gid maps
    /// used by passwd synthesis.
    pub(crate) fn dststat(&mut self, path: &str) -> Result<Option<NodeId>> {
        let node = self.fs.lookup(ROOT, path)?;
        if let Some(node) = node {
            let meta = self.fs.meta(node);
            self.dst_uid(meta.uid);
            self.dst_gid(meta.gid);
        }
        Ok(node.filter(|n| self.fs.exists(*n)))
    }

    /// Destination lookup that plans a node of the required format.
    pub(crate) fn dststat_fmt(&mut self, path: &str, fmt: FileFormat) -> Result<NodeId> {
        let node = self.fs.lookup_default(ROOT, path, fmt)?;
        let meta = self.fs.meta(node);
        self.dst_uid(meta.uid);
        self.dst_gid(meta.gid);
        Ok(node)
    }

    /// Record a uid seen in the jail. Returns `None` for uids with no
    /// system account.
    pub(crate) fn dst_uid(&mut self, uid: u32) -> Option<u32> {
        if !self.dst_uids.contains_key(&uid) {
            match User::from_uid(Uid::from_raw(uid)) {
                Ok(Some(user)) => {
                    let gid = user.gid.as_raw();
                    self.dst_uids.insert(uid, user);
                    self.dst_gid(gid);
                }
                _ => {
                    self.log(&format!("unknown uid {uid}"));
                    return None;
                }
            }
        }
        Some(uid)
    }

    pub(crate) fn dst_gid(&mut self, gid: u32) -> Option<u32> {
        if !self.dst_gids.contains_key(&gid) {
            match Group::from_gid(Gid::from_raw(gid)) {
                Ok(Some(group)) => {
                    self.dst_gids.insert(gid, group);
                }
                _ => {
                    self.log(&format!("unknown gid {gid}"));
                    return None;
                }
            }
        }
        Some(gid)
    }

    /// One-time provisioning of `$JAILTMP`, `$JAILHOME` and `$JAILMOUNT`
    /// plus the shared tmp/dev/zoneinfo/locale trees, triggered by the
    /// first path that lives under the jail base.
    fn update_jailbase(&mut self, path: Option<&str>, cmd: &str) -> Result<bool> {
        if self.updated_jailbase {
            return Ok(false);
        }
        let relevant = match path {
            None => true,
            Some(p) => {
                p.starts_with(&format!("/{}", self.cfg.base.name))
                    || p.starts_with(&self.cfg.base.tmp)
                    || self
                        .cfg
                        .jailmount()
                        .map(|m| p.starts_with(&format!("{m}/{}", self.cfg.base.name)))
                        .unwrap_or(false)
            }
        };
        if !relevant {
            return Ok(false);
        }
        self.log(&format!("### updating {} for {cmd:?}", self.cfg.base.name));
        self.updated_jailbase = true;
        let root = self.fs.meta(ROOT);
        for dir in [
            self.cfg.base.tmp.clone(),
            self.cfg.base.home.clone(),
            self.cfg.base.mount.clone(),
        ] {
            self.fs
                .mkdir_at(ROOT, &dir, root.mode, Some(root.uid), Some(root.gid))?;
        }
        self.tmp()?;
        self.dev()?;
        self.clone_recurse(
            "/usr/share/zoneinfo",
            &format!("{}/.zoneinfo", self.cfg.base.tmp),
            true,
        )?;
        self.clone_recurse(
            "/usr/lib/locale",
            &format!("{}/.locale", self.cfg.base.tmp),
            true,
        )?;
        Ok(true)
    }

    /// `--dev`: a minimal shared `/dev` at `{jaildev}`.
    pub fn dev(&mut self) -> Result<()> {
        let mode = self.fs.meta(ROOT).perm();
        self.fs.make_dirs(ROOT, &self.cfg.base.tmp.clone(), mode)?;
        let jaildev = self.cfg.jaildev();
        self.clone_entry("/dev", &jaildev)?;
        for devname in ["null", "zero", "random", "urandom"] {
            self.clone_entry(&join("/dev", devname), &join(&jaildev, devname))?;
        }
        Ok(())
    }

    /// `--tmp`: the shared `/tmp` at `{jailtmp}` plus the user-private
    /// scratch directory.
    pub fn tmp(&mut self) -> Result<()> {
        let mode = self.fs.meta(ROOT).perm();
        self.fs.make_dirs(ROOT, &self.cfg.base.tmp.clone(), mode)?;
        self.clone_entry("/tmp", &self.cfg.jailtmp())?;
        if let Some(user) = self.cfg.user.clone() {
            self.mkdir(&join(&self.cfg.base.tmp, &user), None, None)?;
        }
        Ok(())
    }

    fn clone_entry(&mut self, srcpath: &str, dstpath: &str) -> Result<()> {
        let src = self
            .srcstat(srcpath)?
            .ok_or_else(|| Error::NotFound(srcpath.to_string()))?;
        let dst = self.dststat_fmt(dstpath, self.fs.format(src))?;
        self.clone_stat(src, dst)?;
        Ok(())
    }

    /// `--add`: clone paths and their shared-object dependencies.
    pub fn add(&mut self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.add_path(path, false, false)?;
        }
        Ok(())
    }

    /// `--add-from`: add files relative to a source directory.
    pub fn add_from(&mut self, srcdir: &str, files: &[String]) -> Result<()> {
        for file in files {
            self.add_path(&join(srcdir, file), false, false)?;
        }
        Ok(())
    }

    /// `--add-recurse [--quick]`: add with directory descent. With
    /// `--quick`, unchanged directories (by the node comparison) are not
    /// descended into.
    pub fn add_recurse(&mut self, paths: &[String]) -> Result<()> {
        let quick = paths.iter().any(|p| p == "--quick");
        for path in paths.iter().filter(|p| *p != "--quick") {
            self.add_path(path, true, quick)?;
        }
        Ok(())
    }

    pub(crate) fn add_path(&mut self, srcpath: &str, recurse: bool, quick: bool) -> Result<()> {
        let srcpath = self.srcpath(srcpath)?;
        if self.src_done.contains(&srcpath) {
            return Ok(());
        }
        self.src_done.insert(srcpath.clone());

        // parents land in the jail before their children
        let srcdir = dirname(&srcpath).to_string();
        if !srcdir.is_empty() && !self.src_done.contains(&srcdir) {
            self.add_path(&srcdir, false, false)?;
        }

        let src = self
            .srcstat(&srcpath)?
            .ok_or_else(|| Error::NotFound(srcpath.clone()))?;

        if self.jailhome.is_none() {
            let mode = self.fs.meta(ROOT).perm();
            let home = self.cfg.jailhome()?;
            self.jailhome = Some(self.fs.make_dirs(ROOT, &home, mode)?);
        }
        let jailhome = self.jailhome.expect("just created");
        let dst = self.fs.lookup_default(jailhome, &srcpath, self.fs.format(src))?;

        match self.fs.format(src) {
            FileFormat::Symlink => {
                if let Some(target) = self.fs.resolve_node(src)?.filter(|n| self.fs.exists(*n)) {
                    let target_path = self.fs.path(target);
                    self.add_path(&target_path, recurse, quick)?;
                } else if self.fs.format(dst) == FileFormat::Symlink
                    && self.fs.exists(dst)
                    && self
                        .fs
                        .resolve_node(dst)?
                        .map_or(true, |n| !self.fs.exists(n))
                {
                    // host-side target vanished and the jail-side link
                    // dangles with it
                    self.log(&format!(
                        "{srcpath:?}: link is broken, removing {:?}",
                        self.fs.path(dst)
                    ));
                    self.fs.remove(dst)?;
                    return Ok(());
                }
            }
            FileFormat::Regular if self.is_executable(&srcpath, src) => {
                if !self.resolver.examined() {
                    self.resolver.examine_system(&mut self.fs, self.cfg.verbose)?;
                }
                if !self.dns_added
                    && (self.cfg.dns || self.resolver.dns_files.contains(&srcpath))
                {
                    self.dns_added = true;
                    for path in self.resolver.dns_files.clone() {
                        self.add_path(&path, recurse, quick)?;
                    }
                }
                if !self.thread_added && self.resolver.thread_files.contains(&srcpath) {
                    self.thread_added = true;
                    for path in self.resolver.thread_files.clone() {
                        self.add_path(&path, recurse, quick)?;
                    }
                }
                for path in self.resolver.aliases(&srcpath) {
                    self.add_path(&path, recurse, quick)?;
                }
                for path in self.resolver.deps(&srcpath, self.cfg.verbose)? {
                    self.add_path(&path, recurse, quick)?;
                }
            }
            _ => {}
        }

        if src == dst {
            self.log(&format!("same file: {srcpath:?}"));
            return Ok(());
        }
        let unchanged =
            self.fs.compare(Some(src), Some(dst)) == std::cmp::Ordering::Equal;
        if !unchanged && !self.clone_stat(src, dst)? {
            self.log(&format!(
                "skipped {} {srcpath:?}",
                self.fs.format(src).as_str()
            ));
        }
        if self.fs.format(src) == FileFormat::Directory && recurse && (!quick || !unchanged) {
            for name in self.fs.list_dir(src)? {
                self.add_path(&join(&srcpath, &name), recurse, quick)?;
            }
        }
        Ok(())
    }

    pub(crate) fn is_executable(&self, srcpath: &str, src: NodeId) -> bool {
        self.fs.meta(src).is_executable() || self.resolver.is_library(srcpath)
    }

    /// Copy one entry's format, data and metadata from source node to
    /// destination node. Returns `false` for formats that cannot be cloned
    /// (fifos, sockets).
    pub(crate) fn clone_stat(&mut self, src: NodeId, dst: NodeId) -> Result<bool> {
        if src == dst {
            return Ok(true);
        }
        if self.fs.format(src) != self.fs.format(dst) {
            return Err(jail_sfs::Error::FormatMismatch {
                path: self.fs.path(dst),
                expected: self.fs.format(src).as_str(),
                actual: self.fs.format(dst).as_str(),
            }
            .into());
        }
        let meta = self.fs.meta(src);
        self.dst_uid(meta.uid);
        self.dst_gid(meta.gid);
        match meta.format() {
            FileFormat::Regular => self.fs.copy2(src, dst)?,
            FileFormat::Directory => {
                self.fs
                    .mkdir(dst, meta.mode, Some(meta.uid), Some(meta.gid))?;
                self.fs.utime(dst, Some(meta.mtime))?;
            }
            FileFormat::Symlink => {
                let target = self.fs.link(src).unwrap_or_default().to_string();
                self.fs.symlink(dst, &target)?;
                self.fs.chown(dst, Some(meta.uid), Some(meta.gid))?;
            }
            FileFormat::CharDevice | FileFormat::BlockDevice => {
                self.fs.mknod(dst, meta.mode, meta.rdev)?;
                self.fs.chown(dst, Some(meta.uid), Some(meta.gid))?;
                self.fs.utime(dst, Some(meta.mtime))?;
            }
            _ => return Ok(false),
        }
        self.fs.chflags(dst, meta.flags)?;
        Ok(true)
    }

    /// `--clone`: copy an entry with data and metadata, mirroring missing
    /// parent directories from the source's parent chain.
    pub fn clone(&mut self, srcpath: &str, dstpath: &str) -> Result<()> {
        let srcpath = self.srcpath(srcpath)?;
        let src = self
            .srcstat(&srcpath)?
            .ok_or_else(|| Error::NotFound(srcpath.clone()))?;
        let dstpath = self.dstpath(dstpath)?;
        let dstdir = nonempty_dir(dirname(&dstpath));
        if self
            .fs
            .resolve(ROOT, dstdir)?
            .map_or(true, |n| !self.fs.exists(n))
        {
            let srcdir = nonempty_dir(dirname(&srcpath)).to_string();
            let dstdir = dstdir.to_string();
            self.clone(&srcdir, &dstdir)?;
        }
        let dst = self.dststat_fmt(&dstpath, self.fs.format(src))?;
        self.clone_stat(src, dst)?;
        Ok(())
    }

    /// `--clone-recurse [--quick]`.
    pub fn clone_recurse(&mut self, srcpath: &str, dstpath: &str, quick: bool) -> Result<()> {
        let srcpath = self.srcpath(srcpath)?;
        let src = self.srcstat(&srcpath)?;
        let dstpath = self.dstpath(dstpath)?;
        let dst = self.dststat(&dstpath)?;
        let unchanged = self.fs.compare(src, dst) == std::cmp::Ordering::Equal;
        self.clone(&srcpath, &dstpath)?;
        let is_dir = src.map_or(false, |n| self.fs.format(n) == FileFormat::Directory);
        if is_dir && (!quick || !unchanged) {
            let src = src.expect("is_dir");
            for name in self.fs.list_dir(src)? {
                self.clone_recurse(&join(&srcpath, &name), &join(&dstpath, &name), quick)?;
            }
        }
        Ok(())
    }

    /// `--clone-from`.
    pub fn clone_from(&mut self, srcdir: &str, dstdir: &str, files: &[String]) -> Result<()> {
        for file in files {
            self.clone(&join(srcdir, file), &join(dstdir, file))?;
        }
        Ok(())
    }

    /// `--mkdir <path> [mode] [user[:group]]`.
    pub fn mkdir(&mut self, dstpath: &str, mode: Option<&str>, owner: Option<&str>) -> Result<()> {
        let mode = match mode {
            None => 0o750,
            Some(m) => parse_number(m).ok_or_else(|| Error::BadMode(m.to_string()))? as u32,
        } & 0o7777;
        let (user, group) = match owner {
            Some(owner) => self.cfg.namespec(owner)?,
            None => (None, None),
        };
        let (uid, gid) = self.cfg.userspec(
            user.as_deref(),
            group.as_deref(),
            self.cfg.uid,
            self.cfg.gid,
        )?;
        let dstpath = self.dstpath(dstpath)?;
        let dst = self.dststat_fmt(&dstpath, FileFormat::Directory)?;
        // the parent directory may live under the jail base
        let parent = dirname(&dstpath).to_string();
        self.srcpath(&parent)?;
        if let Some(uid) = uid {
            self.dst_uid(uid);
        }
        if let Some(gid) = gid {
            self.dst_gid(gid);
        }
        self.fs.mkdir(dst, mode, uid, gid)?;
        Ok(())
    }

    /// `--ln-s <target> <linkname>`: an existing linkname must already
    /// point at the target.
    pub fn ln_s(&mut self, target: &str, linkname: &str) -> Result<()> {
        let target = self.subprops(target)?;
        let dstpath = self.dstpath(linkname)?;
        let dst = self.dststat_fmt(&dstpath, FileFormat::Symlink)?;
        if self.fs.exists(dst) && self.fs.link(dst) != Some(target.as_str()) {
            return Err(Error::SymlinkTargetMismatch {
                path: dstpath,
                expected: target,
                actual: self.fs.link(dst).unwrap_or_default().to_string(),
            });
        }
        self.fs.symlink(dst, &target)?;
        Ok(())
    }

    /// `--mknod <path> c|b <major> [minor]`. With no minor, major is a
    /// combined device number.
    pub fn mknod(
        &mut self,
        dstpath: &str,
        devtype: &str,
        major_arg: &str,
        minor_arg: Option<&str>,
    ) -> Result<()> {
        let mode = match devtype {
            "c" => FileFormat::CharDevice.bits(),
            "b" => FileFormat::BlockDevice.bits(),
            _ => return Err(Error::BadDeviceType),
        } | 0o666;
        let major_num =
            parse_number(major_arg).ok_or_else(|| Error::BadMode(major_arg.to_string()))?;
        let device = match minor_arg {
            None => major_num,
            Some(m) => {
                let minor_num =
                    parse_number(m).ok_or_else(|| Error::BadMode(m.to_string()))?;
                makedev(major_num, minor_num)
            }
        };
        let dstpath = self.dstpath(dstpath)?;
        let dst = self.dststat_fmt(&dstpath, FileFormat::from_mode(mode))?;
        if self.fs.exists(dst) && self.fs.meta(dst).rdev != device {
            return Err(Error::DeviceMismatch {
                path: dstpath,
                devtype: devtype.to_string(),
                major: major(device),
                minor: minor(device),
            });
        }
        self.fs.mknod(dst, mode, device)?;
        Ok(())
    }

    /// `--chflags <path> <flags>`.
    pub fn chflags(&mut self, dstpath: &str, flags: &str) -> Result<()> {
        let flags = parse_number(flags).ok_or_else(|| Error::BadFlags(flags.to_string()))?;
        let dstpath = self.dstpath(dstpath)?;
        let dst = self
            .dststat(&dstpath)?
            .ok_or(Error::NotFound(dstpath))?;
        self.fs.chflags(dst, flags)?;
        Ok(())
    }

    /// `--chmod <path> <mode>`.
    pub fn chmod(&mut self, dstpath: &str, mode: &str) -> Result<()> {
        let mode = parse_number(mode).ok_or_else(|| Error::BadMode(mode.to_string()))? as u32;
        let dstpath = self.dstpath(dstpath)?;
        let dst = self
            .dststat(&dstpath)?
            .ok_or(Error::NotFound(dstpath))?;
        self.fs.chmod(dst, mode)?;
        Ok(())
    }

    /// `--chown <path> <user[:group]>`: group left unchanged when omitted.
    pub fn chown(&mut self, dstpath: &str, owner: &str) -> Result<()> {
        let dstpath = self.dstpath(dstpath)?;
        let (user, group) = self.cfg.namespec(owner)?;
        let (uid, gid) = self
            .cfg
            .userspec(user.as_deref(), group.as_deref(), None, None)?;
        if let Some(uid) = uid {
            self.dst_uid(uid);
        }
        if let Some(gid) = gid {
            self.dst_gid(gid);
        }
        let dst = self
            .dststat(&dstpath)?
            .ok_or(Error::NotFound(dstpath))?;
        self.fs.chown(dst, uid, gid)?;
        Ok(())
    }

    /// `--touch <path> [mtime]` with the `%Y%m%d%H%M.%S` format.
    pub fn touch(&mut self, dstpath: &str, mtime: Option<&str>) -> Result<()> {
        let dstpath = self.dstpath(dstpath)?;
        let dst = self
            .dststat(&dstpath)?
            .ok_or(Error::NotFound(dstpath))?;
        match mtime {
            None => self.fs.utime(dst, None)?,
            Some(stamp) => self.fs.utime_str(dst, stamp)?,
        }
        Ok(())
    }

    /// `--rm`.
    pub fn rm(&mut self, dstpath: &str) -> Result<()> {
        let dstpath = self.dstpath(dstpath)?;
        if let Some(dst) = self.dststat(&dstpath)? {
            self.fs.remove(dst)?;
        }
        Ok(())
    }

    /// `--rmdir`.
    pub fn rmdir(&mut self, dstpath: &str) -> Result<()> {
        let dstpath = self.dstpath(dstpath)?;
        if let Some(dst) = self.dststat(&dstpath)? {
            self.fs.rmdir(dst)?;
        }
        Ok(())
    }

    /// `--clean`: empty out `{jailpriv}`.
    pub fn clean(&mut self) -> Result<()> {
        let dstpath = self.dstpath(&self.cfg.jailpriv()?)?;
        let Some(dir) = self.fs.resolve(ROOT, &dstpath)? else {
            return Ok(());
        };
        for name in self.fs.list_dir(dir)? {
            self.fs.rm_rf(ROOT, &join(&dstpath, &name))?;
        }
        Ok(())
    }

    /// `--remove`: unmount, then delete `{jailhome}` and `{jailpriv}`.
    pub fn remove(&mut self) -> Result<()> {
        self.umount()?;
        let home = self.cfg.jailhome()?;
        self.fs.rm_rf(ROOT, &home)?;
        let private = self.cfg.jailpriv()?;
        self.fs.rm_rf(ROOT, &private)?;
        Ok(())
    }

    /// `--print [fmt]`.
    pub fn print(&mut self, fmtstring: Option<&str>) -> Result<()> {
        match fmtstring {
            None => {
                for (key, value) in self.cfg.entries() {
                    match value {
                        Some(v) => println!("{key} = {v:?}"),
                        None => println!("{key} = None"),
                    }
                }
            }
            Some(fmtstring) => println!("{}", self.subprops(fmtstring)?),
        }
        Ok(())
    }

    /// `--try`: absorb the next command's failure.
    pub fn cli_try(&mut self) {
        self.try_next = 2;
    }

    /// Run a helper, capturing output. In test mode the command is only
    /// echoed.
    pub(crate) fn subcall(&mut self, args: &[&str]) -> Result<String> {
        if self.cfg.test {
            eprintln!("{}", args.join(" "));
            return Ok(String::new());
        }
        let argv: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = pcall(&argv, self.cfg.verbose)?;
        if !output.status.success() {
            return Err(Error::Subprocess {
                cmd: args.join(" "),
                output: output_text(&output).trim().to_string(),
            });
        }
        Ok(output_text(&output))
    }

    /// Deferred bookkeeping at the end of the run: passwd synthesis and
    /// the construction report.
    pub fn all_done(&mut self) -> Result<()> {
        if self.cfg.passwd {
            self.update_passwd()
                .map_err(|e| Error::Other(anyhow::anyhow!("--passwd: {e}")))?;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        let ldlist = if self.resolver.ldlist_count > 0 {
            format!("{} ld-linux and ", self.resolver.ldlist_count)
        } else {
            String::new()
        };
        self.log(&format!(
            "### checked {} files in {elapsed:.2}s using {ldlist}{} stat() ({:.1}% of {} cached)",
            self.fs.instances(),
            self.fs.statcalls(),
            self.fs.hit_ratio(),
            self.fs.accesses(),
        ));
        if self.cfg.test || self.cfg.verbose {
            if let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) {
                let user = usage.user_time();
                let system = usage.system_time();
                let cpu = user.tv_sec() as f64
                    + user.tv_usec() as f64 * 1e-6
                    + system.tv_sec() as f64
                    + system.tv_usec() as f64 * 1e-6;
                // ru_maxrss is KiB on Linux
                let rss = usage.max_rss().max(0) as u64 * 1024;
                self.log(&format!(
                    "### used {cpu:.2} seconds CPU and {}B RAM",
                    human_bytes(rss)
                ));
            }
        }
        Ok(())
    }
}

fn nonempty_dir(dir: &str) -> &str {
    if dir.is_empty() {
        "/"
    } else {
        dir
    }
}
