/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bind-mount planning: the kernel mount table is read back, each
//! configured `--bind` spec is validated against the jail subtree rules,
//! and the surviving specs are executed through `/bin/mount`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use jail_sfs::FileFormat;
use jail_sfs::ROOT;
use regex::Regex;

use crate::builder::Jail;
use crate::Result;

/// Existing mounts below the mount root: mount point -> (source device,
/// option set).
pub type MountTable = BTreeMap<String, (String, BTreeSet<String>)>;

/// Effective bind options for a source directory.
///
/// With a source path, the baseline is `noexec,ro,nosuid,remount,bind,
/// noatime`; `auto` then selects `exec,ro` for sources inside the jail
/// home storage, `noexec,rw` for writable sources, `noexec,ro` otherwise.
/// Explicit tokens toggle set membership (`rw` drops `ro`, `noX` drops
/// `X`, …); `suid` is ignored so `nosuid` always survives. Without a
/// source path (parsing an existing mount's options) the baseline is the
/// kernel's default `exec,rw,suid,remount,noatime`.
pub fn bindopts(
    home_root: &str,
    writepath: &Regex,
    srcpath: Option<&str>,
    opts: Option<&str>,
) -> BTreeSet<String> {
    let mut set: BTreeSet<String> = match srcpath {
        Some(_) => [
            "noexec", "ro", "nosuid", "remount", "bind", "noatime",
        ]
        .as_slice(),
        None => ["exec", "rw", "suid", "remount", "noatime"].as_slice(),
    }
    .iter()
    .map(|s| s.to_string())
    .collect();
    let src = srcpath.unwrap_or("");
    let opts = match opts {
        Some(o) if !o.is_empty() => o.to_ascii_lowercase(),
        _ => "auto".to_string(),
    };
    let opts = if opts == "auto" {
        if src.starts_with(home_root) {
            "exec,ro".to_string()
        } else if writepath.is_match(src) {
            "noexec,rw".to_string()
        } else {
            "noexec,ro".to_string()
        }
    } else {
        opts
    };
    for opt in opts.split(',').map(str::trim) {
        if opt.is_empty() || opt == "suid" {
            continue;
        }
        match opt {
            "rw" => {
                set.remove("ro");
            }
            "ro" => {
                set.remove("rw");
            }
            o if o.starts_with("no") => {
                set.remove(&o[2..]);
            }
            o => {
                set.remove(&format!("no{o}"));
            }
        }
        set.insert(opt.to_string());
    }
    set
}

/// Parse the kernel mount table. A line is relevant iff its fstype is
/// `simfs` or its options contain `bind`, and its mount point lies within
/// `jailmount/`. Returns the table plus warnings about duplicated mount
/// points.
pub fn parse_mtab(
    text: &str,
    jailmount: &str,
    home_root: &str,
    writepath: &Regex,
) -> (MountTable, Vec<String>) {
    let mut mounts = MountTable::new();
    let mut warnings = Vec::new();
    let prefix = format!("{jailmount}/");
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [device, mount_point, fstype, options, ..] = parts.as_slice() else {
            continue;
        };
        if (*fstype == "simfs" || options.contains("bind"))
            && format!("{mount_point}/").starts_with(&prefix)
        {
            if mounts.contains_key(*mount_point) {
                warnings.push(format!("{mount_point:?} is mounted more than once"));
            }
            mounts.insert(
                mount_point.to_string(),
                (
                    device.to_string(),
                    bindopts(home_root, writepath, None, Some(options)),
                ),
            );
        }
    }
    (mounts, warnings)
}

impl Jail {
    /// Existing bind mounts below `{jailmount}`, from `/etc/mtab`.
    pub(crate) fn mounts(&mut self) -> Result<MountTable> {
        let text = std::fs::read_to_string("/etc/mtab")?;
        let jailmount = self.cfg.jailmount()?;
        let (mounts, warnings) = parse_mtab(
            &text,
            &jailmount,
            &self.cfg.base.home,
            &self.cfg.writepath_rx,
        );
        for warning in warnings {
            self.log(&warning);
        }
        Ok(mounts)
    }

    /// `--mount`: mount `{jailhome}` at `{jailmount}` along with every
    /// accepted `--bind` spec, creating missing mount points inside
    /// `{jailhome}` by cloning them from their sources.
    pub fn mount(&mut self) -> Result<()> {
        let root = self.fs.meta(ROOT);
        let jailhome = self.cfg.jailhome()?;
        let jailmount = self.cfg.jailmount()?;
        for dir in [&jailhome, &jailmount] {
            let node = self.dststat_fmt(dir, FileFormat::Directory)?;
            self.fs
                .mkdir(node, root.mode, Some(root.uid), Some(root.gid))?;
        }

        let mounts = self.mounts()?;
        let mut binds: BTreeMap<String, (String, BTreeSet<String>)> = BTreeMap::new();
        for spec in self.cfg.binds.clone() {
            let srcpath = self.srcpath(&spec.src)?;
            let srcdir = with_slash(&srcpath);
            let src = self.srcstat(&srcpath)?;
            let opts = bindopts(
                &self.cfg.base.home,
                &self.cfg.writepath_rx.clone(),
                Some(&srcpath),
                Some(&spec.opts),
            );
            let dstpath = self.dstpath(&format!("{jailmount}/{}", spec.path))?;
            let dstdir = with_slash(&dstpath);
            let dst = self.dststat(&dstpath)?;

            // None: accepted so far. Some(""): an identical mount already
            // exists. Some(text): rejected or noteworthy.
            let mut msg: Option<String> = None;
            for (dstmount, (srcmount, optmount)) in &mounts {
                if format!("{dstmount}/").starts_with(&dstdir) {
                    if *dstmount != dstpath {
                        msg = Some(format!(
                            "dstpath subdir {srcmount:?} mounted at {dstmount:?}"
                        ));
                    } else if *srcmount != srcpath {
                        msg = Some(format!("{srcmount:?} already mounted at {dstpath:?}"));
                    } else if *optmount == opts {
                        msg = Some(String::new());
                    }
                    break;
                }
            }
            if msg.is_some() {
                // an existing mount already decided this spec
            } else if srcdir.starts_with(&dstdir) {
                msg = Some(format!("parent of srcpath {srcpath:?}"));
            } else if dst.map_or(false, |d| self.fs.format(d) != FileFormat::Directory) {
                msg = Some(format!(
                    "dstpath must be directory, not {}",
                    dst.map(|d| self.fs.format(d).as_str()).unwrap_or("none")
                ));
            } else if src.is_none() {
                msg = Some("srcpath not found".to_string());
            } else if src.map_or(true, |s| self.fs.format(s) != FileFormat::Directory) {
                msg = Some(format!(
                    "srcpath must be directory, not {}",
                    src.map(|s| self.fs.format(s).as_str()).unwrap_or("none")
                ));
            } else if srcpath.starts_with(&format!("{jailhome}/")) {
                msg = Some(format!("inside jailhome {jailhome:?}"));
            } else if srcpath.starts_with(&format!("{jailmount}/")) {
                msg = Some(format!("inside jailmount {jailmount:?}"));
            } else if jailmount.starts_with(&srcdir) {
                msg = Some(format!("parent of jailmount {jailmount:?}"));
            } else if jailhome.starts_with(&srcdir) {
                msg = Some(format!("parent of jailhome {jailhome:?}"));
            } else {
                if let Some((replaced, _)) = binds.get(&dstpath) {
                    msg = Some(format!("replaced {replaced:?}"));
                } else if let Some((_, optmount)) = mounts.get(&dstpath) {
                    let dropped: Vec<&str> =
                        optmount.difference(&opts).map(String::as_str).collect();
                    let added: Vec<&str> =
                        opts.difference(optmount).map(String::as_str).collect();
                    msg = Some(format!(
                        "change option {:?} -> {:?}",
                        dropped.join(","),
                        added.join(",")
                    ));
                }
                binds.insert(dstpath.clone(), (srcpath.clone(), opts.clone()));
            }

            if self.cfg.test {
                let optstr = opts.iter().cloned().collect::<Vec<_>>().join(",");
                let note = msg
                    .as_deref()
                    .filter(|m| !m.is_empty())
                    .map(|m| format!(": {m}"))
                    .unwrap_or_default();
                eprintln!(
                    "## --bind {srcpath:?} {optstr:?} {:?}{note}",
                    spec.path
                );
            }

            let rejected = msg.as_deref().map_or(false, |m| !m.is_empty());
            if !rejected && dst.is_none() {
                // materialize the mount point inside the jail home
                self.clone(&srcpath, &format!("{jailhome}/{}", spec.path))?;
            }
        }

        // shallow mount points first
        let mut pathlist: Vec<&String> = binds.keys().collect();
        pathlist.sort_by(|a, b| {
            a.matches('/')
                .count()
                .cmp(&b.matches('/').count())
                .then(a.len().cmp(&b.len()))
        });
        for dstpath in pathlist.into_iter().cloned().collect::<Vec<String>>() {
            let (srcpath, opts) = binds[dstpath.as_str()].clone();
            let optstr = opts.iter().cloned().collect::<Vec<_>>().join(",");
            if !mounts.contains_key(dstpath.as_str()) {
                self.subcall(&["/bin/mount", "--bind", srcpath.as_str(), dstpath.as_str()])?;
            }
            self.subcall(&["/bin/mount", "-o", &optstr, dstpath.as_str()])?;
        }
        Ok(())
    }

    /// `--umount`: unmount everything at or below `{jailmount}`, deepest
    /// first, then remove the empty mount root.
    pub fn umount(&mut self) -> Result<()> {
        let mounts = self.mounts()?;
        let mut dirs: Vec<&String> = mounts.keys().collect();
        dirs.sort_by(|a, b| {
            b.matches('/')
                .count()
                .cmp(&a.matches('/').count())
                .then(b.len().cmp(&a.len()))
        });
        let lazy = self.cfg.lazy;
        for dir in dirs.into_iter().cloned().collect::<Vec<String>>() {
            let dstpath = self.dstpath(&dir)?;
            if lazy {
                self.subcall(&["/bin/umount", "-l", dstpath.as_str()])?;
            } else {
                self.subcall(&["/bin/umount", dstpath.as_str()])?;
            }
        }
        let jailmount = self.cfg.jailmount()?;
        if let Some(node) = self.dststat(&jailmount)? {
            self.fs.rmdir(node)?;
        }
        Ok(())
    }
}

fn with_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writepath() -> Regex {
        Regex::new(r"^/(tmp|(run|mnt|var)/jailbase)($|/)").unwrap()
    }

    fn set(opts: &[&str]) -> BTreeSet<String> {
        opts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn auto_inside_jailhome_is_exec_ro() {
        let opts = bindopts(
            "/var/jailbase",
            &writepath(),
            Some("/var/jailbase/bob"),
            Some("auto"),
        );
        assert_eq!(
            opts,
            set(&["exec", "ro", "nosuid", "remount", "bind", "noatime"])
        );
    }

    #[test]
    fn empty_opts_mean_auto() {
        let auto = bindopts("/var/jailbase", &writepath(), Some("/tmp/jailbase"), Some("auto"));
        let empty = bindopts("/var/jailbase", &writepath(), Some("/tmp/jailbase"), Some(""));
        let none = bindopts("/var/jailbase", &writepath(), Some("/tmp/jailbase"), None);
        assert_eq!(auto, empty);
        assert_eq!(auto, none);
        // a writable source gets rw but stays noexec
        assert!(auto.contains("rw") && auto.contains("noexec"));
    }

    #[test]
    fn auto_readonly_for_foreign_sources() {
        let opts = bindopts("/var/jailbase", &writepath(), Some("/etc"), Some("auto"));
        assert!(opts.contains("ro") && opts.contains("noexec") && opts.contains("nosuid"));
    }

    #[test]
    fn explicit_tokens_toggle() {
        let opts = bindopts("/var/jailbase", &writepath(), Some("/etc"), Some("rw,exec"));
        assert!(opts.contains("rw") && !opts.contains("ro"));
        assert!(opts.contains("exec") && !opts.contains("noexec"));
        // nosuid survives even an explicit suid
        let opts = bindopts("/var/jailbase", &writepath(), Some("/etc"), Some("suid"));
        assert!(opts.contains("nosuid") && !opts.contains("suid"));
    }

    #[test]
    fn remount_always_present() {
        for opts in [Some("auto"), Some("rw"), Some("ro,noatime")] {
            let set = bindopts("/var/jailbase", &writepath(), Some("/etc"), opts);
            assert!(set.contains("remount"), "{opts:?}");
        }
    }

    #[test]
    fn parse_mtab_filters_by_root_and_kind() {
        let mtab = "\
/dev/sda1 / ext4 rw,relatime 0 0
/var/jailbase/bob /mnt/jailbase/bob none rw,bind 0 0
tmpfs /mnt/jailbase/bob/jailbase tmpfs rw,bind,nosuid 0 0
/dev/simfs /mnt/jailbase/bob/data simfs rw 0 0
/var/other /mnt/elsewhere none rw,bind 0 0
";
        let (mounts, warnings) =
            parse_mtab(mtab, "/mnt/jailbase/bob", "/var/jailbase", &writepath());
        assert!(warnings.is_empty());
        let keys: Vec<&str> = mounts.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "/mnt/jailbase/bob",
                "/mnt/jailbase/bob/data",
                "/mnt/jailbase/bob/jailbase",
            ]
        );
        assert_eq!(mounts["/mnt/jailbase/bob"].0, "/var/jailbase/bob");
        // parsed options pass through the toggle logic
        assert!(mounts["/mnt/jailbase/bob"].1.contains("bind"));
    }

    #[test]
    fn parse_mtab_warns_on_duplicates() {
        let mtab = "\
a /mnt/jailbase/bob none rw,bind 0 0
b /mnt/jailbase/bob none ro,bind 0 0
";
        let (mounts, warnings) =
            parse_mtab(mtab, "/mnt/jailbase/bob", "/var/jailbase", &writepath());
        assert_eq!(mounts.len(), 1);
        assert_eq!(warnings.len(), 1);
        // the later line wins
        assert_eq!(mounts["/mnt/jailbase/bob"].0, "b");
    }
}
