/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The terminal stage: finalize bookkeeping, mount, then drop privileges
//! and exec the target program inside the jail. In test mode every step is
//! echoed instead of performed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ffi::CString;
use std::io::Write;

use nix::sys::stat::Mode;
use nix::unistd::getegid;
use nix::unistd::geteuid;
use nix::unistd::getgrouplist;
use nix::unistd::Gid;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::builder::Jail;
use crate::fmt::abs_path;
use crate::fmt::quote_arg;
use crate::Error;
use crate::Result;

static ENV_KEY_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("static regex is valid"));

impl Jail {
    /// `--execute [K=V]... <prog> <args>...`: implied `--passwd` handling
    /// through `all_done`, implied `--mount`, environment scrubbing, then
    /// `umask`/`chdir`/`chroot`/`setgroups`/`setgid`/`setuid`/`execve`.
    pub fn execute(&mut self, args: &[String]) -> Result<()> {
        let (mut chuid_uid, mut chuid_gid) = (None, None);
        if let Some(chuid) = self.cfg.exec_chuid.clone() {
            let (user, group) = self.cfg.namespec(&chuid)?;
            let (uid, gid) =
                self.cfg
                    .userspec(user.as_deref(), group.as_deref(), None, None)?;
            chuid_uid = uid;
            chuid_gid = gid;
        }
        let exec_gid = match chuid_gid.filter(|g| *g >= 1) {
            Some(gid) => {
                self.dst_gid(gid);
                gid
            }
            None => {
                let gid = self.cfg.gid.unwrap_or_else(|| getegid().as_raw());
                match self.dst_gid(gid) {
                    Some(gid) if gid >= 1 => gid,
                    _ => return Err(Error::DisallowedGid(gid)),
                }
            }
        };
        let exec_uid = match chuid_uid.filter(|u| *u >= 1) {
            Some(uid) => match self.dst_uid(uid) {
                Some(uid) => uid,
                None => return Err(Error::DisallowedUid(uid)),
            },
            None => {
                let uid = self.cfg.uid.unwrap_or_else(|| geteuid().as_raw());
                match self.dst_uid(uid) {
                    Some(uid) if uid >= 1 => uid,
                    _ => return Err(Error::DisallowedUid(uid)),
                }
            }
        };
        let user = self
            .dst_uids
            .get(&exec_uid)
            .cloned()
            .ok_or(Error::DisallowedUid(exec_uid))?;

        // supplementary groups, restricted to those known in the jail
        let mut exec_groups: BTreeSet<u32> = BTreeSet::new();
        if let Ok(cname) = CString::new(user.name.clone()) {
            if let Ok(groups) = getgrouplist(&cname, user.gid) {
                for gid in groups {
                    let gid = gid.as_raw();
                    if self.dst_gid(gid).map_or(false, |g| g >= 1) {
                        exec_groups.insert(gid);
                    }
                }
            }
        }
        exec_groups.insert(exec_gid);

        let exec_chdir = abs_path(&self.subprops(&self.cfg.exec_chdir.clone())?);

        self.all_done()?;
        self.mount()?;

        let jailmount = self.cfg.jailmount()?;
        let jailhome = self.cfg.jailhome()?;
        let mut exec_paths = Vec::new();
        for dir in std::env::var("PATH").unwrap_or_default().split(':') {
            if std::path::Path::new(&format!("{jailmount}{dir}")).is_dir() {
                exec_paths.push(dir.to_string());
            } else if self.cfg.test
                && std::path::Path::new(&format!("{jailhome}{dir}")).is_dir()
            {
                exec_paths.push(dir.to_string());
            }
        }

        let mut exec_env: BTreeMap<String, String> = BTreeMap::new();
        exec_env.insert("JAILBASE".to_string(), self.cfg.jailbase());
        exec_env.insert("PWD".to_string(), exec_chdir.clone());
        exec_env.insert("USER".to_string(), user.name.clone());
        exec_env.insert(
            "HOME".to_string(),
            user.dir.to_string_lossy().into_owned(),
        );
        exec_env.insert("PATH".to_string(), exec_paths.join(":"));
        if let Ok(lang) = std::env::var("LANG") {
            exec_env.insert("LANG".to_string(), lang);
        }

        // KEY=VALUE arguments preceding the program edit the environment:
        // "*" copies from the host, an empty value deletes, a
        // non-identifier key is a regex over host variable names
        let mut exec_args: Vec<String> = Vec::new();
        for arg in args {
            let arg = self.subprops(arg)?;
            if !exec_args.is_empty() || !arg.contains('=') {
                exec_args.push(arg);
                continue;
            }
            let (key, value) = arg.split_once('=').expect("checked above");
            let key = key.to_ascii_uppercase();
            let keys: Vec<String> = if ENV_KEY_RX.is_match(&key) {
                vec![key.clone()]
            } else {
                let rx = Regex::new(&key)?;
                std::env::vars()
                    .map(|(k, _)| k)
                    .filter(|k| rx.find(k).map_or(false, |m| m.start() == 0))
                    .collect()
            };
            for k in keys {
                let v = if value == "*" {
                    std::env::var(&k).ok()
                } else {
                    Some(value.to_string())
                };
                match v {
                    Some(v) if !v.is_empty() => {
                        exec_env.insert(k, v);
                    }
                    _ => {
                        exec_env.remove(&k);
                    }
                }
            }
        }

        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        let umask = self.cfg.exec_umask;
        self.gated(&format!("umask {umask:o}"), None, || {
            nix::sys::stat::umask(Mode::from_bits_truncate(umask));
            Ok(())
        })?;
        let chdir_path = format!("{jailmount}{exec_chdir}");
        self.gated(&format!("cd {chdir_path:?}"), Some(&chdir_path), || {
            nix::unistd::chdir(std::path::Path::new(&chdir_path)).map_err(nix_err)
        })?;
        self.gated(&format!("chroot {jailmount:?}"), Some(&jailmount), || {
            nix::unistd::chroot(std::path::Path::new(&jailmount)).map_err(nix_err)
        })?;
        let group_names: Vec<String> = exec_groups
            .iter()
            .map(|gid| {
                self.dst_gids
                    .get(gid)
                    .map(|g| g.name.clone())
                    .unwrap_or_else(|| gid.to_string())
            })
            .collect();
        let gids: Vec<Gid> = exec_groups.iter().map(|g| Gid::from_raw(*g)).collect();
        self.gated(
            &format!("setgroups {}", group_names.join(", ")),
            None,
            || nix::unistd::setgroups(&gids).map_err(nix_err),
        )?;
        if exec_gid >= 1 && exec_gid != getegid().as_raw() {
            let name = self
                .dst_gids
                .get(&exec_gid)
                .map(|g| g.name.clone())
                .unwrap_or_else(|| exec_gid.to_string());
            self.gated(&format!("sg {name}"), None, || {
                nix::unistd::setgid(Gid::from_raw(exec_gid)).map_err(nix_err)
            })?;
        }
        if exec_uid >= 1 && exec_uid != geteuid().as_raw() {
            self.gated(&format!("su {}", user.name), None, || {
                nix::unistd::setuid(nix::unistd::Uid::from_raw(exec_uid)).map_err(nix_err)
            })?;
        }

        let program = exec_args.first().ok_or(Error::MissingProgram)?.clone();
        let env_text = exec_env
            .iter()
            .map(|(k, v)| format!("{k}={v:?}"))
            .collect::<Vec<_>>()
            .join(" ");
        let args_text = exec_args
            .iter()
            .map(|a| quote_arg(a))
            .collect::<Vec<_>>()
            .join(" ");
        let cmd = format!("env -i {env_text} {args_text}");
        if self.fs.policy().writable(None, Some(&cmd))? {
            let prog_c = cstring(&program)?;
            let args_c: Vec<CString> = exec_args
                .iter()
                .map(|a| cstring(a))
                .collect::<Result<_>>()?;
            let env_c: Vec<CString> = exec_env
                .iter()
                .map(|(k, v)| cstring(&format!("{k}={v}")))
                .collect::<Result<_>>()?;
            nix::unistd::execve(&prog_c, &args_c, &env_c)
                .map_err(|e| Error::Subprocess {
                    cmd,
                    output: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn gated(
        &self,
        cmd: &str,
        path: Option<&str>,
        f: impl FnOnce() -> std::io::Result<()>,
    ) -> Result<()> {
        if self.fs().policy().writable(path, Some(cmd))? {
            f().map_err(|e| {
                Error::Other(anyhow::anyhow!("{cmd}: {e}"))
            })?;
        }
        Ok(())
    }
}

fn nix_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| {
        Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })
}
