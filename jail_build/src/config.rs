/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The user-visible knobs of a jail, plus the property map consulted by
//! `{key}` substitution in user-supplied strings.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fmt::Formatter;

use chrono::Local;
use nix::unistd::Gid;
use nix::unistd::Group;
use nix::unistd::Uid;
use nix::unistd::User;
use regex::Regex;

use crate::fmt::abs_path;
use crate::fmt::join;
use crate::fmt::parse_number;
use crate::fmt::quote_arg;
use crate::Error;
use crate::Result;

const DEFAULT_VALIDNAME: &str = r"^[a-z][-a-z0-9_\.\@]*\$?$";

/// Directory roots selected by the `JAILBASE`, `JAILTMP`, `JAILHOME` and
/// `JAILMOUNT` environment variables.
#[derive(Debug, Clone)]
pub struct BaseDirs {
    /// The directory-name fragment used everywhere (`JAILBASE`).
    pub name: String,
    /// Shared runtime tmp root (`JAILTMP`).
    pub tmp: String,
    /// Jail storage root (`JAILHOME`).
    pub home: String,
    /// Activation root where jails get mounted (`JAILMOUNT`).
    pub mount: String,
}

impl BaseDirs {
    pub fn from_env() -> Self {
        let name = std::env::var("JAILBASE").unwrap_or_else(|_| "jailbase".to_string());
        let var = |key: &str, default: String| {
            abs_path(&std::env::var(key).unwrap_or(default))
        };
        Self {
            tmp: var("JAILTMP", format!("/tmp/{name}")),
            home: var("JAILHOME", format!("/var/{name}")),
            mount: var("JAILMOUNT", format!("/mnt/{name}")),
            name,
        }
    }
}

/// One `--bind` request: source directory, mount options (or `auto`), and
/// the path below the mount root.
#[derive(Debug, Clone)]
pub struct BindSpec {
    pub src: String,
    pub opts: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct JailConfig {
    pub base: BaseDirs,
    pub user: Option<String>,
    pub group: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub verbose: bool,
    pub test: bool,
    pub help: bool,
    pub passwd: bool,
    pub dns: bool,
    pub lazy: bool,
    pub etc: bool,
    pub defaults: bool,
    pub etc_text: String,
    pub defaults_text: String,
    pub exec_umask: u32,
    pub exec_chdir: String,
    pub exec_chuid: Option<String>,
    pub validname_rx: Regex,
    pub writepath_rx: Regex,
    pub binds: Vec<BindSpec>,
}

impl JailConfig {
    pub fn new(base: BaseDirs) -> Result<Self> {
        let etc_text = "--try --add /etc/hostname \
            --try --add /etc/hosts \
            --try --add /etc/resolv.conf \
            --try --add /etc/services \
            --try --add /etc/protocols \
            --try --add /etc/ld.so.cache \
            --try --add /etc/mime.types \
            --try --add /etc/timezone \
            --try --add /etc/nsswitch.conf \
            --try --add /etc/mailname \
            --try --clone /etc/localtime {jailhome}/etc/localtime"
            .to_string();
        let defaults_text = format!(
            "--tmp --dev --etc --passwd \
             --try --mkdir {tmp}/{{user}} \
             --try --clone /usr/share {{jailhome}}/usr/share \
             --try --clone /usr/lib {{jailhome}}/usr/lib \
             --try --ln-s {name}/.dev {{jailhome}}/dev \
             --try --ln-s {name}/.tmp {{jailhome}}/tmp \
             --try --ln-s ../../{name}/.zoneinfo {{jailhome}}/usr/share/zoneinfo \
             --try --ln-s ../../{name}/.locale {{jailhome}}/usr/lib/locale",
            tmp = base.tmp,
            name = base.name,
        );
        let writepath = format!("^/(tmp|(run|mnt|var)/{})($|/)", regex::escape(&base.name));
        let cfg = Self {
            binds: vec![
                BindSpec {
                    src: "{jailhome}".to_string(),
                    opts: "auto".to_string(),
                    path: "/".to_string(),
                },
                BindSpec {
                    src: base.tmp.clone(),
                    opts: "auto".to_string(),
                    path: format!("/{}", base.name),
                },
            ],
            base,
            user: None,
            group: None,
            uid: None,
            gid: None,
            verbose: false,
            test: false,
            help: false,
            passwd: false,
            dns: false,
            lazy: false,
            etc: false,
            defaults: false,
            etc_text,
            defaults_text,
            exec_umask: 0o037,
            exec_chdir: "/".to_string(),
            exec_chuid: None,
            validname_rx: Regex::new(DEFAULT_VALIDNAME)?,
            writepath_rx: Regex::new(&writepath)?,
        };
        Ok(cfg)
    }

    pub fn set_validname(&mut self, regex: &str) -> Result<()> {
        self.validname_rx = Regex::new(regex)?;
        Ok(())
    }

    pub fn set_writepath(&mut self, regex: &str) -> Result<()> {
        self.writepath_rx = Regex::new(regex)?;
        Ok(())
    }

    pub fn set_chuid(&mut self, userspec: &str) -> Result<()> {
        self.namespec(userspec)?;
        self.exec_chuid = Some(userspec.to_string());
        Ok(())
    }

    pub fn set_umask(&mut self, mask: &str) -> Result<()> {
        self.exec_umask =
            parse_number(mask).ok_or_else(|| Error::BadMode(mask.to_string()))? as u32 & 0o777;
        Ok(())
    }

    /// Set the jail user and group from `user[:group]`. Neither may resolve
    /// to uid or gid 0.
    pub fn set_namespec(&mut self, namespec: &str) -> Result<()> {
        let (user, group) = self.namespec(namespec)?;
        let (uid, gid) = self.userspec(user.as_deref(), group.as_deref(), None, None)?;
        self.user = user;
        self.group = group;
        self.uid = uid;
        self.gid = gid;
        if self.gid.is_none() {
            if let Some(uid) = self.uid {
                self.gid = User::from_uid(Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|u| u.gid.as_raw());
            }
        }
        if self.uid == Some(0) || self.gid == Some(0) {
            return Err(Error::RootIdDisallowed);
        }
        if self.group.is_none() {
            self.group = match self.gid {
                Some(gid) => Group::from_gid(Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|g| g.name)
                    .or_else(|| self.user.clone()),
                None => self.user.clone(),
            };
        }
        Ok(())
    }

    /// Split `user[:group]` and validate both names.
    pub fn namespec(&self, spec: &str) -> Result<(Option<String>, Option<String>)> {
        let (user, group) = match spec.split_once(':') {
            Some((u, g)) => (u, g),
            None => (spec, ""),
        };
        let user = (!user.is_empty()).then(|| user.to_string());
        let group = (!group.is_empty()).then(|| group.to_string());
        if let Some(u) = &user {
            if !self.validname_rx.is_match(u) {
                return Err(Error::InvalidUserName(u.clone()));
            }
        }
        if let Some(g) = &group {
            if !self.validname_rx.is_match(g) {
                return Err(Error::InvalidGroupName(g.clone()));
            }
        }
        Ok((user, group))
    }

    /// Resolve names to ids. A user that is not a system account leaves the
    /// supplied defaults in place; a resolved user also supplies its
    /// primary gid when neither a group nor a default gid was given.
    pub fn userspec(
        &self,
        user: Option<&str>,
        group: Option<&str>,
        mut uid: Option<u32>,
        mut gid: Option<u32>,
    ) -> Result<(Option<u32>, Option<u32>)> {
        if let Some(u) = user {
            if !self.validname_rx.is_match(u) {
                return Err(Error::InvalidUserName(u.to_string()));
            }
        }
        if let Some(g) = group {
            if !self.validname_rx.is_match(g) {
                return Err(Error::InvalidGroupName(g.to_string()));
            }
        }
        if let Some(pw) = user.and_then(lookup_user) {
            uid = Some(pw.uid.as_raw());
            if group.is_none() && gid.is_none() {
                gid = Some(pw.gid.as_raw());
            }
        }
        if let Some(gr) = group.and_then(lookup_group) {
            gid = Some(gr.gid.as_raw());
        }
        Ok((uid, gid))
    }

    pub fn bind(&mut self, src: &str, opts: Option<&str>, path: Option<&str>) {
        self.binds.push(BindSpec {
            src: src.to_string(),
            opts: opts
                .filter(|o| !o.is_empty())
                .unwrap_or("auto")
                .to_string(),
            path: path.filter(|p| !p.is_empty()).unwrap_or(src).to_string(),
        });
    }

    /// `/$JAILBASE`, where the content of `$JAILTMP` is accessible inside
    /// the jail.
    pub fn jailbase(&self) -> String {
        format!("/{}", self.base.name)
    }

    /// `$JAILTMP/{user}`, a tmp directory not world readable.
    pub fn jailpriv(&self) -> Result<String> {
        let user = self.user.as_ref().ok_or(Error::UserNotSet)?;
        Ok(join(&self.base.tmp, user))
    }

    /// `$JAILHOME/{group}`, the jail root directory storage.
    pub fn jailhome(&self) -> Result<String> {
        let group = self.group.as_ref().ok_or(Error::GroupNotSet)?;
        Ok(join(&self.base.home, group))
    }

    /// `$JAILMOUNT/{user}`, where the jail home gets mounted.
    pub fn jailmount(&self) -> Result<String> {
        let user = self.user.as_ref().ok_or(Error::UserNotSet)?;
        Ok(join(&self.base.mount, user))
    }

    /// `$JAILTMP/.tmp`, accessible as `/tmp` in the jail.
    pub fn jailtmp(&self) -> String {
        join(&self.base.tmp, ".tmp")
    }

    /// `$JAILTMP/.dev`, accessible as `/dev` in the jail.
    pub fn jaildev(&self) -> String {
        join(&self.base.tmp, ".dev")
    }

    /// Home directory of the system account behind the jail user.
    pub fn userhome(&self) -> Result<String> {
        let uid = match self.uid {
            Some(uid) if uid != 0 => uid,
            _ => {
                return Err(Error::NotSystemAccount(
                    self.user.clone().unwrap_or_default(),
                ))
            }
        };
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.dir.to_string_lossy().into_owned())
            .ok_or_else(|| Error::NotSystemAccount(self.user.clone().unwrap_or_default()))
    }

    /// All properties by name, with unset ones as `None`. Sorted by key.
    pub fn entries(&self) -> Vec<(&'static str, Option<String>)> {
        let flag = |b: bool| Some(if b { "1" } else { "0" }.to_string());
        let binds = self
            .binds
            .iter()
            .map(|b| {
                format!(
                    "{} {} {}",
                    quote_arg(&b.src),
                    quote_arg(&b.opts),
                    quote_arg(&b.path)
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        let mut entries = vec![
            ("binds", Some(binds)),
            ("defaults", flag(self.defaults)),
            ("defaults_text", Some(self.defaults_text.clone())),
            ("dns", flag(self.dns)),
            ("etc", flag(self.etc)),
            ("etc_text", Some(self.etc_text.clone())),
            ("exec_chdir", Some(self.exec_chdir.clone())),
            ("exec_chuid", self.exec_chuid.clone()),
            ("exec_umask", Some(self.exec_umask.to_string())),
            ("gid", self.gid.map(|g| g.to_string())),
            ("group", self.group.clone()),
            ("help", flag(self.help)),
            ("jailbase", Some(self.jailbase())),
            ("jaildev", Some(self.jaildev())),
            ("jailhome", self.jailhome().ok()),
            ("jailmount", self.jailmount().ok()),
            ("jailpriv", self.jailpriv().ok()),
            ("jailtmp", Some(self.jailtmp())),
            ("lazy", flag(self.lazy)),
            ("passwd", flag(self.passwd)),
            ("test", flag(self.test)),
            ("uid", self.uid.map(|u| u.to_string())),
            ("user", self.user.clone()),
            ("userhome", self.userhome().ok()),
            ("validname", Some(self.validname_rx.as_str().to_string())),
            ("verbose", flag(self.verbose)),
            ("writepath", Some(self.writepath_rx.as_str().to_string())),
        ];
        entries.sort_by_key(|(k, _)| *k);
        entries
    }

    /// The substitution map for `{key}` tokens: every set property,
    /// stringified.
    pub fn fmt_map(&self) -> BTreeMap<String, String> {
        self.entries()
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
            .collect()
    }
}

impl Display for JailConfig {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "### {}: {}{} ({}:{}) [{}]",
            self.jailhome()
                .map(|h| format!("{h:?}"))
                .unwrap_or_else(|_| "None".to_string()),
            self.user.as_deref().unwrap_or("None"),
            self.group
                .as_deref()
                .map(|g| format!(":{g}"))
                .unwrap_or_default(),
            self.uid.map_or("None".to_string(), |u| u.to_string()),
            self.gid.map_or("None".to_string(), |g| g.to_string()),
            Local::now().format("%a %b %e %H:%M:%S %Y"),
        )?;
        for (key, value) in self.entries() {
            if value.as_deref() == Some("1") {
                write!(f, " --{key}")?;
            }
        }
        Ok(())
    }
}

fn lookup_user(name: &str) -> Option<User> {
    match User::from_name(name) {
        Ok(Some(user)) => Some(user),
        _ => parse_number(name)
            .and_then(|uid| User::from_uid(Uid::from_raw(uid as u32)).ok().flatten()),
    }
}

fn lookup_group(name: &str) -> Option<Group> {
    match Group::from_name(name) {
        Ok(Some(group)) => Some(group),
        _ => parse_number(name)
            .and_then(|gid| Group::from_gid(Gid::from_raw(gid as u32)).ok().flatten()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BaseDirs {
        BaseDirs {
            name: "jailbase".to_string(),
            tmp: "/tmp/jailbase".to_string(),
            home: "/var/jailbase".to_string(),
            mount: "/mnt/jailbase".to_string(),
        }
    }

    #[test]
    fn paths_derive_from_user_and_group() {
        let mut cfg = JailConfig::new(base()).unwrap();
        cfg.user = Some("alice".to_string());
        cfg.group = Some("staff".to_string());
        assert_eq!(cfg.jailbase(), "/jailbase");
        assert_eq!(cfg.jailpriv().unwrap(), "/tmp/jailbase/alice");
        assert_eq!(cfg.jailhome().unwrap(), "/var/jailbase/staff");
        assert_eq!(cfg.jailmount().unwrap(), "/mnt/jailbase/alice");
        assert_eq!(cfg.jailtmp(), "/tmp/jailbase/.tmp");
        assert_eq!(cfg.jaildev(), "/tmp/jailbase/.dev");
    }

    #[test]
    fn paths_require_names() {
        let cfg = JailConfig::new(base()).unwrap();
        assert!(matches!(cfg.jailpriv(), Err(Error::UserNotSet)));
        assert!(matches!(cfg.jailhome(), Err(Error::GroupNotSet)));
    }

    #[test]
    fn namespec_splits_and_validates() {
        let cfg = JailConfig::new(base()).unwrap();
        assert_eq!(
            cfg.namespec("bob:staff").unwrap(),
            (Some("bob".to_string()), Some("staff".to_string()))
        );
        assert_eq!(cfg.namespec("bob").unwrap(), (Some("bob".to_string()), None));
        assert_eq!(cfg.namespec(":staff").unwrap(), (None, Some("staff".to_string())));
        assert!(matches!(
            cfg.namespec("Bob"),
            Err(Error::InvalidUserName(_))
        ));
        assert!(matches!(
            cfg.namespec("bob:St aff"),
            Err(Error::InvalidGroupName(_))
        ));
    }

    #[test]
    fn root_is_rejected() {
        let mut cfg = JailConfig::new(base()).unwrap();
        assert!(matches!(
            cfg.set_namespec("root"),
            Err(Error::RootIdDisallowed)
        ));
    }

    #[test]
    fn unknown_user_keeps_names_without_ids() {
        let mut cfg = JailConfig::new(base()).unwrap();
        cfg.set_namespec("nosuchjailuser").unwrap();
        assert_eq!(cfg.user.as_deref(), Some("nosuchjailuser"));
        assert_eq!(cfg.group.as_deref(), Some("nosuchjailuser"));
        assert_eq!(cfg.uid, None);
        assert_eq!(cfg.gid, None);
    }

    #[test]
    fn fmt_map_has_the_substitution_keys() {
        let mut cfg = JailConfig::new(base()).unwrap();
        cfg.user = Some("alice".to_string());
        cfg.group = Some("alice".to_string());
        let map = cfg.fmt_map();
        assert_eq!(map.get("jailhome").map(String::as_str), Some("/var/jailbase/alice"));
        assert_eq!(map.get("user").map(String::as_str), Some("alice"));
        assert_eq!(map.get("test").map(String::as_str), Some("0"));
        assert!(!map.contains_key("uid"));
    }

    #[test]
    fn set_umask_takes_octal() {
        let mut cfg = JailConfig::new(base()).unwrap();
        cfg.set_umask("022").unwrap();
        assert_eq!(cfg.exec_umask, 0o022);
        cfg.set_umask("0o77").unwrap();
        assert_eq!(cfg.exec_umask, 0o077);
        assert!(cfg.set_umask("bogus").is_err());
    }

    #[test]
    fn bind_defaults() {
        let mut cfg = JailConfig::new(base()).unwrap();
        cfg.bind("/etc/hostname", None, None);
        cfg.bind("/srv/data", Some(""), Some("/data"));
        let b = &cfg.binds[cfg.binds.len() - 2];
        assert_eq!((b.opts.as_str(), b.path.as_str()), ("auto", "/etc/hostname"));
        let b = &cfg.binds[cfg.binds.len() - 1];
        assert_eq!((b.opts.as_str(), b.path.as_str()), ("auto", "/data"));
    }

    #[test]
    fn writepath_default_covers_jail_roots_only() {
        let cfg = JailConfig::new(base()).unwrap();
        for ok in ["/tmp", "/tmp/x", "/var/jailbase/g", "/mnt/jailbase/u", "/run/jailbase"] {
            assert!(cfg.writepath_rx.is_match(ok), "{ok}");
        }
        for bad in ["/etc/hosts", "/var/lib", "/mntx", "/usr/bin"] {
            assert!(!cfg.writepath_rx.is_match(bad), "{bad}");
        }
    }
}
