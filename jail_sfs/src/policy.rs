/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Write-policy gate applied to every mutating filesystem call.

use regex::Regex;

use crate::Error;
use crate::Result;

/// Two compiled regexes plus the test/verbose switches. `write_path` decides
/// which paths commands may mutate; `valid_name` decides what counts as a
/// usable system user or group name.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    valid_name: Regex,
    write_path: Regex,
    test: bool,
    verbose: bool,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            valid_name: Regex::new(r"^[a-z][-a-z0-9_\.\@]*\$?$")
                .expect("static regex is valid"),
            write_path: Regex::new(r"^/(tmp|(run|mnt|var)/jailbase)($|/)")
                .expect("static regex is valid"),
            test: false,
            verbose: false,
        }
    }
}

impl PathPolicy {
    pub fn new(valid_name: Regex, write_path: Regex, test: bool, verbose: bool) -> Self {
        Self {
            valid_name,
            write_path,
            test,
            verbose,
        }
    }

    pub fn valid_name(&self) -> &Regex {
        &self.valid_name
    }

    pub fn write_path(&self) -> &Regex {
        &self.write_path
    }

    pub fn test(&self) -> bool {
        self.test
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_valid_name(&self, name: &str) -> bool {
        self.valid_name.is_match(name)
    }

    pub fn allows_write(&self, path: &str) -> bool {
        self.write_path.is_match(path)
    }

    /// Gate for read syscalls. Always permits; echoes the command text in
    /// test and verbose modes.
    pub fn readable(&self, _path: Option<&str>, cmd: Option<&str>) -> bool {
        if let Some(cmd) = cmd {
            if self.test {
                eprintln!("{cmd}");
            } else if self.verbose {
                eprintln!("# {cmd}");
            }
        }
        true
    }

    /// Gate for write syscalls. A disallowed path with a command attached is
    /// an error; in test mode the command is echoed and the caller skips the
    /// syscall (returns `false`), so the run mutates only the cache.
    pub fn writable(&self, path: Option<&str>, cmd: Option<&str>) -> Result<bool> {
        let allowed = path.map_or(true, |p| self.write_path.is_match(p));
        if let Some(cmd) = cmd {
            if !allowed {
                return Err(Error::PolicyViolation {
                    cmd: cmd.to_string(),
                    path: path.unwrap_or_default().to_string(),
                });
            }
            if self.test {
                eprintln!("{cmd}");
            } else if self.verbose {
                eprintln!("# {cmd}");
            }
        }
        Ok(!self.test && allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(test: bool) -> PathPolicy {
        PathPolicy::new(
            Regex::new(r"^[a-z][-a-z0-9_\.\@]*\$?$").unwrap(),
            Regex::new(r"^/(tmp|(run|mnt|var)/jailbase)($|/)").unwrap(),
            test,
            false,
        )
    }

    #[test]
    fn writable_allows_jail_paths() {
        let p = policy(false);
        assert!(p.writable(Some("/var/jailbase/bob/etc"), None).unwrap());
        assert!(p.writable(Some("/tmp/jailbase"), None).unwrap());
        assert!(p.writable(None, None).unwrap());
    }

    #[test]
    fn writable_refuses_host_paths_with_command() {
        let p = policy(false);
        // without a command the gate is a soft query
        assert!(!p.writable(Some("/etc/hosts"), None).unwrap());
        assert!(matches!(
            p.writable(Some("/etc/hosts"), Some("rm -f '/etc/hosts'")),
            Err(Error::PolicyViolation { .. })
        ));
    }

    #[test]
    fn test_mode_skips_the_syscall() {
        let p = policy(true);
        assert!(!p.writable(Some("/tmp/jailbase/x"), Some("mkdir '/tmp/jailbase/x'")).unwrap());
    }

    #[test]
    fn name_validation() {
        let p = policy(false);
        assert!(p.is_valid_name("bob"));
        assert!(p.is_valid_name("www-data"));
        assert!(p.is_valid_name("machine$"));
        assert!(!p.is_valid_name("Bob"));
        assert!(!p.is_valid_name("0day"));
    }
}
