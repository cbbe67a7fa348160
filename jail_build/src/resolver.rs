/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shared-library dependency resolution through the dynamic loader.
//!
//! The `ldconfig -p` index maps sonames to resolved paths and locates the
//! loader binary itself; per-executable dependencies come from running
//! `{ldlinux_so} --list {path}` and mapping each reported soname back
//! through the index. Symlink aliases found in the library directories are
//! recorded so a cloned library travels with every name it is known by.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use jail_sfs::ShadowFs;
use jail_sfs::ROOT;
use regex::Regex;

use crate::fmt::dirname;
use crate::fmt::join;
use crate::fmt::substitute;
use crate::output_text;
use crate::pcall;
use crate::Error;
use crate::Result;

const DEFAULT_LDCONFIG_CMD: &str = "/sbin/ldconfig -p";
const DEFAULT_LDCONFIG_RX: &str = r"\s*(\S+).+=>\s*(\S+)\s*";
const DEFAULT_LDLIST_CMD: &str = "{ldlinux_so} --list {path}";
const DEFAULT_LDLIST_RX: &str = r"\s+(\S+)\s+=>(\s*\S+\s*)?\(0x.+\)";
const DEFAULT_LIBRARY_RX: &str = r"(^|.*/)lib.*\.so(\..*|$)";
const DNS_RX: &str = r"^lib(nsl|resolv|nss[_,0-9,a-z]+)\..+";
const THREAD_RX: &str = r"^lib(pthread|gcc_s)\..+";

pub struct DependencyResolver {
    ldconfig_cmd: Vec<String>,
    ldconfig_rx: Regex,
    ldlist_cmd: String,
    ldlist_rx: Regex,
    library_rx: Regex,
    dns_rx: Regex,
    thread_rx: Regex,
    /// The dynamic loader binary, discovered from the index.
    pub ldlinux_so: Option<String>,
    /// soname -> resolved paths.
    soname_paths: HashMap<String, BTreeSet<String>>,
    /// executable path -> direct dependency paths, memoized.
    deps_cache: HashMap<String, BTreeSet<String>>,
    /// real library path -> symlink aliases pointing at it.
    so_aliases: HashMap<String, BTreeSet<String>>,
    /// Shared objects that group-ship with DNS-using binaries.
    pub dns_files: BTreeSet<String>,
    /// Shared objects that group-ship with thread-using binaries.
    pub thread_files: BTreeSet<String>,
    /// Number of loader listing invocations issued.
    pub ldlist_count: u64,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {
            ldconfig_cmd: DEFAULT_LDCONFIG_CMD
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            ldconfig_rx: Regex::new(DEFAULT_LDCONFIG_RX).expect("static regex is valid"),
            ldlist_cmd: DEFAULT_LDLIST_CMD.to_string(),
            ldlist_rx: Regex::new(DEFAULT_LDLIST_RX).expect("static regex is valid"),
            library_rx: Regex::new(DEFAULT_LIBRARY_RX).expect("static regex is valid"),
            dns_rx: Regex::new(DNS_RX).expect("static regex is valid"),
            thread_rx: Regex::new(THREAD_RX).expect("static regex is valid"),
            ldlinux_so: None,
            soname_paths: HashMap::new(),
            deps_cache: HashMap::new(),
            so_aliases: HashMap::new(),
            dns_files: BTreeSet::new(),
            thread_files: BTreeSet::new(),
            ldlist_count: 0,
        }
    }

    pub fn set_ldconfig_cmd(&mut self, command: &str) {
        self.ldconfig_cmd = command.split_whitespace().map(str::to_string).collect();
    }

    pub fn ldconfig_cmd(&self) -> String {
        self.ldconfig_cmd.join(" ")
    }

    pub fn set_ldconfig_rx(&mut self, regex: &str) -> Result<()> {
        self.ldconfig_rx = Regex::new(regex)?;
        Ok(())
    }

    pub fn set_ldlist_cmd(&mut self, template: &str) {
        self.ldlist_cmd = template.to_string();
    }

    pub fn set_ldlist_rx(&mut self, regex: &str) -> Result<()> {
        self.ldlist_rx = Regex::new(regex)?;
        Ok(())
    }

    pub fn set_library_rx(&mut self, regex: &str) -> Result<()> {
        self.library_rx = Regex::new(regex)?;
        Ok(())
    }

    /// Whether a path names a shared object by convention.
    pub fn is_library(&self, path: &str) -> bool {
        self.library_rx.is_match(path)
    }

    pub fn examined(&self) -> bool {
        self.ldlinux_so.is_some()
    }

    /// Aliases under which the library at `path` is also reachable.
    pub fn aliases(&self, path: &str) -> Vec<String> {
        self.so_aliases
            .get(path)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Parse the loader index, classify DNS and thread libraries, locate
    /// the loader binary and collect symlink aliases from every library
    /// directory.
    pub fn examine_system(&mut self, fs: &mut ShadowFs, verbose: bool) -> Result<()> {
        let output = pcall(&self.ldconfig_cmd, verbose)?;
        let text = output_text(&output);

        let mut libdirs = BTreeSet::new();
        let mut dns_files: BTreeMap<String, String> = BTreeMap::new();
        let mut thread_files: BTreeMap<String, String> = BTreeMap::new();

        for caps in self.ldconfig_rx.captures_iter(&text) {
            let (Some(name), Some(path)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let (name, path) = (name.as_str(), path.as_str());
            self.soname_paths
                .entry(name.to_string())
                .or_default()
                .insert(path.to_string());
            libdirs.insert(dirname(path).to_string());
            if self.ldlinux_so.is_none() && name.starts_with("ld-linux") {
                self.ldlinux_so = Some(realpath(path));
            }
            if dns_files.contains_key(path) || thread_files.contains_key(path) {
                continue;
            }
            if self.dns_rx.is_match(name) {
                dns_files.insert(path.to_string(), realpath(path));
            }
            if self.thread_rx.is_match(name) {
                thread_files.insert(path.to_string(), realpath(path));
            }
        }
        self.dns_files = dns_files.into_values().collect();
        self.thread_files = thread_files.into_values().collect();

        for dir in &libdirs {
            let Some(dir_node) = fs.lookup(ROOT, dir)? else {
                continue;
            };
            for name in fs.list_dir(dir_node)? {
                let srcpath = join(dir, &name);
                let Some(node) = fs.lookup(ROOT, &srcpath)? else {
                    continue;
                };
                if let Some(target) = fs.link(node) {
                    self.so_aliases
                        .entry(join(dir, target))
                        .or_default()
                        .insert(srcpath);
                }
            }
        }
        tracing::debug!(
            sonames = self.soname_paths.len(),
            dns = self.dns_files.len(),
            thread = self.thread_files.len(),
            ldlinux_so = self.ldlinux_so.as_deref().unwrap_or(""),
            "examined loader index"
        );
        Ok(())
    }

    /// Direct dependencies of an executable or shared object, through the
    /// loader's listing. Memoized; a listing that exits non-zero is
    /// memoized as empty.
    pub fn deps(&mut self, path: &str, verbose: bool) -> Result<BTreeSet<String>> {
        if !self.deps_cache.contains_key(path) {
            if !path.starts_with('/') {
                return Err(Error::NotAbsolute(path.to_string()));
            }
            let mut map = BTreeMap::new();
            map.insert(
                "ldlinux_so".to_string(),
                self.ldlinux_so.clone().unwrap_or_default(),
            );
            map.insert("path".to_string(), path.to_string());
            let cmdline = substitute(&self.ldlist_cmd, &map)?;
            let args: Vec<String> = cmdline.split_whitespace().map(str::to_string).collect();
            let output = pcall(&args, verbose)?;
            self.ldlist_count += 1;
            let mut result = BTreeSet::new();
            if output.status.success() {
                let text = output_text(&output);
                for caps in self.ldlist_rx.captures_iter(&text) {
                    let Some(soname) = caps.get(1) else { continue };
                    match self.soname_paths.get(soname.as_str()) {
                        Some(paths) => result.extend(paths.iter().cloned()),
                        None => {
                            result.insert(soname.as_str().to_string());
                        }
                    }
                }
            }
            self.deps_cache.insert(path.to_string(), result);
        }
        Ok(self.deps_cache[path].clone())
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn realpath(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_regex_matches_shared_objects() {
        let r = DependencyResolver::new();
        assert!(r.is_library("/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(r.is_library("/usr/lib/libfoo.so"));
        assert!(r.is_library("libbar.so.1.2"));
        assert!(!r.is_library("/usr/bin/python"));
        assert!(!r.is_library("/usr/lib/libfoo.a"));
    }

    #[test]
    fn ldconfig_regex_parses_index_lines() {
        let r = DependencyResolver::new();
        let line = "\tlibc.so.6 (libc6,x86-64) => /lib/x86_64-linux-gnu/libc.so.6";
        let caps = r.ldconfig_rx.captures(line).expect("line should match");
        assert_eq!(&caps[1], "libc.so.6");
        assert_eq!(&caps[2], "/lib/x86_64-linux-gnu/libc.so.6");
    }

    #[test]
    fn ldlist_regex_parses_loader_output() {
        let r = DependencyResolver::new();
        let text = "\tlibc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x00007f1e8d000000)\n\
                    \t/lib64/ld-linux-x86-64.so.2 (0x00007f1e8d2f0000)\n";
        let names: Vec<&str> = r
            .ldlist_rx
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        assert_eq!(names, vec!["libc.so.6"]);
    }

    #[test]
    fn dns_and_thread_classification() {
        let r = DependencyResolver::new();
        assert!(r.dns_rx.is_match("libnss_dns.so.2"));
        assert!(r.dns_rx.is_match("libresolv.so.2"));
        assert!(r.dns_rx.is_match("libnsl.so.1"));
        assert!(!r.dns_rx.is_match("libc.so.6"));
        assert!(r.thread_rx.is_match("libpthread.so.0"));
        assert!(r.thread_rx.is_match("libgcc_s.so.1"));
        assert!(!r.thread_rx.is_match("libm.so.6"));
    }

    #[test]
    fn setters_validate_regexes() {
        let mut r = DependencyResolver::new();
        assert!(r.set_ldlist_rx(r"(\S+)").is_ok());
        assert!(matches!(r.set_ldlist_rx("(unclosed"), Err(Error::Regex(_))));
        assert!(matches!(r.set_ldconfig_rx("[bad"), Err(Error::Regex(_))));
        assert!(matches!(r.set_library_rx("[bad"), Err(Error::Regex(_))));
    }

    #[test]
    fn deps_requires_absolute_path() {
        let mut r = DependencyResolver::new();
        assert!(matches!(
            r.deps("relative/bin", false),
            Err(Error::NotAbsolute(_))
        ));
    }
}
