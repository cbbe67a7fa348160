/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Property substitution and small text helpers shared by the builder:
//! `{key}` tokens resolved against the config's property map, standard
//! string escapes, lexical path normalization and number parsing.

use std::collections::BTreeMap;

use crate::Error;
use crate::Result;

/// Interpret the standard escape alphabet (`\n`, `\t`, `\xHH`, octal, …).
/// Unknown escapes keep their backslash.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('x') => {
                let mut hex = String::new();
                for _ in 0..2 {
                    match chars.peek() {
                        Some(h) if h.is_ascii_hexdigit() => hex.push(chars.next().unwrap_or('0')),
                        _ => break,
                    }
                }
                match u8::from_str_radix(&hex, 16) {
                    Ok(b) if !hex.is_empty() => out.push(b as char),
                    _ => {
                        out.push_str("\\x");
                        out.push_str(&hex);
                    }
                }
            }
            Some(d @ '0'..='7') => {
                let mut oct = String::from(d);
                for _ in 0..2 {
                    match chars.peek() {
                        Some(o @ '0'..='7') => {
                            oct.push(*o);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                if let Ok(b) = u8::from_str_radix(&oct, 8) {
                    out.push(b as char);
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

/// Substitute `{key}` tokens against `map`. `{{` and `}}` escape literal
/// braces; an unknown key is an error.
pub fn substitute(s: &str, map: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => return Err(Error::UnknownProperty(key)),
                    }
                }
                match map.get(&key) {
                    Some(value) => out.push_str(value),
                    None => return Err(Error::UnknownProperty(key)),
                }
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Lexical absolute-path normalization: relative paths are joined with the
/// current directory, then `//`, `.` and `..` components collapse without
/// consulting the filesystem.
pub fn abs_path(path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// `os.path.dirname` semantics.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        None => "",
        Some(i) => {
            let head = &path[..i + 1];
            let stripped = head.trim_end_matches('/');
            if stripped.is_empty() {
                head
            } else {
                stripped
            }
        }
    }
}

/// `os.path.join(dir, name)` for the two-component case: an absolute
/// `name` wins.
pub fn join(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parse an integer accepting `0x`/`0o` prefixes and leading-zero octal.
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        u64::from_str_radix(oct, 8).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Quote an argument for command echoes when it contains whitespace.
pub fn quote_arg(s: &str) -> String {
    if s.contains(char::is_whitespace) {
        format!("{s:?}")
    } else {
        s.to_string()
    }
}

/// Compact byte count with a 1024-based magnitude suffix, for the
/// resource report.
pub fn human_bytes(n: u64) -> String {
    const SUFFIXES: &str = "KMGTPEZY";
    if n < 10_000 {
        return n.to_string();
    }
    let mut value = n as f64;
    let mut suffix = ' ';
    for s in SUFFIXES.chars() {
        value /= 1024.0;
        suffix = s;
        if value < 1000.0 {
            break;
        }
    }
    if value < 10.0 {
        format!("{value:.1}{suffix}")
    } else {
        format!("{value:.0}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case::newline(r"a\nb", "a\nb")]
    #[case::tab(r"a\tb", "a\tb")]
    #[case::backslash(r"a\\b", "a\\b")]
    #[case::hex(r"\x41", "A")]
    #[case::octal(r"\101", "A")]
    #[case::unknown(r"\q", "\\q")]
    #[case::plain("no escapes", "no escapes")]
    fn unescape_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(unescape(input), expected);
    }

    #[test]
    fn substitute_resolves_keys() {
        let m = map(&[("jailhome", "/var/jailbase/bob"), ("user", "bob")]);
        assert_eq!(
            substitute("{jailhome}/home/{user}", &m).unwrap(),
            "/var/jailbase/bob/home/bob"
        );
        assert_eq!(substitute("{{literal}}", &m).unwrap(), "{literal}");
        assert!(matches!(
            substitute("{missing}", &m),
            Err(Error::UnknownProperty(k)) if k == "missing"
        ));
    }

    #[rstest]
    #[case("/a/b/c", "/a/b/c")]
    #[case("//a//b/", "/a/b")]
    #[case("/a/./b", "/a/b")]
    #[case("/a/b/..", "/a")]
    #[case("/..", "/")]
    #[case("/", "/")]
    fn abs_path_normalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(abs_path(input), expected);
    }

    #[test]
    fn abs_path_joins_cwd_for_relative() {
        let got = abs_path("some/rel");
        assert!(got.starts_with('/'));
        assert!(got.ends_with("/some/rel"));
    }

    #[rstest]
    #[case("/a/b", "/a")]
    #[case("/a", "/")]
    #[case("a", "")]
    #[case("/", "/")]
    fn dirname_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(dirname(input), expected);
    }

    #[test]
    fn join_prefers_absolute_names() {
        assert_eq!(join("/etc", "hosts"), "/etc/hosts");
        assert_eq!(join("/etc", "/abs"), "/abs");
        assert_eq!(join("/", "tmp"), "/tmp");
    }

    #[rstest]
    #[case("0750", Some(0o750))]
    #[case("0o750", Some(0o750))]
    #[case("0x1f", Some(0x1f))]
    #[case("644", Some(644))]
    #[case("0", Some(0))]
    #[case("junk", None)]
    fn parse_number_cases(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_number(input), expected);
    }

    #[test]
    fn human_bytes_is_compact() {
        assert_eq!(human_bytes(512), "512");
        assert_eq!(human_bytes(8 * 1024 * 1024), "8.0M");
        assert!(human_bytes(3 * 1024 * 1024 * 1024).ends_with('G'));
    }
}
