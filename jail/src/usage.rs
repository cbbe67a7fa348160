/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Usage text generated from the handler registry.

use crate::cli::Kind;
use crate::cli::REGISTRY;

const WIDTH: usize = 72;
const TAB: usize = 4;

fn wrap(text: &str, margin: usize, out: &mut String) {
    let indent = " ".repeat(margin * TAB);
    let mut line = indent.clone();
    let mut used = indent.len();
    for word in text.split_whitespace() {
        if used + word.len() + 1 > WIDTH && used > indent.len() {
            out.push_str(line.trim_end());
            out.push('\n');
            line = indent.clone();
            used = indent.len();
        }
        line.push_str(word);
        line.push(' ');
        used += word.len() + 1;
    }
    if used > indent.len() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
}

pub fn render() -> String {
    let mut out = String::new();
    out.push_str("NAME\n");
    wrap(
        "jail - build and maintain chroot jails from a curated subset of the \
         host filesystem",
        1,
        &mut out,
    );

    out.push_str("\nSYNOPSIS\n");
    wrap("jail [options] user[:group] [commands]", 1, &mut out);

    out.push_str("\nDESCRIPTION\n");
    wrap(
        "Commands are processed in the order they occur. If a command fails, \
         jail logs an error message and exits with a nonzero status. With \
         the --test option, the equivalent shell commands are printed \
         instead and processing continues if at all possible.",
        1,
        &mut out,
    );
    for spec in REGISTRY.iter().filter(|s| s.positional.is_some()) {
        out.push('\n');
        wrap(spec.args_help.trim(), 1, &mut out);
        wrap(spec.doc, 2, &mut out);
    }

    out.push_str("\nOPTIONS\n");
    for spec in sorted(Kind::Direct) {
        out.push('\n');
        wrap(
            &format!("{}{}", spec_keys(spec), spec.args_help),
            1,
            &mut out,
        );
        wrap(spec.doc, 2, &mut out);
    }

    out.push_str("\nCOMMANDS\n");
    for spec in sorted(Kind::Queued) {
        out.push('\n');
        wrap(
            &format!("{}{}", spec_keys(spec), spec.args_help),
            1,
            &mut out,
        );
        wrap(spec.doc, 2, &mut out);
    }
    out
}

fn spec_keys(spec: &crate::cli::HandlerSpec) -> String {
    spec.keys.join(", ")
}

fn sorted(kind: Kind) -> Vec<&'static crate::cli::HandlerSpec> {
    let mut specs: Vec<_> = REGISTRY
        .iter()
        .filter(|s| s.kind == kind && !s.keys.is_empty())
        .collect();
    // sort by the longest key, like the handler table itself
    specs.sort_by_key(|s| s.keys.iter().max_by_key(|k| k.len()).copied().unwrap_or(""));
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_mentions_every_key() {
        let text = render();
        for spec in REGISTRY {
            for key in spec.keys {
                assert!(text.contains(key), "usage is missing {key}");
            }
        }
    }

    #[test]
    fn usage_has_the_sections() {
        let text = render();
        for section in ["NAME", "SYNOPSIS", "DESCRIPTION", "OPTIONS", "COMMANDS"] {
            assert!(text.contains(section));
        }
    }

    #[test]
    fn lines_stay_within_width() {
        for line in render().lines() {
            assert!(line.len() <= WIDTH, "overlong line: {line:?}");
        }
    }
}
