/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Command-line handling: an explicit handler registry consulted by an
//! ordered-queue parser. Direct options apply while parsing (and may
//! inject replacement tokens); queued commands run afterwards, in parse
//! order, with `--try` absorbing the next failure.

use std::collections::VecDeque;

use jail_build::fmt::quote_arg;
use jail_build::Error;
use jail_build::Jail;
use jail_build::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Verbose,
    Passwd,
    Help,
    Dns,
    Lazy,
    Umask,
    Chdir,
    Chuid,
    Test,
    Defaults,
    Etc,
    ValidName,
    WritePath,
    LdconfigCmd,
    LdconfigRx,
    LdlistCmd,
    LdlistRx,
    Namespec,
    Bind,
    Print,
    Mount,
    Umount,
    Clean,
    Remove,
    Dev,
    Tmp,
    Add,
    AddFrom,
    AddRecurse,
    Mknod,
    Mkdir,
    LnS,
    Chflags,
    Chmod,
    Chown,
    Touch,
    Clone,
    CloneRecurse,
    CloneFrom,
    Rm,
    Rmdir,
    Try,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Applied immediately during parsing; may inject replacement tokens.
    Direct,
    /// Deferred to the ordered queue executed after parsing.
    Queued,
}

pub struct HandlerSpec {
    pub keys: &'static [&'static str],
    /// 1-based index for positional arguments with no option key.
    pub positional: Option<usize>,
    pub kind: Kind,
    pub min_args: usize,
    /// `None` means variadic.
    pub max_args: Option<usize>,
    /// A final handler consumes every remaining token.
    pub is_final: bool,
    pub args_help: &'static str,
    pub doc: &'static str,
    pub op: Op,
}

pub const REGISTRY: &[HandlerSpec] = &[
    HandlerSpec {
        keys: &["-v", "--verbose"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Be more verbose.",
        op: Op::Verbose,
    },
    HandlerSpec {
        keys: &["--passwd"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Update or add entries for all users and groups seen in the jail \
              /etc/passwd and /etc/group files.",
        op: Op::Passwd,
    },
    HandlerSpec {
        keys: &["-h", "--help"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Show help text and exit.",
        op: Op::Help,
    },
    HandlerSpec {
        keys: &["--dns"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Add DNS libraries even if no executables or libraries explicitly \
              require them.",
        op: Op::Dns,
    },
    HandlerSpec {
        keys: &["--lazy"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Causes --umount to use umount with the -l switch.",
        op: Op::Lazy,
    },
    HandlerSpec {
        keys: &["--umask"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <mask>",
        doc: "Set the process umask for --execute. Defaults to 037.",
        op: Op::Umask,
    },
    HandlerSpec {
        keys: &["--chdir"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <path>",
        doc: "Set the current directory inside the jail for --execute. \
              Defaults to /.",
        op: Op::Chdir,
    },
    HandlerSpec {
        keys: &["--chuid"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <user[:group]>",
        doc: "Set the user and primary group to run as for --execute. \
              Defaults to the jail's uid and gid.",
        op: Op::Chuid,
    },
    HandlerSpec {
        keys: &["-t", "--test"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Test mode, only print the equivalent shell commands. Since \
              nothing is actually done, there will likely be errors that \
              won't occur when running without --test, as parent directories \
              may not have been created or mounts missing.",
        op: Op::Test,
    },
    HandlerSpec {
        keys: &["-d", "--defaults"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Enable jail default options and contents. Use --print \
              {defaults_text} for details.",
        op: Op::Defaults,
    },
    HandlerSpec {
        keys: &["--etc"],
        positional: None,
        kind: Kind::Direct,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Add a minimal set of files from /etc to the jail. Use --print \
              {etc_text} for details.",
        op: Op::Etc,
    },
    HandlerSpec {
        keys: &["--validname"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <regex>",
        doc: "Set the regular expression used to check if a given name could \
              be used as a system username.",
        op: Op::ValidName,
    },
    HandlerSpec {
        keys: &["--writepath"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <regex>",
        doc: "Set the regular expression used to deny or allow writing. A \
              command may only make changes if the path matches.",
        op: Op::WritePath,
    },
    HandlerSpec {
        keys: &["--ldconfig-cmd"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <cmdline>",
        doc: "Set the command used to read the shared object index. Default \
              is /sbin/ldconfig -p.",
        op: Op::LdconfigCmd,
    },
    HandlerSpec {
        keys: &["--ldconfig-rx"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <regex>",
        doc: "Set the regular expression used to parse the output of \
              --ldconfig-cmd.",
        op: Op::LdconfigRx,
    },
    HandlerSpec {
        keys: &["--ldlist-cmd"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <template>",
        doc: "Set the command template used to list shared object \
              dependencies. Default is {ldlinux_so} --list {path}.",
        op: Op::LdlistCmd,
    },
    HandlerSpec {
        keys: &["--ldlist-rx"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <regex>",
        doc: "Set the regular expression used to parse the output of \
              --ldlist-cmd.",
        op: Op::LdlistRx,
    },
    HandlerSpec {
        keys: &[],
        positional: Some(1),
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <user[:group]>",
        doc: "Set the jail user and optionally group. If group is omitted it \
              defaults to user. They need not be existing system user or \
              group names. For more information about jail properties, see \
              --print.",
        op: Op::Namespec,
    },
    HandlerSpec {
        keys: &["--bind"],
        positional: None,
        kind: Kind::Direct,
        min_args: 1,
        max_args: Some(3),
        is_final: false,
        args_help: " <srcpath> [opts] [path]",
        doc: "If directory srcpath exists when --mount:ing the jail, mount it \
              at {jailmount}/path with the bind options opts. Creates a mount \
              point {jailhome}/path if needed. path defaults to srcpath; \
              opts defaults to auto. Bind options always contain nosuid.",
        op: Op::Bind,
    },
    HandlerSpec {
        keys: &["--print"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(1),
        is_final: false,
        args_help: " [fmt]",
        doc: "Print the text fmt with {key} tokens substituted from the jail \
              properties. Without fmt, print the property list.",
        op: Op::Print,
    },
    HandlerSpec {
        keys: &["--mount"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Mount {jailhome} at {jailmount}, then mount all --bind \
              directories. Creates mount point directories in {jailhome} as \
              needed.",
        op: Op::Mount,
    },
    HandlerSpec {
        keys: &["--umount"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Unmount all mounted directories at or below {jailmount}.",
        op: Op::Umount,
    },
    HandlerSpec {
        keys: &["--clean"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Remove all files and directories within {jailpriv}.",
        op: Op::Clean,
    },
    HandlerSpec {
        keys: &["--remove"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Remove {jailhome} and {jailpriv}. Implies --umount.",
        op: Op::Remove,
    },
    HandlerSpec {
        keys: &["--dev"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Create a minimal /dev for jails at {jaildev}.",
        op: Op::Dev,
    },
    HandlerSpec {
        keys: &["--tmp"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "Create a /tmp for jails at {jailtmp}.",
        op: Op::Tmp,
    },
    HandlerSpec {
        keys: &["--add"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: None,
        is_final: false,
        args_help: " <path>...",
        doc: "Add paths and dependencies to the jail: --clone path \
              {jailhome}/path. If path is an executable or a library, --add \
              all libraries it depends on.",
        op: Op::Add,
    },
    HandlerSpec {
        keys: &["--add-from"],
        positional: None,
        kind: Kind::Queued,
        min_args: 1,
        max_args: None,
        is_final: false,
        args_help: " <dir> <file>...",
        doc: "Add zero or more files from dir to the jail. See --add.",
        op: Op::AddFrom,
    },
    HandlerSpec {
        keys: &["--add-recurse"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: None,
        is_final: false,
        args_help: " [--quick] <path>...",
        doc: "Add paths, dependencies and directory contents to the jail. \
              With --quick, assume directory contents are unchanged if the \
              directory date and size are unchanged.",
        op: Op::AddRecurse,
    },
    HandlerSpec {
        keys: &["--mknod"],
        positional: None,
        kind: Kind::Queued,
        min_args: 3,
        max_args: Some(4),
        is_final: false,
        args_help: " <path> c|b <major> [minor]",
        doc: "Create the special device file path of type c or b. If path \
              exists, ensure it has the same type and device numbers. With \
              no minor, major is a combined device number.",
        op: Op::Mknod,
    },
    HandlerSpec {
        keys: &["--mkdir"],
        positional: None,
        kind: Kind::Queued,
        min_args: 1,
        max_args: Some(3),
        is_final: false,
        args_help: " <path> [mode] [user[:group]]",
        doc: "Create the directory path with mode permissions and optionally \
              set the owning user and group. mode defaults to 0750.",
        op: Op::Mkdir,
    },
    HandlerSpec {
        keys: &["--ln-s"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: Some(2),
        is_final: false,
        args_help: " <target> <linkname>",
        doc: "Create the symlink linkname referring to target. If linkname \
              exists it must be a symlink referring to target.",
        op: Op::LnS,
    },
    HandlerSpec {
        keys: &["--chflags"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: Some(2),
        is_final: false,
        args_help: " <path> <flags>",
        doc: "On systems that support it, change the file flags of path to \
              flags.",
        op: Op::Chflags,
    },
    HandlerSpec {
        keys: &["--chmod"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: Some(2),
        is_final: false,
        args_help: " <path> <mode>",
        doc: "Change the permissions of path to mode.",
        op: Op::Chmod,
    },
    HandlerSpec {
        keys: &["--chown"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: Some(2),
        is_final: false,
        args_help: " <path> <user[:group]>",
        doc: "Change the ownership of path. If omitted, group is left \
              unchanged.",
        op: Op::Chown,
    },
    HandlerSpec {
        keys: &["--touch"],
        positional: None,
        kind: Kind::Queued,
        min_args: 1,
        max_args: Some(2),
        is_final: false,
        args_help: " <path> [mtime]",
        doc: "Set the modification time of path, which must exist. mtime \
              defaults to the current time; use the format %Y%m%d%H%M.%S.",
        op: Op::Touch,
    },
    HandlerSpec {
        keys: &["--clone"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: Some(2),
        is_final: false,
        args_help: " <src> <dst>",
        doc: "Copy src to dst, along with data and metadata. Symlinks are \
              copied, not followed. src must exist; if dst exists it must \
              have the same type. Clones parent directories as needed.",
        op: Op::Clone,
    },
    HandlerSpec {
        keys: &["--clone-recurse"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: Some(3),
        is_final: false,
        args_help: " [--quick] <src> <dst>",
        doc: "Clone src to dst; if src is a directory, --clone-recurse its \
              contents. With --quick, assume directory contents are \
              unchanged if their size and modification times match.",
        op: Op::CloneRecurse,
    },
    HandlerSpec {
        keys: &["--clone-from"],
        positional: None,
        kind: Kind::Queued,
        min_args: 2,
        max_args: None,
        is_final: false,
        args_help: " <srcdir> <dstdir> <file>...",
        doc: "Clone files from srcdir to dstdir.",
        op: Op::CloneFrom,
    },
    HandlerSpec {
        keys: &["--rm"],
        positional: None,
        kind: Kind::Queued,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <path>",
        doc: "Remove the file path.",
        op: Op::Rm,
    },
    HandlerSpec {
        keys: &["--rmdir"],
        positional: None,
        kind: Kind::Queued,
        min_args: 1,
        max_args: Some(1),
        is_final: false,
        args_help: " <path>",
        doc: "Remove the empty directory path.",
        op: Op::Rmdir,
    },
    HandlerSpec {
        keys: &["--try"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: Some(0),
        is_final: false,
        args_help: "",
        doc: "The next command will ignore failure.",
        op: Op::Try,
    },
    HandlerSpec {
        keys: &["--", "--execute"],
        positional: None,
        kind: Kind::Queued,
        min_args: 0,
        max_args: None,
        is_final: true,
        args_help: " [name=value ...] <program> [args ...]",
        doc: "Execute program inside the jail, replacing this process. The \
              environment is cleared except for JAILBASE, PWD, USER, HOME, \
              PATH and LANG, plus anything given as name=value before \
              program. Everything after --execute is taken as arguments. \
              Implies --passwd and --mount. See also --chuid, --umask, \
              --chdir.",
        op: Op::Execute,
    },
];

#[derive(Debug)]
pub struct Command {
    pub op: Op,
    pub token: String,
    pub args: Vec<String>,
    pub text: String,
}

fn lookup_key(token: &str) -> Option<&'static HandlerSpec> {
    REGISTRY.iter().find(|spec| spec.keys.contains(&token))
}

/// Parse the argument stream: apply direct options in place (injecting
/// their replacement tokens), expand combined short options, and collect
/// queued commands in order.
pub fn parse(jail: &mut Jail, args: Vec<String>, debug: u32) -> Result<Vec<Command>> {
    if debug > 0 {
        for spec in REGISTRY {
            eprintln!(
                "cli: {:?} {:?} min={} max={:?}{}",
                spec.kind,
                spec.keys,
                spec.min_args,
                spec.max_args,
                if spec.is_final { " final" } else { "" },
            );
        }
    }
    let mut tokens: VecDeque<String> = args.into();
    let mut queue = Vec::new();
    let mut positional = 0usize;

    while let Some(token) = tokens.pop_front() {
        if debug > 1 {
            eprintln!("cli: token {token:?} + {tokens:?}");
        }
        // -abc expands to -a -b -c
        if token.len() > 2 && token.starts_with('-') && !token.starts_with("--") {
            for ch in token.chars().collect::<Vec<_>>().into_iter().skip(1).rev() {
                tokens.push_front(format!("-{ch}"));
            }
            continue;
        }

        let spec = match lookup_key(&token) {
            Some(spec) => spec,
            None => {
                positional += 1;
                let Some(spec) = REGISTRY
                    .iter()
                    .find(|spec| spec.positional == Some(positional))
                else {
                    return Err(Error::Other(anyhow::anyhow!(
                        "{token:?}: unexpected argument"
                    )));
                };
                tokens.push_front(token.clone());
                spec
            }
        };

        let mut cmd_args = Vec::new();
        loop {
            if let Some(max) = spec.max_args {
                if cmd_args.len() >= max {
                    break;
                }
            }
            match tokens.front() {
                None => break,
                Some(next) if !spec.is_final && lookup_key(next).is_some() => break,
                Some(_) => cmd_args.push(tokens.pop_front().expect("front is some")),
            }
        }
        if cmd_args.len() < spec.min_args {
            return Err(Error::Other(anyhow::anyhow!(
                "{token:?}: missing arguments ({} of at least {} given)",
                cmd_args.len(),
                spec.min_args,
            )));
        }

        let text = std::iter::once(token.clone())
            .filter(|_| !spec.keys.is_empty())
            .chain(cmd_args.iter().map(|a| quote_arg(a)))
            .collect::<Vec<_>>()
            .join(" ");

        match spec.kind {
            Kind::Direct => {
                if debug > 0 {
                    eprintln!("cli: direct {text}");
                }
                if let Some(inject) = apply_direct(jail, spec.op, &cmd_args)? {
                    for t in inject.into_iter().rev() {
                        tokens.push_front(t);
                    }
                }
            }
            Kind::Queued => {
                if debug > 0 {
                    eprintln!("cli: queued {text}");
                }
                queue.push(Command {
                    op: spec.op,
                    token: token.clone(),
                    args: cmd_args,
                    text,
                });
            }
        }
    }
    Ok(queue)
}

/// Apply a direct option. Returns tokens to splice back into the stream.
fn apply_direct(jail: &mut Jail, op: Op, args: &[String]) -> Result<Option<Vec<String>>> {
    match op {
        Op::Verbose => jail.cfg.verbose = true,
        Op::Passwd => jail.cfg.passwd = true,
        Op::Help => jail.cfg.help = true,
        Op::Dns => jail.cfg.dns = true,
        Op::Lazy => jail.cfg.lazy = true,
        Op::Test => jail.cfg.test = true,
        Op::Umask => jail.cfg.set_umask(&args[0])?,
        Op::Chdir => jail.cfg.exec_chdir = args[0].clone(),
        Op::Chuid => jail.cfg.set_chuid(&args[0])?,
        Op::ValidName => jail.cfg.set_validname(&args[0])?,
        Op::WritePath => jail.cfg.set_writepath(&args[0])?,
        Op::LdconfigCmd => jail.resolver_mut().set_ldconfig_cmd(&args[0]),
        Op::LdconfigRx => jail.resolver_mut().set_ldconfig_rx(&args[0])?,
        Op::LdlistCmd => jail.resolver_mut().set_ldlist_cmd(&args[0]),
        Op::LdlistRx => jail.resolver_mut().set_ldlist_rx(&args[0])?,
        Op::Namespec => jail.cfg.set_namespec(&args[0])?,
        Op::Bind => jail.cfg.bind(
            &args[0],
            args.get(1).map(String::as_str),
            args.get(2).map(String::as_str),
        ),
        Op::Defaults => {
            if !jail.cfg.defaults {
                jail.cfg.defaults = true;
                return Ok(Some(
                    jail.cfg
                        .defaults_text
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                ));
            }
        }
        Op::Etc => {
            if !jail.cfg.etc {
                jail.cfg.etc = true;
                return Ok(Some(
                    jail.cfg
                        .etc_text
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                ));
            }
        }
        _ => unreachable!("queued op dispatched as direct"),
    }
    Ok(None)
}

/// Run the queued commands in parse order. A failure aborts unless the
/// command was protected by `--try` or the run is in test mode.
pub fn run_queue(jail: &mut Jail, queue: Vec<Command>) -> Result<()> {
    jail.sync_policy();
    jail.log(&jail.cfg.to_string());
    for cmd in &queue {
        if jail.try_next > 0 {
            jail.try_next -= 1;
        }
        jail.log(&cmd.text);
        if let Err(e) = dispatch(jail, cmd) {
            let absorbed = jail.try_next > 0;
            jail.log(&format!(
                "{}{}: {e}",
                if absorbed { "--try " } else { "" },
                cmd.token,
            ));
            if absorbed || jail.cfg.test {
                continue;
            }
            return Err(Error::Other(anyhow::anyhow!("{}: {e}", cmd.token)));
        }
    }
    jail.all_done()
}

fn dispatch(jail: &mut Jail, cmd: &Command) -> Result<()> {
    let args = &cmd.args;
    let arg = |i: usize| args[i].as_str();
    let opt = |i: usize| args.get(i).map(String::as_str);
    match cmd.op {
        Op::Print => jail.print(opt(0)),
        Op::Mount => jail.mount(),
        Op::Umount => jail.umount(),
        Op::Clean => jail.clean(),
        Op::Remove => jail.remove(),
        Op::Dev => jail.dev(),
        Op::Tmp => jail.tmp(),
        Op::Add => jail.add(args),
        Op::AddFrom => jail.add_from(arg(0), &args[1..]),
        Op::AddRecurse => jail.add_recurse(args),
        Op::Mknod => jail.mknod(arg(0), arg(1), arg(2), opt(3)),
        Op::Mkdir => jail.mkdir(arg(0), opt(1), opt(2)),
        Op::LnS => jail.ln_s(arg(0), arg(1)),
        Op::Chflags => jail.chflags(arg(0), arg(1)),
        Op::Chmod => jail.chmod(arg(0), arg(1)),
        Op::Chown => jail.chown(arg(0), arg(1)),
        Op::Touch => jail.touch(arg(0), opt(1)),
        Op::Clone => jail.clone(arg(0), arg(1)),
        Op::CloneRecurse => {
            let quick = args.iter().any(|a| a == "--quick");
            let rest: Vec<&str> = args
                .iter()
                .filter(|a| *a != "--quick")
                .map(String::as_str)
                .collect();
            let [src, dst] = rest.as_slice() else {
                return Err(Error::Other(anyhow::anyhow!(
                    "expected <src> <dst>, got {args:?}"
                )));
            };
            jail.clone_recurse(src, dst, quick)
        }
        Op::CloneFrom => jail.clone_from(arg(0), arg(1), &args[2..]),
        Op::Rm => jail.rm(arg(0)),
        Op::Rmdir => jail.rmdir(arg(0)),
        Op::Try => {
            jail.cli_try();
            Ok(())
        }
        Op::Execute => jail.execute(args),
        _ => unreachable!("direct op in the queue"),
    }
}

#[cfg(test)]
mod tests {
    use jail_build::BaseDirs;
    use jail_build::JailConfig;

    use super::*;

    fn jail() -> Jail {
        let base = BaseDirs {
            name: "jailbase".to_string(),
            tmp: "/tmp/jailbase".to_string(),
            home: "/var/jailbase".to_string(),
            mount: "/mnt/jailbase".to_string(),
        };
        Jail::new(JailConfig::new(base).unwrap()).unwrap()
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn direct_options_apply_immediately() {
        let mut j = jail();
        let queue = parse(&mut j, strings(&["-t", "-v", "--dns"]), 0).unwrap();
        assert!(queue.is_empty());
        assert!(j.cfg.test && j.cfg.verbose && j.cfg.dns);
    }

    #[test]
    fn combined_short_options_expand() {
        let mut j = jail();
        let queue = parse(&mut j, strings(&["-tv"]), 0).unwrap();
        assert!(queue.is_empty());
        assert!(j.cfg.test && j.cfg.verbose);
    }

    #[test]
    fn queued_commands_keep_parse_order() {
        let mut j = jail();
        let queue = parse(
            &mut j,
            strings(&["--mkdir", "/x", "--add", "/bin/sh", "/bin/ls", "--umount"]),
            0,
        )
        .unwrap();
        let ops: Vec<Op> = queue.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![Op::Mkdir, Op::Add, Op::Umount]);
        assert_eq!(queue[1].args, strings(&["/bin/sh", "/bin/ls"]));
        assert_eq!(queue[1].text, "--add /bin/sh /bin/ls");
    }

    #[test]
    fn positional_sets_the_namespec() {
        let mut j = jail();
        let queue = parse(&mut j, strings(&["somejailuser", "--mount"]), 0).unwrap();
        assert_eq!(j.cfg.user.as_deref(), Some("somejailuser"));
        assert_eq!(queue.len(), 1);
        // a second positional is not handled
        let mut j = jail();
        assert!(parse(&mut j, strings(&["alpha", "beta"]), 0).is_err());
    }

    #[test]
    fn final_handler_consumes_everything() {
        let mut j = jail();
        let queue = parse(
            &mut j,
            strings(&["--", "/bin/sh", "--add", "-v", "K=V"]),
            0,
        )
        .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].op, Op::Execute);
        assert_eq!(queue[0].args, strings(&["/bin/sh", "--add", "-v", "K=V"]));
        assert!(!j.cfg.verbose);
    }

    #[test]
    fn defaults_inject_once() {
        let mut j = jail();
        let queue = parse(
            &mut j,
            strings(&["somejailuser", "--defaults", "--defaults"]),
            0,
        )
        .unwrap();
        assert!(j.cfg.defaults && j.cfg.etc && j.cfg.passwd);
        // the injected text queues tmp/dev/etc-adds, mkdir, clones, links
        assert!(queue.iter().any(|c| c.op == Op::Tmp));
        assert!(queue.iter().any(|c| c.op == Op::Dev));
        assert!(queue.iter().any(|c| c.op == Op::Add));
        let mkdirs = queue.iter().filter(|c| c.op == Op::Mkdir).count();
        assert_eq!(mkdirs, 1, "second --defaults must not re-inject");
    }

    #[test]
    fn missing_arguments_are_an_error() {
        let mut j = jail();
        assert!(parse(&mut j, strings(&["--ln-s", "target"]), 0).is_err());
        assert!(parse(&mut j, strings(&["--umask"]), 0).is_err());
    }

    #[test]
    fn arguments_stop_at_the_next_key() {
        let mut j = jail();
        let queue = parse(&mut j, strings(&["--touch", "/x", "--umount"]), 0).unwrap();
        assert_eq!(queue[0].args, strings(&["/x"]));
        assert_eq!(queue[1].op, Op::Umount);
        // but unregistered dashed tokens are consumed as arguments
        let mut j = jail();
        let queue = parse(
            &mut j,
            strings(&["--add-recurse", "--quick", "/usr/share/locale"]),
            0,
        )
        .unwrap();
        assert_eq!(queue[0].args, strings(&["--quick", "/usr/share/locale"]));
    }

    #[test]
    fn bad_direct_value_is_an_error() {
        let mut j = jail();
        assert!(parse(&mut j, strings(&["--writepath", "[bad"]), 0).is_err());
        assert!(parse(&mut j, strings(&["--umask", "bogus"]), 0).is_err());
    }

    #[test]
    fn try_is_queued_in_order() {
        let mut j = jail();
        let queue = parse(
            &mut j,
            strings(&["--try", "--add", "/nope", "--umount"]),
            0,
        )
        .unwrap();
        let ops: Vec<Op> = queue.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![Op::Try, Op::Add, Op::Umount]);
    }
}
