/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Construction and activation of chroot jails: a curated subset of the
//! host filesystem is cloned under the jail home, shared-library
//! dependencies are resolved through the dynamic loader, bind mounts
//! assemble the runtime view, and the target program is exec'd with
//! dropped privileges.

use std::process::Output;
use std::process::Stdio;

pub mod builder;
pub mod config;
mod exec;
pub mod fmt;
pub mod mounts;
pub mod resolver;
mod synth;

pub use builder::Jail;
pub use config::BaseDirs;
pub use config::JailConfig;
pub use resolver::DependencyResolver;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("jail UID or GID may not be 0")]
    RootIdDisallowed,
    #[error("invalid user name {0:?}")]
    InvalidUserName(String),
    #[error("invalid group name {0:?}")]
    InvalidGroupName(String),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("jail user not set")]
    UserNotSet,
    #[error("jail group not set")]
    GroupNotSet,
    #[error("{0:?} is not a system account")]
    NotSystemAccount(String),
    #[error("not found: {0:?}")]
    NotFound(String),
    #[error("{0:?} not set")]
    UnknownProperty(String),
    #[error("devtype must be c or b")]
    BadDeviceType,
    #[error("invalid mode {0:?}")]
    BadMode(String),
    #[error("invalid flags {0:?}")]
    BadFlags(String),
    #[error("path not absolute: {0:?}")]
    NotAbsolute(String),
    #[error("disallowed user id {0}")]
    DisallowedUid(u32),
    #[error("disallowed group id {0}")]
    DisallowedGid(u32),
    #[error("missing program to execute")]
    MissingProgram,
    #[error("{path:?}: expected symlink to {expected:?}, got {actual:?}")]
    SymlinkTargetMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("{path:?}: expected device {devtype} {major}.{minor}")]
    DeviceMismatch {
        path: String,
        devtype: String,
        major: u64,
        minor: u64,
    },
    #[error("{cmd:?}: {output}")]
    Subprocess { cmd: String, output: String },
    #[error(transparent)]
    Sfs(#[from] jail_sfs::Error),
    #[error(transparent)]
    Users(#[from] jail_users::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Spawn a helper synchronously with output captured. Spawn failure is an
/// error; a non-zero exit is reported through the returned [Output].
pub(crate) fn pcall(args: &[String], verbose: bool) -> Result<Output> {
    if verbose {
        eprintln!("# {}", args.join(" "));
    }
    let (program, rest) = args.split_first().ok_or(Error::MissingProgram)?;
    tracing::debug!(cmd = args.join(" "), "spawning helper");
    std::process::Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Subprocess {
            cmd: args.join(" "),
            output: e.to_string(),
        })
}

pub(crate) fn output_text(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}
