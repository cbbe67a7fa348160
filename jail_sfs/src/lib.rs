/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shadow filesystem.
//!
//! Caches `lstat(2)` results in a tree of nodes mirroring the directory
//! structure, and routes every mutating filesystem operation through that
//! cache so that a complete dry run can be computed from in-memory state.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use nix::sys::stat::FileStat;
use nix::sys::stat::SFlag;

mod policy;
mod tree;

pub use policy::PathPolicy;
pub use tree::NodeId;
pub use tree::ShadowFs;
pub use tree::ROOT;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0:?}")]
    NotFound(String),
    #[error("{path:?}: expected {expected}, got {actual}")]
    FormatMismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{path:?}: expected device {expected:#x}, found {actual:#x}")]
    DeviceMismatch { path: String, expected: u64, actual: u64 },
    #[error("{path:?}: recursive symlink, {unreachable:?} unreachable")]
    SymlinkLoop { path: String, unreachable: String },
    #[error("{path:?} mismatch vs disk: {diff}")]
    CacheDrift { path: String, diff: String },
    #[error("{cmd:?}: writepath disallows {path:?}")]
    PolicyViolation { cmd: String, path: String },
    #[error("refusing to remove {0:?}: too close to the filesystem root")]
    NearRoot(String),
    #[error("bad timestamp {0:?}, expected %Y%m%d%H%M.%S")]
    BadTimestamp(String),
    #[error("{cmd}: {source}")]
    Syscall {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// File type of a node, from the `S_IFMT` bits of its mode. `None` marks a
/// node that does not exist on disk and has no planned type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    None,
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileFormat {
    pub fn from_mode(mode: u32) -> Self {
        match mode & SFlag::S_IFMT.bits() {
            m if m == SFlag::S_IFREG.bits() => Self::Regular,
            m if m == SFlag::S_IFDIR.bits() => Self::Directory,
            m if m == SFlag::S_IFLNK.bits() => Self::Symlink,
            m if m == SFlag::S_IFCHR.bits() => Self::CharDevice,
            m if m == SFlag::S_IFBLK.bits() => Self::BlockDevice,
            m if m == SFlag::S_IFIFO.bits() => Self::Fifo,
            m if m == SFlag::S_IFSOCK.bits() => Self::Socket,
            _ => Self::None,
        }
    }

    /// The `S_IFMT` bits for this format.
    pub fn bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Regular => SFlag::S_IFREG.bits(),
            Self::Directory => SFlag::S_IFDIR.bits(),
            Self::Symlink => SFlag::S_IFLNK.bits(),
            Self::CharDevice => SFlag::S_IFCHR.bits(),
            Self::BlockDevice => SFlag::S_IFBLK.bits(),
            Self::Fifo => SFlag::S_IFIFO.bits(),
            Self::Socket => SFlag::S_IFSOCK.bits(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Regular => "file",
            Self::Directory => "dir",
            Self::Symlink => "link",
            Self::CharDevice => "chrdev",
            Self::BlockDevice => "blkdev",
            Self::Fifo => "fifo",
            Self::Socket => "sock",
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached stat record for one node. Timestamps are seconds since the epoch;
/// comparisons on them use a 0.5 s epsilon to absorb filesystem granularity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Meta {
    pub mode: u32,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub blocks: u64,
    pub blksize: u64,
    pub rdev: u64,
    pub flags: u64,
}

impl Meta {
    /// State of a node that has never been seen on disk: owned by the
    /// current process, timestamped now, everything else zero.
    pub fn fresh() -> Self {
        let now = now_secs();
        Self {
            mode: 0,
            ino: 0,
            dev: 0,
            nlink: 0,
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            blocks: 0,
            blksize: 0,
            rdev: 0,
            flags: 0,
        }
    }

    pub fn from_stat(st: &FileStat) -> Self {
        Self {
            mode: st.st_mode,
            ino: st.st_ino,
            dev: st.st_dev,
            nlink: st.st_nlink,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size.max(0) as u64,
            atime: st.st_atime as f64 + st.st_atime_nsec as f64 * 1e-9,
            mtime: st.st_mtime as f64 + st.st_mtime_nsec as f64 * 1e-9,
            ctime: st.st_ctime as f64 + st.st_ctime_nsec as f64 * 1e-9,
            blocks: st.st_blocks.max(0) as u64,
            blksize: st.st_blksize.max(0) as u64,
            rdev: st.st_rdev,
            // Linux has no st_flags; kept for metadata parity on systems
            // that do.
            flags: 0,
        }
    }

    /// Permission bits only (no file type).
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn format(&self) -> FileFormat {
        FileFormat::from_mode(self.mode)
    }

    /// A node exists if it was seen on disk (inode) or carries permission
    /// bits. Planned placeholders hold only file-type bits and do not
    /// exist yet.
    pub fn exists(&self) -> bool {
        self.ino != 0 || self.perm() != 0
    }

    pub fn is_executable(&self) -> bool {
        self.format() == FileFormat::Regular && self.mode & 0o111 != 0
    }
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn nix_io(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trip() {
        for fmt in [
            FileFormat::Regular,
            FileFormat::Directory,
            FileFormat::Symlink,
            FileFormat::CharDevice,
            FileFormat::BlockDevice,
            FileFormat::Fifo,
            FileFormat::Socket,
        ] {
            assert_eq!(FileFormat::from_mode(fmt.bits() | 0o644), fmt);
        }
        assert_eq!(FileFormat::from_mode(0o644), FileFormat::None);
    }

    #[test]
    fn planned_nodes_do_not_exist() {
        let meta = Meta {
            mode: FileFormat::Directory.bits(),
            ..Meta::fresh()
        };
        assert!(!meta.exists());
        assert_eq!(meta.format(), FileFormat::Directory);
    }

    #[test]
    fn executable_wants_regular_and_x_bit() {
        let mut meta = Meta {
            mode: FileFormat::Regular.bits() | 0o755,
            ino: 1,
            ..Meta::fresh()
        };
        assert!(meta.is_executable());
        meta.mode = FileFormat::Regular.bits() | 0o644;
        assert!(!meta.is_executable());
        meta.mode = FileFormat::Directory.bits() | 0o755;
        assert!(!meta.is_executable());
    }
}
