/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Parse and render `/etc/passwd` and `/etc/group` so that a jail's user
//! database can be rebuilt from the set of uids and gids observed while the
//! jail was populated.

pub mod group;
pub mod passwd;

pub use group::EtcGroup;
pub use group::GroupRecord;
pub use passwd::EtcPasswd;
pub use passwd::UserRecord;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0} defined twice, first as {1} and then as {2}")]
    Duplicate(String, String, String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
