/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `/etc/passwd` records: seven colon-separated fields per line.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use nom::bytes::complete::take_until;
use nom::bytes::complete::take_until1;
use nom::character::complete::char;
use nom::combinator::all_consuming;
use nom::combinator::rest;
use nom::error::convert_error;
use nom::error::ContextError;
use nom::error::ParseError;
use nom::error::VerboseError;
use nom::sequence::tuple;
use nom::Finish;
use nom::IResult;

use crate::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    /// The literal password field. The synthesizer writes `*` for accounts
    /// that had any password set and leaves it empty otherwise.
    pub password: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

impl UserRecord {
    fn parse<'a, E>(input: &'a str) -> IResult<&'a str, Self, E>
    where
        E: ParseError<&'a str> + ContextError<&'a str>,
    {
        let (input, (name, _, password, _, uid, _, gid, _, gecos, _, home, _, shell)) =
            tuple((
                take_until1(":"),
                char(':'),
                take_until(":"),
                char(':'),
                nom::character::complete::u32,
                char(':'),
                nom::character::complete::u32,
                char(':'),
                take_until(":"),
                char(':'),
                take_until(":"),
                char(':'),
                rest,
            ))(input)?;
        Ok((
            input,
            Self {
                name: name.to_string(),
                password: password.to_string(),
                uid,
                gid,
                gecos: gecos.to_string(),
                home: home.to_string(),
                shell: shell.to_string(),
            },
        ))
    }
}

impl Display for UserRecord {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}:{}",
            self.name, self.password, self.uid, self.gid, self.gecos, self.home, self.shell
        )
    }
}

/// An ordered set of user records indexed by uid and by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcPasswd {
    records: Vec<UserRecord>,
    uid_to_record_idx: BTreeMap<u32, usize>,
    username_to_record_idx: BTreeMap<String, usize>,
}

impl EtcPasswd {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut db = Self::new();
        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            let record = all_consuming(UserRecord::parse::<VerboseError<&str>>)(line)
                .finish()
                .map(|(_rest, r)| r)
                .map_err(|e| Error::Parse(convert_error(line, e)))?;
            db.push(record)?;
        }
        Ok(db)
    }

    pub fn records(&self) -> impl Iterator<Item = &UserRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: UserRecord) -> Result<()> {
        match (
            self.get_user_by_id(record.uid),
            self.get_user_by_name(&record.name),
        ) {
            (Some(existing), _) | (_, Some(existing)) if *existing == record => Ok(()),
            (Some(existing), _) | (_, Some(existing)) => Err(Error::Duplicate(
                existing.name.clone(),
                format!("{existing:?}"),
                format!("{record:?}"),
            )),
            (None, None) => {
                self.uid_to_record_idx.insert(record.uid, self.records.len());
                self.username_to_record_idx
                    .insert(record.name.clone(), self.records.len());
                self.records.push(record);
                Ok(())
            }
        }
    }

    pub fn get_user_by_name(&self, name: &str) -> Option<&UserRecord> {
        self.username_to_record_idx
            .get(name)
            .and_then(|&idx| self.records.get(idx))
    }

    pub fn get_user_by_id(&self, uid: u32) -> Option<&UserRecord> {
        self.uid_to_record_idx
            .get(&uid)
            .and_then(|&idx| self.records.get(idx))
    }
}

impl FromStr for EtcPasswd {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for EtcPasswd {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        for record in &self.records {
            writeln!(f, "{record}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parse_etc_passwd() {
        let src = r#"root:x:0:0:root:/root:/bin/bash
bin:x:1:1:bin:/bin:/sbin/nologin
daemon:*:2:2:daemon:/sbin:/sbin/nologin
pwdlesslogin::420:420:Passwordless login:/dev/null:/sbin/nologin
nobody:x:65534:65534:Kernel Overflow User:/:/sbin/nologin
"#;
        let passwd = EtcPasswd::parse(src).expect("failed to parse");
        // round trip proves every field was captured
        assert_eq!(src, passwd.to_string());
        assert_eq!(
            Some(&UserRecord {
                name: "root".into(),
                password: "x".into(),
                uid: 0,
                gid: 0,
                gecos: "root".into(),
                home: "/root".into(),
                shell: "/bin/bash".into(),
            }),
            passwd.get_user_by_id(0),
        );
        assert_eq!(passwd.get_user_by_id(0), passwd.get_user_by_name("root"));
        assert_eq!(passwd.get_user_by_id(420).map(|u| u.password.as_str()), Some(""));
    }

    #[test]
    fn parse_tolerates_blank_lines_and_no_trailing_newline() {
        let src = "root:x:0:0:root:/root:/bin/bash\n\nbin:x:1:1:bin:/bin:/sbin/nologin";
        let passwd = EtcPasswd::parse(src).expect("failed to parse");
        assert_eq!(passwd.len(), 2);
    }

    #[rstest]
    #[case::missing_fields("root:x:0:0:root")]
    #[case::non_numeric_uid("root:x:root:0:gecos:/root:/bin/bash")]
    #[case::empty_name(":x:0:0:gecos:/root:/bin/bash")]
    fn parse_rejects_malformed(#[case] src: &str) {
        assert!(EtcPasswd::parse(src).is_err());
    }

    #[test]
    fn push_deduplicates_and_rejects_conflicts() {
        let mut db = EtcPasswd::new();
        let alice = UserRecord {
            name: "alice".into(),
            password: "*".into(),
            uid: 1000,
            gid: 1000,
            gecos: String::new(),
            home: "/home/alice".into(),
            shell: "/bin/sh".into(),
        };
        db.push(alice.clone()).unwrap();
        // identical record is a no-op
        db.push(alice.clone()).unwrap();
        assert_eq!(db.len(), 1);
        // same uid, different shell: conflict
        let mut evil = alice;
        evil.shell = "/bin/bash".into();
        assert!(matches!(db.push(evil), Err(Error::Duplicate(..))));
    }
}
