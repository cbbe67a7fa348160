/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `/etc/group` records: four colon-separated fields, the last a
//! comma-separated member list.

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
pub struct GroupRecord {
    pub name: String,
    pub password: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl GroupRecord {
    fn parse<'a, E>(input: &'a str) -> IResult<&'a str, Self, E>
    where
        E: ParseError<&'a str> + ContextError<&'a str>,
    {
        let (input, (name, _, password, _, gid, _, members)) = tuple((
            take_until1(":"),
            char(':'),
            take_until(":"),
            char(':'),
            nom::character::complete::u32,
            char(':'),
            rest,
        ))(input)?;
        Ok((
            input,
            Self {
                name: name.to_string(),
                password: password.to_string(),
                gid,
                members: members
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
        ))
    }
}

impl Display for GroupRecord {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.name,
            self.password,
            self.gid,
            self.members.join(",")
        )
    }
}

/// An ordered set of group records indexed by gid and by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcGroup {
    records: Vec<GroupRecord>,
    gid_to_record_idx: BTreeMap<u32, usize>,
    groupname_to_record_idx: BTreeMap<String, usize>,
}

impl EtcGroup {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut db = Self::new();
        for line in input.lines() {
            if line.is_empty() {
                continue;
            }
            let record = all_consuming(GroupRecord::parse::<VerboseError<&str>>)(line)
                .finish()
                .map(|(_rest, r)| r)
                .map_err(|e| Error::Parse(convert_error(line, e)))?;
            db.push(record)?;
        }
        Ok(db)
    }

    pub fn records(&self) -> impl Iterator<Item = &GroupRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: GroupRecord) -> Result<()> {
        match (
            self.get_group_by_id(record.gid),
            self.get_group_by_name(&record.name),
        ) {
            (Some(existing), _) | (_, Some(existing)) if *existing == record => Ok(()),
            (Some(existing), _) | (_, Some(existing)) => Err(Error::Duplicate(
                existing.name.clone(),
                format!("{existing:?}"),
                format!("{record:?}"),
            )),
            (None, None) => {
                self.gid_to_record_idx.insert(record.gid, self.records.len());
                self.groupname_to_record_idx
                    .insert(record.name.clone(), self.records.len());
                self.records.push(record);
                Ok(())
            }
        }
    }

    pub fn get_group_by_name(&self, name: &str) -> Option<&GroupRecord> {
        self.groupname_to_record_idx
            .get(name)
            .and_then(|&idx| self.records.get(idx))
    }

    pub fn get_group_by_id(&self, gid: u32) -> Option<&GroupRecord> {
        self.gid_to_record_idx
            .get(&gid)
            .and_then(|&idx| self.records.get(idx))
    }
}

impl FromStr for EtcGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Display for EtcGroup {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        for record in &self.records {
            writeln!(f, "{record}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parse_etc_group() {
        let src = r#"root:x:0:
bin:x:1:root,daemon
daemon:*:2:root,bin
adm::4:
"#;
        let groups = EtcGroup::parse(src).expect("failed to parse");
        assert_eq!(src, groups.to_string());
        assert_eq!(
            Some(&GroupRecord {
                name: "bin".into(),
                password: "x".into(),
                gid: 1,
                members: vec!["root".into(), "daemon".into()],
            }),
            groups.get_group_by_id(1),
        );
        assert!(groups
            .get_group_by_name("adm")
            .map(|g| g.members.is_empty())
            .unwrap_or(false));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(EtcGroup::parse("root:x:zero:\n").is_err());
        assert!(EtcGroup::parse(":x:0:\n").is_err());
    }

    #[test]
    fn push_deduplicates() {
        let mut db = EtcGroup::new();
        let rec = GroupRecord {
            name: "staff".into(),
            password: "*".into(),
            gid: 50,
            members: vec!["alice".into()],
        };
        db.push(rec.clone()).unwrap();
        db.push(rec.clone()).unwrap();
        assert_eq!(db.len(), 1);
        let conflicting = GroupRecord {
            members: vec!["bob".into()],
            ..rec
        };
        assert!(matches!(db.push(conflicting), Err(Error::Duplicate(..))));
    }
}
