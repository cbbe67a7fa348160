/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rewrite the jail's `/etc/passwd` and `/etc/group` from the uids and
//! gids observed while the jail was populated.

use jail_sfs::FileFormat;
use jail_users::EtcGroup;
use jail_users::EtcPasswd;
use jail_users::GroupRecord;
use jail_users::UserRecord;

use crate::builder::Jail;
use crate::Result;

impl Jail {
    /// Runs once during the terminal phase when `--passwd` was requested
    /// and the jail home exists. Every uid and gid already present in the
    /// jail's passwd/group files joins the observed set first, so repeated
    /// runs keep prior entries.
    pub(crate) fn update_passwd(&mut self) -> Result<()> {
        if self.updated_passwd || !self.cfg.passwd {
            return Ok(());
        }
        let jailhome = self.cfg.jailhome()?;
        if self.dststat(&jailhome)?.is_none() {
            return Ok(());
        }
        self.updated_passwd = true;
        self.clone("/etc", "{jailhome}/etc")?;

        let etcpasswd_path = self.dstpath("{jailhome}/etc/passwd")?;
        let etcpasswd_node = self.dststat_fmt(&etcpasswd_path, FileFormat::Regular)?;
        let etcgroup_path = self.dstpath("{jailhome}/etc/group")?;
        let etcgroup_node = self.dststat_fmt(&etcgroup_path, FileFormat::Regular)?;

        if self.fs.exists(etcpasswd_node) {
            if let Ok(text) = std::fs::read_to_string(&etcpasswd_path) {
                match EtcPasswd::parse(&text) {
                    Ok(db) => {
                        for record in db.records() {
                            self.dst_uid(record.uid);
                        }
                    }
                    Err(e) => self.log(&format!("{etcpasswd_path}: {e}")),
                }
            }
        }
        if self.fs.exists(etcgroup_node) {
            if let Ok(text) = std::fs::read_to_string(&etcgroup_path) {
                match EtcGroup::parse(&text) {
                    Ok(db) => {
                        for record in db.records() {
                            self.dst_gid(record.gid);
                        }
                    }
                    Err(e) => self.log(&format!("{etcgroup_path}: {e}")),
                }
            }
        }

        let mut passwd = EtcPasswd::new();
        let mut known_users = std::collections::BTreeSet::new();
        for (uid, pw) in self.dst_uids.clone() {
            known_users.insert(pw.name.clone());
            let record = UserRecord {
                name: pw.name.clone(),
                password: if pw.passwd.as_bytes().is_empty() {
                    String::new()
                } else {
                    "*".to_string()
                },
                uid,
                gid: pw.gid.as_raw(),
                gecos: pw.gecos.to_string_lossy().into_owned(),
                home: pw.dir.to_string_lossy().into_owned(),
                shell: pw.shell.to_string_lossy().into_owned(),
            };
            if let Err(e) = passwd.push(record) {
                self.log(&e.to_string());
            }
        }
        self.write_db(&etcpasswd_path, &passwd.to_string())?;
        let host = self
            .srcstat("/etc/passwd")?
            .ok_or(crate::Error::NotFound("/etc/passwd".to_string()))?;
        let host_meta = self.fs.meta(host);
        self.fs.chmod(etcpasswd_node, host_meta.perm())?;
        self.fs
            .chown(etcpasswd_node, Some(host_meta.uid), Some(host_meta.gid))?;

        let mut group = EtcGroup::new();
        for (gid, gr) in self.dst_gids.clone() {
            let record = GroupRecord {
                name: gr.name.clone(),
                password: if gr.passwd.as_bytes().is_empty() {
                    String::new()
                } else {
                    "*".to_string()
                },
                gid,
                members: gr
                    .mem
                    .iter()
                    .filter(|m| known_users.contains(*m))
                    .cloned()
                    .collect(),
            };
            if let Err(e) = group.push(record) {
                self.log(&e.to_string());
            }
        }
        self.write_db(&etcgroup_path, &group.to_string())?;
        let host = self
            .srcstat("/etc/group")?
            .ok_or(crate::Error::NotFound("/etc/group".to_string()))?;
        let host_meta = self.fs.meta(host);
        self.fs.chmod(etcgroup_node, host_meta.perm())?;
        self.fs
            .chown(etcgroup_node, Some(host_meta.uid), Some(host_meta.gid))?;
        Ok(())
    }

    fn write_db(&mut self, path: &str, text: &str) -> Result<()> {
        let cmd = format!("cat > {path:?} <<_EOT_\n{text}_EOT_");
        if self.fs.policy().writable(Some(path), Some(&cmd))? {
            std::fs::write(path, text)?;
        }
        Ok(())
    }
}
