/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end builder tests against a throwaway directory tree. Tests
//! that would need to change foreign ownership only run as root.

use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use jail_build::BaseDirs;
use jail_build::Jail;
use jail_build::JailConfig;
use nix::unistd::Uid;
use tempfile::TempDir;

fn jail_in(tmp: &TempDir, user: &str) -> Jail {
    let root = tmp.path().to_string_lossy().into_owned();
    let base = BaseDirs {
        name: "jailbase".to_string(),
        tmp: format!("{root}/tmp/jailbase"),
        home: format!("{root}/var/jailbase"),
        mount: format!("{root}/mnt/jailbase"),
    };
    let mut cfg = JailConfig::new(base).expect("config");
    cfg.set_writepath(&format!("^{}($|/)", regex::escape(&root)))
        .expect("writepath");
    cfg.user = Some(user.to_string());
    cfg.group = Some(user.to_string());
    let mut jail = Jail::new(cfg).expect("jail");
    jail.sync_policy();
    jail
}

fn write_host_file(tmp: &TempDir, rel: &str, data: &[u8], mode: u32) -> String {
    let path = tmp.path().join(rel);
    std::fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
    std::fs::write(&path, data).expect("write");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).expect("chmod");
    path.to_string_lossy().into_owned()
}

#[test]
fn clone_copies_data_and_metadata() {
    let tmp = TempDir::new().expect("mktemp");
    let src = write_host_file(&tmp, "src/dir/payload", b"payload bytes", 0o640);
    let dst = format!("{}/dst/dir/payload", tmp.path().to_string_lossy());

    let mut jail = jail_in(&tmp, "cloner");
    jail.clone(&src, &dst).expect("clone");

    assert_eq!(std::fs::read(&dst).expect("copied"), b"payload bytes");
    let meta = std::fs::metadata(&dst).expect("stat");
    assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
    let src_meta = std::fs::metadata(&src).expect("stat src");
    assert!((meta.mtime() - src_meta.mtime()).abs() <= 1);
}

#[test]
fn clone_recurse_mirrors_trees() {
    let tmp = TempDir::new().expect("mktemp");
    write_host_file(&tmp, "srctree/a/one", b"1", 0o644);
    write_host_file(&tmp, "srctree/a/b/two", b"22", 0o600);
    write_host_file(&tmp, "srctree/three", b"333", 0o644);
    let root = tmp.path().to_string_lossy().into_owned();

    let mut jail = jail_in(&tmp, "cloner");
    jail.clone_recurse(
        &format!("{root}/srctree"),
        &format!("{root}/dsttree"),
        false,
    )
    .expect("clone-recurse");

    for (rel, data) in [("a/one", "1"), ("a/b/two", "22"), ("three", "333")] {
        let path = format!("{root}/dsttree/{rel}");
        assert_eq!(std::fs::read(&path).expect(&path), data.as_bytes());
    }

    // both trees list the same relative entries
    let relpaths = |top: &str| -> Vec<String> {
        let mut entries: Vec<String> = walkdir::WalkDir::new(top)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| {
                e.path()
                    .strip_prefix(top)
                    .expect("under top")
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        entries.sort();
        entries
    };
    assert_eq!(
        relpaths(&format!("{root}/srctree")),
        relpaths(&format!("{root}/dsttree"))
    );

    // a second quick pass sees identical trees and stays cheap
    let mut jail = jail_in(&tmp, "cloner");
    jail.clone_recurse(
        &format!("{root}/srctree"),
        &format!("{root}/dsttree"),
        true,
    )
    .expect("second clone-recurse");
}

#[test]
fn test_mode_add_touches_nothing() {
    let tmp = TempDir::new().expect("mktemp");
    let src = write_host_file(&tmp, "host/etc/conf", b"k=v", 0o644);
    let mut jail = jail_in(&tmp, "dryrun");
    jail.cfg.test = true;
    jail.sync_policy();

    jail.add(&[src]).expect("dry-run add");

    // the jail home was only planned, never created
    let home = jail.cfg.jailhome().expect("jailhome");
    assert!(!Path::new(&home).exists());
    assert!(jail.fs().statcalls() > 0);
}

#[test]
fn add_places_file_under_jailhome() {
    if !Uid::effective().is_root() {
        // cloning the host directory chain reconciles root ownership
        return;
    }
    let tmp = TempDir::new().expect("mktemp");
    let src = write_host_file(&tmp, "host/etc/conf", b"k=v", 0o644);
    let mut jail = jail_in(&tmp, "adder");
    jail.add(std::slice::from_ref(&src)).expect("add");

    let home = jail.cfg.jailhome().expect("jailhome");
    let inside = format!("{home}{src}");
    assert_eq!(std::fs::read(&inside).expect("added"), b"k=v");
    let meta = std::fs::metadata(&inside).expect("stat");
    assert_eq!(meta.permissions().mode() & 0o7777, 0o644);

    // adding the same path again is a no-op at the filesystem level
    let before = std::fs::metadata(&inside).expect("stat").mtime();
    let mut jail = jail_in(&tmp, "adder");
    jail.add(std::slice::from_ref(&src)).expect("re-add");
    let after = std::fs::metadata(&inside).expect("stat").mtime();
    assert_eq!(before, after);
}

#[test]
fn passwd_synthesis_writes_observed_accounts() {
    if !Uid::effective().is_root() {
        return;
    }
    let tmp = TempDir::new().expect("mktemp");
    let src = write_host_file(&tmp, "host/etc/conf", b"k=v", 0o644);
    let mut jail = jail_in(&tmp, "pwsynth");
    jail.cfg.passwd = true;
    jail.add(std::slice::from_ref(&src)).expect("add");
    jail.all_done().expect("all_done");

    let home = jail.cfg.jailhome().expect("jailhome");
    let passwd = std::fs::read_to_string(format!("{home}/etc/passwd")).expect("passwd");
    let db = jail_users::EtcPasswd::parse(&passwd).expect("parse synthesized passwd");
    assert!(db.get_user_by_id(0).is_some(), "root was observed: {passwd}");
    let group = std::fs::read_to_string(format!("{home}/etc/group")).expect("group");
    jail_users::EtcGroup::parse(&group).expect("parse synthesized group");
}

#[test]
fn test_mode_mount_only_plans() {
    let tmp = TempDir::new().expect("mktemp");
    // the base roots normally appear when the first jail path is touched
    std::fs::create_dir_all(tmp.path().join("var/jailbase")).expect("mkdir");
    std::fs::create_dir_all(tmp.path().join("mnt/jailbase")).expect("mkdir");
    let mut jail = jail_in(&tmp, "mounter");
    jail.cfg.test = true;
    jail.sync_policy();
    jail.mount().expect("test-mode mount");
    // the per-user mount root was planned in the cache, never created
    assert!(!tmp.path().join("mnt/jailbase/mounter").exists());
    assert!(!tmp.path().join("var/jailbase/mounter").exists());
}

#[test]
fn print_substitutes_properties() {
    let tmp = TempDir::new().expect("mktemp");
    let mut jail = jail_in(&tmp, "printer");
    let text = jail.subprops("{user} lives in {jailhome}").expect("subst");
    let home = jail.cfg.jailhome().expect("jailhome");
    assert_eq!(text, format!("printer lives in {home}"));
    assert!(jail.subprops("{nosuchkey}").is_err());
}

#[test]
fn resolver_reads_the_loader_index() {
    if !Path::new("/sbin/ldconfig").exists() {
        return;
    }
    let tmp = TempDir::new().expect("mktemp");
    let mut jail = jail_in(&tmp, "resolver");
    let verbose = jail.cfg.verbose;
    let (resolver, fs) = jail.parts_mut();
    if resolver.examine_system(fs, verbose).is_err() {
        // containers without a loader cache
        return;
    }
    assert!(resolver.examined());
}
