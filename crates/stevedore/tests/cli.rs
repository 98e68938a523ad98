//! End-to-end CLI tests that need no network.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn stevedore(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stevedore").unwrap();
    cmd.env_remove("RUST_LOG")
        .env("STEVEDORE_DIR", root)
        .arg("-q");
    cmd
}

fn rootfs_tar(path: &Path) {
    let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
    let mut header = tar::Header::new_gnu();
    let data = b"hello from the image\n";
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "etc/motd", &data[..]).unwrap();
    builder.finish().unwrap();
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("stevedore")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pull"))
        .stdout(predicate::str::contains("save"));
}

#[test]
fn rejects_unknown_pull_policy() {
    let dir = tempfile::tempdir().unwrap();
    stevedore(dir.path())
        .args(["pull", "--pull", "sometimes", "alpine"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sometimes"));
}

#[test]
fn import_create_and_manage_container() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let tar = dir.path().join("fs.tar");
    rootfs_tar(&tar);

    stevedore(&root)
        .args(["import", "--platform", "linux/amd64"])
        .arg(&tar)
        .arg("demo/app:1")
        .assert()
        .success();

    stevedore(&root)
        .args(["images", "-p"])
        .assert()
        .success()
        .stdout(predicate::str::contains("demo/app:1"))
        .stdout(predicate::str::contains("linux/amd64"));

    stevedore(&root)
        .args(["verify", "demo/app:1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));

    let created = stevedore(&root)
        .args(["create", "--name", "web", "demo/app:1"])
        .output()
        .unwrap();
    assert!(created.status.success());
    let id = String::from_utf8(created.stdout).unwrap().trim().to_string();
    assert!(!id.is_empty());

    stevedore(&root)
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("web"))
        .stdout(predicate::str::contains("demo/app:1"));

    stevedore(&root)
        .args(["inspect", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rootfs\""));

    stevedore(&root)
        .args(["create", "--name", "web", "demo/app:1"])
        .assert()
        .failure();

    stevedore(&root)
        .args(["rename", "web", "site"])
        .assert()
        .success();

    let out = dir.path().join("export.tar");
    stevedore(&root)
        .args(["export", "-o"])
        .arg(&out)
        .arg("site")
        .assert()
        .success();
    assert!(out.is_file());

    stevedore(&root).args(["protect", "site"]).assert().success();
    stevedore(&root).args(["rm", id.as_str()]).assert().failure();
    stevedore(&root).args(["unprotect", id.as_str()]).assert().success();
    stevedore(&root).args(["rm", id.as_str()]).assert().success();

    stevedore(&root)
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()).not());
}

#[test]
fn save_load_and_remove_image() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let tar = dir.path().join("fs.tar");
    rootfs_tar(&tar);

    stevedore(&first)
        .arg("import")
        .arg(&tar)
        .arg("demo/app:1")
        .assert()
        .success();

    let saved = dir.path().join("saved.tar");
    stevedore(&first)
        .args(["save", "-o"])
        .arg(&saved)
        .arg("demo/app:1")
        .assert()
        .success();

    stevedore(&second)
        .args(["load", "-i"])
        .arg(&saved)
        .assert()
        .success()
        .stdout(predicate::str::contains("demo/app:1"));

    stevedore(&second).args(["protect", "demo/app:1"]).assert().success();
    stevedore(&second).args(["rmi", "demo/app:1"]).assert().failure();
    stevedore(&second)
        .args(["rmi", "--force", "demo/app:1"])
        .assert()
        .success();

    stevedore(&second)
        .arg("images")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo/app:1").not());
}
