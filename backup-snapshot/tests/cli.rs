//! Command-line behaviour of the installed binaries.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn ghe_backup(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ghe-backup").unwrap();
    cmd.env("GHE_BACKUP_ROOT", root.path())
        .env("HOME", root.path().join("home"))
        .env("GHE_FS_ROOT", root.path().join("fsroot"))
        .env_remove("GHE_BACKUP_CONFIG")
        .env_remove("GHE_HOSTNAME")
        .env_remove("GHE_DATA_DIR");
    cmd
}

#[test]
fn version_exits_zero() {
    Command::cargo_bin("ghe-backup")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn help_exits_zero() {
    Command::cargo_bin("ghe-backup")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbose"));
}

#[test]
fn unknown_flag_exits_one() {
    Command::cargo_bin("ghe-backup")
        .unwrap()
        .arg("--bogus")
        .assert()
        .code(1);
}

#[test]
fn missing_config_exits_two() {
    let root = TempDir::new().unwrap();
    ghe_backup(&root)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No backup configuration file found"))
        .stderr(predicate::str::contains("backup.config"));
}

#[test]
fn missing_data_dir_exits_eight() {
    let root = TempDir::new().unwrap();
    let data = root.path().join("absent");
    fs::write(
        root.path().join("backup.config"),
        format!(
            "GHE_HOSTNAME=github.example.com\nGHE_DATA_DIR={}\nGHE_CREATE_DATA_DIR=no\n",
            data.display()
        ),
    )
    .unwrap();
    ghe_backup(&root)
        .assert()
        .code(8)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn running_on_appliance_is_refused() {
    let root = TempDir::new().unwrap();
    let sentinel = root.path().join("fsroot/etc/github");
    fs::create_dir_all(&sentinel).unwrap();
    fs::write(sentinel.join("enterprise-release"), "").unwrap();
    fs::write(
        root.path().join("backup.config"),
        format!("GHE_HOSTNAME=h\nGHE_DATA_DIR={}\n", root.path().join("data").display()),
    )
    .unwrap();
    ghe_backup(&root).assert().code(1);
}

#[test]
fn fix_paths_truncates_by_version() {
    Command::cargo_bin("ghe-fix-paths")
        .unwrap()
        .env("GHE_HOSTNAME", "github.example.com")
        .env("GHE_REMOTE_VERSION", "2.19.3")
        .write_stdin("a/nw/23/aa/28/gist/1.git/\nrepositories/a/b/c.git\n")
        .assert()
        .success()
        .stdout("a/nw/23/aa/28/gist/1.git/\nrepositories/a/b\n");

    Command::cargo_bin("ghe-fix-paths")
        .unwrap()
        .env("GHE_HOSTNAME", "github.example.com")
        .env("GHE_REMOTE_VERSION", "2.18.7")
        .write_stdin("a/nw/23/aa/28/gist/1.git/\n")
        .assert()
        .success()
        .stdout("a/nw/23/aa/28/gist\n");
}

#[test]
fn fix_paths_requires_negotiated_version() {
    Command::cargo_bin("ghe-fix-paths")
        .unwrap()
        .env_remove("GHE_REMOTE_VERSION")
        .write_stdin("a/b\n")
        .assert()
        .failure();
}
