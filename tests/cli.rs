//! Binary smoke tests.

use assert_cmd::Command;
use tempfile::TempDir;

#[test]
fn ports_of_an_empty_storage_directory_prints_nothing() {
    let storage = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.args(["daemon", "ports", "--storage-directory"])
        .arg(storage.path())
        .assert()
        .success()
        .stdout("");
}

#[test]
fn rejects_malformed_user_parameters() {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.args(["daemon", "run", "-U", "missing-equals"])
        .assert()
        .failure();
}
