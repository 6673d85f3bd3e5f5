use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn version_prints_package_version() {
    Command::cargo_bin("contest")
        .unwrap()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn run_rejects_missing_scenario_file() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("contest")
        .unwrap()
        .arg("run")
        .arg(dir.path())
        .arg(dir.path().join("nope.yml"))
        .arg("localhost")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn run_rejects_relative_base_dir() {
    Command::cargo_bin("contest")
        .unwrap()
        .arg("run")
        .arg("relative/path")
        .arg("scenario.yml")
        .arg("localhost")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be absolute"));
}

#[test]
fn run_with_no_hosts_is_rejected_by_clap() {
    Command::cargo_bin("contest")
        .unwrap()
        .arg("run")
        .arg("/tmp")
        .arg("scenario.yml")
        .assert()
        .failure();
}
