use std::process::Command;

use serial_test::serial;
use tempdir::TempDir;

#[test]
#[serial]
fn test_server_runs_clients() {
    let d = TempDir::new("pmix-test").unwrap();
    let mut p = Command::new(env!("CARGO_BIN_EXE_pmix-test"))
        .args(["server", "--nprocs=3", "--timeout=30", "--tempdir"])
        .arg(d.path())
        .spawn()
        .unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
#[serial]
fn test_server_hands_credential_to_clients() {
    // The default client command carries no secret of its own
    let d = TempDir::new("pmix-test").unwrap();
    let mut p = Command::new(env!("CARGO_BIN_EXE_pmix-test"))
        .args(["server", "--nprocs=2", "--timeout=30", "--credential=not-the-default"])
        .arg("--tempdir")
        .arg(d.path())
        .spawn()
        .unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
#[serial]
fn test_server_rejects_bad_credential() {
    let d = TempDir::new("pmix-test").unwrap();
    let mut p = Command::new(env!("CARGO_BIN_EXE_pmix-test"))
        .args(["server", "--nprocs=1", "--timeout=10", "--tempdir"])
        .arg(d.path())
        .args(["--", env!("CARGO_BIN_EXE_pmix-test"), "client", "--credential=wrong"])
        .spawn()
        .unwrap();
    assert!(!p.wait().unwrap().success());
}

#[test]
#[serial]
fn test_launcher() {
    let mut p = Command::new(env!("CARGO_BIN_EXE_pmix-exchange"))
        .args(["--nproc=2", "--timeout=30", env!("CARGO_BIN_EXE_pmix-test"), "client"])
        .spawn()
        .unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
#[serial]
fn test_launcher_fails_with_client() {
    let mut p = Command::new(env!("CARGO_BIN_EXE_pmix-exchange"))
        .args(["--nproc=2", "--timeout=30", "false"])
        .spawn()
        .unwrap();
    assert!(!p.wait().unwrap().success());
}
