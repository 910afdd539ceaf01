use predicates::prelude::*;

mod common;

#[test]
fn test_status_without_instances_file() {
    let mut ctx = common::vmfleet();

    ctx.cmd
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("instances.csv"));
}

#[test]
fn test_status_reports_liveness() {
    let mut ctx = common::vmfleet();
    let csv = format!(
        "INDEX,NAME,IP,MAC,DISK,SEED_ISO,PID,STATUS\n\
         1,lab-1,10.0.0.10,52:54:00:f1:33:11,,,{},running\n\
         2,lab-2,10.0.0.11,52:54:00:f1:33:12,,,,failed:storage\n",
        std::process::id()
    );
    ctx.write("instances.csv", csv.as_bytes());

    ctx.cmd
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("ALIVE"))
        .stdout(predicate::str::is_match(r"lab-1\s+10\.0\.0\.10\s+\d+\s+running\s+yes").unwrap())
        .stdout(predicate::str::is_match(r"lab-2\s+10\.0\.0\.11\s+-\s+failed:storage\s+no").unwrap());
}

#[test]
fn test_status_json() {
    let mut ctx = common::vmfleet();
    ctx.write(
        "instances.csv",
        b"INDEX,NAME,IP,MAC,DISK,SEED_ISO,PID,STATUS\n\
          3,overlay-3,10.0.0.12,52:54:00:f1:33:13,,,,failed:launch\n",
    );

    let output = ctx.cmd.args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());

    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries[0]["NAME"], "overlay-3");
    assert_eq!(entries[0]["INDEX"], 3);
    assert_eq!(entries[0]["alive"], false);
}
