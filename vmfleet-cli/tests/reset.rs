use predicates::prelude::*;

mod common;

#[test]
fn test_reset_removes_instance_files() {
    let mut ctx = common::vmfleet();
    ctx.write("overlays/root-2.qcow2", b"QFI\xfb");
    ctx.write("overlays/vars-2.fd", &[0u8; 16]);
    ctx.write("seeds/seed-init-2/user-data", b"#cloud-config\n");
    ctx.write("seeds/seed-2.iso", b"iso");
    ctx.write("overlays/root-3.qcow2", b"QFI\xfb");

    ctx.cmd
        .args(["reset", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("overlay-2: removed"))
        .stdout(predicate::str::contains("root-2.qcow2"));

    assert!(!ctx.path("overlays/root-2.qcow2").exists());
    assert!(!ctx.path("overlays/vars-2.fd").exists());
    assert!(!ctx.path("seeds/seed-init-2").exists());
    assert!(!ctx.path("seeds/seed-2.iso").exists());
    assert!(ctx.path("overlays/root-3.qcow2").exists());
}

#[test]
fn test_reset_uses_recorded_names() {
    let mut ctx = common::vmfleet();
    ctx.write(
        "instances.csv",
        b"INDEX,NAME,IP,MAC,DISK,SEED_ISO,PID,STATUS\n\
          1,lab-1,10.0.0.10,52:54:00:f1:33:11,,,,exited\n",
    );
    ctx.write("run/lab-1.pid", b"999999999\n");
    ctx.write("overlays/root-1.qcow2", b"QFI\xfb");

    ctx.cmd
        .args(["reset", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lab-1: removed"));

    assert!(!ctx.path("run/lab-1.pid").exists());
}

#[test]
fn test_reset_refuses_running_instance() {
    let mut ctx = common::vmfleet();
    ctx.write("run/overlay-1.pid", std::process::id().to_string().as_bytes());
    ctx.write("overlays/root-1.qcow2", b"QFI\xfb");

    ctx.cmd
        .args(["reset", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("still running"));
    assert!(ctx.path("overlays/root-1.qcow2").exists());

    ctx.new_cmd()
        .args(["reset", "--force", "1"])
        .assert()
        .success();
    assert!(!ctx.path("overlays/root-1.qcow2").exists());
}

#[test]
fn test_reset_nothing_to_remove() {
    let mut ctx = common::vmfleet();

    ctx.cmd
        .args(["reset", "5", "--name-prefix", "lab"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lab-5: nothing to remove"));
}

#[test]
fn test_reset_requires_index() {
    let mut ctx = common::vmfleet();
    ctx.cmd.arg("reset").assert().failure();
}

#[test]
fn test_reset_index_zero() {
    let mut ctx = common::vmfleet();

    ctx.cmd
        .args(["reset", "0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("start at 1"));
}
