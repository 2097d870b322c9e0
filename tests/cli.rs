//! CLI smoke tests for the `pm` binary.

mod fixtures;

use assert_cmd::Command;

use fixtures::object_store::ObjectStoreFixture;

#[test]
fn status_reports_pack_snapshot() {
    let store = ObjectStoreFixture::new().expect("fixture");
    store.write_pack("pack-a.pack", 1024).expect("pack");
    store.write_pack("pack-b.pack", 2048).expect("pack");

    let assert = Command::cargo_bin("pm")
        .expect("binary")
        .env("PM_CONFIG_DIR", "/nonexistent-packmaint-config")
        .arg("status")
        .arg("--objects-root")
        .arg(store.objects_root())
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("packs:          2"), "stdout: {stdout}");
    assert!(stdout.contains("pack bytes:     3072"), "stdout: {stdout}");
    assert!(stdout.contains("lock:           free"), "stdout: {stdout}");
}

#[test]
fn status_json_is_machine_readable() {
    let store = ObjectStoreFixture::new().expect("fixture");
    store.write_pack("pack-a.pack", 4096).expect("pack");

    let assert = Command::cargo_bin("pm")
        .expect("binary")
        .env("PM_CONFIG_DIR", "/nonexistent-packmaint-config")
        .arg("status")
        .arg("--objects-root")
        .arg(store.objects_root())
        .arg("--json")
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).expect("valid json");
    assert_eq!(value["pack_count"], 1);
    assert_eq!(value["total_size_bytes"], 4096);
    assert!(value["maintenance_lock"].is_null());
}

#[test]
fn missing_objects_root_fails() {
    Command::cargo_bin("pm")
        .expect("binary")
        .arg("status")
        .env_remove("PM_OBJECTS_ROOT")
        .env("PM_CONFIG_DIR", "/nonexistent-packmaint-config")
        .assert()
        .failure();
}
