use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn prints_help() {
    Command::cargo_bin("recordatorio").unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--data-dir"));
}

#[test]
fn check_lists_default_schedules() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    Command::cargo_bin("recordatorio").unwrap()
        .arg("--config").arg(&config)
        .arg("--data-dir").arg(dir.path().join("kv"))
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("credits 09:00 enabled=false lead_days=1"))
        .stdout(predicate::str::contains("birthdays"))
        .stdout(predicate::str::contains("reminders"));
    assert!(config.exists());
}
