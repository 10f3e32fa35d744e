//! Integration tests for the `aml` command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Builds an `aml` command isolated from the user's config and environment.
fn aml(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("aml").unwrap();
    cmd.current_dir(temp_dir.path())
        .env("HOME", temp_dir.path())
        .env_remove("AML_STORAGE_PATH")
        .env_remove("AML_ENCRYPTION")
        .env_remove("AML_COMPRESSION")
        .env_remove("AML_MAX_SIZE_GB")
        .env_remove("AML_MASTER_KEY");
    cmd
}

/// Writes a pattern collection for an agent directly on disk.
fn seed_agent(temp_dir: &TempDir, agent: &str) {
    let dir = temp_dir.path().join(".aml/memory").join(agent);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("patterns.json"),
        format!(
            r#"[{{"id": "p1", "agent": "{agent}", "timestamp": "2025-01-01T00:00:00Z",
                "pattern": {{"type": "component"}},
                "metrics": {{"successRate": 0.9, "executionCount": 10}}}}]"#
        ),
    )
    .unwrap();
}

#[test]
fn test_init_creates_layout() {
    let temp_dir = TempDir::new().unwrap();

    aml(&temp_dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Memory store ready"));

    let root = temp_dir.path().join(".aml/memory");
    assert!(root.join("global").is_dir());
    assert!(root.join("audit").is_dir());
    assert!(root.join("backup").is_dir());
    assert!(root.join("config.json").is_file());
}

#[test]
fn test_root_flag_overrides_config() {
    let temp_dir = TempDir::new().unwrap();

    aml(&temp_dir).args(["--root", "custom", "init"]).assert().success();
    assert!(temp_dir.path().join("custom/config.json").is_file());
}

#[test]
fn test_local_config_file_is_used() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("aml.toml"), "[storage]\npath = \"from-toml\"\n").unwrap();

    aml(&temp_dir).arg("init").assert().success();
    assert!(temp_dir.path().join("from-toml/config.json").is_file());
}

#[test]
fn test_agents_empty() {
    let temp_dir = TempDir::new().unwrap();

    aml(&temp_dir)
        .arg("agents")
        .assert()
        .success()
        .stdout(predicate::str::contains("No agents found"));
}

#[test]
fn test_agents_and_patterns_listing() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "frontend-developer");

    aml(&temp_dir)
        .arg("agents")
        .assert()
        .success()
        .stdout(predicate::str::contains("frontend-developer"));

    aml(&temp_dir)
        .args(["patterns", "frontend-developer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"));

    aml(&temp_dir)
        .args(["patterns", "frontend-developer", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"successRate\": 0.9"));
}

#[test]
fn test_global_set_get() {
    let temp_dir = TempDir::new().unwrap();

    aml(&temp_dir)
        .args(["global", "set", "conventions", r#"{"indent": 2}"#])
        .assert()
        .success();

    aml(&temp_dir)
        .args(["global", "get", "conventions"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"indent\": 2"));

    aml(&temp_dir).args(["global", "get", "missing"]).assert().failure();
    aml(&temp_dir).args(["global", "set", "bad", "{not json"]).assert().failure();
}

#[test]
fn test_backup_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "qa");

    let output = aml(&temp_dir).args(["backup", "create", "qa"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let backup_id = stdout.split_whitespace().last().unwrap().to_string();
    assert!(backup_id.starts_with("backup-"));

    aml(&temp_dir)
        .args(["backup", "list", "qa"])
        .assert()
        .success()
        .stdout(predicate::str::contains(backup_id.as_str()));

    aml(&temp_dir).args(["backup", "verify", "qa", &backup_id]).assert().success();

    fs::write(temp_dir.path().join(".aml/memory/qa/patterns.json"), "[]").unwrap();
    aml(&temp_dir).args(["backup", "restore", "qa", &backup_id]).assert().success();
    aml(&temp_dir)
        .args(["patterns", "qa"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"));

    aml(&temp_dir)
        .args(["backup", "prune", "qa", "--keep", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 1 backup(s)"));
}

#[test]
fn test_backup_restore_unknown_id_fails() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "qa");

    aml(&temp_dir)
        .args(["backup", "restore", "qa", "backup-does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_keygen_prints_key() {
    let temp_dir = TempDir::new().unwrap();

    let output = aml(&temp_dir).arg("keygen").output().unwrap();
    assert!(output.status.success());
    let key = String::from_utf8(output.stdout).unwrap();
    assert_eq!(key.trim().len(), 44);
}

#[test]
fn test_encrypted_store_requires_key() {
    let temp_dir = TempDir::new().unwrap();

    aml(&temp_dir)
        .env("AML_ENCRYPTION", "true")
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("AML_MASTER_KEY"));
}

#[test]
fn test_encrypted_store_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let output = aml(&temp_dir).arg("keygen").output().unwrap();
    let key = String::from_utf8(output.stdout).unwrap().trim().to_string();

    aml(&temp_dir)
        .env("AML_ENCRYPTION", "true")
        .env("AML_MASTER_KEY", &key)
        .args(["global", "set", "secrets", r#"{"token": "sensitive data"}"#])
        .assert()
        .success();

    let raw = fs::read_to_string(temp_dir.path().join(".aml/memory/global/secrets.json")).unwrap();
    assert!(!raw.contains("sensitive data"));

    aml(&temp_dir)
        .env("AML_ENCRYPTION", "true")
        .env("AML_MASTER_KEY", &key)
        .args(["global", "get", "secrets"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sensitive data"));
}

#[test]
fn test_prune_dry_run_then_prune() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "frontend-developer");

    aml(&temp_dir)
        .args(["prune", "--strategy", "time", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Would prune").and(predicate::str::contains("p1")));
    aml(&temp_dir)
        .args(["patterns", "frontend-developer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"));

    aml(&temp_dir)
        .args(["prune", "--strategy", "time", "--agent", "frontend-developer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("archived to"));
    aml(&temp_dir)
        .args(["patterns", "frontend-developer", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1").not());

    let archive_dir = temp_dir.path().join(".aml/memory/backup/frontend-developer/archive");
    assert_eq!(fs::read_dir(archive_dir).unwrap().count(), 1);
}

#[test]
fn test_prune_nothing_to_do() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "qa");

    aml(&temp_dir)
        .args(["prune", "--strategy", "performance"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to prune"));
}

#[test]
fn test_migrate_upgrades_naive_timestamps() {
    let temp_dir = TempDir::new().unwrap();
    aml(&temp_dir).arg("init").assert().success();

    let root = temp_dir.path().join(".aml/memory");
    fs::create_dir_all(root.join("legacy")).unwrap();
    fs::write(
        root.join("legacy/patterns.json"),
        r#"[{"id": "p1", "agent": "legacy", "timestamp": "2025-01-01T09:00:00",
            "pattern": {"type": "component"}}]"#,
    )
    .unwrap();
    fs::remove_file(root.join("schema.json")).unwrap();

    aml(&temp_dir)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("schema 1 -> 2"));
    aml(&temp_dir)
        .args(["patterns", "legacy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"));
    aml(&temp_dir)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Schema is current"));
}

#[test]
fn test_health_reports_damage() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "qa");
    aml(&temp_dir).args(["backup", "create", "qa"]).assert().success();

    aml(&temp_dir)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("healthy"));

    fs::write(temp_dir.path().join(".aml/memory/qa/patterns.json"), "{broken").unwrap();
    aml(&temp_dir)
        .args(["health", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"status\": \"critical\""))
        .stderr(predicate::str::contains("critical"));
}

#[test]
fn test_backup_rotate_and_point_in_time_restore() {
    let temp_dir = TempDir::new().unwrap();
    seed_agent(&temp_dir, "qa");

    aml(&temp_dir).args(["backup", "create", "qa"]).assert().success();
    std::thread::sleep(std::time::Duration::from_millis(10));
    aml(&temp_dir).args(["backup", "create", "qa"]).assert().success();

    fs::write(temp_dir.path().join(".aml/memory/qa/patterns.json"), "[]").unwrap();
    aml(&temp_dir)
        .args(["backup", "restore", "qa", "--at", "2999-01-01T00:00:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored"));
    aml(&temp_dir)
        .args(["patterns", "qa"])
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"));

    aml(&temp_dir)
        .args(["backup", "restore", "qa", "--at", "2000-01-01T00:00:00Z"])
        .assert()
        .failure();

    aml(&temp_dir)
        .args(["backup", "rotate", "qa", "--retention-days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 1 backup(s)"));
}
