//! Integration tests for backup and restore.

mod common;

use std::fs::File;
use std::io::Read;

use aml_core::memory::{ErrorKind, MemoryError, Pattern};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, Header};
use common::{encrypted_store, plain_store, sample_pattern};
use serde_json::json;

#[test]
fn test_backup_mutate_restore() {
    let (_temp_dir, store) = plain_store();
    let agent = "frontend-developer";
    store.add(agent, sample_pattern("p1", agent)).unwrap();
    store.add(agent, sample_pattern("p2", agent)).unwrap();
    let snapshot = store.get::<Pattern>(agent).unwrap();

    let backup_id = store.backup_agent_memory(agent).unwrap();

    store.delete::<Pattern>(agent, "p1").unwrap();
    store.add(agent, sample_pattern("p3", agent)).unwrap();
    store.record_pattern_outcome(agent, "p2", false, 0.0).unwrap();
    assert_ne!(store.get::<Pattern>(agent).unwrap(), snapshot);

    let manifest = store.restore_agent_memory(agent, &backup_id).unwrap();
    assert_eq!(manifest.backup_id, backup_id);
    assert_eq!(store.get::<Pattern>(agent).unwrap(), snapshot);
}

#[test]
fn test_encrypted_backup_restore() {
    let (temp_dir, store, _engine) = encrypted_store();
    let agent = "security-auditor";
    store.add(agent, sample_pattern("p1", agent)).unwrap();
    store.update_metrics(agent, |m| {
        m.insert("audits".to_string(), json!(1));
    })
    .unwrap();

    let backup_id = store.backup_agent_memory(agent).unwrap();
    let manifest = store.verify_backup(agent, &backup_id).unwrap();
    assert!(manifest.encrypted);

    let archive = std::fs::read(
        temp_dir.path().join("memory/backup").join(agent).join(format!("{backup_id}.tar.gz")),
    )
    .unwrap();
    assert!(!archive.windows(b"component-structure".len()).any(|w| w == b"component-structure"));

    store.delete::<Pattern>(agent, "p1").unwrap();
    store.restore_agent_memory(agent, &backup_id).unwrap();

    assert_eq!(store.find::<Pattern>(agent, "p1").unwrap().id, "p1");
    assert_eq!(store.get_metrics(agent).unwrap()["audits"], 1);
}

#[test]
fn test_restore_unknown_id_is_not_found() {
    let (_temp_dir, store) = plain_store();
    store.ensure_agent_directory("a").unwrap();

    let err = store.restore_agent_memory("a", "backup-19700101T000000000Z-deadbeef").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_restore_into_fresh_agent_directory() {
    let (temp_dir, store) = plain_store();
    store.add("a", sample_pattern("p1", "a")).unwrap();
    let backup_id = store.backup_agent_memory("a").unwrap();

    std::fs::remove_dir_all(temp_dir.path().join("memory/a")).unwrap();
    assert!(store.get::<Pattern>("a").unwrap().is_empty());

    store.restore_agent_memory("a", &backup_id).unwrap();
    assert_eq!(store.get::<Pattern>("a").unwrap().len(), 1);
}

#[test]
fn test_backup_of_other_agent_is_not_visible() {
    let (_temp_dir, store) = plain_store();
    store.ensure_agent_directory("a").unwrap();
    store.ensure_agent_directory("b").unwrap();
    let backup_id = store.backup_agent_memory("a").unwrap();

    assert_eq!(store.restore_agent_memory("b", &backup_id).unwrap_err().kind(), ErrorKind::NotFound);
    assert!(store.list_backups("b").unwrap().is_empty());
}

#[test]
fn test_tampered_backup_refused() {
    let (temp_dir, store) = plain_store();
    store.add("a", sample_pattern("p1", "a")).unwrap();
    let backup_id = store.backup_agent_memory("a").unwrap();

    // Rewrite the archive with an edited patterns.json and the original manifest.
    let path = temp_dir.path().join("memory/backup/a").join(format!("{backup_id}.tar.gz"));
    let mut entries = Vec::new();
    let mut archive = Archive::new(GzDecoder::new(File::open(&path).unwrap()));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        if name == "patterns.json" {
            bytes = b"[]".to_vec();
        }
        entries.push((name, bytes));
    }
    drop(archive);

    let mut builder = Builder::new(GzEncoder::new(File::create(&path).unwrap(), Compression::default()));
    for (name, bytes) in &entries {
        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, bytes.as_slice()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();

    let err = store.verify_backup("a", &backup_id).unwrap_err();
    assert!(matches!(err, MemoryError::BackupCorrupted(_)), "{err:?}");

    store.delete::<Pattern>("a", "p1").unwrap();
    assert!(store.restore_agent_memory("a", &backup_id).is_err());
    assert!(store.get::<Pattern>("a").unwrap().is_empty());
}

#[test]
fn test_prune_keeps_newest() {
    let (_temp_dir, store) = plain_store();
    store.ensure_agent_directory("a").unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        std::thread::sleep(std::time::Duration::from_millis(5));
        ids.push(store.backup_agent_memory("a").unwrap());
    }

    let deleted = store.prune_backups("a", 2).unwrap();
    assert_eq!(deleted, vec![ids[1].clone(), ids[0].clone()]);

    let remaining: Vec<_> =
        store.list_backups("a").unwrap().into_iter().map(|b| b.manifest.backup_id).collect();
    assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);
}
