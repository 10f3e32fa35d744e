//! Point-in-time backups of one agent's memory.
//!
//! A backup is a gzip'd tar archive holding the agent's four files exactly
//! as stored (still encrypted, for encrypted stores) plus a `manifest.json`
//! with a SHA-256 checksum per file. Archives are written once and never
//! modified.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, Header};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{MemoryError, Result};
use super::records::Collection;
use super::store::{MemoryStore, dir_size, stage_file, validate_agent_name, write_atomic};
use crate::security::{AuditEntry, AuditOperation};

const MANIFEST_FILE: &str = "manifest.json";
const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// One file captured in a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// File name inside the agent directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Description of a backup, stored inside the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    /// Backup identifier.
    pub backup_id: String,
    /// Agent the backup belongs to.
    pub agent: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Captured files.
    pub files: Vec<BackupFile>,
    /// Whether the archive was written with compression.
    pub compressed: bool,
    /// Whether the captured files are encryption envelopes.
    pub encrypted: bool,
}

/// A backup found on disk.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Manifest read from the archive.
    pub manifest: BackupManifest,
    /// Archive location.
    pub path: PathBuf,
    /// Archive size in bytes.
    pub size_bytes: u64,
}

impl MemoryStore {
    /// Snapshots an agent's directory and returns the backup id.
    ///
    /// # Errors
    /// Returns `NotFound` if the agent has no directory, or `Capacity` if the
    /// archive does not fit under the size cap
    pub fn backup_agent_memory(&self, agent: &str) -> Result<String> {
        let result = self.backup_inner(agent);
        let target = result.as_deref().unwrap_or("");
        let entry = AuditEntry::new(AuditOperation::Backup).with_agent(agent).with_target(target);
        self.audited(entry, result)
    }

    /// Replaces an agent's directory with the contents of a backup.
    ///
    /// Checksums and the size cap are checked and every file is staged
    /// before the first one is moved into place, so a failed restore leaves
    /// the directory as it was.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown backup, `BackupCorrupted` if the
    /// archive fails verification, `Configuration` if the backup's
    /// encryption setting differs from the store's, and `Capacity` if the
    /// restored files do not fit under the size cap
    pub fn restore_agent_memory(&self, agent: &str, backup_id: &str) -> Result<BackupManifest> {
        let entry =
            AuditEntry::new(AuditOperation::Restore).with_agent(agent).with_target(backup_id);
        let result = self.restore_inner(agent, backup_id);
        self.audited(entry, result)
    }

    /// Re-reads a backup and checks every file against its manifest.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown backup and `BackupCorrupted` on any
    /// mismatch
    pub fn verify_backup(&self, agent: &str, backup_id: &str) -> Result<BackupManifest> {
        let path = self.backup_path(agent, backup_id)?;
        let (manifest, files) = read_archive(&path)?;
        check_manifest(&manifest, &files, agent, backup_id)?;
        Ok(manifest)
    }

    /// Lists an agent's backups, newest first.
    ///
    /// Unreadable archives are skipped with a warning.
    ///
    /// # Errors
    /// Returns error if the backup directory cannot be read
    pub fn list_backups(&self, agent: &str) -> Result<Vec<BackupInfo>> {
        validate_agent_name(agent)?;
        let dir = self.backup_dir(agent);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_archive = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(ARCHIVE_EXTENSION));
            if !is_archive {
                continue;
            }

            match read_archive(&path) {
                Ok((manifest, _)) => {
                    let size_bytes = fs::metadata(&path)?.len();
                    backups.push(BackupInfo { manifest, path, size_bytes });
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable backup"),
            }
        }

        backups.sort_by(|a, b| {
            b.manifest
                .timestamp
                .cmp(&a.manifest.timestamp)
                .then_with(|| b.manifest.backup_id.cmp(&a.manifest.backup_id))
        });
        Ok(backups)
    }

    /// Deletes all but the newest `keep` backups; returns the deleted ids.
    ///
    /// # Errors
    /// Returns error if a backup cannot be removed
    pub fn prune_backups(&self, agent: &str, keep: usize) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for backup in self.list_backups(agent)?.into_iter().skip(keep) {
            self.delete_backup(agent, &backup.manifest.backup_id)?;
            deleted.push(backup.manifest.backup_id);
        }
        if !deleted.is_empty() {
            info!(agent, count = deleted.len(), "Pruned backups");
        }
        Ok(deleted)
    }

    /// Restores the newest backup taken at or before `at`.
    ///
    /// # Errors
    /// Returns `NotFound` if no backup is that old, and any error of
    /// [`restore_agent_memory`](Self::restore_agent_memory)
    pub fn restore_to_point_in_time(
        &self,
        agent: &str,
        at: DateTime<Utc>,
    ) -> Result<BackupManifest> {
        let backup = self
            .list_backups(agent)?
            .into_iter()
            .find(|backup| backup.manifest.timestamp <= at)
            .ok_or_else(|| {
                MemoryError::NotFound(format!("backup of {} at or before {}", agent, at.to_rfc3339()))
            })?;
        self.restore_agent_memory(agent, &backup.manifest.backup_id)
    }

    /// Deletes backups older than `retention_days`; the newest backup is
    /// always kept. Returns the deleted ids.
    ///
    /// # Errors
    /// Returns error if a backup cannot be removed
    pub fn rotate_backups(&self, agent: &str, retention_days: i64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut deleted = Vec::new();
        for backup in self.list_backups(agent)?.into_iter().skip(1) {
            if backup.manifest.timestamp < cutoff {
                self.delete_backup(agent, &backup.manifest.backup_id)?;
                deleted.push(backup.manifest.backup_id);
            }
        }
        if !deleted.is_empty() {
            info!(agent, count = deleted.len(), retention_days, "Rotated backups");
        }
        Ok(deleted)
    }

    /// Removes one backup archive.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown backup
    pub fn delete_backup(&self, agent: &str, backup_id: &str) -> Result<()> {
        let entry =
            AuditEntry::new(AuditOperation::DeleteBackup).with_agent(agent).with_target(backup_id);
        let result = self.backup_path(agent, backup_id).and_then(|path| {
            fs::remove_file(&path)?;
            Ok(())
        });
        self.audited(entry, result)
    }

    fn backup_inner(&self, agent: &str) -> Result<String> {
        validate_agent_name(agent)?;
        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;

        let agent_dir = self.root().join(agent);
        if !agent_dir.is_dir() {
            return Err(MemoryError::NotFound(format!("agent {}", agent)));
        }

        let timestamp = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let backup_id = format!("backup-{}-{}", timestamp.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8]);

        let mut contents = Vec::new();
        for collection in Collection::ALL {
            let path = self.collection_path(agent, collection);
            if path.exists() {
                contents.push((collection.file_name(), fs::read(&path)?));
            }
        }

        let manifest = BackupManifest {
            backup_id: backup_id.clone(),
            agent: agent.to_string(),
            timestamp,
            files: contents
                .iter()
                .map(|(name, bytes)| BackupFile {
                    name: (*name).to_string(),
                    size: bytes.len() as u64,
                    sha256: sha256_hex(bytes),
                })
                .collect(),
            compressed: self.config().compression,
            encrypted: self.is_encrypted(),
        };

        let level = if manifest.compressed { Compression::best() } else { Compression::none() };
        let mtime = u64::try_from(timestamp.timestamp()).unwrap_or(0);
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), level));
        append_file(&mut builder, MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?, mtime)?;
        for (name, bytes) in &contents {
            append_file(&mut builder, name, bytes, mtime)?;
        }
        let archive = builder.into_inner()?.finish()?;

        let dir = self.backup_dir(agent);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}{}", backup_id, ARCHIVE_EXTENSION));
        self.check_capacity(&path, archive.len() as u64)?;
        write_atomic(&path, &archive)?;

        info!(agent, backup_id = %backup_id, files = contents.len(), "Created backup");
        Ok(backup_id)
    }

    fn restore_inner(&self, agent: &str, backup_id: &str) -> Result<BackupManifest> {
        let path = self.backup_path(agent, backup_id)?;
        let (manifest, files) = read_archive(&path)?;
        check_manifest(&manifest, &files, agent, backup_id)?;

        if manifest.encrypted != self.is_encrypted() {
            return Err(MemoryError::Configuration(format!(
                "backup {} was taken with encryption {}, store has it {}",
                backup_id,
                on_off(manifest.encrypted),
                on_off(self.is_encrypted())
            )));
        }

        let lock = self.agent_lock(agent)?;
        let _guard = lock.lock().map_err(|_| MemoryError::LockPoisoned)?;

        let agent_dir = self.root().join(agent);
        fs::create_dir_all(&agent_dir)?;

        // The snapshot replaces everything currently in the agent directory.
        let incoming = files.values().map(|bytes| bytes.len() as u64).sum();
        self.check_capacity_replacing(dir_size(&agent_dir), incoming)?;

        let mut staged = Vec::with_capacity(files.len());
        for (name, bytes) in &files {
            staged.push((stage_file(&agent_dir, bytes)?, agent_dir.join(name)));
        }
        for (file, target) in staged {
            file.persist(&target).map_err(|e| e.error)?;
        }

        // Full overwrite: drop anything the snapshot did not contain.
        for entry in fs::read_dir(&agent_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let keep = name.to_str().is_some_and(|n| files.contains_key(n));
            if !keep && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }

        info!(agent, backup_id, "Restored backup");
        Ok(manifest)
    }

    fn backup_dir(&self, agent: &str) -> PathBuf {
        self.root().join("backup").join(agent)
    }

    /// Path of an existing backup archive.
    fn backup_path(&self, agent: &str, backup_id: &str) -> Result<PathBuf> {
        validate_agent_name(agent)?;
        if backup_id.is_empty() || backup_id.starts_with('.') || backup_id.contains(['/', '\\']) {
            return Err(MemoryError::NotFound(format!("backup {}", backup_id)));
        }

        let path = self.backup_dir(agent).join(format!("{}{}", backup_id, ARCHIVE_EXTENSION));
        if !path.is_file() {
            return Err(MemoryError::NotFound(format!("backup {} for agent {}", backup_id, agent)));
        }
        Ok(path)
    }
}

fn append_file(
    builder: &mut Builder<GzEncoder<Vec<u8>>>,
    name: &str,
    bytes: &[u8],
    mtime: u64,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

/// Reads the manifest and the captured files from an archive.
fn read_archive(path: &Path) -> Result<(BackupManifest, BTreeMap<String, Vec<u8>>)> {
    let corrupted = |e: std::io::Error| MemoryError::BackupCorrupted(e.to_string());

    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    let mut manifest = None;
    let mut files = BTreeMap::new();

    for entry in archive.entries().map_err(corrupted)? {
        let mut entry = entry.map_err(corrupted)?;
        let name = entry.path().map_err(corrupted)?.to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(corrupted)?;

        if name == MANIFEST_FILE {
            manifest = Some(
                serde_json::from_slice::<BackupManifest>(&bytes)
                    .map_err(|e| MemoryError::BackupCorrupted(format!("manifest: {}", e)))?,
            );
        } else if Collection::ALL.iter().any(|c| c.file_name() == name) {
            files.insert(name, bytes);
        } else {
            return Err(MemoryError::BackupCorrupted(format!("unexpected entry {}", name)));
        }
    }

    let manifest =
        manifest.ok_or_else(|| MemoryError::BackupCorrupted("manifest missing".to_string()))?;
    Ok((manifest, files))
}

fn check_manifest(
    manifest: &BackupManifest,
    files: &BTreeMap<String, Vec<u8>>,
    agent: &str,
    backup_id: &str,
) -> Result<()> {
    if manifest.agent != agent || manifest.backup_id != backup_id {
        return Err(MemoryError::BackupCorrupted(format!(
            "manifest names {}/{}",
            manifest.agent, manifest.backup_id
        )));
    }

    if manifest.files.len() != files.len() {
        return Err(MemoryError::BackupCorrupted("file list does not match manifest".to_string()));
    }

    for expected in &manifest.files {
        let bytes = files
            .get(&expected.name)
            .ok_or_else(|| MemoryError::BackupCorrupted(format!("{} missing", expected.name)))?;
        if bytes.len() as u64 != expected.size || sha256_hex(bytes) != expected.sha256 {
            return Err(MemoryError::BackupCorrupted(format!("{} checksum mismatch", expected.name)));
        }
    }

    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
