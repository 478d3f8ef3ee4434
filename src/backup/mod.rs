//! Snapshots of the original source containers.
//!
//! # State machine
//!
//! ```text
//! Clean ──snapshot()──▶ Pending ──▶ Snapshotted ──restore()─────▶ Restored
//!                                              └──acknowledge()─▶ Acknowledged
//! ```
//!
//! The current record lives at `<root>/backup/snapshot.json`; the files it
//! lists live in `<root>/backup/<timestamp>/`. The record is written (as
//! `Pending`) before the first source is moved, so a crash mid-snapshot
//! still leaves enough information to put everything back.
//!
//! A merge is refused while the record is `Pending` or `Snapshotted`: the
//! content directory then holds merged output, and backing that up as if it
//! were original content would lose the real originals.
//!
//! Only one snapshot directory is kept. Creating a snapshot or completing a
//! restore removes every other directory under `backup/`.

pub mod lock;

pub use lock::{LockError, RunLock, LOCK_FILE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fsutil;
use crate::plugin::PLUGIN_EXTENSION;
use crate::strings::{self, StringsError};

pub const BACKUP_DIR:    &str = "backup";
pub const RECORD_FILE:   &str = "snapshot.json";
pub const DISPLACED_DIR: &str = "displaced_strings";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("snapshot {id} is {state:?}; restore or acknowledge it before merging again")]
    Unresolved { id: String, state: SnapshotState },
    #[error("no snapshot to acknowledge")]
    NoSnapshot,
    #[error("cannot back up {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("snapshot record {} is corrupt: {source}", .path.display())]
    Record { path: PathBuf, source: serde_json::Error },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Strings(#[from] StringsError),
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("no snapshot to restore")]
    NoSnapshot,
    #[error("snapshot {id} is {state:?} and cannot be restored")]
    NotRestorable { id: String, state: SnapshotState },
    #[error("backup copy {} is missing", .0.display())]
    Missing(PathBuf),
    #[error("backup copy {} does not match the snapshot (expected {expected}, found {actual})", .path.display())]
    Corrupt { path: PathBuf, expected: String, actual: String },
    #[error("restore failed at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Record(#[from] BackupError),
    #[error(transparent)]
    Strings(#[from] StringsError),
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Record written, sources being moved.
    Pending,
    /// All sources moved; merged output may exist.
    Snapshotted,
    Restored,
    /// Merged output accepted as the new baseline.
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original: PathBuf,
    pub backup:   PathBuf,
    pub size:     u64,
    /// BLAKE3 of the original, hex.
    pub blake3:   String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// `%Y%m%d_%H%M%S`, optionally with a `_N` suffix.
    pub id:      String,
    pub run_id:  Uuid,
    pub created: DateTime<Utc>,
    pub state:   SnapshotState,
    pub entries: Vec<BackupEntry>,
    /// Containers and descriptors the run writes; deleted on restore.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
}

impl BackupSnapshot {
    pub fn blocks_merge(&self) -> bool {
        matches!(self.state, SnapshotState::Pending | SnapshotState::Snapshotted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub id:              String,
    pub restored:        usize,
    pub outputs_removed: Vec<PathBuf>,
    pub strings_removed: usize,
}

impl RestoreReport {
    /// File names of the removed descriptors.
    pub fn descriptor_names(&self) -> Vec<String> {
        self.outputs_removed
            .iter()
            .filter(|p| {
                p.extension()
                    .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(PLUGIN_EXTENSION))
            })
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }
}

// ── BackupManager ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_owned() }
    }

    pub fn backup_root(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.backup_root().join(id)
    }

    fn record_path(&self) -> PathBuf {
        self.backup_root().join(RECORD_FILE)
    }

    /// The current snapshot record, if any.
    pub fn current(&self) -> Result<Option<BackupSnapshot>, BackupError> {
        let path = self.record_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(BackupError::Io { path, source }),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| BackupError::Record { path, source })
    }

    pub fn save(&self, snapshot: &BackupSnapshot) -> Result<(), BackupError> {
        let path = self.record_path();
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| BackupError::Record { path: path.clone(), source })?;
        fsutil::write_atomic(&path, &bytes).map_err(|source| BackupError::Io { path, source })
    }

    /// Fail unless a new merge may start.
    pub fn ensure_clean(&self) -> Result<(), BackupError> {
        match self.current()? {
            Some(snap) if snap.blocks_merge() => Err(BackupError::Unresolved { id: snap.id, state: snap.state }),
            _ => Ok(()),
        }
    }

    /// Move every file in `sources` into a fresh snapshot directory.
    ///
    /// Either all sources end up in the snapshot or none do: on failure the
    /// files already moved are moved back and the record is removed.
    pub fn snapshot(&self, sources: &[PathBuf]) -> Result<BackupSnapshot, BackupError> {
        self.ensure_clean()?;

        let id = self.fresh_id();
        let dir = self.snapshot_dir(&id);
        fs::create_dir_all(&dir).map_err(|source| BackupError::Io { path: dir.clone(), source })?;

        let mut entries = Vec::with_capacity(sources.len());
        for original in sources {
            let hashed = fsutil::hash_file(original);
            let (size, blake3) = match hashed {
                Ok(v) => v,
                Err(source) => {
                    let _ = fs::remove_dir_all(&dir);
                    return Err(BackupError::Io { path: original.clone(), source });
                }
            };
            let name = original.file_name().unwrap_or(original.as_os_str());
            entries.push(BackupEntry { original: original.clone(), backup: dir.join(name), size, blake3 });
        }

        let mut snapshot = BackupSnapshot {
            id,
            run_id: Uuid::new_v4(),
            created: Utc::now(),
            state: SnapshotState::Pending,
            entries,
            outputs: Vec::new(),
        };
        if let Err(e) = self.save(&snapshot) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        for (i, entry) in snapshot.entries.iter().enumerate() {
            if let Err(source) = fsutil::move_file(&entry.original, &entry.backup) {
                warn!(file = %entry.original.display(), error = %source, "snapshot failed, moving files back");
                self.unwind(&snapshot.entries[..i], &dir);
                return Err(BackupError::Io { path: entry.original.clone(), source });
            }
        }

        snapshot.state = SnapshotState::Snapshotted;
        self.save(&snapshot)?;
        let pruned = self.prune(&snapshot.id)?;
        info!(id = %snapshot.id, files = snapshot.entries.len(), pruned, "snapshot taken");
        Ok(snapshot)
    }

    fn unwind(&self, moved: &[BackupEntry], dir: &Path) {
        for entry in moved.iter().rev() {
            if let Err(e) = fsutil::move_file(&entry.backup, &entry.original) {
                warn!(file = %entry.backup.display(), error = %e, "could not move file back");
                // Keep the record: it is the only map back to this file.
                return;
            }
        }
        let _ = fs::remove_file(self.record_path());
        let _ = fs::remove_dir_all(dir);
    }

    /// Append to the list of outputs the run is about to write.
    pub fn record_outputs(&self, snapshot: &mut BackupSnapshot, outputs: &[PathBuf]) -> Result<(), BackupError> {
        for path in outputs {
            if !snapshot.outputs.contains(path) {
                snapshot.outputs.push(path.clone());
            }
        }
        self.save(snapshot)
    }

    /// Put the originals back and remove everything the merge created.
    ///
    /// Every backup copy is checked against its recorded size and digest
    /// before anything is touched.
    pub fn restore(&self) -> Result<RestoreReport, RestoreError> {
        let mut snapshot = self.current()?.ok_or(RestoreError::NoSnapshot)?;
        if !snapshot.blocks_merge() {
            return Err(RestoreError::NotRestorable { id: snapshot.id, state: snapshot.state });
        }

        let mut moves = Vec::with_capacity(snapshot.entries.len());
        for entry in &snapshot.entries {
            if entry.backup.is_file() {
                let (size, digest) = fsutil::hash_file(&entry.backup)
                    .map_err(|source| RestoreError::Io { path: entry.backup.clone(), source })?;
                if size != entry.size {
                    return Err(RestoreError::Corrupt {
                        path: entry.backup.clone(),
                        expected: format!("{} bytes", entry.size),
                        actual: format!("{size} bytes"),
                    });
                }
                if digest != entry.blake3 {
                    return Err(RestoreError::Corrupt {
                        path: entry.backup.clone(),
                        expected: entry.blake3.clone(),
                        actual: digest,
                    });
                }
                moves.push(entry);
            } else if snapshot.state == SnapshotState::Pending && entry.original.is_file() {
                debug!(file = %entry.original.display(), "never moved");
            } else {
                return Err(RestoreError::Missing(entry.backup.clone()));
            }
        }

        let strings_removed = strings::undo(&self.root)?;

        let mut outputs_removed = Vec::new();
        for output in &snapshot.outputs {
            let removed = fsutil::remove_if_exists(output)
                .map_err(|source| RestoreError::Io { path: output.clone(), source })?;
            if removed {
                outputs_removed.push(output.clone());
            }
        }

        for entry in &moves {
            fsutil::move_file(&entry.backup, &entry.original)
                .map_err(|source| RestoreError::Io { path: entry.original.clone(), source })?;
        }

        snapshot.state = SnapshotState::Restored;
        self.save(&snapshot)?;
        self.prune(&snapshot.id)?;
        info!(id = %snapshot.id, restored = moves.len(), outputs = outputs_removed.len(), "snapshot restored");

        Ok(RestoreReport {
            id: snapshot.id,
            restored: moves.len(),
            outputs_removed,
            strings_removed,
        })
    }

    /// Accept the merged output; a later merge may snapshot again.
    ///
    /// Takes the run lock. The strings manifest moves into the snapshot
    /// directory, so undoing a later merge leaves this run's loose strings.
    pub fn acknowledge(&self) -> Result<BackupSnapshot, BackupError> {
        let _lock = RunLock::acquire(&self.root)?;
        let mut snapshot = self.current()?.ok_or(BackupError::NoSnapshot)?;
        if snapshot.state != SnapshotState::Snapshotted {
            return Err(BackupError::Unresolved { id: snapshot.id, state: snapshot.state });
        }
        strings::retire(&self.root, &self.snapshot_dir(&snapshot.id))?;
        snapshot.state = SnapshotState::Acknowledged;
        self.save(&snapshot)?;
        info!(id = %snapshot.id, "snapshot acknowledged");
        Ok(snapshot)
    }

    /// Remove every snapshot directory except `keep`.
    pub fn prune(&self, keep: &str) -> Result<usize, BackupError> {
        let root = self.backup_root();
        let read = match fs::read_dir(&root) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(BackupError::Io { path: root, source }),
        };
        let mut removed = 0;
        for entry in read {
            let entry = entry.map_err(|source| BackupError::Io { path: root.clone(), source })?;
            let path = entry.path();
            if !path.is_dir() || entry.file_name() == keep {
                continue;
            }
            fs::remove_dir_all(&path).map_err(|source| BackupError::Io { path: path.clone(), source })?;
            debug!(dir = %path.display(), "pruned old snapshot");
            removed += 1;
        }
        Ok(removed)
    }

    fn fresh_id(&self) -> String {
        let base = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut id = base.clone();
        let mut n = 1;
        while self.snapshot_dir(&id).exists() {
            id = format!("{base}_{n}");
            n += 1;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(root: &Path) -> Vec<PathBuf> {
        ["ccA - Main.ba2", "ccB - Textures.ba2"]
            .iter()
            .map(|name| {
                let path = root.join(name);
                fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn snapshot_moves_and_guards() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let files = sources(dir.path());

        let snap = mgr.snapshot(&files).unwrap();
        assert_eq!(snap.state, SnapshotState::Snapshotted);
        assert!(files.iter().all(|f| !f.exists()));
        assert!(snap.entries.iter().all(|e| e.backup.is_file()));
        assert_eq!(mgr.current().unwrap().unwrap(), snap);

        assert!(matches!(mgr.snapshot(&[]), Err(BackupError::Unresolved { .. })));
        assert!(mgr.ensure_clean().is_err());
    }

    #[test]
    fn failed_snapshot_leaves_sources_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let mut files = sources(dir.path());
        files.push(dir.path().join("ccMissing - Main.ba2"));

        let err = mgr.snapshot(&files).unwrap_err();
        assert!(matches!(err, BackupError::Io { .. }));
        assert!(files[..2].iter().all(|f| f.is_file()));
        assert!(mgr.current().unwrap().is_none());
    }

    #[test]
    fn restore_round_trip_and_outputs_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let files = sources(dir.path());
        let mut snap = mgr.snapshot(&files).unwrap();

        let output = dir.path().join("CCMerged - Main.ba2");
        fs::write(&output, b"merged").unwrap();
        mgr.record_outputs(&mut snap, &[output.clone()]).unwrap();

        let report = mgr.restore().unwrap();
        assert_eq!(report.restored, 2);
        assert_eq!(report.outputs_removed, vec![output.clone()]);
        assert!(!output.exists());
        assert_eq!(fs::read(&files[0]).unwrap(), b"ccA - Main.ba2");
        assert_eq!(mgr.current().unwrap().unwrap().state, SnapshotState::Restored);
        assert!(mgr.ensure_clean().is_ok());
        assert!(matches!(mgr.restore(), Err(RestoreError::NotRestorable { .. })));
    }

    #[test]
    fn restore_fails_closed_on_tampered_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let files = sources(dir.path());
        let snap = mgr.snapshot(&files).unwrap();
        fs::write(&snap.entries[1].backup, b"tampered!").unwrap();

        assert!(matches!(mgr.restore(), Err(RestoreError::Corrupt { .. })));
        // Nothing was applied.
        assert!(!files[0].exists());
        assert!(snap.entries[0].backup.is_file());

        fs::remove_file(&snap.entries[1].backup).unwrap();
        assert!(matches!(mgr.restore(), Err(RestoreError::Missing(_))));
    }

    #[test]
    fn new_snapshot_prunes_previous_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let first = mgr.snapshot(&sources(dir.path())).unwrap();
        mgr.restore().unwrap();
        assert!(mgr.snapshot_dir(&first.id).is_dir());

        let second = mgr.snapshot(&sources(dir.path())).unwrap();
        assert_ne!(first.id, second.id);
        assert!(!mgr.snapshot_dir(&first.id).exists());
        assert!(mgr.snapshot_dir(&second.id).is_dir());
    }

    #[test]
    fn acknowledge_clears_guard() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        assert!(matches!(mgr.acknowledge(), Err(BackupError::NoSnapshot)));
        mgr.snapshot(&sources(dir.path())).unwrap();
        assert_eq!(mgr.acknowledge().unwrap().state, SnapshotState::Acknowledged);
        assert!(mgr.ensure_clean().is_ok());
        assert!(matches!(mgr.restore(), Err(RestoreError::NoSnapshot) | Err(RestoreError::NotRestorable { .. })));
    }

    #[test]
    fn acknowledge_waits_for_running_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let snap = mgr.snapshot(&sources(dir.path())).unwrap();
        fs::write(dir.path().join(strings::MANIFEST_FILE), b"{\"entries\":[]}").unwrap();

        let lock = RunLock::acquire(dir.path()).unwrap();
        assert!(matches!(mgr.acknowledge(), Err(BackupError::Lock(_))));
        assert_eq!(mgr.current().unwrap().unwrap().state, SnapshotState::Snapshotted);
        drop(lock);

        mgr.acknowledge().unwrap();
        assert!(!dir.path().join(strings::MANIFEST_FILE).exists());
        assert!(mgr.snapshot_dir(&snap.id).join(strings::MANIFEST_FILE).is_file());
    }

    #[test]
    fn pending_restore_accepts_unmoved_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path());
        let files = sources(dir.path());
        let snap_dir = mgr.snapshot_dir("20260101_000000");
        let entries: Vec<BackupEntry> = files
            .iter()
            .map(|f| {
                let (size, blake3) = fsutil::hash_file(f).unwrap();
                BackupEntry { original: f.clone(), backup: snap_dir.join(f.file_name().unwrap()), size, blake3 }
            })
            .collect();
        // Interrupted after the first move.
        fsutil::move_file(&entries[0].original, &entries[0].backup).unwrap();
        mgr.save(&BackupSnapshot {
            id: "20260101_000000".into(),
            run_id: Uuid::new_v4(),
            created: Utc::now(),
            state: SnapshotState::Pending,
            entries,
            outputs: Vec::new(),
        })
        .unwrap();

        let report = mgr.restore().unwrap();
        assert_eq!(report.restored, 1);
        assert!(files.iter().all(|f| f.is_file()));
        assert_eq!(mgr.current().unwrap().unwrap().state, SnapshotState::Restored);
    }
}
