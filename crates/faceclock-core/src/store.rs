//! Signature store: at most one signature per identity key.
//!
//! Records live in SQLite; the raw enrollment image of each record lives in
//! an artifact directory next to the database. A record is only considered
//! present when both halves are.
//!
//! Replacing a record follows write-new-then-delete-old: the new artifact is
//! staged under a fresh name, the row is swapped in one transaction, and only
//! then is the previous artifact removed.

use crate::types::{FaceRegion, Signature, SignatureError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const DB_FILE: &str = "signatures.db";
const ARTIFACT_DIR: &str = "artifacts";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS signatures (
    identity_key            TEXT PRIMARY KEY NOT NULL,
    format_version          TEXT NOT NULL,
    dimension               INTEGER NOT NULL,
    vector                  BLOB NOT NULL,
    region_top              INTEGER NOT NULL,
    region_right            INTEGER NOT NULL,
    region_bottom           INTEGER NOT NULL,
    region_left             INTEGER NOT NULL,
    created_at              TEXT NOT NULL,
    tolerance_at_enrollment REAL NOT NULL,
    artifact                TEXT NOT NULL,
    artifact_sha256         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS signatures_format_version ON signatures (format_version);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("artifact I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no signature enrolled for {0}")]
    NotFound(String),
    #[error("stored record for {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
    #[error("refusing to store invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("artifact {file} was staged for {staged_for}, not {key}")]
    ArtifactMismatch {
        file: String,
        staged_for: String,
        key: String,
    },
    #[error("staged artifact {0} is missing")]
    ArtifactMissing(String),
    #[error("key lock poisoned")]
    LockPoisoned,
}

/// A raw enrollment image written to the artifact directory but not yet
/// referenced by any record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub identity_key: String,
    pub file_name: String,
    pub sha256: String,
    pub bytes: usize,
}

/// Aggregate counts, computed from metadata only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub total: u64,
    pub by_format_version: BTreeMap<String, u64>,
}

/// Keyed persistence for signatures and their enrollment artifacts.
///
/// `put`, `delete` and `exists` on the same key are serialised; different
/// keys never wait on each other.
pub trait SignatureStore: Send + Sync {
    /// Persist the raw enrollment image under a fresh name.
    fn stage_artifact(
        &self,
        identity_key: &str,
        image: &[u8],
        extension: &str,
    ) -> Result<StagedArtifact, StoreError>;

    /// Remove a staged artifact that never made it into a record.
    /// Succeeds if the file is already gone.
    fn discard_artifact(&self, artifact: &StagedArtifact) -> Result<(), StoreError>;

    /// Create or atomically replace the record for `signature.identity_key`.
    fn put(&self, signature: &Signature, artifact: &StagedArtifact) -> Result<(), StoreError>;

    fn get(&self, identity_key: &str) -> Result<Signature, StoreError>;

    /// True iff a complete, structurally valid record and its artifact exist.
    fn exists(&self, identity_key: &str) -> Result<bool, StoreError>;

    /// Remove the record and its artifact. Returns whether a record existed.
    fn delete(&self, identity_key: &str) -> Result<bool, StoreError>;

    fn statistics(&self) -> Result<StoreStatistics, StoreError>;
}

/// Per-key mutual exclusion. An entry lives only while some caller holds
/// or waits on it, so the table stays as small as the number of in-flight
/// operations.
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    /// Run `op` while holding the lock for `key`.
    fn with_lock<T>(
        &self,
        key: &str,
        op: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = {
            let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let result = match lock.lock() {
            Ok(_guard) => op(),
            Err(_) => Err(StoreError::LockPoisoned),
        };
        self.release(key, lock);
        result
    }

    fn release(&self, key: &str, lock: Arc<Mutex<()>>) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        drop(lock);
        // Handles are only cloned under the table lock, so a count of one
        // means nobody else holds or waits on this entry.
        if map.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// SQLite-backed [`SignatureStore`] rooted at a data directory.
pub struct SqliteSignatureStore {
    db_path: PathBuf,
    artifact_dir: PathBuf,
    locks: KeyLocks,
}

impl SqliteSignatureStore {
    /// Open or create the store under `root`, pruning artifacts no record
    /// references (left behind by a crash between staging and `put`).
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let artifact_dir = root.join(ARTIFACT_DIR);
        std::fs::create_dir_all(&artifact_dir).map_err(|source| StoreError::Io {
            path: artifact_dir.clone(),
            source,
        })?;

        let store = Self {
            db_path: root.join(DB_FILE),
            artifact_dir,
            locks: KeyLocks::default(),
        };

        let conn = store.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(
            path = %store.db_path.display(),
            journal_mode = %mode,
            "signature store opened"
        );

        let pruned = store.prune_orphan_artifacts(&conn)?;
        if pruned > 0 {
            tracing::warn!(count = pruned, "removed orphaned enrollment artifacts");
        }

        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.artifact_dir.join(file_name)
    }

    fn prune_orphan_artifacts(&self, conn: &Connection) -> Result<usize, StoreError> {
        let mut stmt = conn.prepare("SELECT artifact FROM signatures")?;
        let referenced = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;

        let entries = std::fs::read_dir(&self.artifact_dir).map_err(|source| StoreError::Io {
            path: self.artifact_dir.clone(),
            source,
        })?;

        let mut pruned = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if referenced.contains(&name) || !entry.path().is_file() {
                continue;
            }
            remove_if_present(&entry.path())?;
            pruned += 1;
        }
        Ok(pruned)
    }
}

impl SignatureStore for SqliteSignatureStore {
    fn stage_artifact(
        &self,
        identity_key: &str,
        image: &[u8],
        extension: &str,
    ) -> Result<StagedArtifact, StoreError> {
        let file_name = format!("{}.{extension}", Uuid::new_v4());
        let path = self.artifact_path(&file_name);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.artifact_dir).map_err(io_err)?;
        tmp.write_all(image).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        let sha256 = format!("{:x}", Sha256::digest(image));
        tracing::debug!(identity_key, file = %file_name, bytes = image.len(), "artifact staged");

        Ok(StagedArtifact {
            identity_key: identity_key.to_string(),
            file_name,
            sha256,
            bytes: image.len(),
        })
    }

    fn discard_artifact(&self, artifact: &StagedArtifact) -> Result<(), StoreError> {
        remove_if_present(&self.artifact_path(&artifact.file_name))?;
        tracing::debug!(
            identity_key = %artifact.identity_key,
            file = %artifact.file_name,
            "staged artifact discarded"
        );
        Ok(())
    }

    fn put(&self, signature: &Signature, artifact: &StagedArtifact) -> Result<(), StoreError> {
        let key = signature.identity_key.as_str();
        if artifact.identity_key != key {
            return Err(StoreError::ArtifactMismatch {
                file: artifact.file_name.clone(),
                staged_for: artifact.identity_key.clone(),
                key: key.to_string(),
            });
        }
        signature.check_shape()?;
        if !self.artifact_path(&artifact.file_name).is_file() {
            return Err(StoreError::ArtifactMissing(artifact.file_name.clone()));
        }

        let dimension = i64::try_from(signature.vector.len()).map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            message: "vector too long".into(),
        })?;
        let blob = encode_vector(&signature.vector);

        self.locks
            .with_lock(key, || self.upsert(signature, artifact, dimension, &blob))
    }

    fn get(&self, identity_key: &str) -> Result<Signature, StoreError> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                "SELECT identity_key, format_version, dimension, vector,
                        region_top, region_right, region_bottom, region_left,
                        created_at, tolerance_at_enrollment
                 FROM signatures WHERE identity_key = ?1",
                params![identity_key],
                decode_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(identity_key.to_string()))?;
        raw.into_signature()
    }

    fn exists(&self, identity_key: &str) -> Result<bool, StoreError> {
        // Under the key lock so a concurrent replace is never seen between
        // its commit and the removal of the old artifact.
        self.locks
            .with_lock(identity_key, || self.record_complete(identity_key))
    }

    fn delete(&self, identity_key: &str) -> Result<bool, StoreError> {
        self.locks
            .with_lock(identity_key, || self.delete_record(identity_key))
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT format_version, COUNT(*) FROM signatures GROUP BY format_version",
        )?;
        let rows =
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = StoreStatistics::default();
        for row in rows {
            let (version, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            stats.by_format_version.insert(version, count);
        }
        Ok(stats)
    }
}

impl SqliteSignatureStore {
    /// Swap the row for `signature.identity_key`. Caller holds the key lock.
    fn upsert(
        &self,
        signature: &Signature,
        artifact: &StagedArtifact,
        dimension: i64,
        blob: &[u8],
    ) -> Result<(), StoreError> {
        let key = signature.identity_key.as_str();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT artifact FROM signatures WHERE identity_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO signatures (
                identity_key, format_version, dimension, vector,
                region_top, region_right, region_bottom, region_left,
                created_at, tolerance_at_enrollment, artifact, artifact_sha256
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(identity_key) DO UPDATE SET
                format_version = excluded.format_version,
                dimension = excluded.dimension,
                vector = excluded.vector,
                region_top = excluded.region_top,
                region_right = excluded.region_right,
                region_bottom = excluded.region_bottom,
                region_left = excluded.region_left,
                created_at = excluded.created_at,
                tolerance_at_enrollment = excluded.tolerance_at_enrollment,
                artifact = excluded.artifact,
                artifact_sha256 = excluded.artifact_sha256",
            params![
                key,
                signature.format_version,
                dimension,
                blob,
                signature.face_region.top,
                signature.face_region.right,
                signature.face_region.bottom,
                signature.face_region.left,
                signature.created_at.to_rfc3339(),
                signature.tolerance_at_enrollment,
                artifact.file_name,
                artifact.sha256,
            ],
        )?;
        tx.commit()?;

        tracing::info!(
            identity_key = key,
            format_version = %signature.format_version,
            replaced = previous.is_some(),
            "signature stored"
        );

        if let Some(old) = previous.filter(|old| *old != artifact.file_name) {
            // The new record is committed; a leftover file is pruned on next open.
            if let Err(err) = remove_if_present(&self.artifact_path(&old)) {
                tracing::warn!(
                    identity_key = key,
                    error = %err,
                    "failed to remove replaced artifact"
                );
            }
        }
        Ok(())
    }

    /// Row present, vector blob the declared length, artifact on disk.
    /// Caller holds the key lock.
    fn record_complete(&self, identity_key: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let artifact: Option<String> = conn
            .query_row(
                "SELECT artifact FROM signatures
                 WHERE identity_key = ?1 AND dimension > 0 AND length(vector) = dimension * 8",
                params![identity_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(artifact.is_some_and(|file| self.artifact_path(&file).is_file()))
    }

    /// Caller holds the key lock.
    fn delete_record(&self, identity_key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let artifact: Option<String> = tx
            .query_row(
                "SELECT artifact FROM signatures WHERE identity_key = ?1",
                params![identity_key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(artifact) = artifact else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM signatures WHERE identity_key = ?1",
            params![identity_key],
        )?;
        tx.commit()?;

        if let Err(err) = remove_if_present(&self.artifact_path(&artifact)) {
            tracing::warn!(
                identity_key,
                error = %err,
                "record deleted but artifact removal failed"
            );
        }
        tracing::info!(identity_key, "signature deleted");
        Ok(true)
    }
}

/// Row as read from SQLite, before shape checks.
struct RawRecord {
    identity_key: String,
    format_version: String,
    dimension: i64,
    vector: Vec<u8>,
    region: FaceRegion,
    created_at: String,
    tolerance_at_enrollment: f64,
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        identity_key: row.get(0)?,
        format_version: row.get(1)?,
        dimension: row.get(2)?,
        vector: row.get(3)?,
        region: FaceRegion {
            top: row.get(4)?,
            right: row.get(5)?,
            bottom: row.get(6)?,
            left: row.get(7)?,
        },
        created_at: row.get(8)?,
        tolerance_at_enrollment: row.get(9)?,
    })
}

impl RawRecord {
    fn into_signature(self) -> Result<Signature, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            key: self.identity_key.clone(),
            message,
        };

        let vector = decode_vector(&self.vector)
            .ok_or_else(|| corrupt(format!("vector blob of {} bytes", self.vector.len())))?;
        if i64::try_from(vector.len()).ok() != Some(self.dimension) {
            return Err(corrupt(format!(
                "declared dimension {} but blob holds {}",
                self.dimension,
                vector.len()
            )));
        }
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(format!("created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Signature {
            identity_key: self.identity_key,
            vector,
            face_region: self.region,
            created_at,
            tolerance_at_enrollment: self.tolerance_at_enrollment,
            format_version: self.format_version,
        })
    }
}

fn encode_vector(vector: &[f64]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f64>> {
    if blob.len() % 8 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect(),
    )
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
