//! Durable per-session record store.
//!
//! Layout under `<state_dir>/<session>/`:
//!
//! ```text
//! session.json         metadata and plan
//! abort.flag           present while an abort is pending
//! records/<key>.json   one SessionRecord per work unit
//! logs/                per-attempt stdout/stderr captures
//! output/              default output root for units
//! ```
//!
//! Every write goes to a temporary sibling, is fsynced and renamed over the
//! target, so readers only ever observe complete records. Writers for the
//! same key are serialized by a per-key mutex; different keys never contend.
//!
//! The abort request is its own file rather than a field of `session.json`:
//! `gbatch abort` runs in another process, and the runner's metadata writes
//! would otherwise overwrite it.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::discovery::{DiscoveryRule, JobTemplate};
use crate::error::StoreError;
use crate::state_machine::{RetryConfig, SessionRecord};

const SESSION_FILE: &str = "session.json";
const ABORT_FILE: &str = "abort.flag";
const RECORDS_DIR: &str = "records";
const LOGS_DIR: &str = "logs";
const OUTPUT_DIR: &str = "output";

/// Everything needed to re-discover and re-run a session without arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPlan {
    pub input_root: PathBuf,
    /// Anchor for relative output directory templates.
    pub base_dir: PathBuf,
    pub discovery: DiscoveryRule,
    pub job: JobTemplate,
    pub retry: RetryConfig,
    pub timeout_secs: Option<u64>,
}

/// Session-wide metadata persisted in `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_units: usize,
    pub concurrency_limit: usize,
    /// Identifier of the most recent `run_session` invocation.
    pub run_id: Option<Uuid>,
    pub plan: Option<SessionPlan>,
}

impl SessionMeta {
    fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            total_units: 0,
            concurrency_limit: 0,
            run_id: None,
            plan: None,
        }
    }
}

pub struct SessionStore {
    name: String,
    dir: PathBuf,
    meta_lock: Mutex<()>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Opens the session, creating it when absent.
    pub fn open(state_dir: &Path, name: &str) -> Result<Self, StoreError> {
        validate_session_name(name)?;
        let dir = state_dir.join(name);
        for sub in [RECORDS_DIR, LOGS_DIR, OUTPUT_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| StoreError::io("create", &path, e))?;
        }
        let store = Self::at(name, dir);
        let meta_path = store.dir.join(SESSION_FILE);
        if !meta_path.exists() {
            let _guard = lock_unpoisoned(&store.meta_lock);
            write_json_atomic(&meta_path, name, &SessionMeta::new(name))?;
            debug!(session = %name, dir = %store.dir.display(), "Session created");
        }
        Ok(store)
    }

    /// Opens an existing session; `None` when it was never created.
    pub fn open_existing(state_dir: &Path, name: &str) -> Result<Option<Self>, StoreError> {
        validate_session_name(name)?;
        let dir = state_dir.join(name);
        if !dir.join(SESSION_FILE).is_file() {
            return Ok(None);
        }
        Self::open(state_dir, name).map(Some)
    }

    fn at(name: &str, dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            dir,
            meta_lock: Mutex::new(()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_root(&self) -> PathBuf {
        self.dir.join(OUTPUT_DIR)
    }

    pub fn stdout_log(&self, key: &str, attempt: u32) -> PathBuf {
        self.dir.join(LOGS_DIR).join(format!("{key}.{attempt}.stdout.log"))
    }

    pub fn stderr_log(&self, key: &str, attempt: u32) -> PathBuf {
        self.dir.join(LOGS_DIR).join(format!("{key}.{attempt}.stderr.log"))
    }

    /// Atomically creates or replaces the record for `record.key`.
    pub fn upsert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        validate_key(&record.key)?;
        let lock = self.key_lock(&record.key);
        let _guard = lock_unpoisoned(&lock);
        write_json_atomic(&self.record_path(&record.key), &record.key, record)
    }

    pub fn get(&self, key: &str) -> Result<Option<SessionRecord>, StoreError> {
        validate_key(key)?;
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Lazily loads records matching `predicate`, in key order.
    ///
    /// Only the directory listing happens up front; each record is read when
    /// the iterator reaches it.
    pub fn list<P>(
        &self,
        predicate: P,
    ) -> Result<impl Iterator<Item = Result<SessionRecord, StoreError>> + use<P>, StoreError>
    where
        P: Fn(&SessionRecord) -> bool,
    {
        let dir = self.dir.join(RECORDS_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io("list", &dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io("list", &dir, e))?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !hidden && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|path| read_json::<SessionRecord>(&path))
            .filter(move |record| match record {
                Ok(record) => predicate(record),
                Err(_) => true,
            }))
    }

    /// All records, in key order.
    pub fn records(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.list(|_| true)?.collect()
    }

    pub fn metadata(&self) -> Result<SessionMeta, StoreError> {
        read_json(&self.dir.join(SESSION_FILE))
    }

    /// Read-modify-write of the metadata under the metadata lock.
    pub fn update_metadata<F>(&self, f: F) -> Result<SessionMeta, StoreError>
    where
        F: FnOnce(&mut SessionMeta),
    {
        let _guard = lock_unpoisoned(&self.meta_lock);
        let path = self.dir.join(SESSION_FILE);
        let mut meta: SessionMeta = read_json(&path)?;
        f(&mut meta);
        meta.updated_at = Utc::now();
        write_json_atomic(&path, &self.name, &meta)?;
        Ok(meta)
    }

    /// Persists the abort request; a runner in another process picks it up.
    /// The file records when the request was made.
    pub fn request_abort(&self) -> Result<(), StoreError> {
        write_json_atomic(&self.dir.join(ABORT_FILE), &self.name, &Utc::now())
    }

    pub fn abort_requested(&self) -> Result<bool, StoreError> {
        let path = self.dir.join(ABORT_FILE);
        path.try_exists().map_err(|e| StoreError::io("read", &path, e))
    }

    /// Drops a stale abort request before a new run starts.
    pub fn clear_abort(&self) -> Result<(), StoreError> {
        let path = self.dir.join(ABORT_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(session = %self.name, "Cleared stale abort request");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("remove", &path, e)),
        }
    }

    /// Final metadata flush.
    pub fn close(&self) -> Result<(), StoreError> {
        self.update_metadata(|_| {})?;
        debug!(session = %self.name, "Session store closed");
        Ok(())
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(RECORDS_DIR).join(format!("{key}.json"))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_unpoisoned(&self.key_locks);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// Names of all sessions under `state_dir`, sorted.
pub fn list_sessions(state_dir: &Path) -> Result<Vec<String>, StoreError> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(state_dir).map_err(|e| StoreError::io("list", state_dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io("list", state_dir, e))?.path();
        if path.join(SESSION_FILE).is_file()
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn validate_session_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidSessionName(name.to_string()));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = fs::read_to_string(path).map_err(|e| StoreError::io("read", path, e))?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Write-to-temp, fsync, rename, fsync directory.
fn write_json_atomic<T: Serialize>(path: &Path, key: &str, value: &T) -> Result<(), StoreError> {
    let mut payload = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    payload.push(b'\n');

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io("write", &tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io("rename", path, e));
    }
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io("sync", dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}
