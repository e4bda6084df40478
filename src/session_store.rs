//! # Session store
//!
//! Durable chat sessions kept as flat JSON files under one directory:
//!
//! ```text
//! <chat_history_dir>/
//!   sessions.json            # index: id -> {id, title, createdAt, updatedAt, messageCount}
//!   session_<id>.json        # detail: the full ChatSession including messages
//!   session_<id>.deleted     # tombstone, only present while a delete is in flight
//! ```
//!
//! ## Consistency rules
//! - Every mutation writes the detail file first and the index second, each through
//!   [`persist::write_json_atomic`]. A crash between the two leaves a readable detail file the
//!   index does not know about yet, never an index entry pointing at a missing file.
//! - Both writes happen under the index lock with no `.await` between them. The lock is taken
//!   before anything is written, so a future dropped while waiting for it has changed nothing.
//! - Deletion writes a tombstone, drops the index entry, then removes the detail file and the
//!   tombstone. A crash part-way leaves the tombstone behind and the next repair finishes the
//!   delete instead of re-listing the session.
//! - The detail file is authoritative for content, the index for listing. [`SessionStore::repair`]
//!   re-derives index entries from detail files, and runs whenever the store is opened.
//! - Nothing is cached in memory: every read goes to disk, so writes made by another process
//!   are always visible.
//!
//! ## Concurrency
//! Mutations of one session are serialized by a per-session async mutex, so two concurrent
//! appends of a user/assistant pair never interleave. Index updates are serialized by a second
//! mutex that is only ever taken while a session lock is already held (or during repair), which
//! keeps the lock order fixed.
//!
//! The store never creates a session implicitly: appending to an unknown id fails with
//! [`Error::NotFound`] and touches no file.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    models::{ChatMessage, ChatSession, NewMessage, SessionSummary},
    persist,
};

const INDEX_FILE: &str = "sessions.json";
const DETAIL_PREFIX: &str = "session_";
const DETAIL_SUFFIX: &str = ".json";
const TOMBSTONE_SUFFIX: &str = ".deleted";
const MAX_ID_LEN: usize = 64;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionIndex {
    sessions: BTreeMap<String, SessionSummary>,
}

/// What a repair pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Detail files that had no index entry.
    pub added: Vec<String>,
    /// Index entries whose fields disagreed with the detail file.
    pub reindexed: Vec<String>,
    /// Index entries with no detail file.
    pub dropped: Vec<String>,
    /// Detail files that could not be parsed; left on disk, kept out of the index.
    pub unreadable: Vec<String>,
    /// Interrupted deletes completed from their tombstones.
    pub finished_deletes: Vec<String>,
    /// Leftover temporary files removed.
    pub temp_files_removed: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty()
            && self.reindexed.is_empty()
            && self.dropped.is_empty()
            && self.unreadable.is_empty()
            && self.finished_deletes.is_empty()
            && self.temp_files_removed == 0
    }
}

/// Reject ids that could escape the storage directory or make odd file names.
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_input(format!("malformed session id `{id}`")))
    }
}

fn default_title() -> String {
    format!("New chat {}", Local::now().format("%Y-%m-%d %H:%M"))
}

fn normalize_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::invalid_input("title must not be empty"));
    }
    Ok(title.to_string())
}

/// Per-session mutexes, dropped again once nobody holds or waits on them.
#[derive(Debug, Default)]
struct SessionLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register interest in `id`'s mutex. The entry is released when the lease drops, including
    /// when the owning future is cancelled while waiting for the lock.
    fn lease(&self, id: &str) -> SessionLease<'_> {
        let handle = Arc::clone(self.map().entry(id.to_string()).or_default());
        SessionLease {
            locks: self,
            id: id.to_string(),
            handle,
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

struct SessionLease<'a> {
    locks: &'a SessionLocks,
    id: String,
    handle: Arc<Mutex<()>>,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.map();
        // Only the map and this lease left: no other task holds or waits on it.
        if Arc::strong_count(&self.handle) == 2 {
            locks.remove(&self.id);
        }
    }
}

#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    locks: SessionLocks,
    index_lock: Mutex<()>,
}

impl SessionStore {
    /// Open (creating if needed) the store rooted at `root` and run a repair pass.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            root: root.into(),
            locks: SessionLocks::default(),
            index_lock: Mutex::new(()),
        };
        persist::ensure_dir(&store.root)?;
        let report = store.repair().await?;
        if report.is_clean() {
            debug!("Session store {} is consistent", store.root.display());
        } else {
            warn!("Repaired session store {}: {:?}", store.root.display(), report);
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an empty session. A missing or blank title gets a timestamped default.
    pub async fn create_session(&self, title: Option<&str>) -> Result<ChatSession> {
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => default_title(),
        };
        let now = Utc::now();
        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };

        {
            let lease = self.locks.lease(&session.id);
            let _guard = lease.handle.lock().await;
            self.commit(&session).await?;
        }

        info!("Created session {} ({})", session.id, session.title);
        Ok(session)
    }

    /// Load a session with its messages.
    pub async fn get_session(&self, id: &str) -> Result<ChatSession> {
        validate_session_id(id)?;
        self.read_detail(id)?
            .ok_or_else(|| Error::not_found("session", id))
    }

    /// All sessions, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let index = self.read_index()?;
        let mut sessions: Vec<SessionSummary> = index.sessions.into_values().collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sessions)
    }

    /// Append one message, assigning an id and timestamp when absent.
    pub async fn append_message(&self, id: &str, message: NewMessage) -> Result<ChatMessage> {
        let mut appended = self.append_messages(id, vec![message]).await?;
        appended
            .pop()
            .ok_or_else(|| Error::invalid_input("nothing to append"))
    }

    /// Append several messages as one atomic write, in order.
    pub async fn append_messages(
        &self,
        id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<ChatMessage>> {
        if messages.is_empty() {
            return Err(Error::invalid_input("nothing to append"));
        }
        let now = Utc::now();
        let finalized = messages
            .into_iter()
            .map(|m| m.finalize(now))
            .collect::<Result<Vec<_>>>()?;

        self.mutate(id, move |session| {
            let duplicate = {
                let mut seen: HashSet<&str> =
                    session.messages.iter().map(|m| m.id.as_str()).collect();
                finalized
                    .iter()
                    .find(|m| !seen.insert(m.id.as_str()))
                    .map(|m| m.id.clone())
            };
            if let Some(id) = duplicate {
                return Err(Error::invalid_input(format!("duplicate message id `{id}`")));
            }
            session.messages.extend(finalized.iter().cloned());
            session.updated_at = Utc::now();
            Ok(finalized)
        })
        .await
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> Result<SessionSummary> {
        let title = normalize_title(title)?;
        self.mutate(id, move |session| {
            session.title = title;
            session.updated_at = Utc::now();
            Ok(session.summary())
        })
        .await
    }

    /// Empty the history while keeping id, title and creation time.
    pub async fn clear_messages(&self, id: &str) -> Result<SessionSummary> {
        self.mutate(id, |session| {
            session.messages.clear();
            session.updated_at = Utc::now();
            Ok(session.summary())
        })
        .await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        validate_session_id(id)?;
        let lease = self.locks.lease(id);
        let _guard = lease.handle.lock().await;
        self.delete_locked(id).await
    }

    /// Tombstone, index entry, detail file, tombstone. Caller holds the session lock.
    async fn delete_locked(&self, id: &str) -> Result<()> {
        let _index_guard = self.index_lock.lock().await;
        let detail = self.detail_path(id);
        let mut index = self.read_index()?;
        let indexed = index.sessions.remove(id).is_some();
        if !detail.exists() && !indexed {
            return Err(Error::not_found("session", id));
        }

        let tombstone = self.tombstone_path(id);
        persist::write_json_atomic(&tombstone, id)?;
        if indexed {
            self.write_index(&index)?;
        }
        persist::remove_file(&detail)?;
        persist::remove_file(&tombstone)?;
        info!("Deleted session {}", id);
        Ok(())
    }

    /// Rebuild the index from the detail files.
    pub async fn repair(&self) -> Result<RepairReport> {
        let _index_guard = self.index_lock.lock().await;
        let mut report = RepairReport::default();

        let current = match persist::read_json::<SessionIndex>(&self.index_path()) {
            Ok(index) => index.unwrap_or_default().sessions,
            Err(e) => {
                warn!("Session index unreadable, rebuilding: {}", e);
                BTreeMap::new()
            }
        };

        let mut paths = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| Error::persistence(&self.root, e))?;
        for entry in entries {
            paths.push(entry.map_err(|e| Error::persistence(&self.root, e))?.path());
        }

        let mut deleted = HashSet::new();
        for path in &paths {
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(DETAIL_PREFIX))
                .and_then(|rest| rest.strip_suffix(TOMBSTONE_SUFFIX))
            else {
                continue;
            };
            if validate_session_id(id).is_err() {
                continue;
            }
            info!("Finishing interrupted delete of session {}", id);
            persist::remove_file(&self.detail_path(id))?;
            persist::remove_file(path)?;
            deleted.insert(id.to_string());
        }

        let mut rebuilt = BTreeMap::new();
        for path in &paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with(".tmp") {
                if persist::remove_file(path).is_ok() {
                    report.temp_files_removed += 1;
                }
                continue;
            }
            let Some(id) = name
                .strip_prefix(DETAIL_PREFIX)
                .and_then(|rest| rest.strip_suffix(DETAIL_SUFFIX))
            else {
                continue;
            };
            if validate_session_id(id).is_err() || deleted.contains(id) {
                continue;
            }

            match persist::read_json::<ChatSession>(path) {
                Ok(Some(session)) if session.id == id => {
                    let summary = session.summary();
                    match current.get(id) {
                        None => report.added.push(id.to_string()),
                        Some(existing) if *existing != summary => {
                            report.reindexed.push(id.to_string())
                        }
                        Some(_) => {}
                    }
                    rebuilt.insert(id.to_string(), summary);
                }
                Ok(_) | Err(_) => {
                    warn!("Session file {} is unreadable, leaving it out", path.display());
                    report.unreadable.push(id.to_string());
                }
            }
        }

        report.dropped = current
            .keys()
            .filter(|id| !rebuilt.contains_key(*id) && !deleted.contains(*id))
            .cloned()
            .collect();
        report.finished_deletes = deleted.into_iter().collect();
        report.finished_deletes.sort();

        let rebuilt = SessionIndex { sessions: rebuilt };
        let index_missing = !self.index_path().exists();
        if !report.added.is_empty()
            || !report.reindexed.is_empty()
            || !report.dropped.is_empty()
            || !report.finished_deletes.is_empty()
            || index_missing
            || current.len() != rebuilt.sessions.len()
        {
            self.write_index(&rebuilt)?;
        }
        Ok(report)
    }

    /// Run `f` on the session under its lock and commit the result.
    async fn mutate<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ChatSession) -> Result<T>,
    ) -> Result<T> {
        validate_session_id(id)?;
        let lease = self.locks.lease(id);
        let _guard = lease.handle.lock().await;
        let mut session = self
            .read_detail(id)?
            .ok_or_else(|| Error::not_found("session", id))?;
        let value = f(&mut session)?;
        self.commit(&session).await?;
        Ok(value)
    }

    /// Detail first, then index, both under the index lock. Caller holds the session lock.
    async fn commit(&self, session: &ChatSession) -> Result<()> {
        let _index_guard = self.index_lock.lock().await;
        persist::write_json_atomic(&self.detail_path(&session.id), session)?;
        let mut index = self.read_index()?;
        index
            .sessions
            .insert(session.id.clone(), session.summary());
        self.write_index(&index)?;
        debug!(
            "Committed session {} ({} messages)",
            session.id,
            session.messages.len()
        );
        Ok(())
    }

    fn read_detail(&self, id: &str) -> Result<Option<ChatSession>> {
        persist::read_json(&self.detail_path(id))
    }

    fn read_index(&self) -> Result<SessionIndex> {
        Ok(persist::read_json(&self.index_path())?.unwrap_or_default())
    }

    fn write_index(&self, index: &SessionIndex) -> Result<()> {
        persist::write_json_atomic(&self.index_path(), index)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn detail_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{DETAIL_PREFIX}{id}{DETAIL_SUFFIX}"))
    }

    fn tombstone_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{DETAIL_PREFIX}{id}{TOMBSTONE_SUFFIX}"))
    }
}
