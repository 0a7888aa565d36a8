//! Versioned Document Store
//!
//! JSON documents in sqlite, grouped into named collections, with optimistic
//! transactions:
//!
//! ```text
//!   txn(|tx| ...)                       commit
//!   ┌──────────────────────────┐   ┌─────────────────────────────┐
//!   │ get() pins (doc,version) │   │ BEGIN IMMEDIATE             │
//!   │ set() stages JSON writes │──▶│ re-check pinned versions    │
//!   │ closure may bail early   │   │ mismatch → rollback + rerun │
//!   └──────────────────────────┘   │ apply writes, version += 1  │
//!                                  │ COMMIT                      │
//!                                  └─────────────────────────────┘
//! ```
//!
//! A document that was read keeps the version it had at first read; if any
//! pinned version moved by commit time the whole closure is rerun against
//! fresh state. Writes to documents that were never read (audit events,
//! fresh uuids) commit unconditionally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::models::AuditEvent;

/// Collection names used across the engines.
pub mod collections {
    /// Pool documents, keyed by pool id.
    pub const POOLS: &str = "pools";
    /// Write-once dedupe ledger, keyed by event key.
    pub const LEDGER: &str = "ledger";
    /// Append-only audit events, keyed by uuid.
    pub const AUDIT: &str = "audit_events";
    /// Global season results documents, keyed by season.
    pub const RESULTS: &str = "results";
}

/// Closure reruns before giving up on a contended transaction.
const MAX_TXN_ATTEMPTS: u32 = 25;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("transaction still contended after {attempts} attempts")]
    Contention { attempts: u32 },
}

/// Handle to the document database. Cheap to clone; all clones share one
/// connection behind a mutex.
#[derive(Clone)]
pub struct DocStore {
    conn: Arc<Mutex<Connection>>,
}

impl DocStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id     TEXT NOT NULL,
                version    INTEGER NOT NULL,
                body       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, doc_id)
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn raw_conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    // ------------------------------------------------------------------
    // One-shot reads and writes
    // ------------------------------------------------------------------

    pub fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<T>, StoreError> {
        let (_, body) = self.read_raw(collection, doc_id)?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    /// Unconditional upsert of a single document. Used for appends (audit
    /// events) and creations where the id is freshly generated.
    pub fn put<T: Serialize>(
        &self,
        collection: &str,
        doc_id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        self.apply_batch(vec![BatchWrite::new(collection, doc_id, doc)?])
    }

    pub fn list_ids(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT doc_id FROM documents WHERE collection = ?1 ORDER BY doc_id",
        )?;
        let rows = stmt.query_map(params![collection], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list<T: DeserializeOwned>(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT doc_id, body FROM documents WHERE collection = ?1 ORDER BY doc_id",
        )?;
        let rows = stmt.query_map(params![collection], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, body) = row?;
            out.push((id, serde_json::from_str(&body)?));
        }
        Ok(out)
    }

    /// Audit events for one pool, oldest first.
    pub fn audit_events_for(&self, pool_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let mut events: Vec<AuditEvent> = self
            .list::<AuditEvent>(collections::AUDIT)?
            .into_iter()
            .map(|(_, ev)| ev)
            .filter(|ev| ev.pool_id == pool_id)
            .collect();
        events.sort_by_key(|ev| ev.created_at);
        Ok(events)
    }

    /// Applies every write in one sqlite transaction, bumping each
    /// document's version. No version preconditions; callers that need
    /// them use [`DocStore::txn`].
    pub fn apply_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let sql_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = chrono::Utc::now().timestamp_millis();
        for w in &writes {
            sql_tx.execute(UPSERT_SQL, params![w.collection, w.doc_id, w.body, now])?;
        }
        sql_tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Optimistic transactions
    // ------------------------------------------------------------------

    /// Runs `body` against a transactional view and commits its staged
    /// writes if every document it read is still at the version it saw.
    /// On a version conflict the closure reruns against fresh state, up to
    /// [`MAX_TXN_ATTEMPTS`] times. Closure errors propagate immediately and
    /// nothing is written.
    pub fn txn<T, E, F>(&self, mut body: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnMut(&mut Txn) -> Result<T, E>,
    {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let mut tx = Txn {
                store: self,
                reads: HashMap::new(),
                writes: Vec::new(),
            };
            let out = body(&mut tx)?;
            if tx.writes.is_empty() {
                // Read-only pass: nothing to validate.
                return Ok(out);
            }
            match self.commit(&tx) {
                Ok(true) => return Ok(out),
                Ok(false) => {
                    tracing::debug!(attempt, "document version conflict, rerunning transaction");
                    continue;
                }
                Err(e) => return Err(E::from(e)),
            }
        }
        Err(E::from(StoreError::Contention {
            attempts: MAX_TXN_ATTEMPTS,
        }))
    }

    /// Ok(true) = committed, Ok(false) = version conflict (rolled back).
    fn commit(&self, tx: &Txn) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let sql_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for ((collection, doc_id), pin) in &tx.reads {
            let current: i64 = sql_tx
                .query_row(
                    "SELECT version FROM documents WHERE collection = ?1 AND doc_id = ?2",
                    params![collection, doc_id],
                    |r| r.get(0),
                )
                .optional()?
                .unwrap_or(0);
            if current != pin.version {
                return Ok(false);
            }
        }
        let now = chrono::Utc::now().timestamp_millis();
        for ((collection, doc_id), body) in &tx.writes {
            sql_tx.execute(UPSERT_SQL, params![collection, doc_id, body, now])?;
        }
        sql_tx.commit()?;
        Ok(true)
    }

    fn read_raw(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<(i64, Option<String>), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT version, body FROM documents WHERE collection = ?1 AND doc_id = ?2",
        )?;
        let row = stmt
            .query_row(params![collection, doc_id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })
            .optional()?;
        Ok(match row {
            Some((version, body)) => (version, Some(body)),
            None => (0, None),
        })
    }

    #[cfg(test)]
    pub(crate) fn version_of(&self, collection: &str, doc_id: &str) -> Result<i64, StoreError> {
        Ok(self.read_raw(collection, doc_id)?.0)
    }
}

const UPSERT_SQL: &str = "INSERT INTO documents (collection, doc_id, version, body, updated_at)
     VALUES (?1, ?2, 1, ?3, ?4)
     ON CONFLICT(collection, doc_id)
     DO UPDATE SET version = version + 1, body = excluded.body, updated_at = excluded.updated_at";

/// A single write prepared for [`DocStore::apply_batch`].
pub struct BatchWrite {
    collection: String,
    doc_id: String,
    body: String,
}

impl BatchWrite {
    pub fn new<T: Serialize>(
        collection: &str,
        doc_id: &str,
        doc: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            body: serde_json::to_string(doc)?,
        })
    }
}

type DocKey = (String, String);

struct ReadPin {
    /// Version at first read; 0 means the document did not exist.
    version: i64,
    body: Option<String>,
}

/// Transactional view handed to [`DocStore::txn`] closures. Reads are
/// repeatable within one attempt and see the closure's own staged writes.
pub struct Txn<'a> {
    store: &'a DocStore,
    reads: HashMap<DocKey, ReadPin>,
    writes: Vec<(DocKey, String)>,
}

impl Txn<'_> {
    pub fn get<T: DeserializeOwned>(
        &mut self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<T>, StoreError> {
        let key = (collection.to_string(), doc_id.to_string());
        if let Some((_, body)) = self.writes.iter().rev().find(|(k, _)| *k == key) {
            return Ok(Some(serde_json::from_str(body)?));
        }
        if let Some(pin) = self.reads.get(&key) {
            return match &pin.body {
                Some(b) => Ok(Some(serde_json::from_str(b)?)),
                None => Ok(None),
            };
        }
        let (version, body) = self.store.read_raw(collection, doc_id)?;
        let parsed = match &body {
            Some(b) => Some(serde_json::from_str(b)?),
            None => None,
        };
        self.reads.insert(key, ReadPin { version, body });
        Ok(parsed)
    }

    /// Pins the document's (non-)existence like a read.
    pub fn exists(&mut self, collection: &str, doc_id: &str) -> Result<bool, StoreError> {
        let key = (collection.to_string(), doc_id.to_string());
        if self.writes.iter().any(|(k, _)| *k == key) {
            return Ok(true);
        }
        if let Some(pin) = self.reads.get(&key) {
            return Ok(pin.body.is_some());
        }
        let (version, body) = self.store.read_raw(collection, doc_id)?;
        let present = body.is_some();
        self.reads.insert(key, ReadPin { version, body });
        Ok(present)
    }

    pub fn set<T: Serialize>(
        &mut self,
        collection: &str,
        doc_id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        let key = (collection.to_string(), doc_id.to_string());
        let body = serde_json::to_string(doc)?;
        if let Some(slot) = self.writes.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = body;
        } else {
            self.writes.push((key, body));
        }
        Ok(())
    }
}
