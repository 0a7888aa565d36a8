//! Notification Outbox
//!
//! Reminder and notice emails are queued here instead of being sent inline;
//! a delivery worker drains the table out of band. Enqueueing is the
//! engines' side-effect boundary: once a ledger key is claimed, the matching
//! message lands in this queue.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::{DocStore, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub queued_at: i64,
}

/// Shares the document store's connection; outbox rows live next to the
/// documents they were triggered by.
#[derive(Clone)]
pub struct Outbox {
    conn: Arc<Mutex<Connection>>,
    clock: Clock,
}

impl Outbox {
    pub fn attach(store: &DocStore, clock: Clock) -> Result<Self, StoreError> {
        let conn = store.raw_conn();
        {
            let guard = conn.lock();
            guard.execute_batch(
                "CREATE TABLE IF NOT EXISTS outbox (
                    id        TEXT PRIMARY KEY,
                    recipient TEXT NOT NULL,
                    subject   TEXT NOT NULL,
                    body      TEXT NOT NULL,
                    queued_at INTEGER NOT NULL
                );",
            )?;
        }
        Ok(Self { conn, clock })
    }

    pub fn enqueue(&self, msg: &EmailMessage) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO outbox (id, recipient, subject, body, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            msg.to,
            msg.subject,
            msg.body,
            self.clock.now_ms(),
        ])?;
        Ok(())
    }

    /// Oldest-first slice of the queue.
    pub fn pending(&self, limit: usize) -> Result<Vec<QueuedEmail>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, recipient, subject, body, queued_at FROM outbox
             ORDER BY queued_at, rowid LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(QueuedEmail {
                id: r.get(0)?,
                to: r.get(1)?,
                subject: r.get(2)?,
                body: r.get(3)?,
                queued_at: r.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn pending_for(&self, recipient: &str) -> Result<Vec<QueuedEmail>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, recipient, subject, body, queued_at FROM outbox
             WHERE recipient = ?1 ORDER BY queued_at, rowid",
        )?;
        let rows = stmt.query_map(params![recipient], |r| {
            Ok(QueuedEmail {
                id: r.get(0)?,
                to: r.get(1)?,
                subject: r.get(2)?,
                body: r.get(3)?,
                queued_at: r.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn queued_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}
