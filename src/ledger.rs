//! Write-Once Event Ledger
//!
//! Dedupe primitive behind every "exactly once per key" side effect:
//! reminder sends, countdown notices, standings mails. A claim either
//! creates the ledger document (CLAIMED) or finds it already present
//! (ALREADY_CLAIMED); two racing claimants for the same key can never both
//! win because creation is validated transactionally.
//!
//! The convention is claim-then-act: once a key is claimed the side effect
//! runs until it succeeds somewhere (at-least-once after the claim), and is
//! never attempted again under that key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::store::{collections, DocStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: String,
    #[serde(default)]
    pub payload: Value,
    pub claimed_at: i64,
}

#[derive(Clone)]
pub struct EventLedger {
    store: DocStore,
    clock: Clock,
}

impl EventLedger {
    pub fn new(store: DocStore, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Claims `key`, storing `payload` for debugging. First caller wins.
    pub fn try_claim(&self, key: &str, payload: Value) -> Result<ClaimOutcome, StoreError> {
        self.store.txn(|tx| {
            if tx.exists(collections::LEDGER, key)? {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            let entry = LedgerEntry {
                key: key.to_string(),
                payload: payload.clone(),
                claimed_at: self.clock.now_ms(),
            };
            tx.set(collections::LEDGER, key, &entry)?;
            Ok(ClaimOutcome::Claimed)
        })
    }

    pub fn entry(&self, key: &str) -> Result<Option<LedgerEntry>, StoreError> {
        self.store.get(collections::LEDGER, key)
    }
}

// ----------------------------------------------------------------------------
// Key builders
//
// Keys are flat strings so operators can read them straight out of the
// ledger collection. Time-bucketed keys embed the bucket index, so a new
// bucket (or an edited lock time) produces a fresh key automatically.
// ----------------------------------------------------------------------------

/// Bucket index for repeat-suppressed reminders: floor(now / interval).
pub fn time_bucket(now_ms: i64, interval_ms: i64) -> i64 {
    now_ms.div_euclid(interval_ms.max(1))
}

pub fn host_payment_key(pool_id: &str, bucket: i64) -> String {
    format!("PAY_HOST:{pool_id}:{bucket}")
}

pub fn user_payment_key(pool_id: &str, email: &str, bucket: i64) -> String {
    format!("PAY_USER:{pool_id}:{email}:{bucket}")
}

pub fn lock_reminder_key(pool_id: &str, lock_time_ms: i64, lead_minutes: i64) -> String {
    format!("LOCK:{pool_id}:{lock_time_ms}:{lead_minutes}")
}

pub fn results_notice_key(pool_id: &str, round: &str, unit: &str) -> String {
    format!("RESULTS:{pool_id}:{round}:{unit}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::NamedTempFile;

    fn temp_ledger() -> (NamedTempFile, EventLedger) {
        let file = NamedTempFile::new().unwrap();
        let store = DocStore::open(file.path().to_str().unwrap()).unwrap();
        (file, EventLedger::new(store, Clock::fixed(1_000)))
    }

    #[test]
    fn first_claim_wins_second_is_deduped() {
        let (_f, ledger) = temp_ledger();
        let key = host_payment_key("pool-1", 17);

        let first = ledger
            .try_claim(&key, serde_json::json!({"bucket": 17}))
            .unwrap();
        assert!(first.is_claimed());

        let second = ledger.try_claim(&key, serde_json::json!({})).unwrap();
        assert_eq!(second, ClaimOutcome::AlreadyClaimed);

        let entry = ledger.entry(&key).unwrap().unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(entry.claimed_at, 1_000);
        assert_eq!(entry.payload["bucket"], 17);
    }

    #[test]
    fn distinct_keys_are_independent() {
        let (_f, ledger) = temp_ledger();
        assert!(ledger
            .try_claim(&host_payment_key("p", 1), Value::Null)
            .unwrap()
            .is_claimed());
        assert!(ledger
            .try_claim(&host_payment_key("p", 2), Value::Null)
            .unwrap()
            .is_claimed());
        assert!(ledger
            .try_claim(&user_payment_key("p", "a@example.com", 1), Value::Null)
            .unwrap()
            .is_claimed());
    }

    #[test]
    fn racing_claims_have_exactly_one_winner() {
        let (_f, ledger) = temp_ledger();
        const THREADS: usize = 8;
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger
                        .try_claim("LOCK:p:1700000000000:60", Value::Null)
                        .unwrap()
                        .is_claimed()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn bucket_boundaries() {
        let day = 24 * 3_600_000;
        assert_eq!(time_bucket(0, day), 0);
        assert_eq!(time_bucket(day - 1, day), 0);
        assert_eq!(time_bucket(day, day), 1);
        assert_eq!(time_bucket(day * 3 + 5, day), 3);
        // degenerate interval never divides by zero
        assert_eq!(time_bucket(500, 0), 500);
    }

    #[test]
    fn key_shapes_are_stable() {
        assert_eq!(host_payment_key("p1", 3), "PAY_HOST:p1:3");
        assert_eq!(
            user_payment_key("p1", "x@y.z", 3),
            "PAY_USER:p1:x@y.z:3"
        );
        assert_eq!(lock_reminder_key("p1", 99, 15), "LOCK:p1:99:15");
        assert_eq!(results_notice_key("p1", "WILD_CARD", "KC"), "RESULTS:p1:WILD_CARD:KC");
    }
}
