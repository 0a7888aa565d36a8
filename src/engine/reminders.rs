//! Reminder Sweep
//!
//! The periodic pass over every pool. Four duty families, dispatched by
//! pool type:
//!
//! - payment reminders for unpaid square reservations, deduped per time
//!   bucket through the event ledger (one host summary, one mail per
//!   participant email)
//! - auto-release of stale unpaid reservations, with best-effort waitlist
//!   notices after the transaction commits
//! - lock countdown reminders at configured lead times, plus the backstop
//!   that locks any pool found open past its deadline
//! - playoff entry payment reminders inside the pre-lock window, tracked
//!   by a per-entry flag instead of ledger keys
//!
//! A failure in one pool is logged and never stops the sweep; every pool
//! gets its chance each cycle.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_json::json;
use tracing::{error, info, warn};

use crate::clock::{Clock, MILLIS_PER_HOUR, MILLIS_PER_MIN};
use crate::engine::lock::{LockActor, LockEngine};
use crate::error::{PoolError, PoolResult};
use crate::ledger::{
    host_payment_key, lock_reminder_key, time_bucket, user_payment_key, EventLedger,
};
use crate::models::{AuditEvent, Pool, PoolType, Square};
use crate::outbox::{EmailMessage, Outbox};
use crate::store::{collections, DocStore};

/// How close to a lead-time target "now" must be for a countdown reminder
/// to fire. Sweeps run every few minutes, so a missed exact instant is
/// normal; anything inside the window counts.
pub const LOCK_REMINDER_TOLERANCE_MS: i64 = 10 * MILLIS_PER_MIN;

/// Playoff entry payment reminders go out inside this window before lock.
pub const PLAYOFF_REMINDER_WINDOW_MS: i64 = 48 * MILLIS_PER_HOUR;

/// Floor for configured reminder repeat intervals.
const MIN_REPEAT_INTERVAL_MS: i64 = MILLIS_PER_MIN;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub pools_scanned: usize,
    pub pools_skipped: usize,
    pub failures: usize,
    pub host_reminders: usize,
    pub participant_reminders: usize,
    pub squares_released: usize,
    pub waitlist_notices: usize,
    pub lock_reminders: usize,
    pub pools_auto_locked: usize,
    pub playoff_reminders: usize,
}

#[derive(Clone)]
pub struct ReminderEngine {
    store: DocStore,
    ledger: EventLedger,
    outbox: Outbox,
    lock_engine: LockEngine,
    clock: Clock,
}

impl ReminderEngine {
    pub fn new(
        store: DocStore,
        ledger: EventLedger,
        outbox: Outbox,
        lock_engine: LockEngine,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            ledger,
            outbox,
            lock_engine,
            clock,
        }
    }

    /// One full pass over the fleet.
    pub fn run_sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let pool_ids = match self.store.list_ids(collections::POOLS) {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "reminder sweep could not list pools");
                return stats;
            }
        };
        for pool_id in pool_ids {
            stats.pools_scanned += 1;
            if let Err(e) = self.sweep_pool(&pool_id, &mut stats) {
                stats.failures += 1;
                warn!(pool_id = %pool_id, error = %e, "sweep failed for pool, continuing");
            }
        }
        info!(?stats, "reminder sweep complete");
        stats
    }

    fn sweep_pool(&self, pool_id: &str, stats: &mut SweepStats) -> PoolResult<()> {
        let Some(pool) = self.store.get::<Pool>(collections::POOLS, pool_id)? else {
            return Ok(());
        };
        if pool.is_finished {
            return Ok(());
        }
        let now = self.clock.now_ms();

        // Normalize the lock deadline once. A lock_time we cannot read means
        // skipping the whole pool this sweep rather than acting on garbage.
        let lock_deadline = match &pool.lock_time {
            None => None,
            Some(ts) => match ts.as_millis() {
                Some(ms) => Some(ms),
                None => {
                    warn!(pool_id = %pool.id, "unparseable lock_time, skipping pool this sweep");
                    stats.pools_skipped += 1;
                    return Ok(());
                }
            },
        };

        match pool.pool_type {
            PoolType::Squares => {
                self.payment_reminders(&pool, now, stats)?;
                self.auto_release(&pool, now, stats)?;
                self.lock_countdown(&pool, lock_deadline, now, stats)?;
            }
            PoolType::NflPlayoffs => {
                self.playoff_payment_reminders(&pool, lock_deadline, now, stats)?;
                self.lock_countdown(&pool, lock_deadline, now, stats)?;
            }
            PoolType::Props | PoolType::Bracket => {
                self.lock_countdown(&pool, lock_deadline, now, stats)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payment reminders (squares pools)
    // ------------------------------------------------------------------

    fn payment_reminders(&self, pool: &Pool, now: i64, stats: &mut SweepStats) -> PoolResult<()> {
        if !pool.reminders.payment_reminders_enabled {
            return Ok(());
        }
        let unpaid = pool.unpaid_squares();
        if unpaid.is_empty() {
            return Ok(());
        }
        let interval = pool.reminders.repeat_interval_ms.max(MIN_REPEAT_INTERVAL_MS);
        let bucket = time_bucket(now, interval);
        let unpaid_ids: Vec<u8> = unpaid.iter().map(|s| s.id).collect();

        if let Some(host_email) = pool.owner_email.as_deref() {
            let key = host_payment_key(&pool.id, bucket);
            let claim = self.ledger.try_claim(
                &key,
                json!({ "pool_id": pool.id, "bucket": bucket, "square_ids": unpaid_ids }),
            )?;
            if claim.is_claimed() {
                self.outbox.enqueue(&EmailMessage {
                    to: host_email.to_string(),
                    subject: format!("{}: {} unpaid square(s)", pool.name, unpaid_ids.len()),
                    body: host_summary_body(pool, &unpaid),
                })?;
                let audit = AuditEvent::new(
                    &pool.id,
                    "payment_reminder_host",
                    format!("unpaid summary sent to host ({} squares)", unpaid_ids.len()),
                    "reminders",
                    json!({ "bucket": bucket, "square_ids": unpaid_ids }),
                    now,
                );
                self.store.put(collections::AUDIT, &audit.id, &audit)?;
                stats.host_reminders += 1;
            }
        }

        if pool.reminders.notify_participants {
            let mut by_email: BTreeMap<String, Vec<u8>> = BTreeMap::new();
            for sq in &unpaid {
                let Some(email) = sq.player_details.as_ref().and_then(|d| d.email.as_deref())
                else {
                    continue;
                };
                let email = email.trim().to_lowercase();
                if !email.is_empty() {
                    by_email.entry(email).or_default().push(sq.id);
                }
            }
            let mut notified = Vec::new();
            for (email, square_ids) in by_email {
                let key = user_payment_key(&pool.id, &email, bucket);
                let claim = self.ledger.try_claim(
                    &key,
                    json!({ "pool_id": pool.id, "bucket": bucket, "square_ids": square_ids }),
                )?;
                if claim.is_claimed() {
                    self.outbox.enqueue(&EmailMessage {
                        to: email.clone(),
                        subject: format!("{}: payment reminder", pool.name),
                        body: participant_reminder_body(pool, &square_ids),
                    })?;
                    stats.participant_reminders += 1;
                    notified.push(email);
                }
            }
            if !notified.is_empty() {
                let audit = AuditEvent::new(
                    &pool.id,
                    "payment_reminder_participants",
                    format!("payment reminders sent to {} participant(s)", notified.len()),
                    "reminders",
                    json!({ "bucket": bucket, "emails": notified }),
                    now,
                );
                self.store.put(collections::AUDIT, &audit.id, &audit)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Auto-release (squares pools, pre-lock only)
    // ------------------------------------------------------------------

    fn auto_release(&self, pool: &Pool, now: i64, stats: &mut SweepStats) -> PoolResult<()> {
        let Some(hours) = pool.reminders.auto_release_hours.filter(|h| *h > 0) else {
            return Ok(());
        };
        // A locked grid is final; releasing squares from it would rewrite
        // who wins.
        if !pool.is_open() {
            return Ok(());
        }
        let cutoff = now - hours * MILLIS_PER_HOUR;
        let candidates: Vec<u8> = pool
            .squares
            .iter()
            .filter(|s| s.owner.is_some() && !s.is_paid && s.reserved_at.map_or(false, |t| t < cutoff))
            .map(|s| s.id)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let pool_id = pool.id.clone();
        let released: Vec<u8> = self.store.txn::<_, PoolError, _>(|tx| {
            let Some(mut fresh) = tx.get::<Pool>(collections::POOLS, &pool_id)? else {
                return Ok(Vec::new());
            };
            if !fresh.is_open() {
                return Ok(Vec::new());
            }
            // Re-check against fresh state: a payment may have landed since
            // the scan.
            let released = fresh.release_stale_squares(&candidates, cutoff);
            if released.is_empty() {
                return Ok(released);
            }
            tx.set(collections::POOLS, &pool_id, &fresh)?;
            let audit = AuditEvent::new(
                &pool_id,
                "squares_auto_released",
                format!("released {} stale unpaid square(s)", released.len()),
                "reminders",
                json!({ "square_ids": released, "threshold_hours": hours }),
                now,
            );
            tx.set(collections::AUDIT, &audit.id, &audit)?;
            Ok(released)
        })?;

        if released.is_empty() {
            return Ok(());
        }
        stats.squares_released += released.len();
        info!(pool_id = %pool.id, count = released.len(), "auto-released stale reservations");

        // Waitlist notices are best-effort and happen outside the
        // transaction; a failed enqueue is logged, never retried.
        for entry in &pool.waitlist {
            let msg = EmailMessage {
                to: entry.email.clone(),
                subject: format!("{}: squares just opened up", pool.name),
                body: waitlist_body(pool, released.len()),
            };
            match self.outbox.enqueue(&msg) {
                Ok(()) => stats.waitlist_notices += 1,
                Err(e) => {
                    warn!(pool_id = %pool.id, recipient = %entry.email, error = %e, "waitlist notice failed")
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lock countdown + overdue backstop (all pool types)
    // ------------------------------------------------------------------

    fn lock_countdown(
        &self,
        pool: &Pool,
        lock_deadline: Option<i64>,
        now: i64,
        stats: &mut SweepStats,
    ) -> PoolResult<()> {
        let Some(deadline) = lock_deadline else {
            return Ok(());
        };
        if !pool.is_open() {
            return Ok(());
        }

        if now >= deadline {
            // Deadline already passed while the pool sat open: lock it now
            // instead of waiting for someone to notice.
            let outcome = self.lock_engine.lock_pool(&pool.id, &LockActor::Scheduler)?;
            if outcome.newly_locked() {
                stats.pools_auto_locked += 1;
                info!(pool_id = %pool.id, "auto-locked pool past its deadline");
            }
            return Ok(());
        }

        for &lead in &pool.reminders.lock_lead_minutes {
            if lead <= 0 {
                continue;
            }
            let target = deadline - lead * MILLIS_PER_MIN;
            if (now - target).abs() > LOCK_REMINDER_TOLERANCE_MS {
                continue;
            }
            let key = lock_reminder_key(&pool.id, deadline, lead);
            let claim = self.ledger.try_claim(
                &key,
                json!({ "pool_id": pool.id, "lock_time": deadline, "lead_minutes": lead }),
            )?;
            if !claim.is_claimed() {
                continue;
            }

            let mut recipients: BTreeSet<String> = BTreeSet::new();
            if let Some(host) = pool.owner_email.as_deref() {
                recipients.insert(host.trim().to_lowercase());
            }
            recipients.extend(pool.participant_emails());
            for recipient in &recipients {
                self.outbox.enqueue(&EmailMessage {
                    to: recipient.clone(),
                    subject: format!("{}: locks in {} minutes", pool.name, lead),
                    body: countdown_body(pool, lead),
                })?;
            }
            let audit = AuditEvent::new(
                &pool.id,
                "lock_reminder_sent",
                format!(
                    "lock countdown ({lead}m) sent to {} recipient(s)",
                    recipients.len()
                ),
                "reminders",
                json!({ "lead_minutes": lead, "lock_time": deadline, "recipients": recipients.len() }),
                now,
            );
            self.store.put(collections::AUDIT, &audit.id, &audit)?;
            stats.lock_reminders += 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Playoff entry payment reminders
    // ------------------------------------------------------------------

    fn playoff_payment_reminders(
        &self,
        pool: &Pool,
        lock_deadline: Option<i64>,
        now: i64,
        stats: &mut SweepStats,
    ) -> PoolResult<()> {
        let Some(deadline) = lock_deadline else {
            return Ok(());
        };
        if !pool.is_open() || now >= deadline || deadline - now > PLAYOFF_REMINDER_WINDOW_MS {
            return Ok(());
        }

        // Flag flips commit before any mail goes out: a crash between the
        // two drops reminders instead of duplicating them.
        let pool_id = pool.id.clone();
        let flagged: Vec<(String, String)> = self.store.txn::<_, PoolError, _>(|tx| {
            let Some(mut fresh) = tx.get::<Pool>(collections::POOLS, &pool_id)? else {
                return Ok(Vec::new());
            };
            if !fresh.is_open() {
                return Ok(Vec::new());
            }
            let mut flagged = Vec::new();
            for entry in fresh.entries.values_mut() {
                if entry.is_paid || entry.payment_reminder_sent {
                    continue;
                }
                let Some(email) = entry.email.clone() else {
                    continue;
                };
                entry.payment_reminder_sent = true;
                flagged.push((email, entry.display_name.clone()));
            }
            if flagged.is_empty() {
                return Ok(flagged);
            }
            tx.set(collections::POOLS, &pool_id, &fresh)?;
            let audit = AuditEvent::new(
                &pool_id,
                "playoff_payment_reminders",
                format!("flagged {} unpaid entries for reminder", flagged.len()),
                "reminders",
                json!({ "entries": flagged.iter().map(|(_, name)| name.as_str()).collect::<Vec<_>>() }),
                now,
            );
            tx.set(collections::AUDIT, &audit.id, &audit)?;
            Ok(flagged)
        })?;

        for (email, display_name) in &flagged {
            self.outbox.enqueue(&EmailMessage {
                to: email.clone(),
                subject: format!("{}: entry payment due before lock", pool.name),
                body: playoff_body(pool, display_name),
            })?;
            stats.playoff_reminders += 1;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Message bodies
// ----------------------------------------------------------------------------

fn host_summary_body(pool: &Pool, unpaid: &[&Square]) -> String {
    let mut body = format!("Unpaid reservations in {}:\n", pool.name);
    for sq in unpaid {
        let owner = sq.owner.as_deref().unwrap_or("(unknown)");
        body.push_str(&format!("  square {:>2} - {}\n", sq.id, owner));
    }
    body
}

fn participant_reminder_body(pool: &Pool, square_ids: &[u8]) -> String {
    format!(
        "Your square(s) {:?} in {} are reserved but not yet paid for.",
        square_ids, pool.name
    )
}

fn waitlist_body(pool: &Pool, count: usize) -> String {
    format!(
        "{} square(s) just opened up in {}. First come, first served.",
        count, pool.name
    )
}

fn countdown_body(pool: &Pool, lead_minutes: i64) -> String {
    format!(
        "{} locks in about {} minutes. Picks and payments close at lock.",
        pool.name, lead_minutes
    )
}

fn playoff_body(pool: &Pool, display_name: &str) -> String {
    format!(
        "{}, your entry in {} is still unpaid. The pool locks soon.",
        display_name, pool.name
    )
}
