//! Lock Engine
//!
//! The single open -> locked transition, shared by the manual endpoint and
//! the scheduler backstop. Grid pools draw their axis digits inside the
//! same transaction that flips the flag, so no observer can ever see a
//! locked pool without digits or digits on an open pool.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::clock::Clock;
use crate::digits::{axis_commit_digest, DigitShuffler};
use crate::error::{PoolError, PoolResult};
use crate::models::{AuditEvent, AxisNumbers, Pool, PoolStatus};
use crate::store::{collections, DocStore};

/// Digest label for pools with a single digit set for the whole game.
const FULL_GAME_PERIOD: &str = "game";

#[derive(Debug, Clone)]
pub enum LockActor {
    /// A signed-in caller; must match the pool's owner.
    Owner { uid: String },
    /// The reminder sweep locking a pool past its deadline.
    Scheduler,
}

impl LockActor {
    fn audit_name(&self) -> &str {
        match self {
            LockActor::Owner { uid } => uid,
            LockActor::Scheduler => "scheduler",
        }
    }

    fn trigger(&self) -> &'static str {
        match self {
            LockActor::Owner { .. } => "manual",
            LockActor::Scheduler => "scheduled",
        }
    }
}

#[derive(Debug, Clone)]
pub enum LockOutcome {
    Locked { axis: Option<AxisNumbers> },
    /// The pool was locked before this call; nothing was changed.
    AlreadyLocked,
}

impl LockOutcome {
    pub fn newly_locked(&self) -> bool {
        matches!(self, LockOutcome::Locked { .. })
    }

    pub fn axis(&self) -> Option<AxisNumbers> {
        match self {
            LockOutcome::Locked { axis } => *axis,
            LockOutcome::AlreadyLocked => None,
        }
    }
}

#[derive(Clone)]
pub struct LockEngine {
    store: DocStore,
    clock: Clock,
    digits: Arc<DigitShuffler>,
}

impl LockEngine {
    pub fn new(store: DocStore, clock: Clock, digits: Arc<DigitShuffler>) -> Self {
        Self {
            store,
            clock,
            digits,
        }
    }

    pub fn lock_pool(&self, pool_id: &str, actor: &LockActor) -> PoolResult<LockOutcome> {
        let outcome = self.store.txn(|tx| {
            let mut pool: Pool = tx
                .get(collections::POOLS, pool_id)?
                .ok_or_else(|| PoolError::NotFound(format!("pool {pool_id}")))?;

            if let LockActor::Owner { uid } = actor {
                if *uid != pool.owner_uid {
                    return Err(PoolError::PermissionDenied(format!(
                        "only the pool owner may lock {pool_id}"
                    )));
                }
            }
            if !pool.is_open() {
                return Ok(LockOutcome::AlreadyLocked);
            }

            let now = self.clock.now_ms();
            let axis = if pool.pool_type.has_grid() {
                // Draws happen inside the transaction closure: a conflict
                // rerun simply draws again, and only the committed set is
                // ever visible.
                let axis = self.digits.draw_pair();
                pool.axis_numbers = Some(axis);
                pool.is_locked = true;
                pool.locked_at = Some(now);

                let digest_period = if pool.uses_quarterly_numbers {
                    pool.quarterly_numbers.insert("Q1".to_string(), axis);
                    pool.current_period = Some("Q1".to_string());
                    "Q1"
                } else {
                    FULL_GAME_PERIOD
                };
                let digest = axis_commit_digest(pool_id, digest_period, &axis);
                let commit = AuditEvent::new(
                    pool_id,
                    "axis_digits_committed",
                    format!("axis digits committed for {digest_period}"),
                    actor.audit_name(),
                    json!({ "period": digest_period, "digest": digest }),
                    now,
                );
                tx.set(collections::AUDIT, &commit.id, &commit)?;
                Some(axis)
            } else {
                pool.status = PoolStatus::Locked;
                pool.locked_at = Some(now);
                None
            };

            tx.set(collections::POOLS, pool_id, &pool)?;

            let transition = AuditEvent::new(
                pool_id,
                "pool_locked",
                "pool locked".to_string(),
                actor.audit_name(),
                json!({ "trigger": actor.trigger() }),
                now,
            );
            tx.set(collections::AUDIT, &transition.id, &transition)?;

            Ok(LockOutcome::Locked { axis })
        })?;

        if outcome.newly_locked() {
            info!(
                pool_id = %pool_id,
                actor = actor.audit_name(),
                trigger = actor.trigger(),
                "pool locked"
            );
        }
        Ok(outcome)
    }
}
