//! Square Claim Engine
//!
//! All grid mutations funnel through one transactional path: read the pool,
//! check every requested square, apply the claim, append the audit event.
//! Two people racing for the same square can never both win; the losing
//! transaction reruns against the committed grid and sees the square taken.

use serde::Serialize;
use serde_json::json;

use crate::clock::Clock;
use crate::error::{PoolError, PoolResult};
use crate::models::{AuditEvent, PlayerDetails, Pool, GRID_SIZE};
use crate::store::{collections, DocStore};

#[derive(Debug, Clone, Serialize)]
pub struct ClaimReceipt {
    pub pool_id: String,
    /// Squares newly assigned by this call.
    pub claimed: Vec<u8>,
    /// Requested squares that already belonged to this claimant; retries
    /// land here instead of failing.
    pub already_owned: Vec<u8>,
}

#[derive(Clone)]
pub struct ClaimEngine {
    store: DocStore,
    clock: Clock,
}

impl ClaimEngine {
    pub fn new(store: DocStore, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Claims `square_ids` for `claimant`. `caller_uid` is the verified
    /// identity of the requester, if any; the pool owner may claim on a
    /// locked pool and bypass the per-player cap.
    pub fn claim_squares(
        &self,
        pool_id: &str,
        square_ids: &[u8],
        claimant: &str,
        details: &PlayerDetails,
        caller_uid: Option<&str>,
    ) -> PoolResult<ClaimReceipt> {
        let claimant = claimant.trim();
        if claimant.is_empty() {
            return Err(PoolError::InvalidArgument(
                "claimant name must not be empty".to_string(),
            ));
        }
        if square_ids.is_empty() {
            return Err(PoolError::InvalidArgument(
                "no squares requested".to_string(),
            ));
        }
        let mut requested = square_ids.to_vec();
        requested.sort_unstable();
        requested.dedup();
        if let Some(&bad) = requested.iter().find(|&&id| id as usize >= GRID_SIZE) {
            return Err(PoolError::InvalidArgument(format!(
                "square id {bad} out of range (0..={})",
                GRID_SIZE - 1
            )));
        }

        self.store.txn(|tx| {
            let mut pool: Pool = tx
                .get(collections::POOLS, pool_id)?
                .ok_or_else(|| PoolError::NotFound(format!("pool {pool_id}")))?;

            if !pool.pool_type.has_grid() {
                return Err(PoolError::FailedPrecondition(format!(
                    "pool {pool_id} has no squares grid"
                )));
            }
            let owner_override = caller_uid == Some(pool.owner_uid.as_str());
            if !pool.is_open() && !owner_override {
                return Err(PoolError::FailedPrecondition(format!(
                    "pool {pool_id} is locked"
                )));
            }

            let mut to_claim = Vec::new();
            let mut already_owned = Vec::new();
            for &id in &requested {
                let square = pool.squares.get(id as usize).ok_or_else(|| {
                    PoolError::FailedPrecondition(format!("pool {pool_id} grid is malformed"))
                })?;
                match square.owner.as_deref() {
                    None => to_claim.push(id),
                    Some(owner) if owner == claimant => already_owned.push(id),
                    Some(owner) => {
                        return Err(PoolError::AlreadyExists(format!(
                            "square {id} already claimed by {owner}"
                        )));
                    }
                }
            }

            if !owner_override {
                if let Some(cap) = pool.max_squares_per_player {
                    let owned = pool.squares_owned_by(claimant);
                    if owned + to_claim.len() > cap as usize {
                        return Err(PoolError::ResourceExhausted(format!(
                            "claim would give {claimant} {} squares, cap is {cap}",
                            owned + to_claim.len()
                        )));
                    }
                }
            }

            if to_claim.is_empty() {
                // Pure retry: everything requested is already this
                // claimant's. No write, no audit.
                return Ok(ClaimReceipt {
                    pool_id: pool_id.to_string(),
                    claimed: Vec::new(),
                    already_owned: already_owned.clone(),
                });
            }

            let now = self.clock.now_ms();
            for &id in &to_claim {
                if let Some(square) = pool.squares.get_mut(id as usize) {
                    square.owner = Some(claimant.to_string());
                    square.player_details = Some(details.clone());
                    square.is_paid = false;
                    square.reserved_at = Some(now);
                    square.reserved_by_uid = caller_uid.map(str::to_string);
                    square.payment_confirmed_at = None;
                }
            }
            tx.set(collections::POOLS, pool_id, &pool)?;

            let audit = AuditEvent::new(
                pool_id,
                "squares_claimed",
                format!("{claimant} claimed {} square(s)", to_claim.len()),
                caller_uid.unwrap_or(claimant),
                json!({ "square_ids": to_claim, "claimant": claimant }),
                now,
            );
            tx.set(collections::AUDIT, &audit.id, &audit)?;

            Ok(ClaimReceipt {
                pool_id: pool_id.to_string(),
                claimed: to_claim,
                already_owned,
            })
        })
    }
}
