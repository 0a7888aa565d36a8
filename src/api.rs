//! HTTP Surface
//!
//! JSON handlers over the engines. Callers arrive with an already-verified
//! uid in the `x-caller-uid` header; the results push is guarded by a static
//! bearer token instead. Error kinds map onto HTTP statuses in `error.rs`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::{ClaimEngine, LockActor, LockEngine, PropagationEngine, ResultsUpdate};
use crate::error::{PoolError, PoolResult};
use crate::models::{
    AuditEvent, AxisNumbers, PlayerDetails, Pool, PoolType, ReminderSettings, Ts,
};
use crate::store::{collections, DocStore};

const CALLER_HEADER: &str = "x-caller-uid";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: DocStore,
    pub claim: ClaimEngine,
    pub lock: LockEngine,
    pub propagation: PropagationEngine,
    pub clock: Clock,
    pub season: String,
    pub results_push_token: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/pools", post(create_pool))
        .route("/api/pools/:id", get(get_pool))
        .route("/api/pools/:id/claim", post(claim_squares))
        .route("/api/pools/:id/lock", post(lock_pool))
        .route("/api/pools/:id/audit", get(get_audit_log))
        .route("/api/results", post(publish_results))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_pool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePoolRequest>,
) -> Result<(StatusCode, Json<Pool>), PoolError> {
    let owner_uid = require_caller(&headers)?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(PoolError::InvalidArgument(
            "pool name must not be empty".to_string(),
        ));
    }

    let id = body
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = state.clock.now_ms();

    let mut pool = Pool::new(&id, name, &owner_uid, body.pool_type, now);
    pool.owner_email = body
        .owner_email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty());
    pool.uses_quarterly_numbers = body.uses_quarterly_numbers && body.pool_type.has_grid();
    pool.lock_time = body.lock_time;
    pool.game_id = body.game_id.filter(|g| !g.trim().is_empty());
    pool.max_squares_per_player = body.max_squares_per_player;
    if let Some(reminders) = body.reminders {
        pool.reminders = reminders;
    }

    let created = state.store.txn(|tx| {
        if tx.exists(collections::POOLS, &id)? {
            return Err(PoolError::AlreadyExists(format!("pool {id}")));
        }
        tx.set(collections::POOLS, &id, &pool)?;
        let audit = AuditEvent::new(
            &id,
            "pool_created",
            format!("pool {} created", pool.name),
            &owner_uid,
            json!({ "pool_type": pool.pool_type.as_str() }),
            now,
        );
        tx.set(collections::AUDIT, &audit.id, &audit)?;
        Ok(pool.clone())
    })?;

    info!(pool_id = %created.id, pool_type = created.pool_type.as_str(), "pool created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Pool>, PoolError> {
    state
        .store
        .get::<Pool>(collections::POOLS, &id)?
        .map(Json)
        .ok_or_else(|| PoolError::NotFound(format!("pool {id}")))
}

async fn claim_squares(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, PoolError> {
    let caller = caller_uid(&headers);
    let details = body.player_details.unwrap_or_default();
    let receipt = state.claim.claim_squares(
        &id,
        &body.square_ids,
        &body.claimant,
        &details,
        caller.as_deref(),
    )?;
    Ok(Json(ClaimResponse {
        pool_id: receipt.pool_id,
        claimed: receipt.claimed,
        already_owned: receipt.already_owned,
        timestamp: state.clock.now_rfc3339(),
    }))
}

async fn lock_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LockResponse>, PoolError> {
    let uid = require_caller(&headers)?;
    let outcome = state.lock.lock_pool(&id, &LockActor::Owner { uid })?;
    Ok(Json(LockResponse {
        pool_id: id,
        newly_locked: outcome.newly_locked(),
        axis_numbers: outcome.axis(),
        timestamp: state.clock.now_rfc3339(),
    }))
}

async fn get_audit_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditEvent>>, PoolError> {
    if state.store.get::<Pool>(collections::POOLS, &id)?.is_none() {
        return Err(PoolError::NotFound(format!("pool {id}")));
    }
    Ok(Json(state.store.audit_events_for(&id)?))
}

async fn publish_results(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<ResultsUpdate>,
) -> Result<Json<ResultsResponse>, PoolError> {
    authorize_results_push(&state, &headers)?;
    let summary = state
        .propagation
        .publish_results(&state.season, &update, "results-push")?;
    Ok(Json(ResultsResponse {
        season: state.season.clone(),
        changed: summary.changed,
        pools_updated: summary.pools_updated,
        entries_rescored: summary.entries_rescored,
        timestamp: state.clock.now_rfc3339(),
    }))
}

// ===== Caller identification =====

fn caller_uid(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_caller(headers: &HeaderMap) -> PoolResult<String> {
    caller_uid(headers)
        .ok_or_else(|| PoolError::PermissionDenied(format!("missing {CALLER_HEADER} header")))
}

fn authorize_results_push(state: &AppState, headers: &HeaderMap) -> PoolResult<()> {
    let Some(expected) = state.results_push_token.as_deref() else {
        return Err(PoolError::PermissionDenied(
            "results push disabled: no token configured".to_string(),
        ));
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if presented != expected {
        return Err(PoolError::PermissionDenied(
            "invalid results push token".to_string(),
        ));
    }
    Ok(())
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Deserialize)]
struct CreatePoolRequest {
    name: String,
    pool_type: PoolType,
    /// Client-supplied id; omitted means the server generates one.
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    owner_email: Option<String>,
    #[serde(default)]
    uses_quarterly_numbers: bool,
    #[serde(default)]
    lock_time: Option<Ts>,
    #[serde(default)]
    game_id: Option<String>,
    #[serde(default)]
    max_squares_per_player: Option<u32>,
    #[serde(default)]
    reminders: Option<ReminderSettings>,
}

#[derive(Deserialize)]
struct ClaimRequest {
    square_ids: Vec<u8>,
    claimant: String,
    #[serde(default)]
    player_details: Option<PlayerDetails>,
}

#[derive(Serialize)]
struct ClaimResponse {
    pool_id: String,
    claimed: Vec<u8>,
    already_owned: Vec<u8>,
    timestamp: String,
}

#[derive(Serialize)]
struct LockResponse {
    pool_id: String,
    newly_locked: bool,
    axis_numbers: Option<AxisNumbers>,
    timestamp: String,
}

#[derive(Serialize)]
struct ResultsResponse {
    season: String,
    changed: bool,
    pools_updated: usize,
    entries_rescored: usize,
    timestamp: String,
}
