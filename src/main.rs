//! Gridpool Backend - squares & playoff pool engine
//!
//! Wires the document store, the five engines, the scheduler loops, and the
//! HTTP surface. All pool semantics live in the library; this binary is just
//! configuration and plumbing.

use std::path::{Path, PathBuf};
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridpool_backend::{
    api::{create_router, AppState},
    clock::Clock,
    digits::DigitShuffler,
    engine::{
        ClaimEngine, LockEngine, PropagationEngine, ReminderEngine, ResultsUpdate, RotationEngine,
    },
    ledger::EventLedger,
    models::Config,
    outbox::Outbox,
    scores::{ScoreSource, SportsFeedClient},
    store::DocStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment and logging
    load_env();
    init_tracing();

    info!("🏈 Gridpool Backend Starting");

    let config = Config::from_env();

    // IMPORTANT: Default to the crate directory so running from elsewhere
    // doesn't accidentally create a new empty DB in a different working
    // directory.
    let db_path = resolve_data_path(Some(config.db_path.clone()), "gridpool.db");
    let store = DocStore::open(&db_path)?;
    info!("📊 Document store initialized at: {}", db_path);

    let clock = Clock::system();
    let ledger = EventLedger::new(store.clone(), clock.clone());
    let outbox = Outbox::attach(&store, clock.clone())?;
    info!("📬 Notification outbox attached ({} queued)", outbox.queued_count()?);

    let digits = match config.digit_seed {
        Some(seed) => {
            warn!("🎲 Digit shuffler seeded with {} - staging use only", seed);
            Arc::new(DigitShuffler::seeded(seed))
        }
        None => Arc::new(DigitShuffler::from_entropy()),
    };

    let claim = ClaimEngine::new(store.clone(), clock.clone());
    let lock = LockEngine::new(store.clone(), clock.clone(), digits.clone());
    let reminders = ReminderEngine::new(
        store.clone(),
        ledger.clone(),
        outbox.clone(),
        lock.clone(),
        clock.clone(),
    );
    let propagation = PropagationEngine::new(store.clone(), ledger, outbox, clock.clone());

    // The score feed is optional. Without it the rotation and results polls
    // stay off; manual result pushes and everything else still work.
    let score_feed: Option<Arc<dyn ScoreSource>> = if config.score_feed_url.trim().is_empty() {
        warn!("SCORE_FEED_URL not set; digit rotation and results polling disabled");
        None
    } else {
        match SportsFeedClient::new(&config.score_feed_url, config.score_feed_api_key.as_deref()) {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                warn!("Failed to initialize score feed client: {e}");
                None
            }
        }
    };

    tokio::spawn(reminder_sweep_polling(reminders, config.reminder_sweep_secs));

    if let Some(feed) = score_feed {
        let rotation =
            RotationEngine::new(store.clone(), clock.clone(), digits.clone(), feed.clone());
        tokio::spawn(rotation_polling(rotation, config.rotation_poll_secs));
        tokio::spawn(results_polling(
            propagation.clone(),
            feed,
            config.season.clone(),
            config.results_poll_secs,
        ));
    }

    let state = AppState {
        store,
        claim,
        lock,
        propagation,
        clock,
        season: config.season.clone(),
        results_push_token: config.results_push_token.clone(),
    };
    let app = create_router(state).layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

async fn reminder_sweep_polling(engine: ReminderEngine, poll_secs: u64) -> Result<()> {
    let poll_secs = poll_secs.max(1);
    info!("⏰ Reminder sweep every {}s", poll_secs);

    let mut ticker = interval(Duration::from_secs(poll_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let stats = engine.run_sweep();
        if stats.failures > 0 {
            warn!(
                "reminder sweep finished with {} pool failure(s)",
                stats.failures
            );
        }
    }
}

async fn rotation_polling(engine: RotationEngine, poll_secs: u64) -> Result<()> {
    let poll_secs = poll_secs.max(1);
    info!("🔄 Digit rotation poll every {}s", poll_secs);

    let mut ticker = interval(Duration::from_secs(poll_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match engine.run_once().await {
            Ok(summary) if summary.sets_revealed > 0 => {
                info!(
                    "🔄 Rotation revealed {} digit set(s) across {} pool(s)",
                    summary.sets_revealed, summary.pools_considered
                );
            }
            Ok(summary) => {
                if summary.feed_failures > 0 || summary.pool_failures > 0 {
                    warn!(
                        "rotation poll: {} feed / {} pool failure(s)",
                        summary.feed_failures, summary.pool_failures
                    );
                }
            }
            Err(e) => warn!("rotation poll failed: {}", e),
        }
    }
}

async fn results_polling(
    propagation: PropagationEngine,
    feed: Arc<dyn ScoreSource>,
    season: String,
    poll_secs: u64,
) -> Result<()> {
    let poll_secs = poll_secs.max(1);
    info!("🏆 Playoff results poll every {}s", poll_secs);

    let mut ticker = interval(Duration::from_secs(poll_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let rounds = match feed.round_winners(&season).await {
            Ok(r) => r,
            Err(e) => {
                warn!("results poll failed: {}", e);
                continue;
            }
        };
        if rounds.is_empty() {
            continue;
        }

        let update = ResultsUpdate {
            rounds,
            multipliers: None,
        };
        match propagation.publish_results(&season, &update, "score-feed") {
            Ok(summary) if summary.changed => {
                info!(
                    "🏆 Applied {} new result unit(s) across {} pool(s)",
                    summary.added_units.len(),
                    summary.pools_updated
                );
            }
            Ok(_) => {}
            Err(e) => warn!("results propagation failed: {}", e),
        }
    }
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridpool_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    // Treat relative paths as relative to the crate dir, not the caller's cwd.
    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try repo-root .env (common when running with --manifest-path
    // from elsewhere). CARGO_MANIFEST_DIR points at the crate at compile time.
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));

    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];

    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
