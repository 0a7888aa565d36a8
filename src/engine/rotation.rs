//! Quarterly Digit Rotation
//!
//! Polls the score feed for every live game that has locked quarterly pools
//! attached and reveals the digit sets whose quarter boundary has passed.
//! Reveals are insert-only: a set that exists is never regenerated, so a
//! feed that re-reports an earlier period cannot reshuffle anything.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::digits::{axis_commit_digest, DigitShuffler};
use crate::error::PoolResult;
use crate::models::{AuditEvent, Pool};
use crate::scores::{GameScore, GameStatus, ScoreSource};
use crate::store::{collections, DocStore, StoreError};

#[derive(Debug, Default)]
pub struct RotationSummary {
    pub pools_considered: usize,
    pub games_polled: usize,
    pub sets_revealed: usize,
    pub feed_failures: usize,
    pub pool_failures: usize,
}

#[derive(Clone)]
pub struct RotationEngine {
    store: DocStore,
    clock: Clock,
    digits: Arc<DigitShuffler>,
    scores: Arc<dyn ScoreSource>,
}

impl RotationEngine {
    pub fn new(
        store: DocStore,
        clock: Clock,
        digits: Arc<DigitShuffler>,
        scores: Arc<dyn ScoreSource>,
    ) -> Self {
        Self {
            store,
            clock,
            digits,
            scores,
        }
    }

    /// One rotation cycle: group candidate pools by game, fetch each game
    /// once, reveal what is due. Feed and per-pool failures are logged and
    /// skipped; the next cycle retries naturally.
    pub async fn run_once(&self) -> Result<RotationSummary, StoreError> {
        let mut summary = RotationSummary::default();

        let mut by_game: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pool_id in self.store.list_ids(collections::POOLS)? {
            let pool = match self.store.get::<Pool>(collections::POOLS, &pool_id) {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pool_id = %pool_id, error = %e, "skipping unreadable pool");
                    summary.pool_failures += 1;
                    continue;
                }
            };
            let rotates = pool.pool_type.has_grid()
                && pool.is_locked
                && pool.uses_quarterly_numbers
                && !pool.is_finished;
            if !rotates {
                continue;
            }
            let Some(game_id) = pool.game_id else { continue };
            by_game.entry(game_id).or_default().push(pool_id);
            summary.pools_considered += 1;
        }

        for (game_id, pool_ids) in by_game {
            let score = match self.scores.game_status(&game_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(game_id = %game_id, error = %e, "score feed unavailable, retrying next cycle");
                    summary.feed_failures += 1;
                    continue;
                }
            };
            summary.games_polled += 1;
            let due = periods_due(&score);
            debug!(game_id = %game_id, period = score.period, due = ?due, "rotation check");

            for pool_id in pool_ids {
                match self.reveal_due_periods(&pool_id, &due) {
                    Ok(n) => summary.sets_revealed += n,
                    Err(e) => {
                        warn!(pool_id = %pool_id, error = %e, "digit reveal failed");
                        summary.pool_failures += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    fn reveal_due_periods(&self, pool_id: &str, due: &[&'static str]) -> PoolResult<usize> {
        self.store.txn(|tx| {
            let Some(mut pool) = tx.get::<Pool>(collections::POOLS, pool_id)? else {
                return Ok(0);
            };
            if !pool.is_locked || pool.is_finished {
                return Ok(0);
            }

            let mut revealed: Vec<(&str, String)> = Vec::new();
            for &period in due {
                if !pool.quarterly_numbers.contains_key(period) {
                    let axis = self.digits.draw_pair();
                    pool.quarterly_numbers.insert(period.to_string(), axis);
                    revealed.push((period, axis_commit_digest(pool_id, period, &axis)));
                }
            }

            let current = pool.most_advanced_period();
            if revealed.is_empty() && pool.current_period == current {
                return Ok(0);
            }
            pool.current_period = current;
            tx.set(collections::POOLS, pool_id, &pool)?;

            if !revealed.is_empty() {
                let periods: Vec<&str> = revealed.iter().map(|(p, _)| *p).collect();
                let digests: Vec<&str> = revealed.iter().map(|(_, d)| d.as_str()).collect();
                let audit = AuditEvent::new(
                    pool_id,
                    "quarter_digits_revealed",
                    format!("revealed digit sets: {}", periods.join(", ")),
                    "rotation",
                    json!({ "periods": periods, "digests": digests }),
                    self.clock.now_ms(),
                );
                tx.set(collections::AUDIT, &audit.id, &audit)?;
            }
            Ok(revealed.len())
        })
    }
}

/// Which quarter digit sets should exist given the feed's view of the game.
/// A quarter is due once its preceding boundary has passed; Q1 is always
/// due for a locked pool (self-healing if lock-time seeding was missed).
pub(crate) fn periods_due(score: &GameScore) -> Vec<&'static str> {
    let effective: u8 = match score.status {
        GameStatus::Final => 5,
        GameStatus::Halftime => 3,
        GameStatus::InProgress | GameStatus::Scheduled => score.period,
    };
    let mut due = vec!["Q1"];
    if effective >= 2 {
        due.push("Q2");
    }
    if effective >= 3 {
        due.push("Q3");
    }
    if effective >= 4 {
        due.push("Q4");
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PoolType;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StubScores {
        // None simulates a feed outage
        score: Mutex<Option<GameScore>>,
    }

    impl StubScores {
        fn reporting(status: GameStatus, period: u8) -> Arc<Self> {
            Arc::new(Self {
                score: Mutex::new(Some(GameScore {
                    game_id: "g1".to_string(),
                    status,
                    period,
                    home_points: 0,
                    away_points: 0,
                })),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                score: Mutex::new(None),
            })
        }

        fn set(&self, status: GameStatus, period: u8) {
            *self.score.lock() = Some(GameScore {
                game_id: "g1".to_string(),
                status,
                period,
                home_points: 0,
                away_points: 0,
            });
        }
    }

    #[async_trait]
    impl ScoreSource for StubScores {
        async fn game_status(&self, _game_id: &str) -> Result<GameScore> {
            match self.score.lock().clone() {
                Some(s) => Ok(s),
                None => anyhow::bail!("feed down"),
            }
        }

        async fn round_winners(&self, _season: &str) -> Result<BTreeMap<String, Vec<String>>> {
            Ok(BTreeMap::new())
        }
    }

    fn setup(scores: Arc<dyn ScoreSource>) -> (tempfile::NamedTempFile, DocStore, RotationEngine) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = DocStore::open(file.path().to_str().unwrap()).unwrap();
        let engine = RotationEngine::new(
            store.clone(),
            Clock::fixed(1_700_000_000_000),
            Arc::new(DigitShuffler::seeded(99)),
            scores,
        );
        (file, store, engine)
    }

    fn seed_locked_pool(store: &DocStore, id: &str, digits: &DigitShuffler) -> Pool {
        let mut pool = Pool::new(id, "Squares", "host-uid", PoolType::Squares, 0);
        pool.uses_quarterly_numbers = true;
        pool.game_id = Some("g1".to_string());
        pool.is_locked = true;
        let axis = digits.draw_pair();
        pool.axis_numbers = Some(axis);
        pool.quarterly_numbers.insert("Q1".to_string(), axis);
        pool.current_period = Some("Q1".to_string());
        store.put(collections::POOLS, id, &pool).unwrap();
        pool
    }

    #[test]
    fn due_periods_follow_the_game_lifecycle() {
        let score = |status, period| GameScore {
            game_id: "g".to_string(),
            status,
            period,
            home_points: 0,
            away_points: 0,
        };
        assert_eq!(periods_due(&score(GameStatus::Scheduled, 0)), vec!["Q1"]);
        assert_eq!(periods_due(&score(GameStatus::InProgress, 1)), vec!["Q1"]);
        assert_eq!(
            periods_due(&score(GameStatus::InProgress, 2)),
            vec!["Q1", "Q2"]
        );
        assert_eq!(
            periods_due(&score(GameStatus::Halftime, 2)),
            vec!["Q1", "Q2", "Q3"]
        );
        assert_eq!(
            periods_due(&score(GameStatus::InProgress, 4)),
            vec!["Q1", "Q2", "Q3", "Q4"]
        );
        assert_eq!(
            periods_due(&score(GameStatus::Final, 4)),
            vec!["Q1", "Q2", "Q3", "Q4"]
        );
    }

    #[tokio::test]
    async fn reveals_follow_the_feed_and_are_idempotent() {
        let feed = StubScores::reporting(GameStatus::InProgress, 2);
        let (_f, store, engine) = setup(feed.clone());
        let seeder = DigitShuffler::seeded(1);
        seed_locked_pool(&store, "p1", &seeder);

        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.pools_considered, 1);
        assert_eq!(summary.games_polled, 1);
        assert_eq!(summary.sets_revealed, 1); // Q2

        let pool: Pool = store.get(collections::POOLS, "p1").unwrap().unwrap();
        assert!(pool.quarterly_numbers.contains_key("Q2"));
        assert!(pool.quarterly_numbers["Q2"].is_permutation());
        assert_eq!(pool.current_period.as_deref(), Some("Q2"));

        // same feed state again: nothing new
        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.sets_revealed, 0);

        // halftime unlocks Q3
        feed.set(GameStatus::Halftime, 2);
        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.sets_revealed, 1);
        let pool: Pool = store.get(collections::POOLS, "p1").unwrap().unwrap();
        assert_eq!(pool.current_period.as_deref(), Some("Q3"));

        // final unlocks the rest
        feed.set(GameStatus::Final, 4);
        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.sets_revealed, 1);
        let pool: Pool = store.get(collections::POOLS, "p1").unwrap().unwrap();
        assert_eq!(pool.quarterly_numbers.len(), 4);
        assert_eq!(pool.current_period.as_deref(), Some("Q4"));
    }

    #[tokio::test]
    async fn existing_sets_survive_a_reveal() {
        let feed = StubScores::reporting(GameStatus::Final, 4);
        let (_f, store, engine) = setup(feed);
        let seeder = DigitShuffler::seeded(2);
        let mut pool = seed_locked_pool(&store, "p1", &seeder);

        // Q2 was already revealed earlier
        let q2 = seeder.draw_pair();
        pool.quarterly_numbers.insert("Q2".to_string(), q2);
        store.put(collections::POOLS, "p1", &pool).unwrap();

        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.sets_revealed, 2); // Q3, Q4 only

        let after: Pool = store.get(collections::POOLS, "p1").unwrap().unwrap();
        assert_eq!(after.quarterly_numbers["Q2"], q2);
        assert_eq!(after.quarterly_numbers["Q1"], pool.quarterly_numbers["Q1"]);
    }

    #[tokio::test]
    async fn feed_outage_skips_the_cycle_without_mutation() {
        let (_f, store, engine) = setup(StubScores::down());
        let seeder = DigitShuffler::seeded(3);
        seed_locked_pool(&store, "p1", &seeder);

        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.feed_failures, 1);
        assert_eq!(summary.sets_revealed, 0);

        let pool: Pool = store.get(collections::POOLS, "p1").unwrap().unwrap();
        assert_eq!(pool.quarterly_numbers.len(), 1);
        assert_eq!(pool.current_period.as_deref(), Some("Q1"));
    }

    #[tokio::test]
    async fn only_locked_quarterly_unfinished_pools_rotate() {
        let feed = StubScores::reporting(GameStatus::Final, 4);
        let (_f, store, engine) = setup(feed);
        let seeder = DigitShuffler::seeded(4);

        // open pool: not considered
        let mut open = Pool::new("open", "Open", "u", PoolType::Squares, 0);
        open.uses_quarterly_numbers = true;
        open.game_id = Some("g1".to_string());
        store.put(collections::POOLS, "open", &open).unwrap();

        // finished pool: not considered
        let mut done = seed_locked_pool(&store, "done", &seeder);
        done.is_finished = true;
        store.put(collections::POOLS, "done", &done).unwrap();

        // single-set pool: not considered
        let mut single = Pool::new("single", "Single", "u", PoolType::Squares, 0);
        single.is_locked = true;
        single.game_id = Some("g1".to_string());
        store.put(collections::POOLS, "single", &single).unwrap();

        seed_locked_pool(&store, "live", &seeder);

        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.pools_considered, 1);
        assert_eq!(summary.sets_revealed, 3);

        let open: Pool = store.get(collections::POOLS, "open").unwrap().unwrap();
        assert!(open.quarterly_numbers.is_empty());
    }

    #[tokio::test]
    async fn unreadable_pool_documents_do_not_poison_the_cycle() {
        let feed = StubScores::reporting(GameStatus::InProgress, 2);
        let (_f, store, engine) = setup(feed);
        let seeder = DigitShuffler::seeded(5);
        seed_locked_pool(&store, "p1", &seeder);
        store
            .put(collections::POOLS, "corrupt", &serde_json::json!({"id": 5}))
            .unwrap();

        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.pool_failures, 1);
        assert_eq!(summary.sets_revealed, 1);
    }

    #[tokio::test]
    async fn audit_trail_carries_digests_for_each_reveal() {
        let feed = StubScores::reporting(GameStatus::Final, 4);
        let (_f, store, engine) = setup(feed);
        let seeder = DigitShuffler::seeded(6);
        seed_locked_pool(&store, "p1", &seeder);

        engine.run_once().await.unwrap();

        let reveal = store
            .audit_events_for("p1")
            .unwrap()
            .into_iter()
            .find(|a| a.event_type == "quarter_digits_revealed")
            .unwrap();
        assert_eq!(
            reveal.payload["periods"],
            serde_json::json!(["Q2", "Q3", "Q4"])
        );
        assert_eq!(reveal.payload["digests"].as_array().unwrap().len(), 3);

        let pool: Pool = store.get(collections::POOLS, "p1").unwrap().unwrap();
        for (i, period) in ["Q2", "Q3", "Q4"].iter().enumerate() {
            let expected = axis_commit_digest("p1", period, &pool.quarterly_numbers[*period]);
            assert_eq!(reveal.payload["digests"][i], expected);
        }
    }
}
