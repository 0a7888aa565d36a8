//! Results Propagation
//!
//! Playoff results arrive as a season-level push: round -> units that
//! advanced, with optional per-round multiplier overrides. The push is
//! merged insert-only into the single season results document, then every
//! playoff pool is rescored against that document re-read in the same
//! version-validated transaction that rewrites the pools, so concurrent
//! pushes always leave the fleet on the freshest union. Re-pushing the
//! same results is a no-op end to end.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{PoolError, PoolResult};
use crate::ledger::{results_notice_key, EventLedger};
use crate::models::{AuditEvent, Entry, GlobalResults, Pool, PoolType, DEFAULT_ROUND_MULTIPLIERS};
use crate::outbox::{EmailMessage, Outbox};
use crate::store::{collections, DocStore};

/// One incoming results push.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsUpdate {
    /// Round key -> units that advanced in that round.
    #[serde(default)]
    pub rounds: BTreeMap<String, Vec<String>>,
    /// Optional multiplier overrides, also how a non-standard round key is
    /// introduced.
    #[serde(default)]
    pub multipliers: Option<BTreeMap<String, u32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropagationSummary {
    /// False when the push matched the stored results exactly.
    pub changed: bool,
    /// (round, unit) pairs this push introduced.
    pub added_units: Vec<(String, String)>,
    pub pools_updated: usize,
    pub entries_rescored: usize,
    pub notices_sent: usize,
}

impl PropagationSummary {
    fn unchanged() -> Self {
        Self {
            changed: false,
            added_units: Vec::new(),
            pools_updated: 0,
            entries_rescored: 0,
            notices_sent: 0,
        }
    }
}

#[derive(Clone)]
pub struct PropagationEngine {
    store: DocStore,
    ledger: EventLedger,
    outbox: Outbox,
    clock: Clock,
}

impl PropagationEngine {
    pub fn new(store: DocStore, ledger: EventLedger, outbox: Outbox, clock: Clock) -> Self {
        Self {
            store,
            ledger,
            outbox,
            clock,
        }
    }

    /// Merges a results push into the season document, then rescores every
    /// playoff pool against that document as re-read in the transaction
    /// that rewrites the pools.
    pub fn publish_results(
        &self,
        season: &str,
        update: &ResultsUpdate,
        actor: &str,
    ) -> PoolResult<PropagationSummary> {
        for (round, units) in &update.rounds {
            let known = DEFAULT_ROUND_MULTIPLIERS.contains_key(round)
                || update
                    .multipliers
                    .as_ref()
                    .map_or(false, |m| m.contains_key(round));
            if !known {
                return Err(PoolError::InvalidArgument(format!(
                    "unknown playoff round {round}"
                )));
            }
            if units.iter().any(|u| u.trim().is_empty()) {
                return Err(PoolError::InvalidArgument(format!(
                    "empty unit name in round {round}"
                )));
            }
        }

        let now = self.clock.now_ms();
        let season_doc = season.to_string();
        let (added, changed) = self.store.txn::<_, PoolError, _>(|tx| {
            let mut results: GlobalResults = tx
                .get(collections::RESULTS, &season_doc)?
                .unwrap_or_default();
            let mut added = Vec::new();
            let mut changed = false;

            for (round, units) in &update.rounds {
                let existing = results.rounds.entry(round.clone()).or_default();
                for unit in units {
                    let unit = unit.trim();
                    if existing.iter().any(|u| u == unit) {
                        continue;
                    }
                    existing.push(unit.to_string());
                    added.push((round.clone(), unit.to_string()));
                    changed = true;
                }
            }
            if let Some(overrides) = &update.multipliers {
                for (round, mult) in overrides {
                    if results.multipliers.get(round) != Some(mult) {
                        results.multipliers.insert(round.clone(), *mult);
                        changed = true;
                    }
                }
            }

            if !changed {
                return Ok((added, false));
            }
            tx.set(collections::RESULTS, &season_doc, &results)?;
            let audit = AuditEvent::new(
                &season_doc,
                "results_published",
                format!("results merged: {} new unit(s)", added.len()),
                actor,
                json!({ "added": added, "rounds": results.rounds }),
                now,
            );
            tx.set(collections::AUDIT, &audit.id, &audit)?;
            Ok((added, true))
        })?;

        if !changed {
            info!(season = %season, "results push matched stored state, nothing to do");
            return Ok(PropagationSummary::unchanged());
        }

        // Locate the playoff fleet. A document that fails to decode is
        // skipped with a warning rather than blocking the batch; membership
        // is re-checked inside the rescore transaction.
        let mut playoff_ids = Vec::new();
        for pool_id in self.store.list_ids(collections::POOLS)? {
            match self.store.get::<Pool>(collections::POOLS, &pool_id) {
                Ok(Some(pool)) if pool.pool_type == PoolType::NflPlayoffs => {
                    playoff_ids.push(pool_id)
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(pool_id = %pool_id, error = %e, "skipping unreadable pool during rescore")
                }
            }
        }

        // Rescore against the season document as it stands at commit time,
        // not this push's merge snapshot. The transaction pins the season
        // document and every pool it rewrites; a racing merge invalidates
        // the pins and the rescore reruns over the fresher union.
        let rescored: Vec<(Pool, usize)> = self.store.txn::<_, PoolError, _>(|tx| {
            let current: GlobalResults = tx
                .get(collections::RESULTS, &season_doc)?
                .unwrap_or_default();
            let mut fleet = Vec::new();
            for pool_id in &playoff_ids {
                if let Some(pool) = tx.get::<Pool>(collections::POOLS, pool_id)? {
                    if pool.pool_type == PoolType::NflPlayoffs {
                        fleet.push(pool);
                    }
                }
            }
            let rescored: Vec<(Pool, usize)> = fleet
                .into_par_iter()
                .filter_map(|mut pool| {
                    let mut entries_changed = 0usize;
                    for entry in pool.entries.values_mut() {
                        let fresh = score_entry(entry, &current);
                        if entry.score != fresh {
                            entry.score = fresh;
                            entries_changed += 1;
                        }
                    }
                    let mut doc_changed = entries_changed > 0;
                    if pool.results != current.rounds {
                        pool.results = current.rounds.clone();
                        doc_changed = true;
                    }
                    doc_changed.then_some((pool, entries_changed))
                })
                .collect();
            for (pool, _) in &rescored {
                tx.set(collections::POOLS, &pool.id, pool)?;
            }
            Ok(rescored)
        })?;

        let pools_updated = rescored.len();
        let entries_rescored: usize = rescored.iter().map(|(_, n)| n).sum();
        info!(
            season = %season,
            added = added.len(),
            pools_updated,
            entries_rescored,
            "results propagated"
        );

        // One mail per host per push, listing only the units their pool has
        // not been told about before.
        let mut notices_sent = 0usize;
        for (pool, _) in &rescored {
            let Some(host) = pool.owner_email.as_deref() else {
                continue;
            };
            let mut fresh_units = Vec::new();
            for (round, unit) in &added {
                let key = results_notice_key(&pool.id, round, unit);
                let claim = self
                    .ledger
                    .try_claim(&key, json!({ "round": round, "unit": unit }))?;
                if claim.is_claimed() {
                    fresh_units.push(format!("{round}: {unit}"));
                }
            }
            if fresh_units.is_empty() {
                continue;
            }
            self.outbox.enqueue(&EmailMessage {
                to: host.to_string(),
                subject: format!("{}: playoff results updated", pool.name),
                body: results_notice_body(&pool.name, &fresh_units),
            })?;
            notices_sent += 1;
        }

        Ok(PropagationSummary {
            changed: true,
            added_units: added,
            pools_updated,
            entries_rescored,
            notices_sent,
        })
    }
}

/// An entry scores `weight x multiplier` for every advancing unit it
/// ranked, summed over all rounds. Saturates rather than wrapping on
/// out-of-range weights.
fn score_entry(entry: &Entry, results: &GlobalResults) -> u32 {
    let mut total = 0u32;
    for (round, units) in &results.rounds {
        let mult = results.multipliers.get(round).copied().unwrap_or(1);
        for unit in units {
            let weight = entry.rankings.get(unit).copied().unwrap_or(0);
            total = total.saturating_add(weight.saturating_mul(mult));
        }
    }
    total
}

fn results_notice_body(pool_name: &str, fresh_units: &[String]) -> String {
    let mut body = format!("New playoff results applied to {pool_name}:\n");
    for line in fresh_units {
        body.push_str(&format!("  {line}\n"));
    }
    body.push_str("Standings have been rescored.");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Barrier};
    use tempfile::NamedTempFile;

    const T0: i64 = 1_700_000_000_000;
    const SEASON: &str = "2025";

    struct Ctx {
        _file: NamedTempFile,
        store: DocStore,
        outbox: Outbox,
        engine: PropagationEngine,
    }

    fn setup() -> Ctx {
        let file = NamedTempFile::new().unwrap();
        let store = DocStore::open(file.path().to_str().unwrap()).unwrap();
        let clock = Clock::fixed(T0);
        let ledger = EventLedger::new(store.clone(), clock.clone());
        let outbox = Outbox::attach(&store, clock.clone()).unwrap();
        let engine = PropagationEngine::new(store.clone(), ledger, outbox.clone(), clock);
        Ctx {
            _file: file,
            store,
            outbox,
            engine,
        }
    }

    fn playoff_pool(id: &str, host: Option<&str>, rankings: &[(&str, u32)]) -> Pool {
        let mut pool = Pool::new(id, "Playoff Pool", "host-uid", PoolType::NflPlayoffs, 0);
        pool.owner_email = host.map(str::to_string);
        let mut entry = Entry {
            display_name: "Alice".to_string(),
            ..Entry::default()
        };
        for (unit, weight) in rankings {
            entry.rankings.insert(unit.to_string(), *weight);
        }
        pool.entries.insert("e1".to_string(), entry);
        pool
    }

    fn push(rounds: &[(&str, &[&str])]) -> ResultsUpdate {
        let mut update = ResultsUpdate::default();
        for (round, units) in rounds {
            update.rounds.insert(
                round.to_string(),
                units.iter().map(|u| u.to_string()).collect(),
            );
        }
        update
    }

    #[test]
    fn scoring_weights_units_by_round_multiplier() {
        let mut entry = Entry::default();
        entry.rankings.insert("KC".to_string(), 10);
        entry.rankings.insert("BUF".to_string(), 7);
        entry.rankings.insert("SF".to_string(), 4);

        let mut results = GlobalResults::default();
        results
            .rounds
            .insert("WILD_CARD".to_string(), vec!["KC".to_string(), "BUF".to_string()]);
        results
            .rounds
            .insert("SUPER_BOWL".to_string(), vec!["KC".to_string()]);

        // (10 + 7) * 1 + 10 * 8
        assert_eq!(score_entry(&entry, &results), 97);

        // unranked units are worth nothing
        results
            .rounds
            .get_mut("WILD_CARD")
            .unwrap()
            .push("DET".to_string());
        assert_eq!(score_entry(&entry, &results), 97);

        // out-of-range weights clamp at the ceiling instead of wrapping
        entry.rankings.insert("KC".to_string(), u32::MAX);
        assert_eq!(score_entry(&entry, &results), u32::MAX);
    }

    #[test]
    fn first_push_rescores_every_playoff_pool() {
        let ctx = setup();
        ctx.store
            .put(
                collections::POOLS,
                "np1",
                &playoff_pool("np1", Some("host@example.com"), &[("KC", 10), ("BUF", 7)]),
            )
            .unwrap();
        ctx.store
            .put(
                collections::POOLS,
                "np2",
                &playoff_pool("np2", None, &[("KC", 3)]),
            )
            .unwrap();

        let summary = ctx
            .engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC", "BUF"])]), "score-feed")
            .unwrap();
        assert!(summary.changed);
        assert_eq!(summary.pools_updated, 2);
        assert_eq!(summary.entries_rescored, 2);
        assert_eq!(summary.notices_sent, 1);
        assert_eq!(
            summary.added_units,
            vec![
                ("WILD_CARD".to_string(), "KC".to_string()),
                ("WILD_CARD".to_string(), "BUF".to_string())
            ]
        );

        let np1: Pool = ctx.store.get(collections::POOLS, "np1").unwrap().unwrap();
        assert_eq!(np1.entries["e1"].score, 17);
        assert_eq!(np1.results["WILD_CARD"], vec!["KC", "BUF"]);
        let np2: Pool = ctx.store.get(collections::POOLS, "np2").unwrap().unwrap();
        assert_eq!(np2.entries["e1"].score, 3);

        let audits = ctx.store.audit_events_for(SEASON).unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].event_type, "results_published");

        let mails = ctx.outbox.pending_for("host@example.com").unwrap();
        assert_eq!(mails.len(), 1);
        assert!(mails[0].body.contains("KC") && mails[0].body.contains("BUF"));
    }

    #[test]
    fn identical_push_is_a_no_op_end_to_end() {
        let ctx = setup();
        ctx.store
            .put(
                collections::POOLS,
                "np1",
                &playoff_pool("np1", Some("host@example.com"), &[("KC", 10)]),
            )
            .unwrap();

        let update = push(&[("WILD_CARD", &["KC"])]);
        ctx.engine
            .publish_results(SEASON, &update, "score-feed")
            .unwrap();
        let v1 = ctx.store.version_of(collections::POOLS, "np1").unwrap();
        let mails_before = ctx.outbox.queued_count().unwrap();

        let again = ctx
            .engine
            .publish_results(SEASON, &update, "score-feed")
            .unwrap();
        assert!(!again.changed);
        assert_eq!(again.pools_updated, 0);
        assert_eq!(again.notices_sent, 0);
        assert_eq!(ctx.store.version_of(collections::POOLS, "np1").unwrap(), v1);
        assert_eq!(ctx.outbox.queued_count().unwrap(), mails_before);
        assert_eq!(ctx.store.audit_events_for(SEASON).unwrap().len(), 1);
    }

    #[test]
    fn incremental_push_appends_in_publication_order() {
        let ctx = setup();
        ctx.store
            .put(
                collections::POOLS,
                "np1",
                &playoff_pool("np1", None, &[("KC", 10), ("BUF", 7)]),
            )
            .unwrap();

        ctx.engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC"])]), "score-feed")
            .unwrap();
        let summary = ctx
            .engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC", "BUF"])]), "score-feed")
            .unwrap();

        assert_eq!(
            summary.added_units,
            vec![("WILD_CARD".to_string(), "BUF".to_string())]
        );
        let results: GlobalResults = ctx
            .store
            .get(collections::RESULTS, SEASON)
            .unwrap()
            .unwrap();
        assert_eq!(results.rounds["WILD_CARD"], vec!["KC", "BUF"]);

        let np1: Pool = ctx.store.get(collections::POOLS, "np1").unwrap().unwrap();
        assert_eq!(np1.entries["e1"].score, 17);
    }

    #[test]
    fn non_playoff_pools_are_never_rewritten() {
        let ctx = setup();
        let squares = Pool::new("s1", "Grid", "host-uid", PoolType::Squares, 0);
        ctx.store.put(collections::POOLS, "s1", &squares).unwrap();
        let v1 = ctx.store.version_of(collections::POOLS, "s1").unwrap();

        ctx.engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC"])]), "score-feed")
            .unwrap();
        assert_eq!(ctx.store.version_of(collections::POOLS, "s1").unwrap(), v1);
    }

    #[test]
    fn host_notices_cover_only_units_not_yet_announced() {
        let ctx = setup();
        ctx.store
            .put(
                collections::POOLS,
                "np1",
                &playoff_pool("np1", Some("host@example.com"), &[("KC", 10), ("BUF", 7)]),
            )
            .unwrap();

        ctx.engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC"])]), "score-feed")
            .unwrap();
        let summary = ctx
            .engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC", "BUF"])]), "score-feed")
            .unwrap();
        assert_eq!(summary.notices_sent, 1);

        let mails = ctx.outbox.pending_for("host@example.com").unwrap();
        assert_eq!(mails.len(), 2);
        assert!(mails[1].body.contains("BUF"));
        assert!(!mails[1].body.contains("KC"));
    }

    #[test]
    fn unknown_round_is_rejected_unless_a_multiplier_introduces_it() {
        let ctx = setup();
        let err = ctx
            .engine
            .publish_results(SEASON, &push(&[("PRESEASON", &["KC"])]), "score-feed")
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidArgument(_)));

        let mut update = push(&[("PRESEASON", &["KC"])]);
        update.multipliers = Some(BTreeMap::from([("PRESEASON".to_string(), 1)]));
        let summary = ctx
            .engine
            .publish_results(SEASON, &update, "score-feed")
            .unwrap();
        assert!(summary.changed);
    }

    #[test]
    fn empty_unit_names_are_rejected() {
        let ctx = setup();
        let err = ctx
            .engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC", "  "])]), "score-feed")
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidArgument(_)));
    }

    #[test]
    fn multiplier_override_forces_a_rescore_without_new_units() {
        let ctx = setup();
        ctx.store
            .put(
                collections::POOLS,
                "np1",
                &playoff_pool("np1", Some("host@example.com"), &[("KC", 10)]),
            )
            .unwrap();

        ctx.engine
            .publish_results(SEASON, &push(&[("SUPER_BOWL", &["KC"])]), "score-feed")
            .unwrap();
        let np1: Pool = ctx.store.get(collections::POOLS, "np1").unwrap().unwrap();
        assert_eq!(np1.entries["e1"].score, 80);

        let mut update = push(&[("SUPER_BOWL", &["KC"])]);
        update.multipliers = Some(BTreeMap::from([("SUPER_BOWL".to_string(), 10)]));
        let summary = ctx
            .engine
            .publish_results(SEASON, &update, "score-feed")
            .unwrap();
        assert!(summary.changed);
        assert!(summary.added_units.is_empty());
        assert_eq!(summary.pools_updated, 1);
        assert_eq!(summary.entries_rescored, 1);
        assert_eq!(summary.notices_sent, 0);

        let np1: Pool = ctx.store.get(collections::POOLS, "np1").unwrap().unwrap();
        assert_eq!(np1.entries["e1"].score, 100);
    }

    #[test]
    fn unreadable_pool_documents_are_skipped() {
        let ctx = setup();
        ctx.store
            .put(collections::POOLS, "corrupt", &json!({ "id": 7 }))
            .unwrap();
        ctx.store
            .put(
                collections::POOLS,
                "np1",
                &playoff_pool("np1", None, &[("KC", 10)]),
            )
            .unwrap();

        let summary = ctx
            .engine
            .publish_results(SEASON, &push(&[("WILD_CARD", &["KC"])]), "score-feed")
            .unwrap();
        assert_eq!(summary.pools_updated, 1);
        let np1: Pool = ctx.store.get(collections::POOLS, "np1").unwrap().unwrap();
        assert_eq!(np1.entries["e1"].score, 10);
    }

    #[test]
    fn concurrent_pushes_merge_without_losing_units() {
        let ctx = setup();
        let a = ctx.engine.clone();
        let b = ctx.engine.clone();

        let ta = std::thread::spawn(move || {
            a.publish_results(SEASON, &push(&[("WILD_CARD", &["KC"])]), "feed-a")
        });
        let tb = std::thread::spawn(move || {
            b.publish_results(SEASON, &push(&[("WILD_CARD", &["BUF"])]), "feed-b")
        });
        ta.join().unwrap().unwrap();
        tb.join().unwrap().unwrap();

        let results: GlobalResults = ctx
            .store
            .get(collections::RESULTS, SEASON)
            .unwrap()
            .unwrap();
        let mut units = results.rounds["WILD_CARD"].clone();
        units.sort();
        assert_eq!(units, vec!["BUF", "KC"]);
    }

    #[test]
    fn racing_pushes_leave_every_pool_on_the_final_union() {
        let ctx = setup();
        for i in 0..10 {
            let id = format!("np{i}");
            ctx.store
                .put(
                    collections::POOLS,
                    &id,
                    &playoff_pool(&id, None, &[("KC", 10), ("BUF", 7)]),
                )
                .unwrap();
        }

        let units = ["KC", "BUF", "SF", "DET", "BAL", "GB"];
        let barrier = Arc::new(Barrier::new(units.len()));
        let handles: Vec<_> = units
            .iter()
            .map(|&unit| {
                let engine = ctx.engine.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.publish_results(SEASON, &push(&[("WILD_CARD", &[unit])]), "feed")
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let season: GlobalResults = ctx
            .store
            .get(collections::RESULTS, SEASON)
            .unwrap()
            .unwrap();
        assert_eq!(season.rounds["WILD_CARD"].len(), units.len());

        // Whatever order the merges and rescores landed in, no pool may be
        // left carrying an older union than the season document records.
        for i in 0..10 {
            let pool: Pool = ctx
                .store
                .get(collections::POOLS, &format!("np{i}"))
                .unwrap()
                .unwrap();
            assert_eq!(
                pool.results, season.rounds,
                "pool np{i} diverged from the season results"
            );
            assert_eq!(pool.entries["e1"].score, 17);
        }
    }
}
