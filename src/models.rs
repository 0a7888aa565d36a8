//! Domain Model
//!
//! Pool documents, squares, entries, audit events, and the global playoff
//! results document, plus the process `Config` read from the environment.
//!
//! Documents are stored as JSON and tolerant of older shapes: most fields
//! carry `#[serde(default)]` so pools written before a field existed still
//! deserialize.

use std::collections::{BTreeMap, BTreeSet};
use std::env;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::clock::{MILLIS_PER_HOUR, MILLIS_PER_SEC};

// ============================================================================
// Periods and rounds
// ============================================================================

/// Quarter keys in game order. Digit sets are revealed in this order and
/// never removed once present.
pub const PERIOD_KEYS: [&str; 4] = ["Q1", "Q2", "Q3", "Q4"];

lazy_static! {
    /// Points a correct playoff pick is worth per round, unless the results
    /// document overrides them.
    pub static ref DEFAULT_ROUND_MULTIPLIERS: BTreeMap<String, u32> = {
        let mut m = BTreeMap::new();
        m.insert("WILD_CARD".to_string(), 1);
        m.insert("DIVISIONAL".to_string(), 2);
        m.insert("CONFERENCE".to_string(), 4);
        m.insert("SUPER_BOWL".to_string(), 8);
        m
    };
}

// ============================================================================
// Timestamps
// ============================================================================

/// A timestamp as it actually arrives from clients and older documents:
/// epoch integer, fractional epoch seconds, a `{seconds, nanoseconds}`
/// object, or an RFC3339 string. `as_millis` normalizes all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ts {
    Epoch(i64),
    EpochFloat(f64),
    Object {
        seconds: i64,
        #[serde(default)]
        nanoseconds: i64,
    },
    Text(String),
}

impl Ts {
    /// Epoch milliseconds, or `None` when the value cannot be interpreted.
    /// Integer/float epochs are disambiguated by magnitude: values below
    /// 100_000_000_000 are seconds, anything larger is already millis.
    pub fn as_millis(&self) -> Option<i64> {
        const MILLIS_CUTOVER: i64 = 100_000_000_000;
        match self {
            Ts::Epoch(v) => {
                if v.unsigned_abs() >= MILLIS_CUTOVER as u64 {
                    Some(*v)
                } else {
                    v.checked_mul(MILLIS_PER_SEC)
                }
            }
            Ts::EpochFloat(v) => {
                if !v.is_finite() {
                    return None;
                }
                if v.abs() >= MILLIS_CUTOVER as f64 {
                    Some(*v as i64)
                } else {
                    Some((v * MILLIS_PER_SEC as f64) as i64)
                }
            }
            Ts::Object {
                seconds,
                nanoseconds,
            } => seconds
                .checked_mul(MILLIS_PER_SEC)
                .and_then(|ms| ms.checked_add(nanoseconds / 1_000_000)),
            Ts::Text(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis()),
        }
    }

    pub fn from_millis(ms: i64) -> Self {
        Ts::Epoch(ms)
    }
}

// ============================================================================
// Pools
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolType {
    Squares,
    Props,
    Bracket,
    NflPlayoffs,
}

impl PoolType {
    /// Only squares pools carry the 100-cell grid and axis digits.
    pub fn has_grid(&self) -> bool {
        matches!(self, PoolType::Squares)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Squares => "SQUARES",
            PoolType::Props => "PROPS",
            PoolType::Bracket => "BRACKET",
            PoolType::NflPlayoffs => "NFL_PLAYOFFS",
        }
    }
}

/// Lifecycle status used by pool types without a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    #[default]
    Open,
    Locked,
    Settled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// One cell in the 10x10 grid. `id` is the flat index 0..=99
/// (row = id / 10, col = id % 10).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Square {
    pub id: u8,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub player_details: Option<PlayerDetails>,
    #[serde(default)]
    pub is_paid: bool,
    /// Epoch millis of the claim that created this reservation.
    #[serde(default)]
    pub reserved_at: Option<i64>,
    #[serde(default)]
    pub reserved_by_uid: Option<String>,
    #[serde(default)]
    pub payment_confirmed_at: Option<i64>,
}

impl Square {
    fn release(&mut self) {
        self.owner = None;
        self.player_details = None;
        self.is_paid = false;
        self.reserved_at = None;
        self.reserved_by_uid = None;
        self.payment_confirmed_at = None;
    }
}

/// One shuffled digit assignment: `home[col]` and `away[row]` give the score
/// digits for a cell. Each array is a permutation of 0..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisNumbers {
    pub home: [u8; 10],
    pub away: [u8; 10],
}

impl AxisNumbers {
    pub fn is_permutation(&self) -> bool {
        let ok = |axis: &[u8; 10]| {
            let mut seen = [false; 10];
            for &d in axis {
                if d > 9 || seen[d as usize] {
                    return false;
                }
                seen[d as usize] = true;
            }
            true
        };
        ok(&self.home) && ok(&self.away)
    }
}

/// A participant entry in a pick-based pool (props, bracket, playoffs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_paid: bool,
    /// Set once the pre-lock payment reminder for this entry has gone out.
    #[serde(default)]
    pub payment_reminder_sent: bool,
    /// Competition unit id -> weight the entrant placed on it.
    #[serde(default)]
    pub rankings: BTreeMap<String, u32>,
    /// Derived: recomputed by results propagation, never edited by hand.
    #[serde(default)]
    pub score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub joined_at: i64,
}

fn default_repeat_interval_ms() -> i64 {
    24 * MILLIS_PER_HOUR
}

fn default_lock_lead_minutes() -> Vec<i64> {
    vec![60, 30, 15]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderSettings {
    #[serde(default)]
    pub payment_reminders_enabled: bool,
    /// Also mail each participant with unpaid squares, not just the host.
    #[serde(default)]
    pub notify_participants: bool,
    /// Width of the reminder dedupe bucket. One reminder per bucket.
    #[serde(default = "default_repeat_interval_ms")]
    pub repeat_interval_ms: i64,
    /// Release unpaid reservations older than this many hours. `None`
    /// disables auto-release.
    #[serde(default)]
    pub auto_release_hours: Option<i64>,
    /// Countdown reminders this many minutes before lock time.
    #[serde(default = "default_lock_lead_minutes")]
    pub lock_lead_minutes: Vec<i64>,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            payment_reminders_enabled: false,
            notify_participants: false,
            repeat_interval_ms: default_repeat_interval_ms(),
            auto_release_hours: None,
            lock_lead_minutes: default_lock_lead_minutes(),
        }
    }
}

pub const GRID_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub owner_uid: String,
    #[serde(default)]
    pub owner_email: Option<String>,
    pub pool_type: PoolType,

    // --- lifecycle ---
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub status: PoolStatus,
    #[serde(default)]
    pub locked_at: Option<i64>,
    /// Scheduled lock deadline. Tolerant of legacy encodings, see [`Ts`].
    #[serde(default)]
    pub lock_time: Option<Ts>,
    #[serde(default)]
    pub is_finished: bool,

    // --- squares grid ---
    #[serde(default)]
    pub squares: Vec<Square>,
    #[serde(default)]
    pub axis_numbers: Option<AxisNumbers>,
    #[serde(default)]
    pub uses_quarterly_numbers: bool,
    /// "Q1".."Q4" -> digit set. Insert-only; existing sets are never
    /// regenerated.
    #[serde(default)]
    pub quarterly_numbers: BTreeMap<String, AxisNumbers>,
    #[serde(default)]
    pub current_period: Option<String>,
    #[serde(default)]
    pub max_squares_per_player: Option<u32>,

    // --- pick-based pools ---
    #[serde(default)]
    pub entries: BTreeMap<String, Entry>,
    /// Copy of the global results rounds, denormalized per pool so clients
    /// read one document.
    #[serde(default)]
    pub results: BTreeMap<String, Vec<String>>,

    // --- scheduling / feed ---
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub reminders: ReminderSettings,
    #[serde(default)]
    pub waitlist: Vec<WaitlistEntry>,

    pub created_at: i64,
}

impl Pool {
    pub fn new(id: &str, name: &str, owner_uid: &str, pool_type: PoolType, now_ms: i64) -> Self {
        let squares = if pool_type.has_grid() {
            (0..GRID_SIZE as u8)
                .map(|id| Square {
                    id,
                    ..Square::default()
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            owner_uid: owner_uid.to_string(),
            owner_email: None,
            pool_type,
            is_locked: false,
            status: PoolStatus::Open,
            locked_at: None,
            lock_time: None,
            is_finished: false,
            squares,
            axis_numbers: None,
            uses_quarterly_numbers: false,
            quarterly_numbers: BTreeMap::new(),
            current_period: None,
            max_squares_per_player: None,
            entries: BTreeMap::new(),
            results: BTreeMap::new(),
            game_id: None,
            reminders: ReminderSettings::default(),
            waitlist: Vec::new(),
            created_at: now_ms,
        }
    }

    /// Whether the pool still accepts claims/entries. Grid pools use the
    /// `is_locked` flag, pick-based pools the `status` field.
    pub fn is_open(&self) -> bool {
        if self.pool_type.has_grid() {
            !self.is_locked
        } else {
            self.status == PoolStatus::Open
        }
    }

    pub fn squares_owned_by(&self, display_name: &str) -> usize {
        self.squares
            .iter()
            .filter(|s| s.owner.as_deref() == Some(display_name))
            .count()
    }

    /// Squares that are reserved but not yet paid for.
    pub fn unpaid_squares(&self) -> Vec<&Square> {
        self.squares
            .iter()
            .filter(|s| s.owner.is_some() && !s.is_paid)
            .collect()
    }

    /// Releases each listed square if it is still unpaid and older than the
    /// cutoff. Returns the ids actually released.
    pub fn release_stale_squares(&mut self, candidates: &[u8], cutoff_ms: i64) -> Vec<u8> {
        let mut released = Vec::new();
        for &id in candidates {
            if let Some(sq) = self.squares.get_mut(id as usize) {
                let stale = sq.owner.is_some()
                    && !sq.is_paid
                    && sq.reserved_at.map_or(false, |t| t < cutoff_ms);
                if stale {
                    sq.release();
                    released.push(id);
                }
            }
        }
        released
    }

    /// Most advanced quarter with a revealed digit set.
    pub fn most_advanced_period(&self) -> Option<String> {
        PERIOD_KEYS
            .iter()
            .rev()
            .find(|k| self.quarterly_numbers.contains_key(**k))
            .map(|k| k.to_string())
    }

    /// Distinct lowercase participant emails across squares and entries.
    pub fn participant_emails(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        for sq in &self.squares {
            if let Some(email) = sq.player_details.as_ref().and_then(|d| d.email.as_deref()) {
                let email = email.trim().to_lowercase();
                if !email.is_empty() {
                    out.insert(email);
                }
            }
        }
        for entry in self.entries.values() {
            if let Some(email) = entry.email.as_deref() {
                let email = email.trim().to_lowercase();
                if !email.is_empty() {
                    out.insert(email);
                }
            }
        }
        out.into_iter().collect()
    }
}

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
}

/// Append-only record of a state transition or side effect. Events that must
/// fire at most once are paired with a ledger claim by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub pool_id: String,
    pub event_type: String,
    pub message: String,
    pub severity: AuditSeverity,
    pub actor: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: i64,
}

impl AuditEvent {
    pub fn new(
        pool_id: &str,
        event_type: &str,
        message: String,
        actor: &str,
        payload: serde_json::Value,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            event_type: event_type.to_string(),
            message,
            severity: AuditSeverity::Info,
            actor: actor.to_string(),
            payload,
            created_at: now_ms,
        }
    }

    pub fn warning(mut self) -> Self {
        self.severity = AuditSeverity::Warning;
        self
    }
}

// ============================================================================
// Settlement artifacts
// ============================================================================

/// A settled period winner for a squares pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Winner {
    pub period: String,
    pub square_id: u8,
    pub owner: Option<String>,
    pub home_digit: u8,
    pub away_digit: u8,
    #[serde(default)]
    pub amount: f64,
}

impl Winner {
    /// Checks the winner against the digit set the pool committed for that
    /// period: the named square must sit at the claimed digit intersection
    /// and be owned by the claimed owner.
    pub fn consistent_with(&self, pool: &Pool) -> bool {
        let axis = match pool.quarterly_numbers.get(&self.period) {
            Some(a) => Some(a),
            None => pool.axis_numbers.as_ref(),
        };
        let Some(axis) = axis else { return false };
        let row = (self.square_id / 10) as usize;
        let col = (self.square_id % 10) as usize;
        if axis.home[col] != self.home_digit || axis.away[row] != self.away_digit {
            return false;
        }
        match pool.squares.get(self.square_id as usize) {
            Some(sq) => sq.owner == self.owner,
            None => false,
        }
    }
}

fn default_multipliers() -> BTreeMap<String, u32> {
    DEFAULT_ROUND_MULTIPLIERS.clone()
}

/// Season-wide playoff results: which units advanced in each round, plus the
/// per-round score multipliers. Single document, merged insert-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalResults {
    /// Round key -> units that advanced, in publication order.
    #[serde(default)]
    pub rounds: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_multipliers")]
    pub multipliers: BTreeMap<String, u32>,
}

impl Default for GlobalResults {
    fn default() -> Self {
        Self {
            rounds: BTreeMap::new(),
            multipliers: default_multipliers(),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    /// Seconds between reminder sweeps.
    pub reminder_sweep_secs: u64,
    /// Seconds between live-game digit rotation polls.
    pub rotation_poll_secs: u64,
    /// Seconds between playoff results polls.
    pub results_poll_secs: u64,
    pub score_feed_url: String,
    pub score_feed_api_key: Option<String>,
    /// Bearer token required on manual results pushes. Pushes are rejected
    /// when unset.
    pub results_push_token: Option<String>,
    /// Document id of the season results doc, e.g. "nfl-playoffs-2026".
    pub season: String,
    /// Optional fixed seed for the digit shuffler (staging reproducibility).
    pub digit_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            db_path: env::var("GRIDPOOL_DB_PATH").unwrap_or_else(|_| "gridpool.db".to_string()),
            reminder_sweep_secs: env::var("REMINDER_SWEEP_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
            rotation_poll_secs: env::var("ROTATION_POLL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            results_poll_secs: env::var("RESULTS_POLL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
            score_feed_url: env::var("SCORE_FEED_URL").unwrap_or_default(),
            score_feed_api_key: env::var("SCORE_FEED_API_KEY").ok().filter(|k| !k.is_empty()),
            results_push_token: env::var("RESULTS_PUSH_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            season: env::var("SEASON").unwrap_or_else(|_| "nfl-playoffs-2026".to_string()),
            digit_seed: env::var("GRIDPOOL_DIGIT_SEED")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}
