//! Pool Engines
//!
//! One engine per concern, all stateless over the shared [`DocStore`]:
//!
//! - [`claim`]: transactional square claims with ownership and cap rules
//! - [`lock`]: the single open -> locked transition, manual or scheduled
//! - [`rotation`]: quarter-boundary digit reveals driven by the score feed
//! - [`reminders`]: the periodic sweep (payments, auto-release, countdowns)
//! - [`propagation`]: playoff results fan-out and entry rescoring
//!
//! [`DocStore`]: crate::store::DocStore

pub mod claim;
pub mod lock;
pub mod propagation;
pub mod reminders;
pub mod rotation;

pub use claim::{ClaimEngine, ClaimReceipt};
pub use lock::{LockActor, LockEngine, LockOutcome};
pub use propagation::{PropagationEngine, PropagationSummary, ResultsUpdate};
pub use reminders::{ReminderEngine, SweepStats};
pub use rotation::{RotationEngine, RotationSummary};
