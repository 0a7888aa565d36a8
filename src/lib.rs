//! Gridpool Backend Library
//!
//! Concurrency-safe squares/playoff pool state machine: a document store
//! with optimistic transactions, a write-once event ledger, and the engines
//! that drive claims, locking, digit rotation, reminders, and results
//! propagation. The binary in `main.rs` wires these behind an HTTP surface
//! and scheduler loops; everything here is usable standalone in tests.

pub mod api;
pub mod clock;
pub mod digits;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod outbox;
pub mod scores;
pub mod store;
