//! Custody Core
//!
//! Custody ledger for a perishable commodity: who may produce and hold stock,
//! which batches each holder owns, and when holding turns into a violation.
//!
//! # Architecture
//!
//! - **Components**: roles, batches, stock, violations and the blacklist each
//!   own one slice of [`CustodyState`]
//! - **Single Writer**: one actor task applies commands in order, each on a
//!   draft that is committed or dropped whole
//! - **Snapshots**: queries read the last published state and never wait
//! - **Journal**: committed events are hash-chained and persisted with the
//!   entities they touched in one RocksDB write
//!
//! # Invariants
//!
//! - Stock conservation: a holder's balance equals the batches it owns
//! - One role per account
//! - A reseller above its cap always has an open overflow violation
//! - A blacklisted holder is never the source of stock movement

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod config;
pub mod roles;
pub mod batches;
pub mod stock;
pub mod violations;
pub mod blacklist;
pub mod events;
pub mod command;
pub mod changes;
pub mod state;
pub mod storage;
pub mod actor;
pub mod ledger;
pub mod sweeper;
pub mod metrics;

// Re-exports
pub use command::{Command, Outcome, Receipt};
pub use config::{Config, PolicyConfig};
pub use error::{Error, Result};
pub use events::{CustodyEvent, EventRecord};
pub use ledger::CustodyLedger;
pub use state::CustodyState;
pub use types::{
    AccountInfo, Address, Batch, BatchId, Role, RoleKind, Timestamp, Violation, ViolationId,
    ViolationKind,
};
pub use violations::ScanReport;
