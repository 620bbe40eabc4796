//! Commands accepted by the custody engine and their outcomes

use crate::config::PolicyConfig;
use crate::events::EventRecord;
use crate::types::{Address, BatchId, ViolationId, ViolationKind};
use crate::violations::ScanReport;
use serde::{Deserialize, Serialize};

/// Mutating command; the caller address travels alongside it, already
/// authenticated by the layer in front of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Grant Admin
    AddAdmin {
        /// Account to promote
        account: Address,
    },
    /// Revoke Admin
    RemoveAdmin {
        /// Admin to demote
        account: Address,
    },
    /// Grant Producer
    SetProducer {
        /// Account to promote
        account: Address,
    },
    /// Revoke Producer
    RemoveProducer {
        /// Producer to demote
        account: Address,
    },
    /// Grant Reseller with a cap
    SetReseller {
        /// Account to promote
        account: Address,
        /// Most units the reseller may hold
        max_quantity: u64,
    },
    /// Revoke Reseller
    RemoveReseller {
        /// Reseller to demote
        account: Address,
    },
    /// Change a reseller's cap
    ChangeMaxQuantityReseller {
        /// Reseller to update
        account: Address,
        /// New cap
        max_quantity: u64,
    },
    /// Set or clear a display label
    LabelAccount {
        /// Account to label
        account: Address,
        /// Label text; blank clears it
        label: String,
    },
    /// Replace the violation policy
    UpdatePolicy {
        /// Policy to put in force
        policy: PolicyConfig,
    },
    /// Create a batch owned by the caller
    Produce {
        /// Units in the new batch
        quantity: u64,
    },
    /// Move stock out of one of the caller's batches
    TransferStock {
        /// Receiving holder
        to: Address,
        /// Units to move
        quantity: u64,
        /// Caller-owned batch to take them from
        batch_id: BatchId,
    },
    /// Expire stale batches and flag abusive storage
    ScanForAbusiveStorage,
    /// Mark a violation resolved
    ResolveViolation {
        /// Violation to close
        violation_id: ViolationId,
    },
    /// Blacklist a holder regardless of violations
    BlacklistManually {
        /// Holder to block
        holder: Address,
    },
    /// Lift a blacklist
    RemoveFromBlacklist {
        /// Holder to unblock
        holder: Address,
    },
    /// Diagnostic violation injection
    TriggerFakeViolation {
        /// Holder the violation is opened against
        holder: Address,
        /// Batch the violation points at
        batch_id: BatchId,
        /// Kind of violation to open
        kind: ViolationKind,
    },
}

impl Command {
    /// Stable command name (metrics label)
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddAdmin { .. } => "add_admin",
            Command::RemoveAdmin { .. } => "remove_admin",
            Command::SetProducer { .. } => "set_producer",
            Command::RemoveProducer { .. } => "remove_producer",
            Command::SetReseller { .. } => "set_reseller",
            Command::RemoveReseller { .. } => "remove_reseller",
            Command::ChangeMaxQuantityReseller { .. } => "change_max_quantity_reseller",
            Command::LabelAccount { .. } => "label_account",
            Command::UpdatePolicy { .. } => "update_policy",
            Command::Produce { .. } => "produce",
            Command::TransferStock { .. } => "transfer_stock",
            Command::ScanForAbusiveStorage => "scan_for_abusive_storage",
            Command::ResolveViolation { .. } => "resolve_violation",
            Command::BlacklistManually { .. } => "blacklist_manually",
            Command::RemoveFromBlacklist { .. } => "remove_from_blacklist",
            Command::TriggerFakeViolation { .. } => "trigger_fake_violation",
        }
    }
}

/// Command-specific result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Applied, nothing further to report
    Applied,
    /// `Produce` created this batch
    Produced {
        /// New batch
        batch_id: BatchId,
    },
    /// `TransferStock` left the receiver owning this batch
    Transferred {
        /// Batch now owned by the receiver
        batch_id: BatchId,
    },
    /// `ScanForAbusiveStorage` report
    Scanned(ScanReport),
    /// `TriggerFakeViolation` opened this violation
    ViolationOpened {
        /// Injected violation
        violation_id: ViolationId,
    },
}

/// What a committed command returns to its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Command-specific result
    pub outcome: Outcome,
    /// Events sealed by the commit, in emission order
    pub records: Vec<EventRecord>,
}

impl Receipt {
    /// Batch created or received, if any
    pub fn batch_id(&self) -> Option<BatchId> {
        match &self.outcome {
            Outcome::Produced { batch_id } | Outcome::Transferred { batch_id } => Some(*batch_id),
            _ => None,
        }
    }

    /// Names of the committed events
    pub fn event_names(&self) -> Vec<&'static str> {
        self.records.iter().map(|r| r.event.name()).collect()
    }
}
