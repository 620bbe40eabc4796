//! Per-entity view of the custody state
//!
//! The store keeps one entry per account, batch and violation plus a small
//! meta record. Every mutation is reported by an event naming the entities it
//! touched, so [`ChangeSet::from_events`] is exactly the set of entries a
//! commit has to rewrite.

use crate::config::PolicyConfig;
use crate::events::CustodyEvent;
use crate::types::{Address, BatchId, Role, ViolationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Key of one persisted entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    /// Role, label, balance, owned batches and blacklist flag of an address
    Account(Address),
    /// One batch record
    Batch(BatchId),
    /// One violation record
    Violation(ViolationId),
}

/// Entities touched by one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    keys: BTreeSet<EntityKey>,
}

impl ChangeSet {
    /// Entities named by `events`
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a CustodyEvent>) -> Self {
        let mut changes = Self::default();
        for event in events {
            changes.record(event);
        }
        changes
    }

    fn record(&mut self, event: &CustodyEvent) {
        use EntityKey::{Account, Batch, Violation};

        match event {
            CustodyEvent::AdminAdded { account, .. }
            | CustodyEvent::AdminRemoved { account, .. }
            | CustodyEvent::ProducerAdded { account, .. }
            | CustodyEvent::ProducerRemoved { account, .. }
            | CustodyEvent::ResellerAdded { account, .. }
            | CustodyEvent::ResellerRemoved { account, .. }
            | CustodyEvent::ResellerCapChanged { account, .. }
            | CustodyEvent::AccountLabelled { account, .. } => {
                self.keys.insert(Account(*account));
            }
            CustodyEvent::Produced {
                producer, batch_id, ..
            } => {
                self.keys.insert(Account(*producer));
                self.keys.insert(Batch(*batch_id));
            }
            CustodyEvent::Transferred {
                from,
                to,
                source_batch_id,
                batch_id,
                ..
            } => {
                self.keys.insert(Account(*from));
                self.keys.insert(Account(*to));
                self.keys.insert(Batch(*source_batch_id));
                self.keys.insert(Batch(*batch_id));
            }
            CustodyEvent::BatchExpired { batch_id, .. } => {
                self.keys.insert(Batch(*batch_id));
            }
            CustodyEvent::AbusiveStorageDetected { violation_id, .. }
            | CustodyEvent::QuantityOverflowDetected { violation_id, .. }
            | CustodyEvent::ViolationResolved { violation_id, .. } => {
                self.keys.insert(Violation(*violation_id));
            }
            CustodyEvent::HolderBlacklisted { holder, .. }
            | CustodyEvent::HolderUnblacklisted { holder, .. } => {
                self.keys.insert(Account(*holder));
            }
            // Policy lives in the meta record, rewritten on every commit
            CustodyEvent::PolicyUpdated { .. } => {}
        }
    }

    /// Touched entities in key order
    pub fn keys(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.keys.iter().copied()
    }

    /// Number of touched entities
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Nothing touched
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Everything persisted about one address
///
/// Each field mirrors a component entry as stored, so `None` and an empty
/// value stay distinct across a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Address the record belongs to
    pub address: Address,
    /// Role entry
    pub role: Option<Role>,
    /// Display label
    pub label: Option<String>,
    /// Balance entry
    pub balance: Option<u64>,
    /// Owned batches in acquisition order
    pub owned_batches: Option<Vec<BatchId>>,
    /// Blacklist status
    pub blacklisted: bool,
}

impl AccountRecord {
    /// No component knows the address
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.label.is_none()
            && self.balance.is_none()
            && self.owned_batches.is_none()
            && !self.blacklisted
    }
}

/// State not owned by a single entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMeta {
    /// Active violation policy
    pub policy: PolicyConfig,
    /// Id the next batch will receive
    pub next_batch_id: BatchId,
    /// Id the next violation will receive
    pub next_violation_id: ViolationId,
}
