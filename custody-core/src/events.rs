//! Custody events and the hash-chained journal
//!
//! Events are produced by a command, held in the command's draft and only
//! sealed into [`EventRecord`]s once the command commits. Each record links to
//! its predecessor by hash, so an observer replaying the journal can detect a
//! gap or a rewritten entry.

use crate::config::PolicyConfig;
use crate::types::{Address, BatchId, Timestamp, ViolationId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hash preceding the first record
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// State change observable by external consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustodyEvent {
    /// Account promoted to admin
    AdminAdded {
        /// New admin
        account: Address,
        /// Command time
        at: Timestamp,
    },
    /// Admin demoted to no role
    AdminRemoved {
        /// Former admin
        account: Address,
        /// Command time
        at: Timestamp,
    },
    /// Account became a producer
    ProducerAdded {
        /// New producer
        account: Address,
        /// Command time
        at: Timestamp,
    },
    /// Producer demoted to no role
    ProducerRemoved {
        /// Former producer
        account: Address,
        /// Command time
        at: Timestamp,
    },
    /// Account became a reseller
    ResellerAdded {
        /// New reseller
        account: Address,
        /// Cap granted with the role
        max_quantity: u64,
        /// Command time
        at: Timestamp,
    },
    /// Reseller demoted to no role
    ResellerRemoved {
        /// Former reseller
        account: Address,
        /// Command time
        at: Timestamp,
    },
    /// Reseller cap changed
    ResellerCapChanged {
        /// Reseller whose cap changed
        account: Address,
        /// Cap before the change
        previous: u64,
        /// Cap after the change
        max_quantity: u64,
        /// Command time
        at: Timestamp,
    },
    /// Display label set or cleared
    AccountLabelled {
        /// Labelled account
        account: Address,
        /// New label, `None` when cleared
        label: Option<String>,
        /// Command time
        at: Timestamp,
    },
    /// New batch produced
    Produced {
        /// Producer and first owner
        producer: Address,
        /// Id of the new batch
        batch_id: BatchId,
        /// Units produced
        quantity: u64,
        /// Command time, also the batch creation time
        at: Timestamp,
    },
    /// Stock moved between holders
    Transferred {
        /// Sending holder
        from: Address,
        /// Receiving holder
        to: Address,
        /// Units moved
        quantity: u64,
        /// Batch the stock was taken from
        source_batch_id: BatchId,
        /// Batch now owned by `to` (equals the source on a full transfer)
        batch_id: BatchId,
        /// Command time
        at: Timestamp,
    },
    /// Batch outlived the storage duration
    BatchExpired {
        /// Expired batch
        batch_id: BatchId,
        /// Owner at expiry
        holder: Address,
        /// Scan time
        at: Timestamp,
    },
    /// Excessive storage violation opened
    AbusiveStorageDetected {
        /// New violation
        violation_id: ViolationId,
        /// Offending holder
        holder: Address,
        /// Batch the violation points at
        batch_id: BatchId,
        /// Holder balance at detection
        balance: u64,
        /// Detection time
        at: Timestamp,
    },
    /// Quantity overflow violation opened
    QuantityOverflowDetected {
        /// New violation
        violation_id: ViolationId,
        /// Reseller above its cap
        holder: Address,
        /// Batch that pushed the balance over
        batch_id: BatchId,
        /// Holder balance at detection
        balance: u64,
        /// Cap in force at detection
        max_quantity: u64,
        /// Detection time
        at: Timestamp,
    },
    /// Violation resolved by an admin
    ViolationResolved {
        /// Resolved violation
        violation_id: ViolationId,
        /// Holder the violation was against
        holder: Address,
        /// Command time
        at: Timestamp,
    },
    /// Holder blacklisted, automatically or by an admin
    HolderBlacklisted {
        /// Blacklisted holder
        holder: Address,
        /// Set by the violation count rather than an admin
        automatic: bool,
        /// Open violations at the time
        active_violations: usize,
        /// Command time
        at: Timestamp,
    },
    /// Holder removed from the blacklist
    HolderUnblacklisted {
        /// Holder cleared
        holder: Address,
        /// Command time
        at: Timestamp,
    },
    /// Violation policy replaced
    PolicyUpdated {
        /// Policy now in force
        policy: PolicyConfig,
        /// Command time
        at: Timestamp,
    },
}

impl CustodyEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            CustodyEvent::AdminAdded { .. } => "AdminAdded",
            CustodyEvent::AdminRemoved { .. } => "AdminRemoved",
            CustodyEvent::ProducerAdded { .. } => "ProducerAdded",
            CustodyEvent::ProducerRemoved { .. } => "ProducerRemoved",
            CustodyEvent::ResellerAdded { .. } => "ResellerAdded",
            CustodyEvent::ResellerRemoved { .. } => "ResellerRemoved",
            CustodyEvent::ResellerCapChanged { .. } => "ResellerCapChanged",
            CustodyEvent::AccountLabelled { .. } => "AccountLabelled",
            CustodyEvent::Produced { .. } => "Produced",
            CustodyEvent::Transferred { .. } => "Transferred",
            CustodyEvent::BatchExpired { .. } => "BatchExpired",
            CustodyEvent::AbusiveStorageDetected { .. } => "AbusiveStorageDetected",
            CustodyEvent::QuantityOverflowDetected { .. } => "QuantityOverflowDetected",
            CustodyEvent::ViolationResolved { .. } => "ViolationResolved",
            CustodyEvent::HolderBlacklisted { .. } => "HolderBlacklisted",
            CustodyEvent::HolderUnblacklisted { .. } => "HolderUnblacklisted",
            CustodyEvent::PolicyUpdated { .. } => "PolicyUpdated",
        }
    }

    /// Time of the command that emitted the event
    pub fn at(&self) -> Timestamp {
        match self {
            CustodyEvent::AdminAdded { at, .. }
            | CustodyEvent::AdminRemoved { at, .. }
            | CustodyEvent::ProducerAdded { at, .. }
            | CustodyEvent::ProducerRemoved { at, .. }
            | CustodyEvent::ResellerAdded { at, .. }
            | CustodyEvent::ResellerRemoved { at, .. }
            | CustodyEvent::ResellerCapChanged { at, .. }
            | CustodyEvent::AccountLabelled { at, .. }
            | CustodyEvent::Produced { at, .. }
            | CustodyEvent::Transferred { at, .. }
            | CustodyEvent::BatchExpired { at, .. }
            | CustodyEvent::AbusiveStorageDetected { at, .. }
            | CustodyEvent::QuantityOverflowDetected { at, .. }
            | CustodyEvent::ViolationResolved { at, .. }
            | CustodyEvent::HolderBlacklisted { at, .. }
            | CustodyEvent::HolderUnblacklisted { at, .. }
            | CustodyEvent::PolicyUpdated { at, .. } => *at,
        }
    }

    /// True for the two violation detection events
    pub fn is_detection(&self) -> bool {
        matches!(
            self,
            CustodyEvent::AbusiveStorageDetected { .. }
                | CustodyEvent::QuantityOverflowDetected { .. }
        )
    }
}

/// Committed, sealed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the journal (starts at 0)
    pub sequence: u64,

    /// Unique event ID (UUIDv7 for time-ordering)
    pub event_id: Uuid,

    /// Event payload
    pub event: CustodyEvent,

    /// Hash of the previous record
    pub prev_hash: [u8; 32],

    /// Hash of this record
    pub hash: [u8; 32],
}

impl EventRecord {
    /// Seal `event` at `sequence`, chaining it to `prev_hash`
    pub fn seal(sequence: u64, prev_hash: [u8; 32], event: CustodyEvent) -> Result<Self> {
        let hash = record_hash(sequence, &prev_hash, &event)?;
        Ok(Self {
            sequence,
            event_id: Uuid::now_v7(),
            event,
            prev_hash,
            hash,
        })
    }

    /// Recompute the hash and compare
    pub fn verify(&self) -> Result<bool> {
        Ok(record_hash(self.sequence, &self.prev_hash, &self.event)? == self.hash)
    }
}

/// Position of the journal head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    /// Sequence the next record receives
    pub next_sequence: u64,
    /// Hash of the last record
    pub last_hash: [u8; 32],
}

impl Default for ChainHead {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            last_hash: GENESIS_HASH,
        }
    }
}

impl ChainHead {
    /// Seal `events` in order, returning the records and the advanced head
    pub fn seal_all(self, events: Vec<CustodyEvent>) -> Result<(Vec<EventRecord>, ChainHead)> {
        let mut head = self;
        let mut records = Vec::with_capacity(events.len());

        for event in events {
            let record = EventRecord::seal(head.next_sequence, head.last_hash, event)?;
            head = ChainHead {
                next_sequence: head.next_sequence + 1,
                last_hash: record.hash,
            };
            records.push(record);
        }

        Ok((records, head))
    }
}

/// SHA-256(sequence || prev_hash || bincode(event))
fn record_hash(sequence: u64, prev_hash: &[u8; 32], event: &CustodyEvent) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_be_bytes());
    hasher.update(prev_hash);
    hasher.update(bincode::serialize(event)?);
    Ok(hasher.finalize().into())
}

/// Verify that `records` form an unbroken chain starting after `prev_hash`
pub fn verify_chain(records: &[EventRecord], mut prev_hash: [u8; 32]) -> Result<()> {
    let mut expected_sequence = records.first().map(|r| r.sequence);

    for record in records {
        if Some(record.sequence) != expected_sequence {
            return Err(Error::InvariantViolation(format!(
                "journal gap before sequence {}",
                record.sequence
            )));
        }
        if record.prev_hash != prev_hash {
            return Err(Error::InvariantViolation(format!(
                "record {} does not link to its predecessor",
                record.sequence
            )));
        }
        if !record.verify()? {
            return Err(Error::InvariantViolation(format!(
                "record {} hash mismatch",
                record.sequence
            )));
        }
        prev_hash = record.hash;
        expected_sequence = Some(record.sequence + 1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn produced(quantity: u64) -> CustodyEvent {
        CustodyEvent::Produced {
            producer: Address::from_low_u64(2),
            batch_id: BatchId(1),
            quantity,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_seal_links_records() {
        let (records, head) = ChainHead::default()
            .seal_all(vec![produced(10), produced(20), produced(30)])
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(head.next_sequence, 3);
        assert_eq!(head.last_hash, records[2].hash);
        assert_eq!(records[0].prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
        verify_chain(&records, GENESIS_HASH).unwrap();
    }

    #[test]
    fn test_tampered_record_detected() {
        let (mut records, _) = ChainHead::default()
            .seal_all(vec![produced(10), produced(20)])
            .unwrap();

        records[1].event = produced(2_000);
        let err = verify_chain(&records, GENESIS_HASH).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_gap_detected() {
        let (records, _) = ChainHead::default()
            .seal_all(vec![produced(1), produced(2), produced(3)])
            .unwrap();

        let gapped = vec![records[0].clone(), records[2].clone()];
        assert!(verify_chain(&gapped, GENESIS_HASH).is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(produced(1).name(), "Produced");
        assert!(!produced(1).is_detection());
    }
}
