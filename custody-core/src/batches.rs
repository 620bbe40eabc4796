//! Batch store
//!
//! Owns every batch and its custody chain. Batches are never deleted: a full
//! transfer moves ownership of the record, a partial transfer splits the moved
//! amount into a new record that inherits producer and production time and
//! points back at its parent.

use crate::types::{Address, Batch, BatchId, Timestamp};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// All batches plus a per-owner index in acquisition order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStore {
    batches: BTreeMap<BatchId, Batch>,
    by_owner: BTreeMap<Address, Vec<BatchId>>,
    next_id: u64,
}

impl Default for BatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStore {
    /// Empty store; the first batch gets id 1
    pub fn new() -> Self {
        Self {
            batches: BTreeMap::new(),
            by_owner: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted batches and per-owner acquisition order
    pub fn from_parts(
        batches: BTreeMap<BatchId, Batch>,
        by_owner: BTreeMap<Address, Vec<BatchId>>,
        next_id: u64,
    ) -> Self {
        Self {
            batches,
            by_owner,
            next_id,
        }
    }

    /// Owner index entry as stored (`None` for an account that never owned a batch)
    pub fn stored_owned(&self, owner: Address) -> Option<&[BatchId]> {
        self.by_owner.get(&owner).map(Vec::as_slice)
    }

    /// Id the next batch will receive
    pub fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_id)
    }

    /// Number of batch records
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// No batch created yet
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Get batch by ID
    pub fn get(&self, id: BatchId) -> Result<&Batch> {
        self.batches.get(&id).ok_or(Error::BatchNotFound(id))
    }

    /// All batches in id order
    pub fn iter(&self) -> impl Iterator<Item = &Batch> {
        self.batches.values()
    }

    /// Batches owned by `owner`, in acquisition order
    pub fn owned_by(&self, owner: Address) -> &[BatchId] {
        self.by_owner.get(&owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recently acquired batch of `owner`
    pub fn latest_owned(&self, owner: Address) -> Option<BatchId> {
        self.owned_by(owner).last().copied()
    }

    /// Sum of quantities of batches owned by `owner`
    pub fn owned_quantity(&self, owner: Address) -> u64 {
        self.owned_by(owner)
            .iter()
            .filter_map(|id| self.batches.get(id))
            .map(|batch| batch.quantity)
            .sum()
    }

    /// Every address that owns at least one batch
    pub fn owners(&self) -> impl Iterator<Item = Address> + '_ {
        self.by_owner
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(owner, _)| *owner)
    }

    /// Create a batch owned by its producer
    pub fn create_batch(
        &mut self,
        producer: Address,
        quantity: u64,
        now: Timestamp,
    ) -> Result<BatchId> {
        if quantity == 0 {
            return Err(Error::InvalidInput("batch quantity must be positive".to_string()));
        }

        let id = self.allocate_id()?;
        self.insert(Batch {
            id,
            producer,
            quantity,
            created_at: now,
            current_owner: producer,
            expired: false,
            parent: None,
        });

        tracing::debug!(batch_id = %id, producer = %producer, quantity, "Batch created");

        Ok(id)
    }

    /// Move `amount` of `batch_id` from `from` to `to`
    ///
    /// Returns the id of the batch `to` now owns: the same id when the whole
    /// remainder moves, a freshly split batch otherwise.
    pub fn transfer_ownership(
        &mut self,
        batch_id: BatchId,
        from: Address,
        to: Address,
        amount: u64,
    ) -> Result<BatchId> {
        if amount == 0 {
            return Err(Error::InvalidInput("transfer amount must be positive".to_string()));
        }

        let batch = self.get(batch_id)?.clone();
        if batch.current_owner != from {
            return Err(Error::Unauthorized(format!(
                "{} does not own batch {}",
                from, batch_id
            )));
        }
        if amount > batch.quantity {
            return Err(Error::InsufficientBalance {
                requested: amount,
                available: batch.quantity,
            });
        }

        if amount == batch.quantity {
            self.detach(from, batch_id);
            if let Some(batch) = self.batches.get_mut(&batch_id) {
                batch.current_owner = to;
            }
            self.by_owner.entry(to).or_default().push(batch_id);
            return Ok(batch_id);
        }

        let split = Batch {
            id: self.allocate_id()?,
            producer: batch.producer,
            quantity: amount,
            created_at: batch.created_at,
            current_owner: to,
            expired: batch.expired,
            parent: Some(batch_id),
        };
        let split_id = split.id;

        if let Some(source) = self.batches.get_mut(&batch_id) {
            source.quantity -= amount;
        }
        self.insert(split);

        tracing::debug!(
            source_batch_id = %batch_id,
            batch_id = %split_id,
            amount,
            "Batch split on partial transfer"
        );

        Ok(split_id)
    }

    /// Flag `batch_id` as expired once it is older than `max_age`
    ///
    /// Returns true only when the flag flips.
    pub fn mark_expired(
        &mut self,
        batch_id: BatchId,
        now: Timestamp,
        max_age: chrono::Duration,
    ) -> Result<bool> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(Error::BatchNotFound(batch_id))?;

        if batch.expired || batch.age(now) <= max_age {
            return Ok(false);
        }

        batch.expired = true;
        Ok(true)
    }

    fn allocate_id(&mut self) -> Result<BatchId> {
        let id = BatchId(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| Error::InvalidInput("batch id space exhausted".to_string()))?;
        Ok(id)
    }

    fn insert(&mut self, batch: Batch) {
        self.by_owner
            .entry(batch.current_owner)
            .or_default()
            .push(batch.id);
        self.batches.insert(batch.id, batch);
    }

    fn detach(&mut self, owner: Address, batch_id: BatchId) {
        if let Some(ids) = self.by_owner.get_mut(&owner) {
            ids.retain(|id| *id != batch_id);
        }
    }
}
