//! Violation engine
//!
//! Detects two classes of breach:
//!
//! - **Excessive storage**: a batch held longer than the storage duration
//!   (found by the scan), or a holder whose balance exceeds the storage
//!   threshold (checked after stock arrives and on every scan).
//! - **Quantity overflow**: a reseller holding more than its cap (checked
//!   whenever a reseller's balance or cap changes).
//!
//! Detection never fails a command. Each newly opened violation is followed by
//! an auto-blacklist evaluation of its holder.
//!
//! # Idempotence
//!
//! - Age-based detection only visits batches not yet flagged expired.
//! - Threshold detection does not reopen while an unresolved excessive-storage
//!   violation exists for the same (holder, batch).
//! - At most one unresolved overflow per holder.

use crate::batches::BatchStore;
use crate::blacklist::BlacklistGuard;
use crate::config::PolicyConfig;
use crate::events::CustodyEvent;
use crate::roles::{validate_address, RoleRegistry};
use crate::stock::StockLedger;
use crate::types::{Address, BatchId, RoleKind, Timestamp, Violation, ViolationId, ViolationKind};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only components detection is built on
#[derive(Debug, Clone, Copy)]
pub struct Inputs<'a> {
    /// Roles and caps
    pub roles: &'a RoleRegistry,
    /// Balances
    pub stock: &'a StockLedger,
    /// Thresholds
    pub policy: &'a PolicyConfig,
}

/// Result of one storage scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Batches flagged expired by this scan
    pub expired: Vec<BatchId>,
    /// Violations opened by this scan
    pub opened: Vec<ViolationId>,
    /// Batches inside the near-expiry window (advisory, not persisted)
    pub nearing: Vec<BatchId>,
}

/// All violations, by id and by holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationEngine {
    violations: BTreeMap<ViolationId, Violation>,
    by_holder: BTreeMap<Address, Vec<ViolationId>>,
    next_id: u64,
}

impl Default for ViolationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ViolationEngine {
    /// Empty engine; the first violation gets id 1
    pub fn new() -> Self {
        Self {
            violations: BTreeMap::new(),
            by_holder: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted violations
    ///
    /// Ids grow monotonically, so id order is also per-holder opening order.
    pub fn from_parts(violations: BTreeMap<ViolationId, Violation>, next_id: u64) -> Self {
        let mut by_holder: BTreeMap<Address, Vec<ViolationId>> = BTreeMap::new();
        for violation in violations.values() {
            by_holder.entry(violation.holder).or_default().push(violation.id);
        }
        Self {
            violations,
            by_holder,
            next_id,
        }
    }

    /// Id the next violation will receive
    pub fn next_violation_id(&self) -> ViolationId {
        ViolationId(self.next_id)
    }

    // Queries

    /// Get violation by ID
    pub fn get(&self, id: ViolationId) -> Result<&Violation> {
        self.violations.get(&id).ok_or(Error::ViolationNotFound(id))
    }

    /// Violations ever opened
    pub fn total(&self) -> u64 {
        self.violations.len() as u64
    }

    /// Unresolved violations of `holder`, oldest first
    pub fn active_by_holder(&self, holder: Address) -> Vec<&Violation> {
        self.by_holder
            .get(&holder)
            .into_iter()
            .flatten()
            .filter_map(|id| self.violations.get(id))
            .filter(|v| v.is_active())
            .collect()
    }

    /// Number of unresolved violations of `holder`
    pub fn active_count(&self, holder: Address) -> usize {
        self.active_by_holder(holder).len()
    }

    /// Is there an unresolved violation of `kind` for `holder` (and `batch`, if given)
    pub fn has_active(&self, holder: Address, kind: ViolationKind, batch: Option<BatchId>) -> bool {
        self.active_by_holder(holder)
            .iter()
            .any(|v| v.kind == kind && batch.map_or(true, |b| v.batch_id == b))
    }

    /// Batches inside the window `(max - window, max]` of their storage life
    ///
    /// A negative window selects nothing; a window longer than the storage
    /// duration selects every unexpired batch still within that duration.
    pub fn batches_nearing_violation(
        batches: &BatchStore,
        policy: &PolicyConfig,
        window: chrono::Duration,
        now: Timestamp,
    ) -> Vec<BatchId> {
        if window < chrono::Duration::zero() {
            return Vec::new();
        }
        let max_age = policy.max_storage_duration();
        let window_start = max_age
            .checked_sub(&window)
            .unwrap_or_else(chrono::Duration::min_value);

        batches
            .iter()
            .filter(|batch| !batch.expired)
            .filter(|batch| {
                let age = batch.age(now);
                age > window_start && age <= max_age
            })
            .map(|batch| batch.id)
            .collect()
    }

    // Detection

    /// Batch an overflow violation would be opened against, if one is due
    ///
    /// Due when `holder` is a reseller above its cap without an open overflow.
    pub fn overflow_due(
        &self,
        inputs: Inputs<'_>,
        batches: &BatchStore,
        holder: Address,
    ) -> Option<BatchId> {
        if inputs.roles.role_of(holder).kind() != RoleKind::Reseller
            || inputs.stock.balance(holder) <= inputs.roles.max_quantity(holder)
            || self.has_active(holder, ViolationKind::QuantityOverflow, None)
        {
            return None;
        }
        // A positive balance implies at least one owned batch
        batches.latest_owned(holder)
    }

    /// Batch a storage-threshold violation would be opened against, if one is due
    pub fn threshold_due(
        &self,
        inputs: Inputs<'_>,
        batches: &BatchStore,
        holder: Address,
    ) -> Option<BatchId> {
        if inputs.stock.balance(holder) <= inputs.policy.storage_threshold {
            return None;
        }
        let batch_id = batches.latest_owned(holder)?;
        if self.has_active(holder, ViolationKind::ExcessiveStorage, Some(batch_id)) {
            return None;
        }
        Some(batch_id)
    }

    /// Open an overflow violation if `holder` is a reseller above its cap
    pub fn check_quantity_overflow(
        &mut self,
        inputs: Inputs<'_>,
        batches: &BatchStore,
        guard: &mut BlacklistGuard,
        holder: Address,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Option<ViolationId> {
        let batch_id = self.overflow_due(inputs, batches, holder)?;
        let balance = inputs.stock.balance(holder);
        let max_quantity = inputs.roles.max_quantity(holder);
        let id = self.open(holder, batch_id, ViolationKind::QuantityOverflow, at);

        events.push(CustodyEvent::QuantityOverflowDetected {
            violation_id: id,
            holder,
            batch_id,
            balance,
            max_quantity,
            at,
        });

        tracing::warn!(
            holder = %holder,
            batch_id = %batch_id,
            balance,
            max_quantity,
            violation_id = %id,
            "Quantity overflow detected"
        );

        self.after_open(inputs, guard, holder, at, events);
        Some(id)
    }

    /// Open an excessive-storage violation if `holder` is above the storage threshold
    pub fn check_storage_threshold(
        &mut self,
        inputs: Inputs<'_>,
        batches: &BatchStore,
        guard: &mut BlacklistGuard,
        holder: Address,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Option<ViolationId> {
        let batch_id = self.threshold_due(inputs, batches, holder)?;
        let balance = inputs.stock.balance(holder);
        let id = self.open(holder, batch_id, ViolationKind::ExcessiveStorage, at);
        events.push(CustodyEvent::AbusiveStorageDetected {
            violation_id: id,
            holder,
            batch_id,
            balance,
            at,
        });

        tracing::warn!(
            holder = %holder,
            batch_id = %batch_id,
            balance,
            threshold = inputs.policy.storage_threshold,
            violation_id = %id,
            "Storage threshold exceeded"
        );

        self.after_open(inputs, guard, holder, at, events);
        Some(id)
    }

    /// Nothing for a scan at `now` to expire or open
    pub fn scan_is_idle(&self, inputs: Inputs<'_>, batches: &BatchStore, now: Timestamp) -> bool {
        let max_age = inputs.policy.max_storage_duration();
        !batches
            .iter()
            .any(|batch| !batch.expired && batch.age(now) > max_age)
            && inputs
                .stock
                .holders()
                .all(|(holder, _)| self.threshold_due(inputs, batches, holder).is_none())
    }

    /// Expire stale batches, flag their holders, and re-check storage thresholds
    pub fn scan_for_abusive_storage(
        &mut self,
        inputs: Inputs<'_>,
        batches: &mut BatchStore,
        guard: &mut BlacklistGuard,
        now: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> ScanReport {
        let max_age = inputs.policy.max_storage_duration();
        let mut report = ScanReport {
            nearing: Self::batches_nearing_violation(
                batches,
                inputs.policy,
                inputs.policy.near_expiry_window(),
                now,
            ),
            ..ScanReport::default()
        };

        let candidates: Vec<(BatchId, Address)> = batches
            .iter()
            .filter(|batch| !batch.expired && batch.age(now) > max_age)
            .map(|batch| (batch.id, batch.current_owner))
            .collect();

        for (batch_id, holder) in candidates {
            // Candidates exist, so the lookup cannot miss
            if !batches.mark_expired(batch_id, now, max_age).unwrap_or(false) {
                continue;
            }
            report.expired.push(batch_id);
            events.push(CustodyEvent::BatchExpired {
                batch_id,
                holder,
                at: now,
            });

            if self.has_active(holder, ViolationKind::ExcessiveStorage, Some(batch_id)) {
                continue;
            }

            let id = self.open(holder, batch_id, ViolationKind::ExcessiveStorage, now);
            events.push(CustodyEvent::AbusiveStorageDetected {
                violation_id: id,
                holder,
                batch_id,
                balance: inputs.stock.balance(holder),
                at: now,
            });

            tracing::warn!(
                holder = %holder,
                batch_id = %batch_id,
                violation_id = %id,
                "Batch stored beyond maximum duration"
            );

            report.opened.push(id);
            self.after_open(inputs, guard, holder, now, events);
        }

        let holders: Vec<Address> = inputs.stock.holders().map(|(holder, _)| holder).collect();
        for holder in holders {
            if let Some(id) =
                self.check_storage_threshold(inputs, batches, guard, holder, now, events)
            {
                report.opened.push(id);
            }
        }

        tracing::debug!(
            expired = report.expired.len(),
            opened = report.opened.len(),
            nearing = report.nearing.len(),
            "Storage scan complete"
        );

        report
    }

    // Commands (admin only)

    /// Mark a violation resolved
    ///
    /// An overflow cannot be resolved while its reseller is still above the cap.
    pub fn resolve(
        &mut self,
        inputs: Inputs<'_>,
        caller: Address,
        id: ViolationId,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Result<()> {
        inputs.roles.require_admin(caller)?;

        let violation = self.get(id)?;
        if violation.resolved {
            return Err(Error::InvalidInput(format!("violation {} already resolved", id)));
        }

        let holder = violation.holder;
        if violation.kind == ViolationKind::QuantityOverflow
            && inputs.roles.is_reseller(holder)
            && inputs.stock.balance(holder) > inputs.roles.max_quantity(holder)
        {
            return Err(Error::InvalidInput(format!(
                "{} still holds {} above its cap of {}",
                holder,
                inputs.stock.balance(holder),
                inputs.roles.max_quantity(holder)
            )));
        }

        if let Some(violation) = self.violations.get_mut(&id) {
            violation.resolved = true;
            violation.resolved_at = Some(at);
        }

        events.push(CustodyEvent::ViolationResolved {
            violation_id: id,
            holder,
            at,
        });

        tracing::info!(violation_id = %id, holder = %holder, by = %caller, "Violation resolved");
        Ok(())
    }

    /// Diagnostic injection, bypassing detection and dedupe
    #[allow(clippy::too_many_arguments)]
    pub fn inject(
        &mut self,
        inputs: Inputs<'_>,
        batches: &BatchStore,
        guard: &mut BlacklistGuard,
        caller: Address,
        holder: Address,
        batch_id: BatchId,
        kind: ViolationKind,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Result<ViolationId> {
        inputs.roles.require_admin(caller)?;
        validate_address(holder)?;
        batches.get(batch_id)?;

        let id = self.open(holder, batch_id, kind, at);
        let balance = inputs.stock.balance(holder);

        events.push(match kind {
            ViolationKind::ExcessiveStorage => CustodyEvent::AbusiveStorageDetected {
                violation_id: id,
                holder,
                batch_id,
                balance,
                at,
            },
            ViolationKind::QuantityOverflow => CustodyEvent::QuantityOverflowDetected {
                violation_id: id,
                holder,
                batch_id,
                balance,
                max_quantity: inputs.roles.max_quantity(holder),
                at,
            },
        });

        tracing::warn!(violation_id = %id, holder = %holder, kind = %kind, by = %caller, "Violation injected");

        self.after_open(inputs, guard, holder, at, events);
        Ok(id)
    }

    /// Every reseller above its cap must have an unresolved overflow
    pub fn check_overflow_coverage(&self, roles: &RoleRegistry, stock: &StockLedger) -> Result<()> {
        for reseller in roles.list(RoleKind::Reseller) {
            if stock.balance(reseller) > roles.max_quantity(reseller)
                && !self.has_active(reseller, ViolationKind::QuantityOverflow, None)
            {
                return Err(Error::InvariantViolation(format!(
                    "reseller {} is above its cap without an open overflow violation",
                    reseller
                )));
            }
        }
        Ok(())
    }

    fn open(
        &mut self,
        holder: Address,
        batch_id: BatchId,
        kind: ViolationKind,
        at: Timestamp,
    ) -> ViolationId {
        let id = ViolationId(self.next_id);
        self.next_id += 1;

        self.violations.insert(
            id,
            Violation {
                id,
                holder,
                batch_id,
                kind,
                detected_at: at,
                resolved: false,
                resolved_at: None,
            },
        );
        self.by_holder.entry(holder).or_default().push(id);
        id
    }

    fn after_open(
        &self,
        inputs: Inputs<'_>,
        guard: &mut BlacklistGuard,
        holder: Address,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) {
        guard.evaluate_auto_blacklist(
            holder,
            self.active_count(holder),
            inputs.policy.violation_count_for_auto_blacklist,
            at,
            events,
        );
    }
}
