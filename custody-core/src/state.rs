//! Process-wide custody state
//!
//! One aggregate holding every component plus the global counters, passed
//! through the single writer. [`CustodyState::execute`] routes a command to
//! the owning component and then re-evaluates violations for the accounts it
//! touched. A rejected command leaves the state as it was; callers that also
//! need to discard a command after it succeeds (a failed commit) run it on a
//! clone and keep the clone only on success (see `actor`).
//!
//! Components sit behind `Arc` and are copied on first write, so a clone is
//! cheap and a command only pays for the components it mutates.

use crate::batches::BatchStore;
use crate::blacklist::BlacklistGuard;
use crate::changes::{AccountRecord, StateMeta};
use crate::command::{Command, Outcome};
use crate::config::PolicyConfig;
use crate::events::CustodyEvent;
use crate::roles::RoleRegistry;
use crate::stock::StockLedger;
use crate::types::{
    AccountInfo, Address, Batch, BatchId, Role, RoleKind, Timestamp, Violation, ViolationId,
};
use crate::violations::{Inputs, ScanReport, ViolationEngine};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Every component of the custody engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyState {
    policy: PolicyConfig,
    roles: Arc<RoleRegistry>,
    batches: Arc<BatchStore>,
    stock: Arc<StockLedger>,
    violations: Arc<ViolationEngine>,
    blacklist: Arc<BlacklistGuard>,

    /// Runtime switch from configuration, never persisted
    fault_injection: bool,
}

impl CustodyState {
    /// Fresh state with one admin
    pub fn genesis(admin: Address, policy: PolicyConfig) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            roles: Arc::new(RoleRegistry::genesis(admin)?),
            batches: Arc::new(BatchStore::new()),
            stock: Arc::new(StockLedger::new()),
            violations: Arc::new(ViolationEngine::new()),
            blacklist: Arc::new(BlacklistGuard::new()),
            fault_injection: false,
        })
    }

    /// Rebuild from persisted entities
    pub fn restore(
        meta: StateMeta,
        accounts: impl IntoIterator<Item = AccountRecord>,
        batches: impl IntoIterator<Item = Batch>,
        violations: impl IntoIterator<Item = Violation>,
    ) -> Result<Self> {
        meta.policy.validate()?;

        let mut roles = BTreeMap::new();
        let mut labels = BTreeMap::new();
        let mut balances = BTreeMap::new();
        let mut by_owner = BTreeMap::new();
        let mut blacklisted = BTreeSet::new();

        for account in accounts {
            let address = account.address;
            if let Some(role) = account.role {
                roles.insert(address, role);
            }
            if let Some(label) = account.label {
                labels.insert(address, label);
            }
            if let Some(balance) = account.balance {
                balances.insert(address, balance);
            }
            if let Some(owned) = account.owned_batches {
                by_owner.insert(address, owned);
            }
            if account.blacklisted {
                blacklisted.insert(address);
            }
        }

        let batches = batches.into_iter().map(|b| (b.id, b)).collect();
        let violations = violations.into_iter().map(|v| (v.id, v)).collect();

        Ok(Self {
            policy: meta.policy,
            roles: Arc::new(RoleRegistry::from_parts(roles, labels)),
            batches: Arc::new(BatchStore::from_parts(
                batches,
                by_owner,
                meta.next_batch_id.0,
            )),
            stock: Arc::new(StockLedger::from_parts(balances)),
            violations: Arc::new(ViolationEngine::from_parts(
                violations,
                meta.next_violation_id.0,
            )),
            blacklist: Arc::new(BlacklistGuard::from_parts(blacklisted)),
            fault_injection: false,
        })
    }

    /// Allow or refuse `TriggerFakeViolation`
    pub fn with_fault_injection(mut self, enabled: bool) -> Self {
        self.fault_injection = enabled;
        self
    }

    /// Apply `command` issued by `caller` at `at`
    ///
    /// On error the state may be partially modified; see the module docs.
    pub fn execute(
        &mut self,
        caller: Address,
        at: Timestamp,
        command: &Command,
    ) -> Result<(Outcome, Vec<CustodyEvent>)> {
        let mut events = Vec::new();

        let outcome = match command {
            Command::AddAdmin { account } => {
                events.extend(Arc::make_mut(&mut self.roles).add_admin(caller, *account, at)?);
                Outcome::Applied
            }
            Command::RemoveAdmin { account } => {
                events.extend(Arc::make_mut(&mut self.roles).remove_admin(caller, *account, at)?);
                Outcome::Applied
            }
            Command::SetProducer { account } => {
                events.extend(Arc::make_mut(&mut self.roles).set_producer(caller, *account, at)?);
                Outcome::Applied
            }
            Command::RemoveProducer { account } => {
                events.extend(Arc::make_mut(&mut self.roles).remove_producer(caller, *account, at)?);
                Outcome::Applied
            }
            Command::SetReseller {
                account,
                max_quantity,
            } => {
                events.extend(Arc::make_mut(&mut self.roles).set_reseller(caller, *account, *max_quantity, at)?);
                self.check_quantity_overflow(*account, at, &mut events);
                Outcome::Applied
            }
            Command::RemoveReseller { account } => {
                events.extend(Arc::make_mut(&mut self.roles).remove_reseller(caller, *account, at)?);
                Outcome::Applied
            }
            Command::ChangeMaxQuantityReseller {
                account,
                max_quantity,
            } => {
                events.extend(
                    Arc::make_mut(&mut self.roles)
                        .change_max_quantity(caller, *account, *max_quantity, at)?,
                );
                self.check_quantity_overflow(*account, at, &mut events);
                Outcome::Applied
            }
            Command::LabelAccount { account, label } => {
                events.extend(Arc::make_mut(&mut self.roles).label_account(caller, *account, label, at)?);
                Outcome::Applied
            }
            Command::UpdatePolicy { policy } => {
                self.roles.require_admin(caller)?;
                policy.validate()?;
                self.policy = policy.clone();
                events.push(CustodyEvent::PolicyUpdated {
                    policy: policy.clone(),
                    at,
                });
                tracing::info!(by = %caller, ?policy, "Policy updated");
                Outcome::Applied
            }
            Command::Produce { quantity } => {
                let batch_id = Arc::make_mut(&mut self.stock).produce(
                    &self.roles,
                    &self.blacklist,
                    Arc::make_mut(&mut self.batches),
                    caller,
                    *quantity,
                    at,
                    &mut events,
                )?;
                self.check_storage_threshold(caller, at, &mut events);
                Outcome::Produced { batch_id }
            }
            Command::TransferStock {
                to,
                quantity,
                batch_id,
            } => {
                let received = Arc::make_mut(&mut self.stock).transfer_stock(
                    &self.roles,
                    &self.blacklist,
                    Arc::make_mut(&mut self.batches),
                    caller,
                    *to,
                    *quantity,
                    *batch_id,
                    at,
                    &mut events,
                )?;
                self.check_quantity_overflow(*to, at, &mut events);
                self.check_storage_threshold(*to, at, &mut events);
                Outcome::Transferred { batch_id: received }
            }
            Command::ScanForAbusiveStorage => {
                let inputs = Inputs {
                    roles: &self.roles,
                    stock: &self.stock,
                    policy: &self.policy,
                };
                let report = if self.violations.scan_is_idle(inputs, &self.batches, at) {
                    // Read-only: components stay shared with the committed state
                    ScanReport {
                        nearing: ViolationEngine::batches_nearing_violation(
                            &self.batches,
                            &self.policy,
                            self.policy.near_expiry_window(),
                            at,
                        ),
                        ..ScanReport::default()
                    }
                } else {
                    Arc::make_mut(&mut self.violations).scan_for_abusive_storage(
                        inputs,
                        Arc::make_mut(&mut self.batches),
                        Arc::make_mut(&mut self.blacklist),
                        at,
                        &mut events,
                    )
                };
                Outcome::Scanned(report)
            }
            Command::ResolveViolation { violation_id } => {
                let inputs = Inputs {
                    roles: &self.roles,
                    stock: &self.stock,
                    policy: &self.policy,
                };
                Arc::make_mut(&mut self.violations)
                    .resolve(inputs, caller, *violation_id, at, &mut events)?;
                Outcome::Applied
            }
            Command::BlacklistManually { holder } => {
                let active = self.violations.active_count(*holder);
                Arc::make_mut(&mut self.blacklist)
                    .blacklist_manually(&self.roles, caller, *holder, active, at, &mut events)?;
                Outcome::Applied
            }
            Command::RemoveFromBlacklist { holder } => {
                Arc::make_mut(&mut self.blacklist)
                    .remove_from_blacklist(&self.roles, caller, *holder, at, &mut events)?;
                Outcome::Applied
            }
            Command::TriggerFakeViolation {
                holder,
                batch_id,
                kind,
            } => {
                self.roles.require_admin(caller)?;
                if !self.fault_injection {
                    return Err(Error::Unauthorized(
                        "fault injection is disabled".to_string(),
                    ));
                }
                let inputs = Inputs {
                    roles: &self.roles,
                    stock: &self.stock,
                    policy: &self.policy,
                };
                let violation_id = Arc::make_mut(&mut self.violations).inject(
                    inputs,
                    &self.batches,
                    Arc::make_mut(&mut self.blacklist),
                    caller,
                    *holder,
                    *batch_id,
                    *kind,
                    at,
                    &mut events,
                )?;
                Outcome::ViolationOpened { violation_id }
            }
        };

        Ok((outcome, events))
    }

    fn check_quantity_overflow(
        &mut self,
        holder: Address,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) {
        let inputs = Inputs {
            roles: &self.roles,
            stock: &self.stock,
            policy: &self.policy,
        };
        if self
            .violations
            .overflow_due(inputs, &self.batches, holder)
            .is_none()
        {
            return;
        }
        Arc::make_mut(&mut self.violations).check_quantity_overflow(
            inputs,
            &self.batches,
            Arc::make_mut(&mut self.blacklist),
            holder,
            at,
            events,
        );
    }

    fn check_storage_threshold(
        &mut self,
        holder: Address,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) {
        let inputs = Inputs {
            roles: &self.roles,
            stock: &self.stock,
            policy: &self.policy,
        };
        if self
            .violations
            .threshold_due(inputs, &self.batches, holder)
            .is_none()
        {
            return;
        }
        Arc::make_mut(&mut self.violations).check_storage_threshold(
            inputs,
            &self.batches,
            Arc::make_mut(&mut self.blacklist),
            holder,
            at,
            events,
        );
    }

    // Queries

    /// Active violation policy
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Role of `account`
    pub fn role_of(&self, account: Address) -> Role {
        self.roles.role_of(account)
    }

    /// Is admin
    pub fn is_admin(&self, account: Address) -> bool {
        self.roles.is_admin(account)
    }

    /// Is producer
    pub fn is_producer(&self, account: Address) -> bool {
        self.roles.is_producer(account)
    }

    /// Is reseller
    pub fn is_reseller(&self, account: Address) -> bool {
        self.roles.is_reseller(account)
    }

    /// Aggregate balance
    pub fn stock_balance(&self, account: Address) -> u64 {
        self.stock.balance(account)
    }

    /// Reseller cap (0 for non-resellers)
    pub fn max_quantity_per_reseller(&self, account: Address) -> u64 {
        self.roles.max_quantity(account)
    }

    /// Blacklist status of one holder
    pub fn is_blacklisted(&self, holder: Address) -> bool {
        self.blacklist.is_blacklisted(holder)
    }

    /// Every blacklisted holder
    pub fn blacklisted_holders(&self) -> Vec<Address> {
        self.blacklist.holders()
    }

    /// Batches owned by `owner`, in acquisition order
    pub fn batches_owned_by(&self, owner: Address) -> Vec<BatchId> {
        self.batches.owned_by(owner).to_vec()
    }

    /// Batch by id
    pub fn batch(&self, id: BatchId) -> Result<&Batch> {
        self.batches.get(id)
    }

    /// Unresolved violations of `holder`
    pub fn active_violations_by_holder(&self, holder: Address) -> Vec<Violation> {
        self.violations
            .active_by_holder(holder)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Violation by id
    pub fn violation(&self, id: ViolationId) -> Result<&Violation> {
        self.violations.get(id)
    }

    /// Batches within `window` of expiry at `now`
    pub fn batches_nearing_violation(&self, now: Timestamp, window: chrono::Duration) -> Vec<BatchId> {
        ViolationEngine::batches_nearing_violation(&self.batches, &self.policy, window, now)
    }

    /// Number of producers
    pub fn total_producers(&self) -> u64 {
        self.roles.total_producers()
    }

    /// Number of resellers
    pub fn total_resellers(&self) -> u64 {
        self.roles.total_resellers()
    }

    /// Violations ever opened
    pub fn total_violations(&self) -> u64 {
        self.violations.total()
    }

    /// Id the next batch will receive
    pub fn next_batch_id(&self) -> BatchId {
        self.batches.next_batch_id()
    }

    /// Producers, sorted by address
    pub fn list_producers(&self) -> Vec<Address> {
        self.roles.list(RoleKind::Producer)
    }

    /// Resellers, sorted by address
    pub fn list_resellers(&self) -> Vec<Address> {
        self.roles.list(RoleKind::Reseller)
    }

    /// Admins, sorted by address
    pub fn list_admins(&self) -> Vec<Address> {
        self.roles.list(RoleKind::Admin)
    }

    /// Aggregate view of `address`
    pub fn account_info(&self, address: Address) -> AccountInfo {
        let role = self.roles.role_of(address);
        AccountInfo {
            address,
            label: self.roles.label(address).map(str::to_string),
            role,
            stock_balance: self.stock.balance(address),
            max_quantity: role.max_quantity(),
            blacklisted: self.blacklist.is_blacklisted(address),
            batch_count: self.batches.owned_by(address).len(),
            active_violations: self.violations.active_count(address),
        }
    }

    /// Number of batch records (live gauge)
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    // Persistence

    /// Policy and id counters
    pub fn meta(&self) -> StateMeta {
        StateMeta {
            policy: self.policy.clone(),
            next_batch_id: self.batches.next_batch_id(),
            next_violation_id: self.violations.next_violation_id(),
        }
    }

    /// Persisted view of `address`, `None` when no component knows it
    pub fn account_record(&self, address: Address) -> Option<AccountRecord> {
        let record = AccountRecord {
            address,
            role: self.roles.stored_role(address),
            label: self.roles.label(address).map(str::to_string),
            balance: self.stock.stored_balance(address),
            owned_batches: self.batches.stored_owned(address).map(<[BatchId]>::to_vec),
            blacklisted: self.blacklist.is_blacklisted(address),
        };
        (!record.is_empty()).then_some(record)
    }

    /// Verify cross-component invariants
    ///
    /// - balances equal the sum of owned batches
    /// - role counters match the roles
    /// - every reseller above its cap has an open overflow violation
    pub fn check_invariants(&self) -> Result<()> {
        self.stock.check_conservation(&self.batches)?;
        self.roles.check_counters()?;
        self.violations
            .check_overflow_coverage(&self.roles, &self.stock)?;

        for batch in self.batches.iter() {
            if batch.quantity == 0 {
                return Err(Error::InvariantViolation(format!(
                    "batch {} has zero quantity",
                    batch.id
                )));
            }
        }

        Ok(())
    }
}
