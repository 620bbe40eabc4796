//! Role registry
//!
//! Owns the exclusive role of every known account, the reseller caps carried
//! inside [`Role::Reseller`], and the directory counters. Every assignment
//! overwrites the previous role; removals reset to [`Role::None`]. Accounts are
//! never forgotten once seen.

use crate::events::CustodyEvent;
use crate::types::{Address, Role, RoleKind, Timestamp};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Reject the zero address
pub fn validate_address(address: Address) -> Result<()> {
    if address.is_zero() {
        return Err(Error::InvalidInput("zero address".to_string()));
    }
    Ok(())
}

/// Per-account roles and capability caps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleRegistry {
    roles: BTreeMap<Address, Role>,
    labels: BTreeMap<Address, String>,
    total_admins: u64,
    total_producers: u64,
    total_resellers: u64,
}

impl RoleRegistry {
    /// Registry with a single admin
    pub fn genesis(admin: Address) -> Result<Self> {
        validate_address(admin)?;
        let mut registry = Self::default();
        registry.roles.insert(admin, Role::Admin);
        registry.total_admins = 1;
        Ok(registry)
    }

    /// Rebuild from persisted roles and labels, recounting the directory
    pub fn from_parts(roles: BTreeMap<Address, Role>, labels: BTreeMap<Address, String>) -> Self {
        let count = |kind: RoleKind| roles.values().filter(|r| r.kind() == kind).count() as u64;
        Self {
            total_admins: count(RoleKind::Admin),
            total_producers: count(RoleKind::Producer),
            total_resellers: count(RoleKind::Reseller),
            roles,
            labels,
        }
    }

    /// Role entry as stored (`None` for an account never seen)
    pub fn stored_role(&self, account: Address) -> Option<Role> {
        self.roles.get(&account).copied()
    }

    // Queries

    /// Current role (None for unknown accounts)
    pub fn role_of(&self, account: Address) -> Role {
        self.roles.get(&account).copied().unwrap_or_default()
    }

    /// Is admin
    pub fn is_admin(&self, account: Address) -> bool {
        self.role_of(account) == Role::Admin
    }

    /// Is producer
    pub fn is_producer(&self, account: Address) -> bool {
        self.role_of(account) == Role::Producer
    }

    /// Is reseller
    pub fn is_reseller(&self, account: Address) -> bool {
        self.role_of(account).kind() == RoleKind::Reseller
    }

    /// Reseller cap (0 for non-resellers)
    pub fn max_quantity(&self, account: Address) -> u64 {
        self.role_of(account).max_quantity()
    }

    /// Display label
    pub fn label(&self, account: Address) -> Option<&str> {
        self.labels.get(&account).map(String::as_str)
    }

    /// Number of admins
    pub fn total_admins(&self) -> u64 {
        self.total_admins
    }

    /// Number of producers
    pub fn total_producers(&self) -> u64 {
        self.total_producers
    }

    /// Number of resellers
    pub fn total_resellers(&self) -> u64 {
        self.total_resellers
    }

    /// Accounts holding a role of `kind`, sorted by address
    pub fn list(&self, kind: RoleKind) -> Vec<Address> {
        self.roles
            .iter()
            .filter(|(_, role)| role.kind() == kind)
            .map(|(address, _)| *address)
            .collect()
    }

    /// Fail with `Unauthorized` unless `caller` is an admin
    pub fn require_admin(&self, caller: Address) -> Result<()> {
        if !self.is_admin(caller) {
            return Err(Error::Unauthorized(format!("{} is not an admin", caller)));
        }
        Ok(())
    }

    // Commands (admin only)

    /// Grant Admin
    pub fn add_admin(
        &mut self,
        caller: Address,
        account: Address,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        self.transition(account, Role::Admin, at)
    }

    /// Revoke Admin
    pub fn remove_admin(
        &mut self,
        caller: Address,
        account: Address,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        self.require_kind(account, RoleKind::Admin)?;
        self.transition(account, Role::None, at)
    }

    /// Grant Producer
    pub fn set_producer(
        &mut self,
        caller: Address,
        account: Address,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        self.transition(account, Role::Producer, at)
    }

    /// Revoke Producer (already produced batches are unaffected)
    pub fn remove_producer(
        &mut self,
        caller: Address,
        account: Address,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        self.require_kind(account, RoleKind::Producer)?;
        self.transition(account, Role::None, at)
    }

    /// Grant Reseller with a cap
    pub fn set_reseller(
        &mut self,
        caller: Address,
        account: Address,
        max_quantity: u64,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        validate_cap(max_quantity)?;
        self.transition(account, Role::Reseller { max_quantity }, at)
    }

    /// Revoke Reseller
    pub fn remove_reseller(
        &mut self,
        caller: Address,
        account: Address,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        self.require_kind(account, RoleKind::Reseller)?;
        self.transition(account, Role::None, at)
    }

    /// Change an existing reseller's cap
    pub fn change_max_quantity(
        &mut self,
        caller: Address,
        account: Address,
        max_quantity: u64,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;
        validate_cap(max_quantity)?;
        self.require_kind(account, RoleKind::Reseller)?;
        self.transition(account, Role::Reseller { max_quantity }, at)
    }

    /// Set (or clear, with an empty label) an account's display label
    pub fn label_account(
        &mut self,
        caller: Address,
        account: Address,
        label: &str,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        self.require_admin(caller)?;
        validate_address(account)?;

        let label = label.trim();
        let label = if label.is_empty() {
            self.labels.remove(&account);
            None
        } else {
            self.labels.insert(account, label.to_string());
            Some(label.to_string())
        };

        Ok(vec![CustodyEvent::AccountLabelled { account, label, at }])
    }

    /// Recount roles and compare with the stored counters
    pub fn check_counters(&self) -> Result<()> {
        let admins = self.list(RoleKind::Admin).len() as u64;
        let producers = self.list(RoleKind::Producer).len() as u64;
        let resellers = self.list(RoleKind::Reseller).len() as u64;

        if (admins, producers, resellers)
            != (self.total_admins, self.total_producers, self.total_resellers)
        {
            return Err(Error::InvariantViolation(format!(
                "role counters ({}, {}, {}) disagree with roles ({}, {}, {})",
                self.total_admins,
                self.total_producers,
                self.total_resellers,
                admins,
                producers,
                resellers
            )));
        }
        Ok(())
    }

    fn require_kind(&self, account: Address, kind: RoleKind) -> Result<()> {
        let current = self.role_of(account).kind();
        if current != kind {
            return Err(Error::InvalidInput(format!(
                "{} is not a {} (role: {})",
                account, kind, current
            )));
        }
        Ok(())
    }

    /// Move `account` to `next`, keeping counters in step and refusing to
    /// drop the last admin
    fn transition(
        &mut self,
        account: Address,
        next: Role,
        at: Timestamp,
    ) -> Result<Vec<CustodyEvent>> {
        let previous = self.role_of(account);
        if previous == next {
            return Ok(Vec::new());
        }

        if previous == Role::Admin && next != Role::Admin && self.total_admins == 1 {
            return Err(Error::InvalidInput(format!(
                "{} is the last admin",
                account
            )));
        }

        let mut events = Vec::with_capacity(2);

        match (previous, next) {
            (Role::Reseller { max_quantity: old }, Role::Reseller { max_quantity }) => {
                events.push(CustodyEvent::ResellerCapChanged {
                    account,
                    previous: old,
                    max_quantity,
                    at,
                });
            }
            _ => {
                match previous {
                    Role::None => {}
                    Role::Admin => {
                        self.total_admins -= 1;
                        events.push(CustodyEvent::AdminRemoved { account, at });
                    }
                    Role::Producer => {
                        self.total_producers -= 1;
                        events.push(CustodyEvent::ProducerRemoved { account, at });
                    }
                    Role::Reseller { .. } => {
                        self.total_resellers -= 1;
                        events.push(CustodyEvent::ResellerRemoved { account, at });
                    }
                }
                match next {
                    Role::None => {}
                    Role::Admin => {
                        self.total_admins += 1;
                        events.push(CustodyEvent::AdminAdded { account, at });
                    }
                    Role::Producer => {
                        self.total_producers += 1;
                        events.push(CustodyEvent::ProducerAdded { account, at });
                    }
                    Role::Reseller { max_quantity } => {
                        self.total_resellers += 1;
                        events.push(CustodyEvent::ResellerAdded {
                            account,
                            max_quantity,
                            at,
                        });
                    }
                }
            }
        }

        self.roles.insert(account, next);

        tracing::info!(
            account = %account,
            from = %previous.kind(),
            to = %next.kind(),
            "Role changed"
        );

        Ok(events)
    }
}

fn validate_cap(max_quantity: u64) -> Result<()> {
    if max_quantity == 0 {
        return Err(Error::InvalidInput(
            "reseller max quantity must be positive".to_string(),
        ));
    }
    Ok(())
}
