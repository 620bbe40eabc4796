//! Blacklist guard
//!
//! Holds the set of blacklisted holders. The set is consulted, not re-derived,
//! at every stock entry point; it changes only through automatic evaluation
//! after a new violation or through admin overrides.

use crate::events::CustodyEvent;
use crate::roles::{validate_address, RoleRegistry};
use crate::types::{Address, Timestamp};
use crate::{Error, Result};
use std::collections::BTreeSet;

/// Blacklisted holders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlacklistGuard {
    blacklisted: BTreeSet<Address>,
}

impl BlacklistGuard {
    /// Empty guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted holders
    pub fn from_parts(blacklisted: BTreeSet<Address>) -> Self {
        Self { blacklisted }
    }

    /// Blacklist status
    pub fn is_blacklisted(&self, holder: Address) -> bool {
        self.blacklisted.contains(&holder)
    }

    /// All blacklisted holders, sorted
    pub fn holders(&self) -> Vec<Address> {
        self.blacklisted.iter().copied().collect()
    }

    /// Number of blacklisted holders
    pub fn len(&self) -> usize {
        self.blacklisted.len()
    }

    /// No holder blacklisted
    pub fn is_empty(&self) -> bool {
        self.blacklisted.is_empty()
    }

    /// Fail with `Blacklisted` for a blacklisted source
    pub fn ensure_not_blacklisted(&self, holder: Address) -> Result<()> {
        if self.is_blacklisted(holder) {
            return Err(Error::Blacklisted(holder));
        }
        Ok(())
    }

    /// Blacklist `holder` once its unresolved violations reach `threshold`
    ///
    /// Returns true when the holder was newly blacklisted.
    pub fn evaluate_auto_blacklist(
        &mut self,
        holder: Address,
        active_violations: usize,
        threshold: u32,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> bool {
        if self.is_blacklisted(holder) || active_violations < threshold as usize {
            return false;
        }

        self.blacklisted.insert(holder);
        events.push(CustodyEvent::HolderBlacklisted {
            holder,
            automatic: true,
            active_violations,
            at,
        });

        tracing::warn!(
            holder = %holder,
            active_violations,
            threshold,
            "Holder automatically blacklisted"
        );

        true
    }

    /// Admin override: blacklist regardless of violation count
    pub fn blacklist_manually(
        &mut self,
        roles: &RoleRegistry,
        caller: Address,
        holder: Address,
        active_violations: usize,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Result<()> {
        roles.require_admin(caller)?;
        validate_address(holder)?;

        if !self.blacklisted.insert(holder) {
            return Err(Error::AlreadyBlacklisted(holder));
        }

        events.push(CustodyEvent::HolderBlacklisted {
            holder,
            automatic: false,
            active_violations,
            at,
        });

        tracing::info!(holder = %holder, by = %caller, "Holder blacklisted manually");
        Ok(())
    }

    /// Admin override: lift a blacklist
    pub fn remove_from_blacklist(
        &mut self,
        roles: &RoleRegistry,
        caller: Address,
        holder: Address,
        at: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Result<()> {
        roles.require_admin(caller)?;
        validate_address(holder)?;

        if !self.blacklisted.remove(&holder) {
            return Err(Error::NotBlacklisted(holder));
        }

        events.push(CustodyEvent::HolderUnblacklisted { holder, at });

        tracing::info!(holder = %holder, by = %caller, "Holder removed from blacklist");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const ADMIN: Address = Address::from_low_u64(1);
    const HOLDER: Address = Address::from_low_u64(5);

    #[test]
    fn test_auto_blacklist_at_threshold() {
        let mut guard = BlacklistGuard::new();
        let mut events = Vec::new();

        assert!(!guard.evaluate_auto_blacklist(HOLDER, 2, 3, Utc::now(), &mut events));
        assert!(guard.evaluate_auto_blacklist(HOLDER, 3, 3, Utc::now(), &mut events));
        // Already blacklisted: no second event
        assert!(!guard.evaluate_auto_blacklist(HOLDER, 4, 3, Utc::now(), &mut events));

        assert!(guard.is_blacklisted(HOLDER));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            CustodyEvent::HolderBlacklisted { automatic: true, active_violations: 3, .. }
        ));
    }

    #[test]
    fn test_manual_overrides() {
        let roles = RoleRegistry::genesis(ADMIN).unwrap();
        let mut guard = BlacklistGuard::new();
        let mut events = Vec::new();

        guard
            .blacklist_manually(&roles, ADMIN, HOLDER, 0, Utc::now(), &mut events)
            .unwrap();
        assert!(matches!(
            guard.blacklist_manually(&roles, ADMIN, HOLDER, 0, Utc::now(), &mut events),
            Err(Error::AlreadyBlacklisted(_))
        ));

        guard
            .remove_from_blacklist(&roles, ADMIN, HOLDER, Utc::now(), &mut events)
            .unwrap();
        assert!(!guard.is_blacklisted(HOLDER));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_remove_not_blacklisted_has_no_effect() {
        let roles = RoleRegistry::genesis(ADMIN).unwrap();
        let mut guard = BlacklistGuard::new();
        let mut events = Vec::new();

        let err = guard
            .remove_from_blacklist(&roles, ADMIN, HOLDER, Utc::now(), &mut events)
            .unwrap_err();
        assert!(matches!(err, Error::NotBlacklisted(h) if h == HOLDER));
        assert!(events.is_empty());
        assert!(guard.is_empty());
    }

    #[test]
    fn test_non_admin_cannot_override() {
        let roles = RoleRegistry::genesis(ADMIN).unwrap();
        let mut guard = BlacklistGuard::new();
        let mut events = Vec::new();

        assert!(matches!(
            guard.blacklist_manually(&roles, HOLDER, HOLDER, 0, Utc::now(), &mut events),
            Err(Error::Unauthorized(_))
        ));
    }
}
