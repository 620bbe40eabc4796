//! Stock ledger
//!
//! Per-account aggregate balances. Every mutation goes through `produce` or
//! `transfer_stock`, which keep balances equal to the sum of the batches an
//! account owns. All preconditions are checked before the first write.

use crate::batches::BatchStore;
use crate::blacklist::BlacklistGuard;
use crate::events::CustodyEvent;
use crate::roles::{validate_address, RoleRegistry};
use crate::types::{Address, BatchId, Role, Timestamp};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Aggregate balances
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockLedger {
    balances: BTreeMap<Address, u64>,
}

impl StockLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted balances
    pub fn from_parts(balances: BTreeMap<Address, u64>) -> Self {
        Self { balances }
    }

    /// Balance entry as stored (`None` for an account that never held stock)
    pub fn stored_balance(&self, account: Address) -> Option<u64> {
        self.balances.get(&account).copied()
    }

    /// Balance of `account` (0 if unknown)
    pub fn balance(&self, account: Address) -> u64 {
        self.balances.get(&account).copied().unwrap_or(0)
    }

    /// Accounts with a non-zero balance
    pub fn holders(&self) -> impl Iterator<Item = (Address, u64)> + '_ {
        self.balances
            .iter()
            .filter(|(_, balance)| **balance > 0)
            .map(|(account, balance)| (*account, *balance))
    }

    /// Create a batch for `producer` and credit its balance
    #[allow(clippy::too_many_arguments)]
    pub fn produce(
        &mut self,
        roles: &RoleRegistry,
        guard: &BlacklistGuard,
        batches: &mut BatchStore,
        producer: Address,
        quantity: u64,
        now: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Result<BatchId> {
        guard.ensure_not_blacklisted(producer)?;

        if roles.role_of(producer) != Role::Producer {
            return Err(Error::Unauthorized(format!(
                "{} is not an authorized producer",
                producer
            )));
        }
        if quantity == 0 {
            return Err(Error::InvalidInput("quantity must be positive".to_string()));
        }

        let credited = self
            .balance(producer)
            .checked_add(quantity)
            .ok_or_else(|| Error::InvalidInput("balance overflow".to_string()))?;

        let batch_id = batches.create_batch(producer, quantity, now)?;
        self.balances.insert(producer, credited);

        events.push(CustodyEvent::Produced {
            producer,
            batch_id,
            quantity,
            at: now,
        });

        tracing::debug!(
            producer = %producer,
            batch_id = %batch_id,
            quantity,
            balance = credited,
            "Produced"
        );

        Ok(batch_id)
    }

    /// Move `quantity` from `batch_id` (owned by `from`) to `to`
    ///
    /// Returns the batch `to` now owns.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_stock(
        &mut self,
        roles: &RoleRegistry,
        guard: &BlacklistGuard,
        batches: &mut BatchStore,
        from: Address,
        to: Address,
        quantity: u64,
        batch_id: BatchId,
        now: Timestamp,
        events: &mut Vec<CustodyEvent>,
    ) -> Result<BatchId> {
        validate_address(to)?;
        if to == from {
            return Err(Error::InvalidInput("cannot transfer to self".to_string()));
        }

        guard.ensure_not_blacklisted(from)?;

        if !roles.role_of(from).can_hold_stock() {
            return Err(Error::Unauthorized(format!(
                "{} is neither a producer nor a reseller",
                from
            )));
        }
        if quantity == 0 {
            return Err(Error::InvalidInput("quantity must be positive".to_string()));
        }

        let available = self.balance(from);
        if available < quantity {
            return Err(Error::InsufficientBalance {
                requested: quantity,
                available,
            });
        }
        let credited = self
            .balance(to)
            .checked_add(quantity)
            .ok_or_else(|| Error::InvalidInput("balance overflow".to_string()))?;

        // Last fallible step: checks batch existence, ownership and remainder
        let received = batches.transfer_ownership(batch_id, from, to, quantity)?;

        self.balances.insert(from, available - quantity);
        self.balances.insert(to, credited);

        events.push(CustodyEvent::Transferred {
            from,
            to,
            quantity,
            source_batch_id: batch_id,
            batch_id: received,
            at: now,
        });

        tracing::debug!(
            from = %from,
            to = %to,
            quantity,
            source_batch_id = %batch_id,
            batch_id = %received,
            "Transferred"
        );

        Ok(received)
    }

    /// Compare every balance with the batches its account owns
    pub fn check_conservation(&self, batches: &BatchStore) -> Result<()> {
        for (account, balance) in &self.balances {
            let owned = batches.owned_quantity(*account);
            if owned != *balance {
                return Err(Error::InvariantViolation(format!(
                    "{} has balance {} but owns batches totalling {}",
                    account, balance, owned
                )));
            }
        }

        for owner in batches.owners() {
            if !self.balances.contains_key(&owner) {
                return Err(Error::InvariantViolation(format!(
                    "{} owns batches but has no balance entry",
                    owner
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const ADMIN: Address = Address::from_low_u64(1);
    const PRODUCER: Address = Address::from_low_u64(2);
    const RESELLER: Address = Address::from_low_u64(3);
    const NOBODY: Address = Address::from_low_u64(4);

    struct Fixture {
        roles: RoleRegistry,
        guard: BlacklistGuard,
        batches: BatchStore,
        stock: StockLedger,
        events: Vec<CustodyEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut roles = RoleRegistry::genesis(ADMIN).unwrap();
            roles.set_producer(ADMIN, PRODUCER, Utc::now()).unwrap();
            roles.set_reseller(ADMIN, RESELLER, 50, Utc::now()).unwrap();
            Self {
                roles,
                guard: BlacklistGuard::new(),
                batches: BatchStore::new(),
                stock: StockLedger::new(),
                events: Vec::new(),
            }
        }

        fn produce(&mut self, who: Address, quantity: u64) -> Result<BatchId> {
            self.stock.produce(
                &self.roles,
                &self.guard,
                &mut self.batches,
                who,
                quantity,
                Utc::now(),
                &mut self.events,
            )
        }

        fn transfer(
            &mut self,
            from: Address,
            to: Address,
            quantity: u64,
            batch: BatchId,
        ) -> Result<BatchId> {
            self.stock.transfer_stock(
                &self.roles,
                &self.guard,
                &mut self.batches,
                from,
                to,
                quantity,
                batch,
                Utc::now(),
                &mut self.events,
            )
        }
    }

    #[test]
    fn test_produce_credits_balance() {
        let mut fx = Fixture::new();
        let batch = fx.produce(PRODUCER, 100).unwrap();

        assert_eq!(fx.stock.balance(PRODUCER), 100);
        assert_eq!(fx.batches.get(batch).unwrap().quantity, 100);
        assert_eq!(fx.events.len(), 1);
        fx.stock.check_conservation(&fx.batches).unwrap();
    }

    #[test]
    fn test_only_producers_produce() {
        let mut fx = Fixture::new();
        let err = fx.produce(RESELLER, 100).unwrap_err();
        assert!(err.to_string().contains("not an authorized producer"));
        assert_eq!(fx.batches.next_batch_id(), BatchId(1));
        assert!(fx.events.is_empty());
    }

    #[test]
    fn test_transfer_moves_balance() {
        let mut fx = Fixture::new();
        let batch = fx.produce(PRODUCER, 200).unwrap();
        fx.transfer(PRODUCER, RESELLER, 50, batch).unwrap();

        assert_eq!(fx.stock.balance(PRODUCER), 150);
        assert_eq!(fx.stock.balance(RESELLER), 50);
        fx.stock.check_conservation(&fx.batches).unwrap();
    }

    #[test]
    fn test_transfer_exceeding_batch_is_atomic() {
        let mut fx = Fixture::new();
        let small = fx.produce(PRODUCER, 10).unwrap();
        fx.produce(PRODUCER, 90).unwrap();

        // Balance covers it, the batch does not
        let err = fx.transfer(PRODUCER, RESELLER, 20, small).unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { requested: 20, available: 10 }));
        assert_eq!(fx.stock.balance(PRODUCER), 100);
        assert_eq!(fx.stock.balance(RESELLER), 0);
        fx.stock.check_conservation(&fx.batches).unwrap();
    }

    #[test]
    fn test_transfer_exceeding_balance() {
        let mut fx = Fixture::new();
        let batch = fx.produce(PRODUCER, 10).unwrap();
        assert!(matches!(
            fx.transfer(PRODUCER, RESELLER, 11, batch),
            Err(Error::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_roleless_sender_unauthorized() {
        let mut fx = Fixture::new();
        let batch = fx.produce(PRODUCER, 10).unwrap();
        fx.transfer(PRODUCER, NOBODY, 10, batch).unwrap();

        assert!(matches!(
            fx.transfer(NOBODY, RESELLER, 10, batch),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_blacklisted_sender_rejected() {
        let mut fx = Fixture::new();
        let batch = fx.produce(PRODUCER, 10).unwrap();
        fx.guard
            .blacklist_manually(&fx.roles, ADMIN, PRODUCER, 0, Utc::now(), &mut fx.events)
            .unwrap();

        assert!(matches!(fx.produce(PRODUCER, 5), Err(Error::Blacklisted(_))));
        assert!(matches!(
            fx.transfer(PRODUCER, RESELLER, 5, batch),
            Err(Error::Blacklisted(_))
        ));
        assert_eq!(fx.stock.balance(PRODUCER), 10);
    }

    #[test]
    fn test_self_and_zero_destination_rejected() {
        let mut fx = Fixture::new();
        let batch = fx.produce(PRODUCER, 10).unwrap();
        assert!(matches!(
            fx.transfer(PRODUCER, PRODUCER, 1, batch),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            fx.transfer(PRODUCER, Address::ZERO, 1, batch),
            Err(Error::InvalidInput(_))
        ));
    }
}
