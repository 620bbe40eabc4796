//! Main custody orchestration layer
//!
//! Ties storage, the single-writer actor and metrics together into the API
//! the outside world uses: commands go through the actor, queries read the
//! latest published snapshot without waiting on it.
//!
//! # Example
//!
//! ```no_run
//! use custody_core::{Address, Config, CustodyLedger};
//!
//! #[tokio::main]
//! async fn main() -> custody_core::Result<()> {
//!     let admin: Address = "0x00000000000000000000000000000000000000a1".parse()?;
//!     let config = Config {
//!         genesis_admin: Some(admin),
//!         ..Config::default()
//!     };
//!     let ledger = CustodyLedger::open(config).await?;
//!
//!     let producer: Address = "0x00000000000000000000000000000000000000b2".parse()?;
//!     ledger.set_producer(admin, producer).await?;
//!     ledger.produce(producer, 600).await?;
//!     assert_eq!(ledger.stock_balance(producer), 600);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_custody_actor, CustodyHandle},
    command::{Command, Outcome, Receipt},
    config::PolicyConfig,
    events::{verify_chain, ChainHead, CustodyEvent, EventRecord, GENESIS_HASH},
    metrics::Metrics,
    state::CustodyState,
    storage::{Snapshot, Storage},
    types::{
        AccountInfo, Address, Batch, BatchId, Role, Timestamp, Violation, ViolationId,
        ViolationKind,
    },
    violations::ScanReport,
    Config, Error, Result,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// Records read per page when walking the journal
const JOURNAL_PAGE: usize = 1_024;

/// Main custody interface
#[derive(Debug)]
pub struct CustodyLedger {
    /// Actor handle for commands and snapshots
    handle: CustodyHandle,

    /// Actor task, awaited on shutdown
    actor: JoinHandle<()>,

    /// Direct storage access (journal reads)
    storage: Arc<Storage>,

    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl CustodyLedger {
    /// Open ledger with configuration
    ///
    /// An empty store is initialised from `config.genesis_admin` and
    /// `config.policy`; an existing snapshot takes precedence over both.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);

        let snapshot = match storage.load_snapshot()? {
            Some(snapshot) => {
                // Entities are rebuilt from separate keys: refuse a torn store
                snapshot.state.check_invariants()?;
                tracing::info!(
                    next_sequence = snapshot.head.next_sequence,
                    next_batch_id = %snapshot.state.next_batch_id(),
                    batches = snapshot.state.batch_count(),
                    "Recovered custody state"
                );
                snapshot
            }
            None => Self::genesis(&storage, &config)?,
        };

        let snapshot = Snapshot {
            state: snapshot
                .state
                .with_fault_injection(config.diagnostics.fault_injection),
            head: snapshot.head,
        };

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        let (handle, actor) = spawn_custody_actor(
            storage.clone(),
            snapshot,
            config.actor.mailbox_capacity,
            config.actor.event_buffer,
            metrics.clone(),
        );

        Ok(Self {
            handle,
            actor,
            storage,
            metrics,
            config,
        })
    }

    fn genesis(storage: &Storage, config: &Config) -> Result<Snapshot> {
        let admin = config.genesis_admin.ok_or_else(|| {
            Error::Config("genesis_admin is required to initialise an empty store".to_string())
        })?;

        let state = CustodyState::genesis(admin, config.policy.clone())?;
        let (records, head) = ChainHead::default().seal_all(vec![CustodyEvent::AdminAdded {
            account: admin,
            at: Utc::now(),
        }])?;

        let snapshot = Snapshot { state, head };
        storage.commit(&records, &snapshot)?;

        tracing::info!(admin = %admin, "Initialised empty custody store");
        Ok(snapshot)
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prometheus collectors
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Commands

    /// Run `command` for `caller` at the current time
    pub async fn execute(&self, caller: Address, command: Command) -> Result<Receipt> {
        self.execute_at(caller, Utc::now(), command).await
    }

    /// Run `command` for `caller` at `at`
    pub async fn execute_at(
        &self,
        caller: Address,
        at: Timestamp,
        command: Command,
    ) -> Result<Receipt> {
        self.handle.execute(caller, at, command).await
    }

    /// Grant Admin
    pub async fn add_admin(&self, caller: Address, account: Address) -> Result<Receipt> {
        self.execute(caller, Command::AddAdmin { account }).await
    }

    /// Revoke Admin
    pub async fn remove_admin(&self, caller: Address, account: Address) -> Result<Receipt> {
        self.execute(caller, Command::RemoveAdmin { account }).await
    }

    /// Grant Producer
    pub async fn set_producer(&self, caller: Address, account: Address) -> Result<Receipt> {
        self.execute(caller, Command::SetProducer { account }).await
    }

    /// Revoke Producer
    pub async fn remove_producer(&self, caller: Address, account: Address) -> Result<Receipt> {
        self.execute(caller, Command::RemoveProducer { account }).await
    }

    /// Grant Reseller with a cap
    pub async fn set_reseller(
        &self,
        caller: Address,
        account: Address,
        max_quantity: u64,
    ) -> Result<Receipt> {
        self.execute(
            caller,
            Command::SetReseller {
                account,
                max_quantity,
            },
        )
        .await
    }

    /// Revoke Reseller
    pub async fn remove_reseller(&self, caller: Address, account: Address) -> Result<Receipt> {
        self.execute(caller, Command::RemoveReseller { account }).await
    }

    /// Change a reseller's cap
    pub async fn change_max_quantity_reseller(
        &self,
        caller: Address,
        account: Address,
        max_quantity: u64,
    ) -> Result<Receipt> {
        self.execute(
            caller,
            Command::ChangeMaxQuantityReseller {
                account,
                max_quantity,
            },
        )
        .await
    }

    /// Produce a batch, returning its id
    pub async fn produce(&self, producer: Address, quantity: u64) -> Result<BatchId> {
        let receipt = self.execute(producer, Command::Produce { quantity }).await?;
        receipt
            .batch_id()
            .ok_or_else(|| Error::InvariantViolation("produce returned no batch".to_string()))
    }

    /// Transfer stock out of `batch_id`, returning the batch `to` now owns
    pub async fn transfer_stock(
        &self,
        from: Address,
        to: Address,
        quantity: u64,
        batch_id: BatchId,
    ) -> Result<BatchId> {
        let receipt = self
            .execute(
                from,
                Command::TransferStock {
                    to,
                    quantity,
                    batch_id,
                },
            )
            .await?;
        receipt
            .batch_id()
            .ok_or_else(|| Error::InvariantViolation("transfer returned no batch".to_string()))
    }

    /// Expire stale batches and flag abusive storage
    pub async fn scan_for_abusive_storage(&self, caller: Address) -> Result<ScanReport> {
        self.scan_for_abusive_storage_at(caller, Utc::now()).await
    }

    /// Scan as of `now`
    pub async fn scan_for_abusive_storage_at(
        &self,
        caller: Address,
        now: Timestamp,
    ) -> Result<ScanReport> {
        match self
            .execute_at(caller, now, Command::ScanForAbusiveStorage)
            .await?
            .outcome
        {
            Outcome::Scanned(report) => Ok(report),
            other => Err(Error::InvariantViolation(format!(
                "scan returned {:?}",
                other
            ))),
        }
    }

    /// Resolve a violation
    pub async fn resolve_violation(
        &self,
        caller: Address,
        violation_id: ViolationId,
    ) -> Result<Receipt> {
        self.execute(caller, Command::ResolveViolation { violation_id })
            .await
    }

    /// Blacklist a holder
    pub async fn blacklist_manually(&self, caller: Address, holder: Address) -> Result<Receipt> {
        self.execute(caller, Command::BlacklistManually { holder })
            .await
    }

    /// Lift a blacklist
    pub async fn remove_from_blacklist(&self, caller: Address, holder: Address) -> Result<Receipt> {
        self.execute(caller, Command::RemoveFromBlacklist { holder })
            .await
    }

    /// Set or clear the display label of an account (admin only)
    pub async fn label_account(
        &self,
        caller: Address,
        account: Address,
        label: impl Into<String>,
    ) -> Result<Receipt> {
        self.execute(
            caller,
            Command::LabelAccount {
                account,
                label: label.into(),
            },
        )
        .await
    }

    /// Replace the violation policy (admin only)
    pub async fn update_policy(&self, caller: Address, policy: PolicyConfig) -> Result<Receipt> {
        self.execute(caller, Command::UpdatePolicy { policy }).await
    }

    /// Diagnostic violation injection (requires `diagnostics.fault_injection`)
    pub async fn trigger_fake_violation(
        &self,
        caller: Address,
        holder: Address,
        batch_id: BatchId,
        kind: ViolationKind,
    ) -> Result<ViolationId> {
        match self
            .execute(
                caller,
                Command::TriggerFakeViolation {
                    holder,
                    batch_id,
                    kind,
                },
            )
            .await?
            .outcome
        {
            Outcome::ViolationOpened { violation_id } => Ok(violation_id),
            other => Err(Error::InvariantViolation(format!(
                "injection returned {:?}",
                other
            ))),
        }
    }

    // Queries

    /// Latest committed state and journal head
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.handle.snapshot()
    }

    /// Role of `account`
    pub fn role_of(&self, account: Address) -> Role {
        self.snapshot().state.role_of(account)
    }

    /// Is admin
    pub fn is_admin(&self, account: Address) -> bool {
        self.snapshot().state.is_admin(account)
    }

    /// Is producer
    pub fn is_producer(&self, account: Address) -> bool {
        self.snapshot().state.is_producer(account)
    }

    /// Is reseller
    pub fn is_reseller(&self, account: Address) -> bool {
        self.snapshot().state.is_reseller(account)
    }

    /// Aggregate balance
    pub fn stock_balance(&self, account: Address) -> u64 {
        self.snapshot().state.stock_balance(account)
    }

    /// Reseller cap
    pub fn max_quantity_per_reseller(&self, account: Address) -> u64 {
        self.snapshot().state.max_quantity_per_reseller(account)
    }

    /// Blacklist status
    pub fn is_blacklisted(&self, holder: Address) -> bool {
        self.snapshot().state.is_blacklisted(holder)
    }

    /// Blacklisted holders
    pub fn blacklisted_holders(&self) -> Vec<Address> {
        self.snapshot().state.blacklisted_holders()
    }

    /// Batches owned by `owner`
    pub fn batches_owned_by(&self, owner: Address) -> Vec<BatchId> {
        self.snapshot().state.batches_owned_by(owner)
    }

    /// Batch by id
    pub fn batch(&self, id: BatchId) -> Result<Batch> {
        self.snapshot().state.batch(id).cloned()
    }

    /// Unresolved violations of `holder`
    pub fn active_violations_by_holder(&self, holder: Address) -> Vec<Violation> {
        self.snapshot().state.active_violations_by_holder(holder)
    }

    /// Violation by id
    pub fn violation(&self, id: ViolationId) -> Result<Violation> {
        self.snapshot().state.violation(id).cloned()
    }

    /// Batches within `window` of expiry right now
    pub fn batches_nearing_violation(&self, window: chrono::Duration) -> Vec<BatchId> {
        self.snapshot()
            .state
            .batches_nearing_violation(Utc::now(), window)
    }

    /// Number of producers
    pub fn total_producers(&self) -> u64 {
        self.snapshot().state.total_producers()
    }

    /// Number of resellers
    pub fn total_resellers(&self) -> u64 {
        self.snapshot().state.total_resellers()
    }

    /// Violations ever opened
    pub fn total_violations(&self) -> u64 {
        self.snapshot().state.total_violations()
    }

    /// Id the next batch will receive
    pub fn next_batch_id(&self) -> BatchId {
        self.snapshot().state.next_batch_id()
    }

    /// Producers, sorted
    pub fn list_producers(&self) -> Vec<Address> {
        self.snapshot().state.list_producers()
    }

    /// Resellers, sorted
    pub fn list_resellers(&self) -> Vec<Address> {
        self.snapshot().state.list_resellers()
    }

    /// Admins, sorted
    pub fn list_admins(&self) -> Vec<Address> {
        self.snapshot().state.list_admins()
    }

    /// Aggregate view of one address
    pub fn account_info(&self, address: Address) -> AccountInfo {
        self.snapshot().state.account_info(address)
    }

    /// Audit the committed state
    pub fn check_invariants(&self) -> Result<()> {
        self.snapshot().state.check_invariants()
    }

    // Journal

    /// Records from `sequence` onwards, at most `limit`
    pub fn events_since(&self, sequence: u64, limit: usize) -> Result<Vec<EventRecord>> {
        self.storage.events_since(sequence, limit)
    }

    /// Stream of records committed after this call
    pub fn subscribe(&self) -> BroadcastStream<EventRecord> {
        BroadcastStream::new(self.handle.subscribe())
    }

    /// Walk the whole journal and check it against the published head
    ///
    /// Returns the number of records verified.
    pub fn verify_journal(&self) -> Result<u64> {
        let head = self.snapshot().head;
        let mut prev_hash = GENESIS_HASH;
        let mut next = 0u64;

        while next < head.next_sequence {
            let page = self.storage.events_since(next, JOURNAL_PAGE)?;
            let page: Vec<EventRecord> = page
                .into_iter()
                .take_while(|r| r.sequence < head.next_sequence)
                .collect();

            let Some(last) = page.last() else {
                break;
            };
            if page[0].sequence != next {
                return Err(Error::InvariantViolation(format!(
                    "journal gap at sequence {}",
                    next
                )));
            }

            verify_chain(&page, prev_hash)?;
            prev_hash = last.hash;
            next = last.sequence + 1;
        }

        if next != head.next_sequence || prev_hash != head.last_hash {
            return Err(Error::InvariantViolation(format!(
                "journal ends at {} but head expects {}",
                next, head.next_sequence
            )));
        }

        Ok(next)
    }

    /// Shutdown ledger, waiting for the actor to drain its mailbox
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await?;
        self.actor
            .await
            .map_err(|e| Error::Concurrency(format!("Actor task failed: {}", e)))?;
        tracing::info!("Custody ledger closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    const ADMIN: Address = Address::from_low_u64(1);
    const PRODUCER: Address = Address::from_low_u64(2);
    const RESELLER: Address = Address::from_low_u64(3);

    fn test_config(temp_dir: &tempfile::TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            genesis_admin: Some(ADMIN),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();

        assert!(ledger.is_admin(ADMIN));
        assert_eq!(ledger.next_batch_id(), BatchId(1));
        // Genesis admin is journalled
        assert_eq!(ledger.events_since(0, 10).unwrap().len(), 1);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_empty_store_requires_admin() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config {
            genesis_admin: None,
            ..test_config(&temp_dir)
        };

        let err = CustodyLedger::open(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_produce_and_transfer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();

        ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
        ledger.set_reseller(ADMIN, RESELLER, 50).await.unwrap();

        let batch = ledger.produce(PRODUCER, 100).await.unwrap();
        let received = ledger
            .transfer_stock(PRODUCER, RESELLER, 30, batch)
            .await
            .unwrap();

        assert_ne!(received, batch);
        assert_eq!(ledger.stock_balance(PRODUCER), 70);
        assert_eq!(ledger.stock_balance(RESELLER), 30);
        assert_eq!(ledger.batch(received).unwrap().parent, Some(batch));
        assert_eq!(ledger.batches_owned_by(RESELLER), vec![received]);
        ledger.check_invariants().unwrap();

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let temp_dir = tempfile::tempdir().unwrap();

        let batch = {
            let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();
            ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
            let batch = ledger.produce(PRODUCER, 42).await.unwrap();
            ledger.shutdown().await.unwrap();
            batch
        };

        // Genesis admin in config is ignored once a snapshot exists
        let config = Config {
            genesis_admin: Some(RESELLER),
            ..test_config(&temp_dir)
        };
        let ledger = CustodyLedger::open(config).await.unwrap();

        assert!(ledger.is_admin(ADMIN));
        assert!(!ledger.is_admin(RESELLER));
        assert_eq!(ledger.stock_balance(PRODUCER), 42);
        assert_eq!(ledger.batch(batch).unwrap().quantity, 42);
        assert_eq!(ledger.next_batch_id(), BatchId(batch.0 + 1));
        assert_eq!(ledger.verify_journal().unwrap(), 3);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_rebuilds_identical_state() {
        let temp_dir = tempfile::tempdir().unwrap();

        let before = {
            let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();
            ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
            ledger.set_reseller(ADMIN, RESELLER, 20).await.unwrap();
            ledger.label_account(ADMIN, RESELLER, "Corner Shop").await.unwrap();

            let batch = ledger.produce(PRODUCER, 100).await.unwrap();
            // Above the cap: opens an overflow violation
            ledger
                .transfer_stock(PRODUCER, RESELLER, 30, batch)
                .await
                .unwrap();
            ledger.blacklist_manually(ADMIN, RESELLER).await.unwrap();
            ledger.remove_producer(ADMIN, PRODUCER).await.unwrap();

            let snapshot = ledger.snapshot();
            ledger.shutdown().await.unwrap();
            snapshot
        };
        assert_eq!(before.state.total_violations(), 1);

        let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();
        let after = ledger.snapshot();
        assert_eq!(after.state, before.state);
        assert_eq!(after.head, before.head);
        ledger.check_invariants().unwrap();

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_nearing_window_out_of_range() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();
        ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
        let batch = ledger.produce(PRODUCER, 10).await.unwrap();

        assert!(ledger
            .batches_nearing_violation(chrono::Duration::min_value())
            .is_empty());
        assert_eq!(
            ledger.batches_nearing_violation(chrono::Duration::max_value()),
            vec![batch]
        );

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_receives_committed_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();
        let mut stream = ledger.subscribe();

        ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
        // Rejected: nothing published
        assert!(ledger.produce(RESELLER, 5).await.is_err());
        ledger.produce(PRODUCER, 5).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event.name(), "ProducerAdded");
        assert_eq!(second.event.name(), "Produced");
        assert_eq!(second.prev_hash, first.hash);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CustodyLedger::open(test_config(&temp_dir)).await.unwrap();

        ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
        for _ in 0..5 {
            ledger.produce(PRODUCER, 10).await.unwrap();
        }

        assert_eq!(ledger.verify_journal().unwrap(), 7);
        assert_eq!(
            ledger.metrics().events_total.get(),
            6,
            "genesis record is written before the actor starts"
        );

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_injection_from_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&temp_dir);
        config.diagnostics.fault_injection = true;
        let ledger = CustodyLedger::open(config).await.unwrap();

        ledger.set_producer(ADMIN, PRODUCER).await.unwrap();
        let batch = ledger.produce(PRODUCER, 5).await.unwrap();

        let id = ledger
            .trigger_fake_violation(ADMIN, PRODUCER, batch, ViolationKind::ExcessiveStorage)
            .await
            .unwrap();
        assert_eq!(ledger.violation(id).unwrap().holder, PRODUCER);
        assert_eq!(ledger.active_violations_by_holder(PRODUCER).len(), 1);

        ledger.shutdown().await.unwrap();
    }
}
