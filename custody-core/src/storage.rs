//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `events` - Append-only journal of sealed records (key: sequence, big-endian)
//! - `accounts` - One [`AccountRecord`] per known address (key: address bytes)
//! - `batches` - One batch per key (key: batch id, big-endian)
//! - `violations` - One violation per key (key: violation id, big-endian)
//! - `state` - Chain head, policy and id counters (key: `meta`)
//!
//! A command commits its records, the entities its events touched and the
//! meta record in one `WriteBatch`, so a crash never leaves the journal and
//! the state apart. The cost of a commit follows the size of the command, not
//! the size of the history.

use crate::{
    changes::{AccountRecord, ChangeSet, EntityKey, StateMeta},
    error::{Error, Result},
    events::{ChainHead, EventRecord},
    state::CustodyState,
    types::{Batch, Violation},
    Config,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

/// Column family names
const CF_EVENTS: &str = "events";
const CF_ACCOUNTS: &str = "accounts";
const CF_BATCHES: &str = "batches";
const CF_VIOLATIONS: &str = "violations";
const CF_STATE: &str = "state";

const META_KEY: &[u8] = b"meta";

/// Committed state together with the journal head it corresponds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Committed state
    pub state: CustodyState,
    /// Journal head matching `state`
    pub head: ChainHead,
}

/// Value under `META_KEY`
#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    head: ChainHead,
    meta: StateMeta,
}

/// What one commit wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Journal records appended
    pub records: usize,
    /// Entities rewritten or deleted
    pub entities: usize,
    /// Encoded bytes put into the batch
    pub bytes: usize,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_entities()),
            ColumnFamilyDescriptor::new(CF_BATCHES, Self::cf_options_entities()),
            ColumnFamilyDescriptor::new(CF_VIOLATIONS, Self::cf_options_entities()),
            ColumnFamilyDescriptor::new(CF_STATE, Self::cf_options_state()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_entities() -> Options {
        let mut opts = Options::default();
        // Point updates, full scan only on restart
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::None);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    // Commit

    /// Append `records` and write the entities they touched (atomic)
    ///
    /// `snapshot` must be the state right after the command that produced
    /// `records`; entities are read from it, never diffed.
    pub fn commit(&self, records: &[EventRecord], snapshot: &Snapshot) -> Result<CommitStats> {
        let mut batch = WriteBatch::default();
        let mut stats = CommitStats {
            records: records.len(),
            ..CommitStats::default()
        };

        let cf_events = self.cf_handle(CF_EVENTS)?;
        for record in records {
            let value = bincode::serialize(record)?;
            stats.bytes += value.len();
            batch.put_cf(&cf_events, record.sequence.to_be_bytes(), &value);
        }

        let changes = ChangeSet::from_events(records.iter().map(|r| &r.event));
        stats.entities = changes.len();

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_batches = self.cf_handle(CF_BATCHES)?;
        let cf_violations = self.cf_handle(CF_VIOLATIONS)?;
        let state = &snapshot.state;

        for key in changes.keys() {
            match key {
                EntityKey::Account(address) => match state.account_record(address) {
                    Some(record) => {
                        let value = bincode::serialize(&record)?;
                        stats.bytes += value.len();
                        batch.put_cf(&cf_accounts, address.as_bytes(), &value);
                    }
                    None => batch.delete_cf(&cf_accounts, address.as_bytes()),
                },
                EntityKey::Batch(id) => {
                    let value = bincode::serialize(state.batch(id)?)?;
                    stats.bytes += value.len();
                    batch.put_cf(&cf_batches, id.0.to_be_bytes(), &value);
                }
                EntityKey::Violation(id) => {
                    let value = bincode::serialize(state.violation(id)?)?;
                    stats.bytes += value.len();
                    batch.put_cf(&cf_violations, id.0.to_be_bytes(), &value);
                }
            }
        }

        let cf_state = self.cf_handle(CF_STATE)?;
        let meta = bincode::serialize(&StoredMeta {
            head: snapshot.head,
            meta: state.meta(),
        })?;
        stats.bytes += meta.len();
        batch.put_cf(&cf_state, META_KEY, &meta);

        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(
            records = stats.records,
            entities = stats.entities,
            bytes = stats.bytes,
            next_sequence = snapshot.head.next_sequence,
            "Commit persisted"
        );

        Ok(stats)
    }

    // Reads

    /// Rebuild the committed state, `None` for an empty store
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        let cf = self.cf_handle(CF_STATE)?;
        let stored: StoredMeta = match self.db.get_cf(&cf, META_KEY)? {
            Some(value) => bincode::deserialize(&value)?,
            None => return Ok(None),
        };

        let accounts: Vec<AccountRecord> = self.scan_cf(CF_ACCOUNTS)?;
        let batches: Vec<Batch> = self.scan_cf(CF_BATCHES)?;
        let violations: Vec<Violation> = self.scan_cf(CF_VIOLATIONS)?;

        tracing::debug!(
            accounts = accounts.len(),
            batches = batches.len(),
            violations = violations.len(),
            "Loaded custody entities"
        );

        let state = CustodyState::restore(stored.meta, accounts, batches, violations)?;
        Ok(Some(Snapshot {
            state,
            head: stored.head,
        }))
    }

    fn scan_cf<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Record at `sequence`
    pub fn get_event(&self, sequence: u64) -> Result<Option<EventRecord>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        match self.db.get_cf(&cf, sequence.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Records from `sequence` onwards, at most `limit`
    pub fn events_since(&self, sequence: u64, limit: usize) -> Result<Vec<EventRecord>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let start = sequence.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut records = Vec::new();
        for item in iter.take(limit) {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::PolicyConfig;
    use crate::events::CustodyEvent;
    use crate::types::{Address, Timestamp};
    use chrono::Utc;
    use tempfile::TempDir;

    const ADMIN: Address = Address::from_low_u64(1);
    const PRODUCER: Address = Address::from_low_u64(2);

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        (config, temp_dir)
    }

    /// Genesis state and its sealed AdminAdded record
    fn genesis() -> (Vec<EventRecord>, Snapshot) {
        let state = CustodyState::genesis(ADMIN, PolicyConfig::default()).unwrap();
        let (records, head) = ChainHead::default()
            .seal_all(vec![CustodyEvent::AdminAdded {
                account: ADMIN,
                at: Utc::now(),
            }])
            .unwrap();
        (records, Snapshot { state, head })
    }

    /// Run `commands` on `snapshot` as one commit
    fn apply(
        snapshot: &Snapshot,
        caller: Address,
        at: Timestamp,
        commands: &[Command],
    ) -> (Vec<EventRecord>, Snapshot) {
        let mut state = snapshot.state.clone();
        let mut events = Vec::new();
        for command in commands {
            events.extend(state.execute(caller, at, command).unwrap().1);
        }
        let (records, head) = snapshot.head.seal_all(events).unwrap();
        (records, Snapshot { state, head })
    }

    fn producers(range: std::ops::Range<u64>) -> Vec<Command> {
        range
            .map(|i| Command::SetProducer {
                account: Address::from_low_u64(100 + i),
            })
            .collect()
    }

    #[test]
    fn test_storage_open_empty() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.load_snapshot().unwrap().is_none());
        assert!(storage.get_event(0).unwrap().is_none());
    }

    #[test]
    fn test_commit_and_read_back() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let (records, snapshot) = genesis();
        storage.commit(&records, &snapshot).unwrap();
        let (more, snapshot) = apply(&snapshot, ADMIN, Utc::now(), &producers(0..3));
        storage.commit(&more, &snapshot).unwrap();

        let loaded = storage.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(loaded.state.is_admin(ADMIN));
        assert!(loaded.state.is_producer(Address::from_low_u64(102)));

        assert_eq!(storage.get_event(2).unwrap().unwrap(), more[1]);
        assert_eq!(storage.events_since(1, usize::MAX).unwrap(), more);
    }

    #[test]
    fn test_events_since_orders_by_sequence() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        // Enough records that byte order would differ from decimal order
        let (genesis_records, snapshot) = genesis();
        storage.commit(&genesis_records, &snapshot).unwrap();
        let (records, snapshot) = apply(&snapshot, ADMIN, Utc::now(), &producers(0..259));
        storage.commit(&records, &snapshot).unwrap();

        let tail = storage.events_since(255, 10).unwrap();
        let sequences: Vec<u64> = tail.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![255, 256, 257, 258, 259]);

        crate::events::verify_chain(
            &storage.events_since(0, usize::MAX).unwrap(),
            crate::events::GENESIS_HASH,
        )
        .unwrap();
    }

    #[test]
    fn test_reopen_keeps_snapshot() {
        let (config, _temp) = test_config();

        let (records, first) = genesis();
        let (more, snapshot) = apply(&first, ADMIN, Utc::now(), &producers(0..1));
        {
            let storage = Storage::open(&config).unwrap();
            storage.commit(&records, &first).unwrap();
            storage.commit(&more, &snapshot).unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        let loaded = storage.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.head.next_sequence, 2);
        assert_eq!(loaded.state, snapshot.state);
        assert_eq!(storage.events_since(0, usize::MAX).unwrap().len(), 2);
    }

    #[test]
    fn test_commit_writes_only_touched_entities() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let now = Utc::now();

        let (records, snapshot) = genesis();
        storage.commit(&records, &snapshot).unwrap();
        let (records, snapshot) = apply(
            &snapshot,
            ADMIN,
            now,
            &[Command::SetProducer { account: PRODUCER }],
        );
        storage.commit(&records, &snapshot).unwrap();

        let produce = vec![Command::Produce { quantity: 1 }; 500];
        let (records, snapshot) = apply(&snapshot, PRODUCER, now, &produce);
        let bulk = storage.commit(&records, &snapshot).unwrap();
        assert_eq!(bulk.entities, 501);

        // A role change after a long history rewrites one account
        let (records, snapshot) = apply(&snapshot, ADMIN, now, &producers(0..1));
        let small = storage.commit(&records, &snapshot).unwrap();
        assert_eq!(small.records, 1);
        assert_eq!(small.entities, 1);
        assert!(small.bytes < 1_024, "wrote {} bytes", small.bytes);

        assert_eq!(storage.load_snapshot().unwrap().unwrap(), snapshot);
    }

    #[test]
    fn test_emptied_account_is_deleted() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let now = Utc::now();
        let stranger = Address::from_low_u64(77);
        let label = |label: &str| Command::LabelAccount {
            account: stranger,
            label: label.to_string(),
        };
        let stored = |storage: &Storage| {
            let cf = storage.cf_handle(CF_ACCOUNTS).unwrap();
            storage.db.get_cf(&cf, stranger.as_bytes()).unwrap()
        };

        let (records, snapshot) = genesis();
        storage.commit(&records, &snapshot).unwrap();
        let (records, snapshot) = apply(&snapshot, ADMIN, now, &[label("Depot")]);
        storage.commit(&records, &snapshot).unwrap();
        assert!(stored(&storage).is_some());

        // Clearing the only thing known about the address drops its entry
        let (records, snapshot) = apply(&snapshot, ADMIN, now, &[label("")]);
        storage.commit(&records, &snapshot).unwrap();
        assert!(snapshot.state.account_record(stranger).is_none());
        assert!(stored(&storage).is_none());
        assert_eq!(storage.load_snapshot().unwrap().unwrap(), snapshot);
    }
}
