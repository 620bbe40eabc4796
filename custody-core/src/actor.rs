//! Single-writer custody actor
//!
//! One tokio task owns the authoritative state and processes commands one at
//! a time from a bounded mailbox. Each command runs against a draft copy; the
//! draft replaces the committed state only after its records and the entities
//! they touched are durably written. State components sit behind `Arc`, so the
//! draft shares everything the command does not mutate.
//!
//! ```text
//! CustodyHandle (Clone) --mpsc--> CustodyActor
//!                                   | draft = state.clone()
//!                                   | draft.execute(command)
//!                                   | seal events, Storage::commit (touched entities)
//!                                   | publish Arc<Snapshot>, broadcast records
//!                                   v
//!        readers <-- RwLock<Arc<Snapshot>>      subscribers <-- broadcast
//! ```

use crate::command::{Command, Receipt};
use crate::events::EventRecord;
use crate::metrics::Metrics;
use crate::storage::{Snapshot, Storage};
use crate::types::{Address, Timestamp};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Message sent to the custody actor
#[derive(Debug)]
pub enum CustodyMessage {
    /// Run a command and commit it
    Execute {
        /// Account issuing the command
        caller: Address,
        /// Time the command is evaluated at
        at: Timestamp,
        /// Command to run
        command: Command,
        /// Receives the receipt or the rejection
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Stop after the messages already queued
    Shutdown,
}

/// Actor that owns the committed state
pub struct CustodyActor {
    storage: Arc<Storage>,
    mailbox: mpsc::Receiver<CustodyMessage>,
    current: Arc<Snapshot>,
    published: Arc<RwLock<Arc<Snapshot>>>,
    events: broadcast::Sender<EventRecord>,
    metrics: Metrics,
}

impl CustodyActor {
    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                CustodyMessage::Execute {
                    caller,
                    at,
                    command,
                    response,
                } => {
                    let result = self.handle_execute(caller, at, command);
                    let _ = response.send(result);
                }
                CustodyMessage::Shutdown => break,
            }
        }

        tracing::info!(
            next_sequence = self.current.head.next_sequence,
            "Custody actor stopped"
        );
    }

    fn handle_execute(&mut self, caller: Address, at: Timestamp, command: Command) -> Result<Receipt> {
        let started = Instant::now();
        let name = command.name();

        let result = self.commit(caller, at, &command);

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.metrics
            .record_command(name, outcome, started.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => tracing::debug!(
                command = name,
                caller = %caller,
                events = receipt.records.len(),
                "Command committed"
            ),
            Err(e @ (Error::Storage(_) | Error::Serialization(_) | Error::InvariantViolation(_))) => {
                tracing::error!(command = name, caller = %caller, error = %e, "Commit failed")
            }
            Err(e) => tracing::debug!(command = name, caller = %caller, error = %e, "Command rejected"),
        }

        result
    }

    fn commit(&mut self, caller: Address, at: Timestamp, command: &Command) -> Result<Receipt> {
        let mut draft = self.current.state.clone();
        let (outcome, events) = draft.execute(caller, at, command)?;

        #[cfg(debug_assertions)]
        draft.check_invariants()?;

        let (records, head) = self.current.head.seal_all(events)?;
        let next = Snapshot { state: draft, head };

        let stats = self.storage.commit(&records, &next)?;
        tracing::trace!(entities = stats.entities, bytes = stats.bytes, "Draft persisted");

        // Durable: publish
        let next = Arc::new(next);
        *self.published.write() = Arc::clone(&next);
        self.current = next;

        self.metrics
            .record_events(&records.iter().map(|r| &r.event).collect::<Vec<_>>());
        self.metrics.update_gauges(
            self.current.state.blacklisted_holders().len(),
            self.current.state.batch_count(),
        );

        for record in &records {
            // No subscribers is not an error
            let _ = self.events.send(record.clone());
        }

        Ok(Receipt { outcome, records })
    }
}

/// Handle for sending commands to the actor and reading what it published
#[derive(Clone, Debug)]
pub struct CustodyHandle {
    sender: mpsc::Sender<CustodyMessage>,
    published: Arc<RwLock<Arc<Snapshot>>>,
    events: broadcast::Sender<EventRecord>,
}

impl CustodyHandle {
    /// Submit a command and wait for its commit
    pub async fn execute(&self, caller: Address, at: Timestamp, command: Command) -> Result<Receipt> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CustodyMessage::Execute {
                caller,
                at,
                command,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Latest committed snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.published.read())
    }

    /// Receiver for records committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CustodyMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the custody actor over an already-loaded snapshot
pub fn spawn_custody_actor(
    storage: Arc<Storage>,
    snapshot: Snapshot,
    mailbox_capacity: usize,
    event_buffer: usize,
    metrics: Metrics,
) -> (CustodyHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let (events, _) = broadcast::channel(event_buffer.max(1));

    let current = Arc::new(snapshot);
    let published = Arc::new(RwLock::new(Arc::clone(&current)));

    metrics.update_gauges(
        current.state.blacklisted_holders().len(),
        current.state.batch_count(),
    );

    let actor = CustodyActor {
        storage,
        mailbox: rx,
        current,
        published: Arc::clone(&published),
        events: events.clone(),
        metrics,
    };

    let join = tokio::spawn(async move {
        actor.run().await;
    });

    (
        CustodyHandle {
            sender: tx,
            published,
            events,
        },
        join,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::events::ChainHead;
    use crate::state::CustodyState;
    use crate::Config;
    use chrono::Utc;

    const ADMIN: Address = Address::from_low_u64(1);
    const PRODUCER: Address = Address::from_low_u64(2);

    fn spawn(temp: &tempfile::TempDir) -> (CustodyHandle, JoinHandle<()>, Arc<Storage>) {
        let config = Config {
            data_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        let storage = Arc::new(Storage::open(&config).unwrap());
        let snapshot = Snapshot {
            state: CustodyState::genesis(ADMIN, PolicyConfig::default()).unwrap(),
            head: ChainHead::default(),
        };
        let (handle, join) =
            spawn_custody_actor(storage.clone(), snapshot, 16, 16, Metrics::new().unwrap());
        (handle, join, storage)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (handle, join, _storage) = spawn(&temp_dir);

        handle.shutdown().await.unwrap();
        join.await.unwrap();

        assert!(matches!(
            handle
                .execute(ADMIN, Utc::now(), Command::SetProducer { account: PRODUCER })
                .await,
            Err(Error::Concurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_publishes_and_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (handle, join, storage) = spawn(&temp_dir);
        let mut events = handle.subscribe();

        let receipt = handle
            .execute(ADMIN, Utc::now(), Command::SetProducer { account: PRODUCER })
            .await
            .unwrap();
        assert_eq!(receipt.event_names(), vec!["ProducerAdded"]);

        assert!(handle.snapshot().state.is_producer(PRODUCER));
        assert_eq!(handle.snapshot().head.next_sequence, 1);
        assert_eq!(events.recv().await.unwrap(), receipt.records[0]);

        let persisted = storage.load_snapshot().unwrap().unwrap();
        assert!(persisted.state.is_producer(PRODUCER));
        assert_eq!(storage.get_event(0).unwrap().unwrap(), receipt.records[0]);

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_command_leaves_no_trace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (handle, join, storage) = spawn(&temp_dir);

        let before = handle.snapshot();
        let err = handle
            .execute(PRODUCER, Utc::now(), Command::Produce { quantity: 10 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        // Same Arc: nothing was published
        assert!(Arc::ptr_eq(&before, &handle.snapshot()));
        assert!(storage.get_event(0).unwrap().is_none());

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }
}
