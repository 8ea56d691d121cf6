//! Testing utilities for the workflow core.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! approval-workflow = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Contents
//!
//! - [`InMemoryStore`]: every storage collaborator in memory, with staged
//!   transactional writes and failure injection
//! - [`RecordingHandler`]: an [`EventHandler`] that records what it sees and
//!   lets a test wait for N events
//! - [`CapturedLogs`]: a `tracing` layer counting log entries per level
//!
//! ```ignore
//! let store = Arc::new(InMemoryStore::new());
//! let id = store.insert_instance("ext-1", State::InReview);
//! store.fail_history(true);
//!
//! let err = engine.transition_state(&ctx, id, Trigger::Approve).await.unwrap_err();
//! assert_eq!(store.status_of(id).as_deref(), Some("IN_REVIEW"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::Layer;

use crate::context::Context;
use crate::dispatch::EventHandler;
use crate::error::RepositoryError;
use crate::event::Event;
use crate::repository::{
    ApprovalHistory, ApprovalInstance, HistoryRepository, InstanceRepository, NewApprovalHistory,
    Transaction, TransactionManager,
};
use crate::states::State;

// =============================================================================
// InMemoryStore
// =============================================================================

#[derive(Default)]
struct Tables {
    instances: HashMap<i64, ApprovalInstance>,
    history: Vec<ApprovalHistory>,
    next_instance_id: i64,
    next_history_id: i64,
}

impl Tables {
    fn set_status(&mut self, id: i64, status: State) -> Result<(), RepositoryError> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", id)))?;
        instance.status = status.as_str().to_string();
        instance.updated_at = Utc::now();
        Ok(())
    }

    fn append_history(&mut self, record: NewApprovalHistory) {
        self.next_history_id += 1;
        self.history.push(ApprovalHistory {
            id: self.next_history_id,
            instance_id: record.instance_id,
            reviewer_id: record.reviewer_id,
            previous_status: record.previous_status,
            new_status: record.new_status,
            action_type: record.action_type,
            action_data: record.action_data,
            created_at: record.created_at,
        });
    }
}

#[derive(Default)]
struct Faults {
    begin: AtomicBool,
    update: AtomicBool,
    history: AtomicBool,
    commit: AtomicBool,
}

fn injected(what: &str) -> RepositoryError {
    RepositoryError::Backend(anyhow!("injected {} failure", what))
}

fn lock_tables(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
    tables
        .lock()
        .map_err(|e| RepositoryError::Backend(anyhow!("mutex poisoned: {}", e)))
}

/// In-memory implementation of every storage collaborator.
///
/// Transactions stage their writes and apply them together on commit, so an
/// uncommitted or rolled-back transaction leaves nothing behind.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
    transactions_started: AtomicUsize,
    commits: Arc<AtomicUsize>,
    rollbacks: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance in `status`, returning its id.
    pub fn insert_instance(&self, external_instance_id: &str, status: State) -> i64 {
        self.insert_raw_instance(external_instance_id, status.as_str())
    }

    /// Insert an instance with an arbitrary stored status string.
    pub fn insert_raw_instance(&self, external_instance_id: &str, status: &str) -> i64 {
        let mut tables = self.tables();
        tables.next_instance_id += 1;
        let id = tables.next_instance_id;
        let now = Utc::now();
        tables.instances.insert(
            id,
            ApprovalInstance {
                id,
                external_instance_id: external_instance_id.to_string(),
                status: status.to_string(),
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Overwrite the stored status outside any transaction.
    pub fn force_status(&self, id: i64, status: &str) {
        if let Some(instance) = self.tables().instances.get_mut(&id) {
            instance.status = status.to_string();
        }
    }

    pub fn status_of(&self, id: i64) -> Option<String> {
        self.tables().instances.get(&id).map(|i| i.status.clone())
    }

    pub fn history_for(&self, instance_id: i64) -> Vec<ApprovalHistory> {
        self.tables()
            .history
            .iter()
            .filter(|h| h.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub fn fail_begin(&self, fail: bool) {
        self.faults.begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.faults.update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.faults.history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.faults.commit.store(fail, Ordering::SeqCst);
    }

    pub fn transactions_started(&self) -> usize {
        self.transactions_started.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InstanceRepository for InMemoryStore {
    async fn get_by_id(&self, id: i64) -> Result<ApprovalInstance, RepositoryError> {
        lock_tables(&self.tables)?
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", id)))
    }

    async fn get_by_external_id(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<ApprovalInstance>, RepositoryError> {
        Ok(lock_tables(&self.tables)?
            .instances
            .values()
            .find(|i| i.external_instance_id == external_instance_id)
            .cloned())
    }

    async fn update_status(&self, id: i64, status: State) -> Result<(), RepositoryError> {
        if self.faults.update.load(Ordering::SeqCst) {
            return Err(injected("update"));
        }
        lock_tables(&self.tables)?.set_status(id, status)
    }
}

#[async_trait]
impl HistoryRepository for InMemoryStore {
    async fn create(&self, record: &NewApprovalHistory) -> Result<(), RepositoryError> {
        if self.faults.history.load(Ordering::SeqCst) {
            return Err(injected("history"));
        }
        lock_tables(&self.tables)?.append_history(record.clone());
        Ok(())
    }

    async fn list_for_instance(
        &self,
        instance_id: i64,
    ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        Ok(lock_tables(&self.tables)?
            .history
            .iter()
            .filter(|h| h.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

enum StagedWrite {
    Status(i64, State),
    History(NewApprovalHistory),
}

struct InMemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
    commits: Arc<AtomicUsize>,
    rollbacks: Arc<AtomicUsize>,
    staged: Vec<StagedWrite>,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn update_status(&mut self, id: i64, status: State) -> Result<(), RepositoryError> {
        if self.faults.update.load(Ordering::SeqCst) {
            return Err(injected("update"));
        }
        if !lock_tables(&self.tables)?.instances.contains_key(&id) {
            return Err(RepositoryError::NotFound(format!("instance {}", id)));
        }
        self.staged.push(StagedWrite::Status(id, status));
        Ok(())
    }

    async fn create_history(
        &mut self,
        record: &NewApprovalHistory,
    ) -> Result<(), RepositoryError> {
        if self.faults.history.load(Ordering::SeqCst) {
            return Err(injected("history"));
        }
        self.staged.push(StagedWrite::History(record.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let InMemoryTransaction {
            tables,
            faults,
            commits,
            staged,
            ..
        } = *self;
        if faults.commit.load(Ordering::SeqCst) {
            return Err(injected("commit"));
        }

        let mut tables = lock_tables(&tables)?;
        for write in &staged {
            if let StagedWrite::Status(id, _) = write {
                if !tables.instances.contains_key(id) {
                    return Err(RepositoryError::NotFound(format!("instance {}", id)));
                }
            }
        }
        for write in staged {
            match write {
                StagedWrite::Status(id, status) => tables.set_status(id, status)?,
                StagedWrite::History(record) => tables.append_history(record),
            }
        }
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TransactionManager for InMemoryStore {
    async fn begin(&self, _ctx: &Context) -> Result<Box<dyn Transaction>, RepositoryError> {
        if self.faults.begin.load(Ordering::SeqCst) {
            return Err(injected("begin"));
        }
        self.transactions_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction {
            tables: self.tables.clone(),
            faults: self.faults.clone(),
            commits: self.commits.clone(),
            rollbacks: self.rollbacks.clone(),
            staged: Vec::new(),
        }))
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables();
        f.debug_struct("InMemoryStore")
            .field("instances", &tables.instances.len())
            .field("history", &tables.history.len())
            .finish()
    }
}

// =============================================================================
// RecordingHandler
// =============================================================================

/// Records every event it handles. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` events have been recorded.
    ///
    /// Wrap in `tokio::time::timeout` to avoid hanging a failing test.
    pub async fn wait_for(&self, count: usize) {
        loop {
            // Register for notification BEFORE checking the count
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

// =============================================================================
// CapturedLogs
// =============================================================================

/// A `tracing` layer that keeps every log entry's level and message.
///
/// ```ignore
/// let logs = CapturedLogs::new();
/// let _guard = logs.install();
/// // ... code under test ...
/// assert_eq!(logs.count(Level::ERROR), 1);
/// ```
#[derive(Clone, Default)]
pub struct CapturedLogs {
    entries: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the thread's default subscriber until the guard drops.
    ///
    /// Only captures logs from the current thread, so use it with the
    /// current-thread tokio runtime.
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn count(&self, level: Level) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*event.metadata().level(), visitor.message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transaction_writes_are_staged_until_commit() {
        let store = InMemoryStore::new();
        let id = store.insert_instance("ext-1", State::InReview);

        let mut tx = store.begin(&Context::new()).await.unwrap();
        tx.update_status(id, State::Approved).await.unwrap();
        assert_eq!(store.status_of(id).as_deref(), Some("IN_REVIEW"));

        tx.commit().await.unwrap();
        assert_eq!(store.status_of(id).as_deref(), Some("APPROVED"));
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = InMemoryStore::new();
        let id = store.insert_instance("ext-1", State::InReview);

        let mut tx = store.begin(&Context::new()).await.unwrap();
        tx.update_status(id, State::Rejected).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.status_of(id).as_deref(), Some("IN_REVIEW"));
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn test_lookup_by_external_id() {
        let store = InMemoryStore::new();
        let id = store.insert_instance("ext-9", State::Created);

        let found = store.get_by_external_id("ext-9").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(store.get_by_external_id("nope").await.unwrap().is_none());
        assert!(matches!(
            store.get_by_id(404).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryStore::new();
        let id = store.insert_instance("ext-1", State::Created);

        store.fail_begin(true);
        assert!(store.begin(&Context::new()).await.is_err());
        store.fail_begin(false);

        store.fail_updates(true);
        assert!(store.update_status(id, State::Pending).await.is_err());
    }

    #[test]
    fn test_captured_logs_count_levels() {
        let logs = CapturedLogs::new();
        {
            let _guard = logs.install();
            tracing::error!(handler = "h", "handler panicked");
            tracing::info!("fine");
        }
        tracing::error!("not captured");

        assert_eq!(logs.count(Level::ERROR), 1);
        assert_eq!(logs.count(Level::INFO), 1);
        assert_eq!(logs.messages(Level::ERROR), vec!["handler panicked".to_string()]);
    }
}
