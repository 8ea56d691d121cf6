//! Workflow engine: maps events to triggers and drives persisted instances.
//!
//! # Transition flow
//!
//! ```text
//! handle_event(ctx, event)
//!   ├─ resolve instance id (numeric, else external id)
//!   ├─ map event type → trigger (no-op types return Ok(None))
//!   └─ transition_state(ctx, id, trigger)
//!        ├─ load machine (cache, else repository + blueprint)
//!        ├─ can_fire pre-check         ── InvalidTransition, no transaction
//!        ├─ BEGIN
//!        │    fire → update status → write history
//!        ├─ COMMIT (ROLLBACK on any error, cache untouched)
//!        ├─ invalidate cache entry
//!        └─ dispatch_async(instance.status_changed)
//! ```
//!
//! # Guarantees
//!
//! - The persisted status is authoritative. A failed transition leaves both
//!   storage and the cached machine as they were.
//! - The derived `instance.status_changed` event is fire-and-forget; its
//!   handlers can't fail the transition.
//! - No per-instance locking. Serialising concurrent writers to one instance
//!   is the transaction backend's job.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::cache::MachineCache;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::{MachineError, RepositoryError, WorkflowError};
use crate::event::{CorrelationId, Event, EventType, StatusChange, PAYLOAD_ACTOR};
use crate::repository::{
    ApprovalHistory, HistoryRepository, InstanceRepository, NewApprovalHistory, Transaction,
    TransactionManager,
};
use crate::states::{reimbursement_blueprint, ReimbursementBuilder, ReimbursementMachine, State, Trigger};

/// Name the engine subscribes under in [`WorkflowEngine::register`].
pub const ENGINE_HANDLER_NAME: &str = "workflow_engine";

/// Trigger an incoming event type maps to.
///
/// `instance.status_changed` and `attachment.ready` map to nothing: the
/// engine accepts them without acting.
pub fn trigger_for(event_type: EventType) -> Option<Trigger> {
    match event_type {
        EventType::InstanceCreated => Some(Trigger::StartAudit),
        EventType::InstanceApproved => Some(Trigger::Approve),
        EventType::InstanceRejected => Some(Trigger::Reject),
        EventType::AuditCompleted => Some(Trigger::CompleteAudit),
        EventType::VoucherGenerated => Some(Trigger::CompleteVoucher),
        EventType::InstanceStatusChanged | EventType::AttachmentReady => None,
    }
}

/// Receipt of a committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub instance_id: i64,
    pub from: State,
    pub to: State,
    pub trigger: Trigger,
}

pub struct WorkflowEngine {
    instances: Arc<dyn InstanceRepository>,
    history: Arc<dyn HistoryRepository>,
    transactions: Arc<dyn TransactionManager>,
    dispatcher: Arc<Dispatcher>,
    blueprint: ReimbursementBuilder,
    cache: MachineCache,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn builder(
        instances: Arc<dyn InstanceRepository>,
        history: Arc<dyn HistoryRepository>,
        transactions: Arc<dyn TransactionManager>,
        dispatcher: Arc<Dispatcher>,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(instances, history, transactions, dispatcher)
    }

    /// Builder for a store implementing every collaborator trait.
    pub fn builder_for_store<S>(store: Arc<S>, dispatcher: Arc<Dispatcher>) -> WorkflowEngineBuilder
    where
        S: InstanceRepository + HistoryRepository + TransactionManager + 'static,
    {
        WorkflowEngineBuilder::new(store.clone(), store.clone(), store, dispatcher)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply an incoming event to its instance.
    ///
    /// Returns `Ok(None)` for event types that carry no trigger. The event's
    /// correlation id and `actor` payload key (when set) flow into the
    /// transition.
    pub async fn handle_event(
        &self,
        ctx: &Context,
        event: &Event,
    ) -> Result<Option<Transition>, WorkflowError> {
        let instance_id = self.resolve_instance(event).await?;

        let Some(trigger) = trigger_for(event.event_type()) else {
            debug!(
                event_type = %event.event_type(),
                instance_id,
                "event carries no trigger, ignoring"
            );
            return Ok(None);
        };

        let mut ctx = ctx.clone();
        if event.correlation_id().is_some() {
            ctx = ctx.with_correlation(event.correlation_id());
        }
        let actor = event.payload_str(PAYLOAD_ACTOR);
        if !actor.is_empty() {
            ctx = ctx.with_actor(actor);
        }

        self.transition_state(&ctx, instance_id, trigger)
            .await
            .map(Some)
    }

    /// Parse a loosely-typed event body and apply it.
    pub async fn handle_json(
        &self,
        ctx: &Context,
        body: &Value,
    ) -> Result<Option<Transition>, WorkflowError> {
        let event = Event::from_json(body)?;
        self.handle_event(ctx, &event).await
    }

    /// Machine positioned at the instance's current state.
    ///
    /// The returned machine is a private copy; firing it changes nothing
    /// persisted or cached.
    pub async fn get_state_machine(
        &self,
        ctx: &Context,
        instance_id: i64,
    ) -> Result<ReimbursementMachine, WorkflowError> {
        self.load(ctx, instance_id).await.map(|(machine, _)| machine)
    }

    pub async fn get_current_state(
        &self,
        ctx: &Context,
        instance_id: i64,
    ) -> Result<State, WorkflowError> {
        Ok(self.get_state_machine(ctx, instance_id).await?.state())
    }

    /// Fire `trigger` on the instance and persist the result atomically.
    pub async fn transition_state(
        &self,
        ctx: &Context,
        instance_id: i64,
        trigger: Trigger,
    ) -> Result<Transition, WorkflowError> {
        if ctx.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        let (mut machine, external_instance_id) = self.load(ctx, instance_id).await?;
        let from = machine.state();

        if !machine.can_fire(trigger) {
            return Err(WorkflowError::Transition {
                instance_id,
                source: MachineError::InvalidTransition {
                    state: from,
                    trigger,
                },
            });
        }

        let actor = ctx
            .actor()
            .unwrap_or(self.config.default_actor.as_str())
            .to_string();
        let persistence = move |source: RepositoryError| WorkflowError::Persistence {
            instance_id,
            trigger,
            from,
            source,
        };

        let work_ctx = ctx.clone();
        let to = self
            .with_transaction(ctx, move |tx| {
                Box::pin(async move {
                    let to = machine
                        .fire(&work_ctx, trigger)
                        .map_err(|source| WorkflowError::Transition {
                            instance_id,
                            source,
                        })?;
                    tx.update_status(instance_id, to)
                        .await
                        .map_err(persistence)?;
                    tx.create_history(&NewApprovalHistory::transition(
                        instance_id,
                        actor,
                        from,
                        to,
                        trigger,
                    ))
                    .await
                    .map_err(persistence)?;
                    Ok(to)
                })
            })
            .await
            .map_err(|e| match e {
                WorkflowError::Repository(source) => persistence(source),
                other => other,
            })?;

        self.cache.invalidate(instance_id);
        info!(
            instance_id,
            from = %from,
            to = %to,
            trigger = %trigger,
            "instance transitioned"
        );

        let correlation_id = ctx.correlation_id().unwrap_or_else(CorrelationId::new);
        let change = StatusChange {
            previous_status: from.as_str().to_string(),
            new_status: to.as_str().to_string(),
            trigger: trigger.as_str().to_string(),
        };
        self.dispatcher.dispatch_async(
            ctx,
            Event::with_correlation(
                EventType::InstanceStatusChanged,
                instance_id,
                external_instance_id,
                change.into_payload(),
                correlation_id,
            ),
        );

        Ok(Transition {
            instance_id,
            from,
            to,
            trigger,
        })
    }

    /// History of the instance, oldest first.
    pub async fn get_history(
        &self,
        _ctx: &Context,
        instance_id: i64,
    ) -> Result<Vec<ApprovalHistory>, WorkflowError> {
        Ok(self.history.list_for_instance(instance_id).await?)
    }

    /// Run `work` in a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// Begin and commit failures surface as [`WorkflowError::Repository`].
    pub async fn with_transaction<R, F>(&self, ctx: &Context, work: F) -> Result<R, WorkflowError>
    where
        R: Send,
        F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<R, WorkflowError>>
            + Send,
    {
        let mut tx = self.transactions.begin(ctx).await?;

        match work(tx.as_mut()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Drop the cached machine for `instance_id`.
    pub fn invalidate(&self, instance_id: i64) -> bool {
        self.cache.invalidate(instance_id)
    }

    /// Drop every expired cache entry.
    pub fn purge_expired(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "purged expired machines");
        }
        purged
    }

    pub fn cached_machines(&self) -> usize {
        self.cache.len()
    }

    /// Subscribe the engine to every trigger-carrying event type.
    ///
    /// The dispatcher holds the engine weakly; once the last `Arc` is gone the
    /// handler does nothing.
    pub fn register(self: &Arc<Self>, dispatcher: &Dispatcher) {
        for event_type in EventType::ALL {
            if trigger_for(event_type).is_none() {
                continue;
            }
            dispatcher.subscribe_named(
                event_type,
                ENGINE_HANDLER_NAME,
                "drives the approval state machine",
                EngineHandler {
                    engine: Arc::downgrade(self),
                },
            );
        }
    }

    async fn resolve_instance(&self, event: &Event) -> Result<i64, WorkflowError> {
        if event.instance_id() != 0 {
            return Ok(event.instance_id());
        }

        let external_id = event.external_instance_id();
        if external_id.is_empty() {
            return Err(WorkflowError::InstanceNotFound(
                "event names no instance".to_string(),
            ));
        }

        match self.instances.get_by_external_id(external_id).await? {
            Some(instance) => Ok(instance.id),
            None => Err(WorkflowError::InstanceNotFound(external_id.to_string())),
        }
    }

    async fn load(
        &self,
        _ctx: &Context,
        instance_id: i64,
    ) -> Result<(ReimbursementMachine, String), WorkflowError> {
        if let Some(hit) = self.cache.get(instance_id) {
            debug!(instance_id, state = %hit.machine.state(), "machine cache hit");
            return Ok((hit.machine, hit.external_instance_id));
        }

        let generation = self.cache.generation(instance_id);
        let instance = self
            .instances
            .get_by_id(instance_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound(_) => {
                    WorkflowError::InstanceNotFound(instance_id.to_string())
                }
                other => WorkflowError::Repository(other),
            })?;

        let state = instance
            .state()
            .map_err(|_| WorkflowError::InvalidState {
                instance_id,
                status: instance.status.clone(),
            })?;

        let machine = self.blueprint.build(state);
        if self.cache.insert(
            instance_id,
            machine.clone(),
            instance.external_instance_id.clone(),
            generation,
        ) {
            debug!(instance_id, state = %state, "machine cached");
        } else {
            debug!(instance_id, state = %state, "instance changed during load, not caching");
        }

        Ok((machine, instance.external_instance_id))
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("cached_machines", &self.cache.len())
            .field("config", &self.config)
            .finish()
    }
}

struct EngineHandler {
    engine: Weak<WorkflowEngine>,
}

#[async_trait]
impl EventHandler for EngineHandler {
    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        engine.handle_event(ctx, event).await?;
        Ok(())
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct WorkflowEngineBuilder {
    instances: Arc<dyn InstanceRepository>,
    history: Arc<dyn HistoryRepository>,
    transactions: Arc<dyn TransactionManager>,
    dispatcher: Arc<Dispatcher>,
    blueprint: ReimbursementBuilder,
    config: EngineConfig,
}

impl WorkflowEngineBuilder {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        history: Arc<dyn HistoryRepository>,
        transactions: Arc<dyn TransactionManager>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            instances,
            history,
            transactions,
            dispatcher,
            blueprint: reimbursement_blueprint(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn with_default_actor(mut self, actor: impl Into<String>) -> Self {
        self.config.default_actor = actor.into();
        self
    }

    /// Replace the reimbursement graph, e.g. to add guards.
    pub fn with_blueprint(mut self, blueprint: ReimbursementBuilder) -> Self {
        self.blueprint = blueprint;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            instances: self.instances,
            history: self.history,
            transactions: self.transactions,
            dispatcher: self.dispatcher,
            blueprint: self.blueprint,
            cache: MachineCache::new(self.config.cache_ttl),
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::testing::InMemoryStore;

    fn engine_with(store: &Arc<InMemoryStore>) -> WorkflowEngine {
        WorkflowEngine::builder_for_store(store.clone(), Arc::new(Dispatcher::new())).build()
    }

    #[test]
    fn test_trigger_mapping() {
        assert_eq!(trigger_for(EventType::InstanceCreated), Some(Trigger::StartAudit));
        assert_eq!(trigger_for(EventType::InstanceApproved), Some(Trigger::Approve));
        assert_eq!(trigger_for(EventType::InstanceRejected), Some(Trigger::Reject));
        assert_eq!(trigger_for(EventType::AuditCompleted), Some(Trigger::CompleteAudit));
        assert_eq!(
            trigger_for(EventType::VoucherGenerated),
            Some(Trigger::CompleteVoucher)
        );
        assert_eq!(trigger_for(EventType::InstanceStatusChanged), None);
        assert_eq!(trigger_for(EventType::AttachmentReady), None);
    }

    #[test]
    fn test_builder_applies_config() {
        let store = Arc::new(InMemoryStore::new());
        let engine = WorkflowEngine::builder_for_store(store, Arc::new(Dispatcher::new()))
            .with_cache_ttl(Duration::from_secs(5))
            .with_default_actor("finance-bot")
            .build();
        assert_eq!(engine.config().cache_ttl, Duration::from_secs(5));
        assert_eq!(engine.config().default_actor, "finance-bot");
        assert_eq!(engine.cached_machines(), 0);
    }

    #[tokio::test]
    async fn test_transition_records_default_actor() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_instance("ext-1", State::InReview);
        let engine = engine_with(&store);

        let transition = engine
            .transition_state(&Context::new(), id, Trigger::Approve)
            .await
            .unwrap();
        assert_eq!(
            transition,
            Transition {
                instance_id: id,
                from: State::InReview,
                to: State::Approved,
                trigger: Trigger::Approve,
            }
        );

        let history = engine.get_history(&Context::new(), id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reviewer_id, "system");
        assert_eq!(history[0].previous_status, "IN_REVIEW");
        assert_eq!(history[0].new_status, "APPROVED");
        assert_eq!(history[0].action_type, "APPROVE");
    }

    #[tokio::test]
    async fn test_actor_from_event_payload() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_instance("ext-1", State::InReview);
        let engine = engine_with(&store);

        let event = Event::new(EventType::InstanceApproved, id, "ext-1", Payload::new())
            .with_payload(PAYLOAD_ACTOR, "reviewer-7");
        engine
            .handle_event(&Context::new().with_actor("ignored"), &event)
            .await
            .unwrap();

        assert_eq!(store.history_for(id)[0].reviewer_id, "reviewer-7");
    }

    #[tokio::test]
    async fn test_invalid_transition_opens_no_transaction() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_instance("ext-1", State::Created);
        let engine = engine_with(&store);

        let err = engine
            .transition_state(&Context::new(), id, Trigger::Approve)
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(store.transactions_started(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_is_refused() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_instance("ext-1", State::Created);
        let engine = engine_with(&store);

        let ctx = Context::new();
        ctx.cancel();
        let err = engine
            .transition_state(&ctx, id, Trigger::Submit)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
        assert_eq!(store.status_of(id).as_deref(), Some("CREATED"));
    }

    #[tokio::test]
    async fn test_corrupt_status_is_invalid_state() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_raw_instance("ext-1", "ON_HOLD");
        let engine = engine_with(&store);

        let err = engine
            .get_current_state(&Context::new(), id)
            .await
            .unwrap_err();
        assert!(
            matches!(err, WorkflowError::InvalidState { instance_id, ref status } if instance_id == id && status == "ON_HOLD")
        );
    }

    #[tokio::test]
    async fn test_guarded_blueprint_reports_guard_failure() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_instance("ext-1", State::AiAudited);

        let mut blueprint = ReimbursementBuilder::new();
        blueprint.configure(State::AiAudited).permit_if(
            Trigger::AutoApprove,
            State::AutoApproved,
            |ctx: &Context| ctx.actor() == Some("auditor"),
        );
        let engine = WorkflowEngine::builder_for_store(store.clone(), Arc::new(Dispatcher::new()))
            .with_blueprint(blueprint)
            .build();

        let err = engine
            .transition_state(&Context::new(), id, Trigger::AutoApprove)
            .await
            .unwrap_err();
        assert!(err.is_guard_failed());
        assert_eq!(store.status_of(id).as_deref(), Some("AI_AUDITED"));
        assert!(store.history_for(id).is_empty());

        let transition = engine
            .transition_state(
                &Context::new().with_actor("auditor"),
                id,
                Trigger::AutoApprove,
            )
            .await
            .unwrap();
        assert_eq!(transition.to, State::AutoApproved);
    }

    #[tokio::test]
    async fn test_engine_handler_is_weak() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.insert_instance("ext-1", State::Created);
        let dispatcher = Arc::new(Dispatcher::new());
        let engine = Arc::new(
            WorkflowEngine::builder_for_store(store.clone(), dispatcher.clone()).build(),
        );
        engine.register(&dispatcher);
        assert_eq!(dispatcher.handler_count(EventType::InstanceCreated), 1);
        assert_eq!(dispatcher.handler_count(EventType::InstanceStatusChanged), 0);

        drop(engine);
        let event = Event::new(EventType::InstanceCreated, id, "ext-1", Payload::new());
        dispatcher.dispatch(&Context::new(), &event).await.unwrap();
        assert_eq!(store.status_of(id).as_deref(), Some("CREATED"));
    }
}
