//! # Approval Workflow
//!
//! The event-driven core of a reimbursement approval system: events come in,
//! a guarded state machine decides, a transaction records the outcome, and a
//! derived `instance.status_changed` event goes back out.
//!
//! ## Core Concepts
//!
//! - [`Event`]: an immutable fact about an approval instance
//! - [`Dispatcher`]: named, per-type pub/sub with sync and async delivery
//! - [`StateMachineBuilder`] / [`StateMachine`]: a transition table compiled
//!   into independent, guarded runtimes
//! - [`WorkflowEngine`]: maps events to [`Trigger`]s and drives persisted
//!   instances through the reimbursement graph
//!
//! ## Architecture
//!
//! ```text
//! Platform webhook / producer
//!     │
//!     ▼ dispatch() / dispatch_async()
//! Dispatcher ───────────────────────────────────────┐
//!     │                                             │
//!     ├─► other handlers (notifications, audit) ◄───┤
//!     │                                             │
//!     └─► WorkflowEngine.handle_event()             │
//!             │                                     │
//!             ├─► MachineCache / InstanceRepository │
//!             ├─► StateMachine.fire()               │
//!             ├─► Transaction: status + history     │
//!             │                                     │
//!             └─► dispatch_async(status_changed) ───┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Events are facts**: never mutated; `with_payload` returns a copy
//! 2. **Persisted status is authoritative**: the cache is dropped after every commit
//! 3. **One transition = one transaction**: status and history commit together or not at all
//! 4. **Handlers are isolated**: a panic fails only that handler
//!
//! ## Example
//!
//! ```ignore
//! use approval_workflow::{Context, Dispatcher, EngineConfig, WorkflowEngine, PgStore};
//!
//! approval_workflow::init_tracing()?;
//!
//! let store = Arc::new(PgStore::new(pool));
//! let dispatcher = Arc::new(Dispatcher::new());
//! let engine = Arc::new(
//!     WorkflowEngine::builder_for_store(store, dispatcher.clone())
//!         .with_config(EngineConfig::from_env()?)
//!         .build(),
//! );
//! engine.register(&dispatcher);
//!
//! dispatcher.subscribe_named(
//!     EventType::InstanceStatusChanged,
//!     "notify_applicant",
//!     "emails the applicant",
//!     NotifyApplicant::new(mailer),
//! );
//!
//! // From a webhook handler:
//! engine.handle_json(&Context::new(), &body).await?;
//!
//! // On shutdown:
//! dispatcher.close().await?;
//! ```

// Core modules
mod cache;
mod config;
mod context;
mod dispatch;
mod engine;
mod error;
mod event;
mod machine;
mod repository;
mod states;
mod telemetry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export context
pub use context::Context;

// Re-export event types
pub use event::{
    CorrelationId, Event, EventId, EventType, Payload, StatusChange, PAYLOAD_ACTOR,
    PAYLOAD_NEW_STATUS, PAYLOAD_PREVIOUS_STATUS, PAYLOAD_TRIGGER,
};

// Re-export error types
pub use crate::error::{
    DispatchError, EventError, MachineError, ParseStateError, ParseTriggerError,
    RepositoryError, WorkflowError,
};

// Re-export dispatcher types
pub use dispatch::{handler_fn, Dispatcher, EventHandler, HandlerFn, HandlerInfo};

// Re-export state machine types
pub use machine::{Guard, Label, StateConfiguration, StateMachine, StateMachineBuilder};

// Re-export reimbursement graph
pub use states::{
    reimbursement_blueprint, ReimbursementBuilder, ReimbursementMachine, State, Trigger,
};

// Re-export storage collaborators
pub use repository::{
    ApprovalHistory, ApprovalInstance, HistoryRepository, InstanceRepository, NewApprovalHistory,
    Transaction, TransactionManager,
};

#[cfg(feature = "postgres")]
pub use repository::PgStore;

// Re-export engine types (primary entry point)
pub use cache::{CachedMachine, MachineCache, DEFAULT_CACHE_TTL};
pub use config::{EngineConfig, DEFAULT_ACTOR};
pub use engine::{
    trigger_for, Transition, WorkflowEngine, WorkflowEngineBuilder, ENGINE_HANDLER_NAME,
};
pub use telemetry::{init_tracing, DEFAULT_FILTER};

// Re-export commonly used external types
pub use async_trait::async_trait;
