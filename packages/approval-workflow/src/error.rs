//! Structured error types for the workflow core.
//!
//! Every layer returns a pattern-matchable error instead of a bare
//! `anyhow::Error`:
//!
//! - [`EventError`]: a raw event body could not be turned into an [`Event`](crate::Event)
//! - [`DispatchError`]: dispatcher lifecycle failures and handler failures
//! - [`MachineError`]: a trigger was not permitted, or every guard rejected it
//! - [`RepositoryError`]: a collaborator (repository, transaction) failed
//! - [`WorkflowError`]: what the engine reports, with instance/trigger context
//!
//! `anyhow` stays the transport for handler and backend failures, where the
//! concrete error type belongs to code outside this crate.
//!
//! # Branching on domain outcomes
//!
//! ```ignore
//! match engine.transition_state(&ctx, id, Trigger::Approve).await {
//!     Ok(transition) => info!(to = %transition.to, "approved"),
//!     Err(e) if e.is_invalid_transition() => { /* not allowed from here */ }
//!     Err(e) if e.is_guard_failed() => { /* business rule vetoed it */ }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

use crate::states::{State, Trigger};

/// A raw event body could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The `type` field is not one of the known event types.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The body is structurally wrong (not an object, missing type, ...).
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// A persisted or external string is not a known [`State`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown state: {0}")]
pub struct ParseStateError(pub String);

/// A persisted or external string is not a known [`Trigger`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown trigger: {0}")]
pub struct ParseTriggerError(pub String);

/// Dispatcher failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher has been closed and accepts no more work.
    #[error("dispatcher closed")]
    Closed,

    /// `close` was called more than once.
    #[error("dispatcher already closed")]
    AlreadyClosed,

    /// A handler returned an error (or panicked) during synchronous dispatch.
    #[error("handler {handler} failed: {source}")]
    Handler {
        /// Name the failing handler was registered under.
        handler: String,
        /// The handler's error; panics surface as `handler panic: <value>`.
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Name of the failing handler, if this is a handler failure.
    pub fn handler_name(&self) -> Option<&str> {
        match self {
            DispatchError::Handler { handler, .. } => Some(handler),
            _ => None,
        }
    }
}

/// Domain rule violations raised by [`StateMachine::fire`](crate::StateMachine::fire).
///
/// Both variants leave the machine's state unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError<S, T> {
    /// No candidate transition exists for the trigger in the current state.
    #[error("invalid transition: {trigger} is not permitted from {state}")]
    InvalidTransition { state: S, trigger: T },

    /// Candidates exist but every guard rejected the transition.
    #[error("guard failed: every candidate for {trigger} from {state} was rejected")]
    GuardFailed { state: S, trigger: T },
}

/// Collaborator failures (repositories and transactions).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage backend failed (connection, timeout, serialization).
    #[error("repository backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row".into()),
            other => RepositoryError::Backend(other.into()),
        }
    }
}

/// Errors reported by the [`WorkflowEngine`](crate::WorkflowEngine).
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Neither the numeric nor the external id resolved to an instance.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The event type string is not one the engine understands.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The raw event body could not be parsed.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The instance's persisted status is not a known state.
    #[error("invalid state {status:?} stored for instance {instance_id}")]
    InvalidState { instance_id: i64, status: String },

    /// The state machine refused the trigger.
    #[error("instance {instance_id}: {source}")]
    Transition {
        instance_id: i64,
        #[source]
        source: MachineError<State, Trigger>,
    },

    /// Writing the transition failed; nothing was committed.
    #[error("instance {instance_id}: persisting {trigger} from {from} failed: {source}")]
    Persistence {
        instance_id: i64,
        trigger: Trigger,
        from: State,
        #[source]
        source: RepositoryError,
    },

    /// Reading from a repository failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The context was cancelled before the operation started.
    #[error("operation cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// The state machine error behind this failure, if any.
    pub fn machine_error(&self) -> Option<&MachineError<State, Trigger>> {
        match self {
            WorkflowError::Transition { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self.machine_error(),
            Some(MachineError::InvalidTransition { .. })
        )
    }

    pub fn is_guard_failed(&self) -> bool {
        matches!(self.machine_error(), Some(MachineError::GuardFailed { .. }))
    }
}

impl From<EventError> for WorkflowError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::UnknownEventType(t) => WorkflowError::UnknownEventType(t),
            EventError::Malformed(msg) => WorkflowError::MalformedEvent(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_handler_error_display_names_handler() {
        let err = DispatchError::Handler {
            handler: "audit_logger".into(),
            source: anyhow::anyhow!("handler panic: boom"),
        };
        assert_eq!(err.handler_name(), Some("audit_logger"));
        assert!(err.to_string().contains("audit_logger"));
        assert!(err.to_string().contains("handler panic: boom"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_lifecycle_error_display() {
        assert_eq!(DispatchError::Closed.to_string(), "dispatcher closed");
        assert_eq!(
            DispatchError::AlreadyClosed.to_string(),
            "dispatcher already closed"
        );
        assert_eq!(DispatchError::Closed.handler_name(), None);
    }

    #[test]
    fn test_machine_error_display() {
        let err = MachineError::InvalidTransition {
            state: State::AiAudited,
            trigger: Trigger::Approve,
        };
        assert!(err.to_string().contains("APPROVE"));
        assert!(err.to_string().contains("AI_AUDITED"));
    }

    #[test]
    fn test_workflow_error_is_pattern_matchable() {
        let err = WorkflowError::Transition {
            instance_id: 4,
            source: MachineError::GuardFailed {
                state: State::AiAudited,
                trigger: Trigger::AutoApprove,
            },
        };
        assert!(err.is_guard_failed());
        assert!(!err.is_invalid_transition());
        assert!(err.to_string().contains("instance 4"));

        let err = WorkflowError::Cancelled;
        assert!(err.machine_error().is_none());
    }

    #[test]
    fn test_event_error_maps_into_workflow_error() {
        let err: WorkflowError = EventError::UnknownEventType("x.y".into()).into();
        assert!(matches!(err, WorkflowError::UnknownEventType(t) if t == "x.y"));

        let err: WorkflowError = EventError::Malformed("bad".into()).into();
        assert!(matches!(err, WorkflowError::MalformedEvent(_)));
    }

    #[test]
    fn test_persistence_error_keeps_context() {
        let err = WorkflowError::Persistence {
            instance_id: 12,
            trigger: Trigger::Approve,
            from: State::InReview,
            source: RepositoryError::Backend(anyhow::anyhow!("connection reset")),
        };
        let msg = err.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("APPROVE"));
        assert!(msg.contains("IN_REVIEW"));
        assert!(msg.contains("connection reset"));
    }
}
