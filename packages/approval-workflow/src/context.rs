//! Execution context threaded through dispatch and transition calls.
//!
//! A [`Context`] carries a [`CancellationToken`] so long-running handlers can
//! stop early, plus the optional actor and correlation id of the operation
//! that started the work. Neither the dispatcher nor the engine forcibly
//! cancels anything; handlers are expected to observe the token themselves.

use tokio_util::sync::CancellationToken;

use crate::event::CorrelationId;

/// Cancellation-aware context passed to handlers, guards and engine calls.
///
/// Cloning is cheap; clones share the same cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    actor: Option<String>,
    correlation_id: Option<CorrelationId>,
}

impl Context {
    /// Create a context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context bound to an existing cancellation token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            actor: None,
            correlation_id: None,
        }
    }

    /// Set the actor recorded in audit history for transitions made with this context.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation id that derived events should carry.
    pub fn with_correlation(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    /// Derive a child context: cancelling the parent cancels the child, not vice versa.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            actor: self.actor.clone(),
            correlation_id: self.correlation_id,
        }
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of all work observing this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_is_cancelled_with_parent() {
        let parent = Context::new().with_actor("alice");
        let child = parent.child();

        assert_eq!(child.actor(), Some("alice"));
        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_cancelling_child_leaves_parent_running() {
        let parent = Context::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_correlation_is_carried_to_child() {
        let cid = CorrelationId::new();
        let ctx = Context::new().with_correlation(cid);
        assert_eq!(ctx.child().correlation_id(), Some(cid));
        assert_eq!(Context::new().correlation_id(), None);
    }
}
