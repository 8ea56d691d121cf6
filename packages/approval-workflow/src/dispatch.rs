//! In-process publish/subscribe dispatcher.
//!
//! Handlers register per [`EventType`] under a name. Producers publish either:
//!
//! - **synchronously** with [`Dispatcher::dispatch`]: handlers run one after
//!   another on the caller's task, in subscription order. The first failure
//!   stops the remaining handlers and is returned to the caller.
//! - **asynchronously** with [`Dispatcher::dispatch_async`]: each handler is
//!   spawned as its own tokio task and the call returns immediately. Failures
//!   are logged and never reach the caller or sibling handlers.
//!
//! # Panic isolation
//!
//! Every handler runs under `catch_unwind`. A panic becomes an error for that
//! handler only (`handler panic: <value>`) and is logged once at error level.
//!
//! # Shutdown
//!
//! [`Dispatcher::close`] stops admitting new work and waits until every
//! asynchronous handler task that was admitted has finished. It can be called
//! once; a second call returns [`DispatchError::AlreadyClosed`].
//!
//! # Guarantees
//!
//! - **In-memory only**: events are not persisted by the dispatcher
//! - **No timeout**: a hung synchronous handler blocks `dispatch` indefinitely;
//!   handlers should observe the [`Context`] cancellation token

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::DispatchError;
use crate::event::{Event, EventType};

// =============================================================================
// Handlers
// =============================================================================

/// Something that reacts to events.
///
/// # Example
///
/// ```ignore
/// struct NotifyApplicant { mailer: Mailer }
///
/// #[async_trait]
/// impl EventHandler for NotifyApplicant {
///     async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
///         if let Some(change) = StatusChange::from_event(event) {
///             self.mailer.send(event.external_instance_id(), &change.new_status).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &Context, event: &Event) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct HandlerFn<F>(F);

/// Wrap `f` as a handler. The closure receives owned clones of the context and event.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context, event: &Event) -> Result<()> {
        (self.0)(ctx.clone(), event.clone()).await
    }
}

/// Public metadata about a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub name: String,
    pub event_type: EventType,
    pub description: String,
}

#[derive(Clone)]
struct Registered {
    info: HandlerInfo,
    handler: Arc<dyn EventHandler>,
}

enum HandlerFailure {
    Failed(anyhow::Error),
    Panicked(String),
}

/// Run one handler, converting a panic into a failure.
async fn run_handler(
    handler: &Arc<dyn EventHandler>,
    ctx: &Context,
    event: &Event,
) -> std::result::Result<(), HandlerFailure> {
    match AssertUnwindSafe(handler.handle(ctx, event))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HandlerFailure::Failed(e)),
        Err(panic_info) => Err(HandlerFailure::Panicked(extract_panic_message(&panic_info))),
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Inflight Tracking
// =============================================================================

/// Counts asynchronous handler tasks that have been admitted but not finished.
#[derive(Default)]
struct InflightTasks {
    count: AtomicUsize,
    notify: Notify,
}

impl InflightTasks {
    fn begin(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            tasks: self.clone(),
        }
    }

    fn pending(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_zero(&self) {
        loop {
            // Register for notification BEFORE checking count so a
            // decrement between the check and the await is not missed.
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the inflight count on drop, including when a task unwinds.
struct InflightGuard {
    tasks: Arc<InflightTasks>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.tasks.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tasks.notify.notify_waiters();
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Event dispatcher with named, per-type handler registration.
///
/// Share it behind an `Arc`; all methods take `&self`.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(Dispatcher::new());
///
/// dispatcher.subscribe_named(
///     EventType::InstanceStatusChanged,
///     "notify_applicant",
///     "emails the applicant when the status changes",
///     NotifyApplicant { mailer },
/// );
///
/// dispatcher.dispatch(&ctx, &event).await?;   // waits for every handler
/// dispatcher.dispatch_async(&ctx, event);     // returns immediately
///
/// dispatcher.close().await?;                  // drains async handlers
/// ```
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventType, Vec<Registered>>>,
    closed: AtomicBool,
    inflight: Arc<InflightTasks>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            inflight: Arc::new(InflightTasks::default()),
        }
    }

    /// Register a handler under its type name.
    pub fn subscribe<H: EventHandler>(&self, event_type: EventType, handler: H) {
        self.subscribe_named(event_type, std::any::type_name::<H>(), "", handler);
    }

    /// Register a handler under an explicit name, which `unsubscribe` can target.
    pub fn subscribe_named<H: EventHandler>(
        &self,
        event_type: EventType,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: H,
    ) {
        let info = HandlerInfo {
            name: name.into(),
            event_type,
            description: description.into(),
        };
        debug!(event_type = %event_type, handler = %info.name, "handler subscribed");

        let registered = Registered {
            info,
            handler: Arc::new(handler),
        };
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push(registered);
    }

    /// Remove every handler registered under `name` for `event_type`.
    ///
    /// Returns how many handlers were removed.
    pub fn unsubscribe(&self, event_type: EventType, name: &str) -> usize {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(registered) = handlers.get_mut(&event_type) else {
            return 0;
        };
        let before = registered.len();
        registered.retain(|r| r.info.name != name);
        let removed = before - registered.len();

        if registered.is_empty() {
            handlers.remove(&event_type);
        }
        if removed > 0 {
            debug!(event_type = %event_type, handler = %name, removed, "handler unsubscribed");
        }
        removed
    }

    /// Metadata for the handlers of `event_type`, in registration order.
    pub fn list_handlers(&self, event_type: EventType) -> Vec<HandlerInfo> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map(|registered| registered.iter().map(|r| r.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Dispatch `event` and wait for every handler to finish.
    ///
    /// Handlers run in subscription order. The first failing handler stops
    /// the rest; its error is returned wrapped with the handler's name.
    pub async fn dispatch(&self, ctx: &Context, event: &Event) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        for registered in self.snapshot(event.event_type()) {
            match run_handler(&registered.handler, ctx, event).await {
                Ok(()) => {}
                Err(HandlerFailure::Failed(source)) => {
                    return Err(DispatchError::Handler {
                        handler: registered.info.name,
                        source,
                    });
                }
                Err(HandlerFailure::Panicked(panic_msg)) => {
                    error!(
                        handler = %registered.info.name,
                        event_type = %event.event_type(),
                        event_id = %event.id(),
                        panic = %panic_msg,
                        "handler panicked"
                    );
                    return Err(DispatchError::Handler {
                        handler: registered.info.name,
                        source: anyhow!("handler panic: {}", panic_msg),
                    });
                }
            }
        }
        Ok(())
    }

    /// Spawn every handler for `event` as a background task and return immediately.
    ///
    /// Must be called from within a tokio runtime. Handler failures are
    /// logged. After `close` the event is dropped with an error log.
    pub fn dispatch_async(&self, ctx: &Context, event: Event) {
        // Admission is counted before the closed check so `close` either sees
        // this call in flight or this call sees the dispatcher closed.
        let _admission = self.inflight.begin();
        if self.is_closed() {
            error!(
                event_type = %event.event_type(),
                event_id = %event.id(),
                "dispatcher closed, dropping event"
            );
            return;
        }

        let event = Arc::new(event);
        for registered in self.snapshot(event.event_type()) {
            let guard = self.inflight.begin();
            let ctx = ctx.clone();
            let event = event.clone();

            tokio::spawn(async move {
                let _guard = guard;
                match run_handler(&registered.handler, &ctx, &event).await {
                    Ok(()) => {}
                    Err(HandlerFailure::Failed(e)) => {
                        error!(
                            handler = %registered.info.name,
                            event_type = %event.event_type(),
                            event_id = %event.id(),
                            error = %e,
                            "async handler failed"
                        );
                    }
                    Err(HandlerFailure::Panicked(panic_msg)) => {
                        error!(
                            handler = %registered.info.name,
                            event_type = %event.event_type(),
                            event_id = %event.id(),
                            panic = %panic_msg,
                            "async handler panicked"
                        );
                    }
                }
            });
        }
    }

    /// Stop admitting work and wait for in-flight async handlers.
    pub async fn close(&self) -> Result<(), DispatchError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DispatchError::AlreadyClosed);
        }

        debug!(inflight = self.inflight.pending(), "closing dispatcher");
        self.inflight.wait_zero().await;
        debug!("dispatcher closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Async handler tasks admitted but not yet finished.
    pub fn inflight(&self) -> usize {
        self.inflight.pending()
    }

    fn snapshot(&self, event_type: EventType) -> Vec<Registered> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum::<usize>();
        f.debug_struct("Dispatcher")
            .field("handlers", &handlers)
            .field("closed", &self.is_closed())
            .field("inflight", &self.inflight.pending())
            .finish()
    }
}
