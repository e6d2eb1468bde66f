//! Event bus — typed pub/sub with supertype-aware delivery.
//!
//! Handlers register against an [`EventKind`] under a caller-chosen tag;
//! registration is idempotent per (kind, tag). `emit` delivers to every
//! handler registered for the event's kind or any of its ancestors, in
//! subscription order within a kind. Handler errors are logged and never
//! abort delivery to the remaining handlers.
//!
//! The subscriber list is guarded by a mutex; `emit` snapshots the matching
//! handlers and invokes them with the lock released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::events::{Event, EventKind};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |evt| Box::pin(f(evt)))
}

struct Registration {
    tag: String,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Registration>>>,
    disabled: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Returns false (and keeps the existing
    /// registration) when the (kind, tag) pair is already subscribed.
    pub fn subscribe(&self, kind: EventKind, tag: impl Into<String>, handler: EventHandler) -> bool {
        let tag = tag.into();
        let mut subs = self.subscribers.lock().expect("bus lock poisoned");
        let entries = subs.entry(kind).or_default();
        if entries.iter().any(|r| r.tag == tag) {
            debug!("bus: duplicate subscribe {:?}/{} ignored", kind, tag);
            return false;
        }
        entries.push(Registration { tag, handler });
        true
    }

    /// Remove the (kind, tag) registration. Returns whether one was removed.
    pub fn unsubscribe(&self, kind: EventKind, tag: &str) -> bool {
        let mut subs = self.subscribers.lock().expect("bus lock poisoned");
        if let Some(entries) = subs.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|r| r.tag != tag);
            return entries.len() < before;
        }
        false
    }

    /// Shutdown gate: while disabled, `emit` is a no-op.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every handler registered for its kind or any
    /// ancestor kind. Handlers run sequentially in registration order, so
    /// same-emitter events reach each handler in emission order.
    pub async fn emit(&self, event: Event) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }

        // Snapshot matching handlers, then invoke without holding the lock.
        let matched: Vec<(String, EventHandler)> = {
            let subs = self.subscribers.lock().expect("bus lock poisoned");
            event
                .kind()
                .ancestors()
                .iter()
                .filter_map(|k| subs.get(k))
                .flatten()
                .map(|r| (r.tag.clone(), r.handler.clone()))
                .collect()
        };

        for (tag, h) in matched {
            if let Err(err) = h(event.clone()).await {
                warn!("bus: handler '{}' failed on {:?}: {:#}", tag, event.kind(), err);
            }
        }
    }
}
