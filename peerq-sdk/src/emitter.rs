//! Typed event bus used by every layer of the SDK.
//!
//! Each owner (transport, client, peer session, room, transfer, sync)
//! publishes a closed set of events. Handlers subscribe per event kind
//! and receive events synchronously, in registration order, on the task
//! that emitted them. A failing handler never prevents its siblings from
//! running: the error is routed to a process-wide hook (by default it is
//! logged via `tracing::error!`).
//!
//! Subscriptions are identified by the token returned from [`Emitter::on`].
//! Cancelling a token during an emit does not perturb the dispatch that is
//! already in flight; the next emit sees the updated handler table.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// Process-wide hook for handler errors.
type ErrorHook = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

static ERROR_HOOK: RwLock<Option<ErrorHook>> = RwLock::new(None);

/// Replace the process-wide handler-error hook.
///
/// The default routes errors to `tracing::error!`.
pub fn set_handler_error_hook(hook: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
    *ERROR_HOOK.write() = Some(Box::new(hook));
}

fn route_handler_error(err: &anyhow::Error) {
    let hook = ERROR_HOOK.read();
    match hook.as_ref() {
        Some(h) => h(err),
        None => tracing::error!(error = %err, "event handler failed"),
    }
}

/// An event that can be published on an [`Emitter`].
///
/// `Kind` is the subscription key: one discriminant per event variant.
pub trait BusEvent: Send + 'static {
    type Kind: Copy + Eq + Hash + Send + std::fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Registration<E: BusEvent> {
    id: u64,
    once: bool,
    fired: Arc<AtomicBool>,
    handler: Handler<E>,
}

impl<E: BusEvent> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            fired: self.fired.clone(),
            handler: self.handler.clone(),
        }
    }
}

struct Inner<E: BusEvent> {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<E::Kind, Vec<Registration<E>>>>,
}

/// A handle that identifies one subscription. Dropping it does NOT
/// unsubscribe; call [`Subscription::cancel`] (or `Emitter::remove_all`).
pub struct Subscription<E: BusEvent> {
    emitter: Weak<Inner<E>>,
    kind: E::Kind,
    id: u64,
}

impl<E: BusEvent> Subscription<E> {
    /// Remove this subscription. Safe to call after the emitter is gone.
    pub fn cancel(self) {
        if let Some(inner) = self.emitter.upgrade()
            && let Some(regs) = inner.handlers.lock().get_mut(&self.kind)
        {
            regs.retain(|r| r.id != self.id);
        }
    }
}

/// Typed publisher over a closed set of event kinds.
pub struct Emitter<E: BusEvent> {
    inner: Arc<Inner<E>>,
}

impl<E: BusEvent> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: BusEvent> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> Emitter<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to one event kind. Handlers run synchronously on the
    /// emitting task, in registration order.
    pub fn on(
        &self,
        kind: E::Kind,
        handler: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription<E> {
        self.register(kind, Arc::new(handler), false)
    }

    /// Subscribe for a single delivery; the registration is removed after
    /// the handler fires once.
    pub fn once(
        &self,
        kind: E::Kind,
        handler: impl Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription<E> {
        self.register(kind, Arc::new(handler), true)
    }

    fn register(&self, kind: E::Kind, handler: Handler<E>, once: bool) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push(Registration {
                id,
                once,
                fired: Arc::new(AtomicBool::new(false)),
                handler,
            });
        Subscription {
            emitter: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Dispatch runs over a snapshot of the handler table, so handlers may
    /// subscribe or cancel freely without affecting the current pass.
    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        let snapshot: Vec<Registration<E>> = {
            let handlers = self.inner.handlers.lock();
            match handlers.get(&kind) {
                Some(regs) => regs.clone(),
                None => return,
            }
        };

        let mut spent = Vec::new();
        for reg in &snapshot {
            if reg.once {
                if reg.fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                spent.push(reg.id);
            }
            if let Err(err) = (reg.handler)(event) {
                route_handler_error(&err);
            }
        }

        if !spent.is_empty()
            && let Some(regs) = self.inner.handlers.lock().get_mut(&kind)
        {
            regs.retain(|r| !spent.contains(&r.id));
        }
    }

    /// Number of live handlers for one kind.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.inner
            .handlers
            .lock()
            .get(&kind)
            .map_or(0, |regs| regs.len())
    }

    /// Drop every handler for one kind, or all handlers when `kind` is None.
    pub fn remove_all(&self, kind: Option<E::Kind>) {
        let mut handlers = self.inner.handlers.lock();
        match kind {
            Some(k) => {
                handlers.remove(&k);
            }
            None => handlers.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestKind {
        Ping,
        Pong,
    }

    impl BusEvent for TestEvent {
        type Kind = TestKind;

        fn kind(&self) -> TestKind {
            match self {
                TestEvent::Ping(_) => TestKind::Ping,
                TestEvent::Pong => TestKind::Pong,
            }
        }
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus: Emitter<TestEvent> = Emitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            bus.on(TestKind::Ping, move |_| {
                order.lock().push(tag);
                Ok(())
            });
        }

        bus.emit(&TestEvent::Ping(1));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_handler_does_not_block_siblings() {
        let bus: Emitter<TestEvent> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(TestKind::Ping, |_| anyhow::bail!("first handler breaks"));
        let hits2 = hits.clone();
        bus.on(TestKind::Ping, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&TestEvent::Ping(7));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_fires_exactly_once() {
        let bus: Emitter<TestEvent> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        bus.once(TestKind::Pong, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&TestEvent::Pong);
        bus.emit(&TestEvent::Pong);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(TestKind::Pong), 0);
    }

    #[test]
    fn cancel_during_emit_keeps_current_dispatch() {
        let bus: Emitter<TestEvent> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        // The first handler cancels the second mid-dispatch; the snapshot
        // still delivers to the second this turn, but not on the next emit.
        let victim_cell: Arc<Mutex<Option<Subscription<TestEvent>>>> =
            Arc::new(Mutex::new(None));
        {
            let cell = victim_cell.clone();
            bus.on(TestKind::Ping, move |_| {
                if let Some(sub) = cell.lock().take() {
                    sub.cancel();
                }
                Ok(())
            });
        }
        let victim = {
            let hits = hits.clone();
            bus.on(TestKind::Ping, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        *victim_cell.lock() = Some(victim);

        bus.emit(&TestEvent::Ping(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.emit(&TestEvent::Ping(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(TestKind::Ping), 1);
    }

    #[test]
    fn remove_all_clears_kind() {
        let bus: Emitter<TestEvent> = Emitter::new();
        bus.on(TestKind::Ping, |_| Ok(()));
        bus.on(TestKind::Ping, |_| Ok(()));
        bus.on(TestKind::Pong, |_| Ok(()));

        bus.remove_all(Some(TestKind::Ping));
        assert_eq!(bus.listener_count(TestKind::Ping), 0);
        assert_eq!(bus.listener_count(TestKind::Pong), 1);

        bus.remove_all(None);
        assert_eq!(bus.listener_count(TestKind::Pong), 0);
    }
}
