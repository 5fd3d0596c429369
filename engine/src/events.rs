//! Typed observer channels and one-shot completion signals.
//!
//! Every component that emits events composes an [`EventBus`] for its own
//! event enum. Handlers run after the listener list lock is released, so a
//! handler may freely subscribe, unsubscribe or emit again.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Filter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Listener<E> {
    id: ListenerId,
    once: bool,
    filter: Option<Filter<E>>,
    handler: Handler<E>,
}

/// A typed event channel.
pub struct EventBus<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(handler, false, None)
    }

    /// Subscribe to the next event only.
    pub fn once<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(handler, true, None)
    }

    /// Subscribe to the next event matching `filter` only.
    pub fn once_when<P, F>(&self, filter: P, handler: F) -> ListenerId
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: FnOnce(&E) + Send + 'static,
    {
        let handler = Mutex::new(Some(handler));
        self.add(
            move |event: &E| {
                if let Some(handler) = handler.lock().take() {
                    handler(event);
                }
            },
            true,
            Some(Arc::new(filter)),
        )
    }

    fn add<F>(&self, handler: F, once: bool, filter: Option<Filter<E>>) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener {
            id,
            once,
            filter,
            handler: Arc::new(handler),
        });
        id
    }

    /// Unsubscribe. Returns false when the listener was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Deliver an event to every current listener, in subscription order.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = {
            let mut listeners = self.listeners.lock();
            let mut handlers = Vec::with_capacity(listeners.len());
            listeners.retain(|l| {
                let matched = l.filter.as_ref().map_or(true, |filter| filter(event));
                if matched {
                    handlers.push(Arc::clone(&l.handler));
                }
                !(matched && l.once)
            });
            handlers
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

type Waiter<T> = Box<dyn FnOnce(T) + Send>;

enum SignalState<T> {
    Pending(Vec<Waiter<T>>),
    Ready(T),
}

/// A one-shot completion signal.
///
/// Waiters registered before resolution run in registration order when the
/// signal resolves; waiters registered afterwards run immediately.
pub struct Signal<T> {
    state: Mutex<SignalState<T>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SignalState::Pending(Vec::new())),
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = matches!(&*self.state.lock(), SignalState::Ready(_));
        f.debug_struct("Signal").field("ready", &ready).finish()
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `waiter` with the resolved value, now or on resolution.
    pub fn when<F>(&self, waiter: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let value = {
            let mut state = self.state.lock();
            match &mut *state {
                SignalState::Ready(value) => value.clone(),
                SignalState::Pending(waiters) => {
                    waiters.push(Box::new(waiter));
                    return;
                }
            }
        };
        waiter(value);
    }

    /// Resolve the signal. Returns false if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                SignalState::Ready(_) => return false,
                SignalState::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = SignalState::Ready(value.clone());
                    waiters
                }
            }
        };
        for waiter in waiters {
            waiter(value.clone());
        }
        true
    }

    pub fn get(&self) -> Option<T> {
        match &*self.state.lock() {
            SignalState::Ready(value) => Some(value.clone()),
            SignalState::Pending(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), SignalState::Ready(_))
    }
}

/// Run `done` once every signal has resolved, with values in input order.
pub fn when_all<T, F>(signals: Vec<Arc<Signal<T>>>, done: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(Vec<T>) + Send + 'static,
{
    struct Join<T, F> {
        values: Vec<Option<T>>,
        remaining: usize,
        done: Option<F>,
    }

    if signals.is_empty() {
        done(Vec::new());
        return;
    }

    let join = Arc::new(Mutex::new(Join {
        values: vec![None; signals.len()],
        remaining: signals.len(),
        done: Some(done),
    }));

    for (index, signal) in signals.into_iter().enumerate() {
        let join = Arc::clone(&join);
        signal.when(move |value| {
            let finished = {
                let mut join = join.lock();
                join.values[index] = Some(value);
                join.remaining -= 1;
                if join.remaining == 0 {
                    let values = join.values.drain(..).flatten().collect::<Vec<_>>();
                    join.done.take().map(|done| (done, values))
                } else {
                    None
                }
            };
            if let Some((done, values)) = finished {
                done(values);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_listeners_in_order() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        bus.on(move |e| s.lock().push(("a", *e)));
        let s = Arc::clone(&seen);
        bus.on(move |e| s.lock().push(("b", *e)));

        bus.emit(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn once_fires_a_single_time() {
        let bus = EventBus::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.once(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&());
        bus.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn once_when_waits_for_a_match() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.once_when(|e| *e > 5, move |e| s.lock().push(*e));

        bus.emit(&1);
        bus.emit(&9);
        bus.emit(&10);
        assert_eq!(*seen.lock(), vec![9]);
        assert!(bus.is_empty());
    }

    #[test]
    fn off_unsubscribes() {
        let bus = EventBus::<()>::new();
        let id = bus.on(|_| panic!("should not run"));
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&());
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Arc::new(EventBus::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&bus);
        let c = Arc::clone(&count);
        bus.on(move |e| {
            c.fetch_add(1, Ordering::SeqCst);
            if *e == 0 {
                b.emit(&1);
            }
        });

        bus.emit(&0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signal_runs_waiters_on_resolve() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        signal.when(move |v| s.lock().push(v));
        assert!(seen.lock().is_empty());

        assert!(signal.resolve(3));
        assert!(!signal.resolve(4));

        let s = Arc::clone(&seen);
        signal.when(move |v| s.lock().push(v * 10));
        assert_eq!(*seen.lock(), vec![3, 30]);
        assert_eq!(signal.get(), Some(3));
    }

    #[test]
    fn when_all_waits_for_every_signal() {
        let a = Arc::new(Signal::<&'static str>::new());
        let b = Arc::new(Signal::<&'static str>::new());
        let result = Arc::new(Mutex::new(None));

        let r = Arc::clone(&result);
        when_all(vec![Arc::clone(&a), Arc::clone(&b)], move |values| {
            *r.lock() = Some(values);
        });

        b.resolve("b");
        assert!(result.lock().is_none());
        a.resolve("a");
        assert_eq!(*result.lock(), Some(vec!["a", "b"]));
    }
}
