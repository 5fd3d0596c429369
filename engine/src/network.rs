//! Connectivity tracking.
//!
//! Operations that fail with the network-unreachable status mark the network
//! offline and park themselves on the next online transition.

use crate::events::{EventBus, ListenerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

/// Shared connectivity state injected into a [`Registry`](crate::Registry).
#[derive(Debug, Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    online: AtomicBool,
    events: EventBus<NetworkEvent>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Network {
    pub fn new(online: bool) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                online: AtomicBool::new(online),
                events: EventBus::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record the current connectivity, emitting an event on transitions.
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!(online, "network status changed");
            let event = if online {
                NetworkEvent::Online
            } else {
                NetworkEvent::Offline
            };
            self.inner.events.emit(&event);
        }
    }

    /// An operation observed the network-unreachable status.
    pub fn report_unreachable(&self) {
        self.set_online(false);
    }

    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Run `resume` once, on the next transition to online.
    pub fn once_online<F>(&self, resume: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let resume = parking_lot::Mutex::new(Some(resume));
        let inner = Arc::downgrade(&self.inner);
        let id = Arc::new(parking_lot::Mutex::new(None::<ListenerId>));
        let slot = Arc::clone(&id);
        let listener = self.inner.events.on(move |event| {
            if *event != NetworkEvent::Online {
                return;
            }
            if let (Some(id), Some(inner)) = (slot.lock().take(), inner.upgrade()) {
                inner.events.off(id);
            }
            if let Some(resume) = resume.lock().take() {
                resume();
            }
        });
        *id.lock() = Some(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn transitions_emit_events() {
        let network = Network::new(true);
        let offline = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&offline);
        network.on(move |e| {
            if *e == NetworkEvent::Offline {
                o.fetch_add(1, Ordering::SeqCst);
            }
        });

        network.report_unreachable();
        network.report_unreachable();
        assert!(!network.is_online());
        assert_eq!(offline.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_online_skips_offline_and_fires_once() {
        let network = Network::new(true);
        let resumed = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&resumed);
        network.once_online(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        network.set_online(false);
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
        network.set_online(true);
        network.set_online(false);
        network.set_online(true);
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
    }
}
