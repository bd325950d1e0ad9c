//! A one-shot, broadcast cancellation signal.
//!
//! [`Tripwire::new`] returns a [`Trigger`] and a [`Tripwire`]. The tripwire is a
//! cloneable future which resolves once the trigger is cancelled, disabled or
//! dropped. Clones polled after that resolve immediately, so late waiters never
//! block.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::{debug, trace};

struct Shared {
    name: String,

    closed: AtomicBool,
    cancelled: AtomicBool,

    next_id: AtomicU64,
    wakers: Mutex<HashMap<u64, Waker>>,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn close(&self, cancel: bool) {
        // `cancelled` must be visible before `closed`, pollers check them in
        // the opposite order.
        if cancel {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.closed.store(true, Ordering::SeqCst);

        let wakers = match self.wakers.lock() {
            Ok(mut wakers) => wakers.drain().collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().drain().collect::<Vec<_>>(),
        };

        for (id, waker) in wakers {
            trace!(message = "wake tripwire", name = %self.name, id);

            waker.wake();
        }
    }

    fn with_wakers<R>(&self, f: impl FnOnce(&mut HashMap<u64, Waker>) -> R) -> R {
        match self.wakers.lock() {
            Ok(mut wakers) => f(&mut wakers),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// The firing half. Consuming it, by `cancel`, `disable` or drop, resolves every
/// associated [`Tripwire`].
pub struct Trigger {
    shared: Arc<Shared>,
}

impl Trigger {
    /// Cancel all associated tripwires, make them immediately resolved.
    pub fn cancel(self) {
        debug!(message = "cancel trigger", name = %self.shared.name);

        self.shared.close(true);
    }

    /// Resolve all associated tripwires without marking them cancelled.
    pub fn disable(self) {
        debug!(message = "disable trigger", name = %self.shared.name);

        self.shared.close(false);
    }

    /// Returns a new tripwire bound to this trigger.
    pub fn tripwire(&self) -> Tripwire {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_id();

        Tripwire { shared, id }
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::SeqCst) {
            trace!(message = "trigger dropped", name = %self.shared.name);

            self.shared.close(false);
        }
    }
}

pub struct Tripwire {
    shared: Arc<Shared>,
    id: u64,
}

impl Clone for Tripwire {
    fn clone(&self) -> Self {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_id();

        Self { shared, id }
    }
}

impl Drop for Tripwire {
    fn drop(&mut self) {
        let id = self.id;
        self.shared.with_wakers(|wakers| wakers.remove(&id));
    }
}

impl Future for Tripwire {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }

        let id = self.id;
        let waker = cx.waker().clone();
        self.shared.with_wakers(|wakers| wakers.insert(id, waker));

        // the trigger may have fired between the first check and the insert
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.with_wakers(|wakers| wakers.remove(&id));
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl Tripwire {
    pub fn new(name: impl Into<String>) -> (Trigger, Tripwire) {
        let shared = Arc::new(Shared {
            name: name.into(),
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            wakers: Mutex::new(HashMap::new()),
        });

        (
            Trigger {
                shared: Arc::clone(&shared),
            },
            Tripwire {
                id: shared.next_id(),
                shared,
            },
        )
    }

    /// The name given at construction, handy for log fields.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the trigger has fired in any way, cancelled, disabled or dropped.
    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Whether the trigger was explicitly cancelled.
    pub fn cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}
