//! Fan-out completion for a routed message.
//!
//! An [`Event`] is shared by every queue a message was routed to. Each consumer calls
//! [`Event::done`] once when it has durably accepted, delivered or dropped its copy;
//! the completion callback runs on the call that brings the count to zero.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::types::Publish;

pub type OnDone = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    msg: Publish,
    remaining: AtomicUsize,
    on_done: Mutex<Option<OnDone>>,
}

impl Event {
    /// A count of zero completes immediately.
    pub fn new<F>(msg: Publish, count: usize, on_done: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let ev = Event {
            inner: Arc::new(EventInner {
                msg,
                remaining: AtomicUsize::new(count),
                on_done: Mutex::new(Some(Box::new(on_done))),
            }),
        };
        if count == 0 {
            ev.complete();
        }
        ev
    }

    /// Event whose completion resolves the returned receiver.
    pub fn with_notify(msg: Publish, count: usize) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let ev = Event::new(msg, count, move || {
            let _ = tx.send(());
        });
        (ev, rx)
    }

    #[inline]
    pub fn message(&self) -> &Publish {
        &self.inner.msg
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Releases one reference. Calls past zero are ignored.
    pub fn done(&self) {
        let prev = self
            .inner
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if let Ok(1) = prev {
            self.complete();
        }
    }

    #[inline]
    fn complete(&self) {
        if let Some(f) = self.inner.on_done.lock().take() {
            f();
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("msg", &self.inner.msg).field("remaining", &self.remaining()).finish()
    }
}
