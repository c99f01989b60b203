use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{DeliveryQueue, Policy};
use crate::error::MqttError;
use crate::event::Event;
use crate::stats::Stats;
use crate::Result;

/// Bounded in-memory queue for QoS0 messages.
///
/// Accepting a message completes the routed event right away and queues a private copy,
/// so a slow or offline QoS0 subscriber never holds back the publisher's ack. A full
/// queue drops either the oldest queued copy or the pushed one, depending on the [`Policy`].
pub struct TemporaryQueue {
    name: String,
    cap: usize,
    policy: Policy,
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    stats: Arc<Stats>,
}

impl TemporaryQueue {
    #[inline]
    pub fn new(name: String, cap: usize, policy: Policy, stats: Arc<Stats>) -> Self {
        Self {
            name,
            cap: cap.max(1),
            policy,
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn drop_event(&self, ev: Event) {
        log::warn!("{} queue is full, dropping {:?}", self.name, ev.message());
        self.stats.qos0_dropped.inc();
        ev.done();
    }
}

#[async_trait]
impl DeliveryQueue for TemporaryQueue {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, ev: Event) -> Result<()> {
        if self.is_closed() {
            ev.done();
            return Err(MqttError::QueueClosed.into());
        }
        let copy = Event::new(ev.message().clone(), 1, || {});
        ev.done();
        let dropped = {
            let mut q = self.inner.lock();
            if q.len() < self.cap {
                q.push_back(copy);
                None
            } else {
                match self.policy {
                    Policy::Current => Some(copy),
                    Policy::Early => {
                        let removed = q.pop_front();
                        q.push_back(copy);
                        removed
                    }
                }
            }
        };
        if let Some(dropped) = dropped {
            self.drop_event(dropped);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(ev) = self.inner.lock().pop_front() {
                return Some(ev);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    async fn close(&self, _cleanup: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remaining = std::mem::take(&mut *self.inner.lock());
        log::debug!("{} closed, {} undelivered QoS0 messages discarded", self.name, remaining.len());
        for ev in remaining {
            ev.done();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
