use std::num::NonZeroU16;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use itertools::Itertools;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::event::Event;
use crate::stats::Stats;
use crate::types::{PacketId, Publish, QoS};

/// A QoS1 message sent to the client and not yet acknowledged.
///
/// `seq` tells a record apart from a later one reusing the same packet id.
pub struct InflightRecord {
    pub packet_id: PacketId,
    pub seq: u64,
    pub event: Event,
    pub publish: Publish,
    pub last_sent_at: Instant,
    _permit: OwnedSemaphorePermit,
}

/// The outbound in-flight window of a session.
///
/// Owned by the session rather than the connection so unacknowledged messages survive a
/// reconnect. A record holds one of `cap` permits until it is acknowledged.
pub struct Inflight {
    cap: usize,
    interval: Duration,
    next: AtomicU16,
    seq: AtomicU64,
    records: DashMap<PacketId, InflightRecord>,
    permits: Arc<Semaphore>,
    stats: Arc<Stats>,
}

impl Inflight {
    #[inline]
    pub fn new(cap: usize, retry_interval: Duration, stats: Arc<Stats>) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            interval: retry_interval,
            next: AtomicU16::new(1),
            seq: AtomicU64::new(1),
            records: DashMap::default(),
            permits: Arc::new(Semaphore::new(cap)),
            stats,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn retry_interval(&self) -> Duration {
        self.interval
    }

    /// Waits for room in the window, `None` once the window is closed.
    #[inline]
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.permits.available_permits() > 0
    }

    #[inline]
    fn next_id(&self) -> PacketId {
        loop {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Records `event` as sent now and returns the packet to put on the wire.
    ///
    /// A live record still holding the allocated id is completed and replaced.
    pub fn insert(&self, event: Event, permit: OwnedSemaphorePermit) -> (PacketId, u64, Publish) {
        let packet_id = self.next_id();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut publish = event.message().clone().packet_id(packet_id);
        publish.qos = QoS::AtLeastOnce;
        publish.dup = false;

        let record = InflightRecord {
            packet_id,
            seq,
            event,
            publish: publish.clone(),
            last_sent_at: Instant::now(),
            _permit: permit,
        };
        if let Some(old) = self.records.insert(packet_id, record) {
            log::error!("packet id {} still in flight, completing {:?}", packet_id, old.publish);
            old.event.done();
        } else {
            self.stats.inflights.inc();
        }
        (packet_id, seq, publish)
    }

    /// Completes the record acknowledged by the client. Returns false for an unknown id.
    pub fn ack(&self, packet_id: NonZeroU16) -> bool {
        match self.records.remove(&packet_id.get()) {
            Some((_, record)) => {
                self.stats.inflights.dec();
                record.event.done();
                true
            }
            None => {
                log::warn!("packet id {} not in flight", packet_id);
                false
            }
        }
    }

    #[inline]
    pub fn is_pending(&self, packet_id: PacketId, seq: u64) -> bool {
        self.records.get(&packet_id).map(|r| r.seq == seq).unwrap_or(false)
    }

    /// When the record is due for a resend, `None` if it is gone.
    #[inline]
    pub fn deadline(&self, packet_id: PacketId, seq: u64) -> Option<Instant> {
        self.records.get(&packet_id).filter(|r| r.seq == seq).map(|r| r.last_sent_at + self.interval)
    }

    /// Refreshes the send time and returns the duplicate to put on the wire, `None` if
    /// the record has been acknowledged meanwhile.
    pub fn resend(&self, packet_id: PacketId, seq: u64) -> Option<Publish> {
        let mut r = self.records.get_mut(&packet_id)?;
        if r.seq != seq {
            return None;
        }
        r.last_sent_at = Instant::now();
        let mut publish = r.publish.clone();
        publish.dup = true;
        Some(publish)
    }

    /// Outstanding records in the order they were first sent.
    pub fn pending(&self) -> Vec<(PacketId, u64)> {
        self.records.iter().map(|r| (r.packet_id, r.seq)).sorted_by_key(|(_, seq)| *seq).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every record without completing it, the backing data goes with the session.
    pub fn clear(&self) {
        let n = self.records.len();
        self.records.clear();
        self.stats.inflights.decs(n as isize);
    }

    /// Wakes any sender waiting for room, it will get no permit.
    #[inline]
    pub fn close(&self) {
        self.permits.close();
    }
}
