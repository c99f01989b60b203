//! Durable QoS1 queue.
//!
//! Three tasks share one store bucket:
//! - the writer batches pushed events into `put` calls and completes them once stored,
//! - the reader follows an offset cursor and feeds stored records to the output channel,
//! - the deleter batches acknowledged offsets into range deletes and periodically
//!   purges records older than the message expiry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use edgemq_utils::timestamp_millis;

use super::{DeliveryQueue, QueueOptions};
use crate::error::MqttError;
use crate::event::Event;
use crate::store::QueueStore;
use crate::types::Publish;
use crate::Result;

pub struct PersistentQueue {
    name: String,
    store: Arc<dyn QueueStore>,
    write_tx: mpsc::Sender<Event>,
    out_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PersistentQueue {
    /// Starts the writer, reader and deleter over `store`. Records already in the
    /// bucket are delivered first.
    pub fn open(store: Arc<dyn QueueStore>, opts: &QueueOptions, out_cap: usize) -> Self {
        let name = store.name().to_owned();
        let (write_tx, write_rx) = mpsc::channel(opts.write_batch_size * 2);
        let (out_tx, out_rx) = mpsc::channel(out_cap.max(1));
        let (acked_tx, acked_rx) = mpsc::unbounded_channel();
        let readable = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let writer = Writer {
            name: name.clone(),
            store: store.clone(),
            batch_size: opts.write_batch_size,
            interval: opts.write_batch_interval,
            readable: readable.clone(),
        };
        let reader = Reader {
            name: name.clone(),
            store: store.clone(),
            batch_size: opts.write_batch_size,
            retry_interval: opts.write_batch_interval,
            readable,
            acked_tx,
        };
        let deleter = Deleter {
            name: name.clone(),
            store: store.clone(),
            batch_size: opts.delete_batch_size,
            interval: opts.delete_batch_interval,
            sweep_interval: opts.expiry_sweep_interval,
            expiry: opts.message_expiry,
        };

        let tasks = vec![
            tokio::spawn(writer.run(write_rx, cancel.clone())),
            tokio::spawn(reader.run(out_tx, cancel.clone())),
            tokio::spawn(deleter.run(acked_rx, cancel.clone())),
        ];

        log::debug!("{} persistent queue opened", name);
        Self {
            name,
            store,
            write_tx,
            out_rx: tokio::sync::Mutex::new(out_rx),
            cancel,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }
}

#[async_trait]
impl DeliveryQueue for PersistentQueue {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, ev: Event) -> Result<()> {
        if self.is_closed() {
            ev.done();
            return Err(MqttError::QueueClosed.into());
        }
        if let Err(e) = self.write_tx.send(ev).await {
            e.0.done();
            return Err(MqttError::QueueClosed.into());
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Event> {
        self.out_rx.lock().await.recv().await
    }

    async fn close(&self, cleanup: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("{} queue task failed, {:?}", self.name, e);
            }
        }
        log::debug!("{} persistent queue closed, cleanup: {}", self.name, cleanup);
        self.store.close(cleanup).await
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for PersistentQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[inline]
fn encode(msg: &Publish) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

#[inline]
fn decode(data: &[u8]) -> Result<Publish> {
    Ok(bincode::deserialize(data)?)
}

struct Writer {
    name: String,
    store: Arc<dyn QueueStore>,
    batch_size: usize,
    interval: Duration,
    readable: Arc<Notify>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<Event>, cancel: CancellationToken) {
        let mut buf: Vec<Event> = Vec::with_capacity(self.batch_size);
        let timer = sleep(self.interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv(), if buf.len() < self.batch_size => match ev {
                    Some(ev) => {
                        buf.push(ev);
                        if buf.len() >= self.batch_size {
                            self.flush(&mut buf).await;
                            timer.as_mut().reset(Instant::now() + self.interval);
                        }
                    }
                    None => break,
                },
                _ = &mut timer => {
                    if !buf.is_empty() {
                        self.flush(&mut buf).await;
                    }
                    timer.as_mut().reset(Instant::now() + self.interval);
                }
            }
        }

        rx.close();
        while let Ok(ev) = rx.try_recv() {
            buf.push(ev);
        }
        if !buf.is_empty() && !self.flush(&mut buf).await {
            log::error!("{} closing with {} unwritten messages", self.name, buf.len());
            for ev in buf.drain(..) {
                ev.done();
            }
        }
    }

    /// Returns false if the batch stays buffered for a retry.
    async fn flush(&self, buf: &mut Vec<Event>) -> bool {
        let mut batch = Vec::with_capacity(buf.len());
        buf.retain(|ev| match encode(ev.message()) {
            Ok(data) => {
                batch.push(data);
                true
            }
            Err(e) => {
                log::error!("{} dropping unencodable message {:?}, {:?}", self.name, ev.message(), e);
                ev.done();
                false
            }
        });
        if batch.is_empty() {
            return true;
        }
        match self.store.put(batch).await {
            Ok(offsets) => {
                log::trace!("{} wrote {} messages, last offset {:?}", self.name, offsets.len(), offsets.last());
                self.readable.notify_one();
                for ev in buf.drain(..) {
                    ev.done();
                }
                true
            }
            Err(e) => {
                log::warn!("{} write of {} messages failed, will retry, {:?}", self.name, buf.len(), e);
                false
            }
        }
    }
}

struct Reader {
    name: String,
    store: Arc<dyn QueueStore>,
    batch_size: usize,
    retry_interval: Duration,
    readable: Arc<Notify>,
    acked_tx: mpsc::UnboundedSender<u64>,
}

impl Reader {
    async fn run(self, out_tx: mpsc::Sender<Event>, cancel: CancellationToken) {
        let mut cursor = 0u64;
        self.readable.notify_one();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.readable.notified() => {}
            }

            let records = match self.store.get(cursor, self.batch_size).await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("{} read at offset {} failed, will retry, {:?}", self.name, cursor, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.retry_interval) => {}
                    }
                    self.readable.notify_one();
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            for rec in records {
                let offset = rec.offset;
                cursor = offset + 1;
                let msg = match decode(&rec.data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::error!("{} skipping undecodable record {}, {:?}", self.name, offset, e);
                        let _ = self.acked_tx.send(offset);
                        continue;
                    }
                };
                let acked_tx = self.acked_tx.clone();
                let ev = Event::new(msg, 1, move || {
                    let _ = acked_tx.send(offset);
                });
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = out_tx.send(ev) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
            self.readable.notify_one();
        }
    }
}

struct Deleter {
    name: String,
    store: Arc<dyn QueueStore>,
    batch_size: usize,
    interval: Duration,
    sweep_interval: Duration,
    expiry: Duration,
}

impl Deleter {
    async fn run(self, mut acked_rx: mpsc::UnboundedReceiver<u64>, cancel: CancellationToken) {
        let mut pending = BTreeSet::new();
        let timer = sleep(self.interval);
        tokio::pin!(timer);
        let sweep_every = if self.sweep_interval.is_zero() { Duration::from_secs(60) } else { self.sweep_interval };
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                offset = acked_rx.recv() => match offset {
                    Some(offset) => {
                        pending.insert(offset);
                        if pending.len() >= self.batch_size {
                            self.flush(&mut pending).await;
                            timer.as_mut().reset(Instant::now() + self.interval);
                        }
                    }
                    None => break,
                },
                _ = &mut timer => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await;
                    }
                    timer.as_mut().reset(Instant::now() + self.interval);
                }
                _ = sweep.tick() => self.sweep().await,
            }
        }

        while let Ok(offset) = acked_rx.try_recv() {
            pending.insert(offset);
        }
        if !pending.is_empty() {
            self.flush(&mut pending).await;
        }
    }

    async fn flush(&self, pending: &mut BTreeSet<u64>) {
        for (start, end) in ranges(pending) {
            match self.store.del_range(start, end).await {
                Ok(_) => {
                    pending.retain(|o| *o < start || *o >= end);
                }
                Err(e) => {
                    log::warn!("{} delete of [{}, {}) failed, will retry, {:?}", self.name, start, end, e);
                    break;
                }
            }
        }
    }

    async fn sweep(&self) {
        if self.expiry.is_zero() {
            return;
        }
        let before = timestamp_millis() - self.expiry.as_millis() as i64;
        match self.store.del_before_ts(before).await {
            Ok(0) => {}
            Ok(n) => log::info!("{} purged {} expired messages", self.name, n),
            Err(e) => log::warn!("{} expiry sweep failed, {:?}", self.name, e),
        }
    }
}

/// Collapses offsets into half-open runs of consecutive values.
fn ranges(offsets: &BTreeSet<u64>) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::new();
    for o in offsets.iter().copied() {
        match out.last_mut() {
            Some((_, end)) if *end == o => *end = o + 1,
            _ => out.push((o, o + 1)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::store::{RamStorage, Storage};
    use crate::types::QoS;

    fn opts() -> QueueOptions {
        QueueOptions {
            write_batch_size: 4,
            write_batch_interval: Duration::from_millis(10),
            delete_batch_size: 4,
            delete_batch_interval: Duration::from_millis(20),
            expiry_sweep_interval: Duration::from_secs(60),
            message_expiry: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn event(topic: String, acks: &Arc<AtomicUsize>) -> Event {
        let acks = acks.clone();
        Event::new(Publish::new(topic, "x", QoS::AtLeastOnce), 1, move || {
            acks.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_ranges() {
        let set = [1u64, 2, 3, 5, 7, 8].into_iter().collect::<BTreeSet<_>>();
        assert_eq!(ranges(&set), vec![(1, 4), (5, 6), (7, 9)]);
        assert!(ranges(&BTreeSet::new()).is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_in_order() {
        let storage = RamStorage::new();
        let bucket = storage.bucket("c1").await.unwrap();
        let q = PersistentQueue::open(bucket.clone(), &opts(), 16);
        let acks = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            q.push(event(format!("t/{}", i), &acks)).await.unwrap();
        }
        wait_for(|| acks.load(Ordering::SeqCst) == 10).await;

        for i in 0..10 {
            let ev = q.recv().await.unwrap();
            assert_eq!(ev.message().topic, format!("t/{}", i));
            ev.done();
        }
        let b = bucket.clone();
        for _ in 0..200 {
            if b.len().await.unwrap() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bucket.len().await.unwrap(), 0);
        q.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unacked_survive_reopen() {
        let storage = RamStorage::new();
        let acks = Arc::new(AtomicUsize::new(0));
        {
            let q = PersistentQueue::open(storage.bucket("c1").await.unwrap(), &opts(), 16);
            for i in 0..3 {
                q.push(event(format!("t/{}", i), &acks)).await.unwrap();
            }
            let first = q.recv().await.unwrap();
            assert_eq!(first.message().topic, "t/0");
            first.done();
            sleep(Duration::from_millis(50)).await;
            q.close(false).await.unwrap();
        }

        let q = PersistentQueue::open(storage.bucket("c1").await.unwrap(), &opts(), 16);
        assert_eq!(q.recv().await.unwrap().message().topic, "t/1");
        assert_eq!(q.recv().await.unwrap().message().topic, "t/2");
        q.close(true).await.unwrap();
        assert!(!storage.bucket_exists("c1"));
    }

    #[tokio::test]
    async fn test_unacked_survive_restart_on_disk() {
        let dir = crate::store::disk::tests::TempDir::new();
        let acks = Arc::new(AtomicUsize::new(0));
        {
            let storage = dir.open().await;
            let q = PersistentQueue::open(storage.bucket("c1").await.unwrap(), &opts(), 16);
            for i in 0..3 {
                q.push(event(format!("t/{}", i), &acks)).await.unwrap();
            }
            wait_for(|| acks.load(Ordering::SeqCst) == 3).await;
            let first = q.recv().await.unwrap();
            assert_eq!(first.message().topic, "t/0");
            first.done();
            sleep(Duration::from_millis(50)).await;
            q.close(false).await.unwrap();
            storage.close().await.unwrap();
        }

        let storage = dir.open().await;
        assert!(storage.bucket_exists("c1"));
        let q = PersistentQueue::open(storage.bucket("c1").await.unwrap(), &opts(), 16);
        assert_eq!(q.recv().await.unwrap().message().topic, "t/1");
        assert_eq!(q.recv().await.unwrap().message().topic, "t/2");
        q.close(true).await.unwrap();
        assert!(!storage.bucket_exists("c1"));
    }

    #[tokio::test]
    async fn test_write_failure_delays_ack() {
        let storage = RamStorage::new();
        let q = PersistentQueue::open(storage.bucket("c1").await.unwrap(), &opts(), 16);
        let acks = Arc::new(AtomicUsize::new(0));
        storage.set_fail_writes(true);
        q.push(event("t".into(), &acks)).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(acks.load(Ordering::SeqCst), 0);

        storage.set_fail_writes(false);
        wait_for(|| acks.load(Ordering::SeqCst) == 1).await;
        assert_eq!(q.recv().await.unwrap().message().topic, "t");
        q.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects() {
        let storage = RamStorage::new();
        let o = QueueOptions { write_batch_interval: Duration::from_secs(60), ..opts() };
        let q = PersistentQueue::open(storage.bucket("c1").await.unwrap(), &o, 16);
        let acks = Arc::new(AtomicUsize::new(0));
        q.push(event("t".into(), &acks)).await.unwrap();
        q.close(false).await.unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(storage.bucket("c1").await.unwrap().len().await.unwrap(), 1);

        assert!(q.push(event("u".into(), &acks)).await.is_err());
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let storage = RamStorage::new();
        let bucket = storage.bucket("c1").await.unwrap();
        bucket.put(vec![encode(&Publish::new("old", "x", QoS::AtLeastOnce)).unwrap()]).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        let o = QueueOptions {
            expiry_sweep_interval: Duration::from_millis(10),
            message_expiry: Duration::from_millis(20),
            ..opts()
        };
        let q = PersistentQueue::open(bucket.clone(), &o, 1);
        for _ in 0..100 {
            if bucket.len().await.unwrap() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bucket.len().await.unwrap(), 0);
        q.close(true).await.unwrap();
    }
}
