use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use edgemq_utils::timestamp_millis;

use super::{QueueStore, Record, Storage};
use crate::types::TimestampMillis;
use crate::Result;

/// In-memory [`Storage`].
///
/// Buckets closed without `clean` keep their records, so reopening one by name behaves
/// like reopening a durable store.
#[derive(Clone, Default)]
pub struct RamStorage {
    inner: Arc<RamInner>,
}

#[derive(Default)]
struct RamInner {
    buckets: DashMap<String, Arc<RamBucket>>,
    kv: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl RamStorage {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every bucket write fail until switched back, for exercising retry paths.
    #[inline]
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[inline]
    pub fn bucket_exists(&self, name: &str) -> bool {
        self.inner.buckets.contains_key(name)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Opens a closed storage again with its data intact, as a restart over the same files would.
    #[inline]
    pub fn reopen(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(anyhow!("storage is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for RamStorage {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn QueueStore>> {
        self.check_open()?;
        let bucket = self
            .inner
            .buckets
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(RamBucket {
                    name: name.to_owned(),
                    records: RwLock::new(BTreeMap::new()),
                    next: AtomicU64::new(1),
                    owner: Arc::downgrade(&self.inner),
                    fail_writes: self.inner.fail_writes.clone(),
                })
            })
            .clone();
        Ok(bucket)
    }

    async fn set_kv(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.inner.kv.write().insert(key.to_owned(), value);
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.inner.kv.read().get(key).cloned())
    }

    async fn del_kv(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.inner.kv.write().remove(key);
        Ok(())
    }

    async fn list_kv(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_open()?;
        Ok(self
            .inner
            .kv
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct RamBucket {
    name: String,
    records: RwLock<BTreeMap<u64, Record>>,
    next: AtomicU64,
    owner: Weak<RamInner>,
    fail_writes: Arc<AtomicBool>,
}

impl RamBucket {
    #[inline]
    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("bucket {} write failed", self.name));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RamBucket {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, batch: Vec<Bytes>) -> Result<Vec<u64>> {
        self.check_writable()?;
        let ts = timestamp_millis();
        let mut records = self.records.write();
        let offsets = batch
            .into_iter()
            .map(|data| {
                let offset = self.next.fetch_add(1, Ordering::SeqCst);
                records.insert(offset, Record { offset, ts, data });
                offset
            })
            .collect();
        Ok(offsets)
    }

    async fn get(&self, offset: u64, limit: usize) -> Result<Vec<Record>> {
        Ok(self.records.read().range(offset..).take(limit).map(|(_, r)| r.clone()).collect())
    }

    async fn del_range(&self, start: u64, end: u64) -> Result<usize> {
        self.check_writable()?;
        if start >= end {
            return Ok(0);
        }
        let mut records = self.records.write();
        let offsets = records.range(start..end).map(|(o, _)| *o).collect::<Vec<_>>();
        for o in offsets.iter() {
            records.remove(o);
        }
        Ok(offsets.len())
    }

    async fn del_before_id(&self, offset: u64) -> Result<usize> {
        self.del_range(0, offset).await
    }

    async fn del_before_ts(&self, ts: TimestampMillis) -> Result<usize> {
        self.check_writable()?;
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.ts >= ts);
        Ok(before - records.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }

    async fn close(&self, clean: bool) -> Result<()> {
        if clean {
            self.records.write().clear();
            if let Some(owner) = self.owner.upgrade() {
                owner.buckets.remove(&self.name);
            }
        }
        Ok(())
    }
}
