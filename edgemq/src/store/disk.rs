//! [`Storage`] on a sled database.
//!
//! Every bucket is a tree named `bucket/<name>` keyed by the big-endian offset, so tree
//! order is append order. A value is the append timestamp followed by the payload.
//! The next offset of each bucket is written to the `offsets` tree with every append,
//! which keeps offsets from being reused after a restart. Key-value entries live in
//! the `kv` tree.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use edgemq_conf::StorageConfig;
use edgemq_utils::timestamp_millis;

use super::{QueueStore, Record, Storage};
use crate::types::TimestampMillis;
use crate::Result;

const KV_TREE: &str = "kv";
const OFFSETS_TREE: &str = "offsets";

#[inline]
fn tree_name(bucket: &str) -> String {
    format!("bucket/{}", bucket)
}

#[derive(Clone)]
pub struct SledStorage {
    inner: Arc<SledInner>,
}

struct SledInner {
    db: sled::Db,
    kv: sled::Tree,
    offsets: sled::Tree,
    buckets: DashMap<String, Arc<SledBucket>>,
    closed: AtomicBool,
}

impl SledStorage {
    pub fn open(cfg: &StorageConfig) -> Result<Self> {
        if cfg.path.as_os_str().is_empty() {
            return Err(anyhow!("storage path is empty"));
        }
        let flush_every = cfg.flush_interval.as_millis() as u64;
        let db = sled::Config::new()
            .path(&cfg.path)
            .cache_capacity(cfg.cache_capacity.as_usize() as u64)
            .flush_every_ms((flush_every > 0).then_some(flush_every))
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|e| anyhow!("failed to open storage at {}, {}", cfg.path.display(), e))?;
        let kv = db.open_tree(KV_TREE)?;
        let offsets = db.open_tree(OFFSETS_TREE)?;
        log::info!("storage opened at {}, {} buckets", cfg.path.display(), offsets.len());
        Ok(Self {
            inner: Arc::new(SledInner { db, kv, offsets, buckets: DashMap::default(), closed: AtomicBool::new(false) }),
        })
    }

    pub fn bucket_exists(&self, name: &str) -> bool {
        let tree = tree_name(name);
        self.inner.db.tree_names().iter().any(|n| &n[..] == tree.as_bytes())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
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
impl Storage for SledStorage {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn QueueStore>> {
        self.check_open()?;
        if let Some(bucket) = self.inner.buckets.get(name) {
            let bucket: Arc<SledBucket> = bucket.value().clone();
            return Ok(bucket);
        }
        let tree = self.inner.db.open_tree(tree_name(name))?;
        let after_last = match tree.last()? {
            Some((k, _)) => decode_offset(&k)? + 1,
            None => 1,
        };
        let saved = match self.inner.offsets.get(name)? {
            Some(v) => decode_offset(&v)?,
            None => 1,
        };
        let bucket = Arc::new(SledBucket {
            name: name.to_owned(),
            tree,
            offsets: self.inner.offsets.clone(),
            next: AtomicU64::new(after_last.max(saved)),
            owner: Arc::downgrade(&self.inner),
        });
        let bucket = self.inner.buckets.entry(name.to_owned()).or_insert(bucket).clone();
        Ok(bucket)
    }

    async fn set_kv(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.inner.kv.insert(key, value)?;
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.inner.kv.get(key)?.map(|v| v.to_vec()))
    }

    async fn del_kv(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.inner.kv.remove(key)?;
        Ok(())
    }

    async fn list_kv(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_open()?;
        self.inner
            .kv
            .scan_prefix(prefix)
            .map(|item| -> Result<(String, Vec<u8>)> {
                let (k, v) = item?;
                Ok((String::from_utf8(k.to_vec())?, v.to_vec()))
            })
            .collect()
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.buckets.clear();
        let n = self.inner.db.flush_async().await?;
        log::info!("storage closed, {} bytes flushed", n);
        Ok(())
    }
}

pub struct SledBucket {
    name: String,
    tree: sled::Tree,
    offsets: sled::Tree,
    next: AtomicU64,
    owner: Weak<SledInner>,
}

impl SledBucket {
    fn remove_keys(&self, keys: Vec<sled::IVec>) -> Result<usize> {
        let n = keys.len();
        if n > 0 {
            let mut batch = sled::Batch::default();
            for k in keys {
                batch.remove(k);
            }
            self.tree.apply_batch(batch)?;
        }
        Ok(n)
    }
}

#[async_trait]
impl QueueStore for SledBucket {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, data: Vec<Bytes>) -> Result<Vec<u64>> {
        let ts = timestamp_millis();
        let mut batch = sled::Batch::default();
        let offsets = data
            .into_iter()
            .map(|data| {
                let offset = self.next.fetch_add(1, Ordering::SeqCst);
                batch.insert(offset.to_be_bytes().to_vec(), encode_value(ts, &data));
                offset
            })
            .collect::<Vec<_>>();
        self.tree.apply_batch(batch)?;
        self.offsets.insert(self.name.as_bytes(), self.next.load(Ordering::SeqCst).to_be_bytes().to_vec())?;
        Ok(offsets)
    }

    async fn get(&self, offset: u64, limit: usize) -> Result<Vec<Record>> {
        self.tree
            .range(offset.to_be_bytes()..)
            .take(limit)
            .map(|item| -> Result<Record> {
                let (k, v) = item?;
                decode_record(&k, &v)
            })
            .collect()
    }

    async fn del_range(&self, start: u64, end: u64) -> Result<usize> {
        if start >= end {
            return Ok(0);
        }
        let keys = self
            .tree
            .range(start.to_be_bytes()..end.to_be_bytes())
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.remove_keys(keys)
    }

    async fn del_before_id(&self, offset: u64) -> Result<usize> {
        self.del_range(0, offset).await
    }

    async fn del_before_ts(&self, ts: TimestampMillis) -> Result<usize> {
        let mut keys = Vec::new();
        for item in self.tree.iter() {
            let (k, v) = item?;
            if decode_ts(&v)? < ts {
                keys.push(k);
            }
        }
        self.remove_keys(keys)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.tree.len())
    }

    async fn close(&self, clean: bool) -> Result<()> {
        if !clean {
            self.tree.flush_async().await?;
            return Ok(());
        }
        self.offsets.remove(self.name.as_bytes())?;
        match self.owner.upgrade() {
            Some(owner) => {
                owner.buckets.remove(&self.name);
                owner.db.drop_tree(tree_name(&self.name))?;
            }
            None => self.tree.clear()?,
        }
        Ok(())
    }
}

#[inline]
fn encode_value(ts: TimestampMillis, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + data.len());
    v.extend_from_slice(&ts.to_be_bytes());
    v.extend_from_slice(data);
    v
}

#[inline]
fn decode_offset(k: &[u8]) -> Result<u64> {
    <[u8; 8]>::try_from(k).map(u64::from_be_bytes).map_err(|_| anyhow!("invalid offset key, {} bytes", k.len()))
}

#[inline]
fn decode_ts(v: &[u8]) -> Result<TimestampMillis> {
    match v.get(..8) {
        Some(ts) => Ok(TimestampMillis::from_be_bytes(<[u8; 8]>::try_from(ts)?)),
        None => Err(anyhow!("invalid record, {} bytes", v.len())),
    }
}

fn decode_record(k: &[u8], v: &[u8]) -> Result<Record> {
    Ok(Record { offset: decode_offset(k)?, ts: decode_ts(v)?, data: Bytes::copy_from_slice(&v[8..]) })
}
