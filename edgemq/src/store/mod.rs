//! Storage seams used by the broker core.
//!
//! [`QueueStore`] is an append only byte range log addressed by monotonic offsets,
//! one per named bucket (one bucket per durable session queue). [`Storage`] opens
//! buckets and also offers a small key-value space for session records and retained
//! messages.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::types::TimestampMillis;
use crate::Result;

use edgemq_conf::{StorageConfig, StorageType};

pub mod disk;
pub mod ram;

pub use disk::SledStorage;
pub use ram::RamStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    /// Append time, used by the expiry sweep.
    pub ts: TimestampMillis,
    pub data: Bytes,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    fn name(&self) -> &str;

    /// Appends the batch in order and returns the offsets assigned to it.
    async fn put(&self, batch: Vec<Bytes>) -> Result<Vec<u64>>;

    /// Up to `limit` records with an offset at or after `offset`, in offset order.
    async fn get(&self, offset: u64, limit: usize) -> Result<Vec<Record>>;

    /// Deletes records in `[start, end)`, returns how many were removed.
    async fn del_range(&self, start: u64, end: u64) -> Result<usize>;

    /// Deletes every record with an offset below `offset`.
    async fn del_before_id(&self, offset: u64) -> Result<usize>;

    /// Deletes every record appended before `ts`.
    async fn del_before_ts(&self, ts: TimestampMillis) -> Result<usize>;

    async fn len(&self) -> Result<usize>;

    /// With `clean` the whole bucket is dropped, otherwise its data stays for a later reopen.
    async fn close(&self, clean: bool) -> Result<()>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens the named bucket, creating it when missing.
    async fn bucket(&self, name: &str) -> Result<Arc<dyn QueueStore>>;

    async fn set_kv(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get_kv(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn del_kv(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`.
    async fn list_kv(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn close(&self) -> Result<()>;
}

/// Opens the storage selected by `[storage]`.
pub fn open(cfg: &StorageConfig) -> Result<Arc<dyn Storage>> {
    Ok(match cfg.typ {
        StorageType::Ram => Arc::new(RamStorage::default()),
        StorageType::Sled => Arc::new(SledStorage::open(cfg)?),
    })
}

pub async fn set_json<T: Serialize + ?Sized>(storage: &dyn Storage, key: &str, val: &T) -> Result<()> {
    storage.set_kv(key, serde_json::to_vec(val)?).await
}

pub async fn get_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    match storage.get_kv(key).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}
