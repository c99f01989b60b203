use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use edgemq_utils::{deserialize_duration, Bytesize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In memory, lost on exit.
    Ram,
    /// A sled database under `path`.
    Sled,
}

/// The `[storage]` section, where durable sessions, QoS1 queues and retained messages live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    pub path: PathBuf,
    pub cache_capacity: Bytesize,
    //Background flush period, zero leaves flushing to explicit calls.
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            typ: StorageType::Sled,
            path: PathBuf::from("/var/lib/edgemq/data"),
            cache_capacity: Bytesize::from("64M"),
            flush_interval: Duration::from_millis(500),
        }
    }
}
