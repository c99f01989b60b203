//! Retained messages.
//!
//! The latest retained message per topic is cached in memory and mirrored to the KV store
//! under `retain/<topic>`. Publishing an empty retained payload clears the topic.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::stats::Stats;
use crate::store::{set_json, Storage};
use crate::topic::{Namespaces, Topic};
use crate::types::{Publish, TopicName};
use crate::Result;

pub const RETAIN_PREFIX: &str = "retain/";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Retained {
    topic: TopicName,
    message: Publish,
}

pub struct RetainStore {
    messages: DashMap<TopicName, Publish>,
    namespaces: Namespaces,
    stats: Arc<Stats>,
}

impl RetainStore {
    #[inline]
    pub fn new(namespaces: Namespaces, stats: Arc<Stats>) -> Self {
        Self { messages: DashMap::default(), namespaces, stats }
    }

    #[inline]
    fn key(topic: &str) -> String {
        format!("{}{}", RETAIN_PREFIX, topic)
    }

    /// Fills the cache from `storage`, skipping undecodable records.
    pub async fn load(&self, storage: &dyn Storage) -> Result<usize> {
        for (key, data) in storage.list_kv(RETAIN_PREFIX).await? {
            match serde_json::from_slice::<Retained>(&data) {
                Ok(r) => {
                    self.messages.insert(r.topic, r.message);
                }
                Err(e) => log::warn!("invalid retained message {}, {}", key, e),
            }
        }
        self.stats.retaineds.sets(self.messages.len() as isize);
        Ok(self.messages.len())
    }

    pub async fn set(&self, storage: &dyn Storage, msg: &Publish) -> Result<()> {
        let key = Self::key(&msg.topic);
        if msg.payload.is_empty() {
            if self.messages.remove(&msg.topic).is_some() {
                self.stats.retaineds.dec();
            }
            storage.del_kv(&key).await
        } else {
            let mut message = msg.clone();
            message.dup = false;
            message.packet_id = None;
            let record = Retained { topic: msg.topic.clone(), message: message.clone() };
            set_json(storage, &key, &record).await?;
            if self.messages.insert(msg.topic.clone(), message).is_none() {
                self.stats.retaineds.inc();
            }
            Ok(())
        }
    }

    /// Retained messages whose topic matches `filter`, within the filter's namespace.
    pub fn matches(&self, filter: &str) -> Vec<Publish> {
        let topic = match Topic::from_str(filter) {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        let ns = self.namespaces.split(filter).0;
        self.messages
            .iter()
            .filter(|e| self.namespaces.split(e.key()).0 == ns && topic.matches_str(e.key()))
            .map(|e| e.value().clone())
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
