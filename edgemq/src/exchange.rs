//! Namespace-partitioned routing.
//!
//! Every reserved topic prefix gets its own [`TopicTree`], matched against the part of
//! the topic after the prefix. Everything else lives in the catch-all tree. A message
//! is wrapped in one [`Event`] shared by all matching subscribers.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::event::Event;
use crate::stats::Stats;
use crate::topic::{Level, Namespaces, Topic};
use crate::trie::TopicTree;
use crate::types::{Publish, SessionUid};
use crate::Result;

#[async_trait]
pub trait Subscriber: Send + Sync {
    fn uid(&self) -> SessionUid;

    /// Takes one reference of `ev`, the subscriber calls [`Event::done`] on it exactly once.
    async fn deliver(&self, ev: Event);
}

/// A bound subscriber, compared by uid.
#[derive(Clone)]
pub struct Target(Arc<dyn Subscriber>);

impl Target {
    #[inline]
    pub fn new(s: Arc<dyn Subscriber>) -> Self {
        Target(s)
    }

    #[inline]
    pub fn uid(&self) -> SessionUid {
        self.0.uid()
    }
}

impl PartialEq for Target {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl Eq for Target {}

impl Hash for Target {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid().hash(state)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.uid())
    }
}

pub struct Exchange {
    namespaces: Namespaces,
    spaces: HashMap<String, RwLock<TopicTree<Target>>>,
    catch_all: RwLock<TopicTree<Target>>,
    stats: Arc<Stats>,
}

impl Exchange {
    pub fn new(namespaces: Namespaces, stats: Arc<Stats>) -> Self {
        let spaces = namespaces.prefixes().map(|p| (p.clone(), RwLock::new(TopicTree::default()))).collect();
        Self { namespaces, spaces, catch_all: RwLock::new(TopicTree::default()), stats }
    }

    #[inline]
    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }

    #[inline]
    fn tree(&self, topic: &str) -> (&RwLock<TopicTree<Target>>, String) {
        match self.namespaces.split(topic) {
            (Some(prefix), rest) => match self.spaces.get(prefix) {
                Some(tree) => (tree, rest.to_owned()),
                None => (&self.catch_all, topic.to_owned()),
            },
            (None, _) => (&self.catch_all, topic.to_owned()),
        }
    }

    #[inline]
    fn parse(rest: &str) -> Result<Topic> {
        if rest.is_empty() {
            Ok(Topic::from(vec![Level::Blank]))
        } else {
            Ok(Topic::from_str(rest)?)
        }
    }

    /// Binds `target` to the filter, returns false if it was already bound.
    pub fn bind(&self, filter: &str, target: Target) -> Result<bool> {
        let (tree, rest) = self.tree(filter);
        let topic = Self::parse(&rest)?;
        Ok(tree.write().insert(&topic, target))
    }

    pub fn unbind(&self, filter: &str, target: &Target) -> Result<bool> {
        let (tree, rest) = self.tree(filter);
        let topic = Self::parse(&rest)?;
        Ok(tree.write().remove(&topic, target))
    }

    /// Removes every binding of `target`, returns how many there were.
    pub fn unbind_all(&self, target: &Target) -> usize {
        let mut n = self.catch_all.write().clear(target);
        for tree in self.spaces.values() {
            n += tree.write().clear(target);
        }
        n
    }

    pub fn matches(&self, topic: &str) -> Vec<Target> {
        let (tree, rest) = self.tree(topic);
        tree.read().matches(&rest)
    }

    /// Hands `msg` to every matching subscriber and returns how many there were.
    ///
    /// `on_done` runs once all of them have released the message, or right away
    /// when nothing matches.
    pub async fn route<F>(&self, msg: Publish, on_done: F) -> usize
    where
        F: FnOnce() + Send + 'static,
    {
        let targets = self.matches(&msg.topic);
        if targets.is_empty() {
            log::debug!("no subscriber for {:?}", msg.topic);
            self.stats.unrouted.inc();
            on_done();
            return 0;
        }
        self.stats.routed.inc();
        let n = targets.len();
        let ev = Event::new(msg, n, on_done);
        for t in targets {
            t.0.deliver(ev.clone()).await;
        }
        n
    }

    pub fn bindings_size(&self) -> usize {
        self.catch_all.read().values_size() + self.spaces.values().map(|t| t.read().values_size()).sum::<usize>()
    }
}
