use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use edgemq_conf::Settings;

use crate::acl::{AuthProvider, StaticAuthProvider};
use crate::exchange::Exchange;
use crate::queue::QueueOptions;
use crate::retain::RetainStore;
use crate::stats::Stats;
use crate::store::Storage;
use crate::topic::Namespaces;
use crate::types::{ConnectionId, SessionUid};

/// Everything shared by the sessions and connections of one broker.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub struct ContextInner {
    pub settings: Settings,
    pub namespaces: Namespaces,
    pub storage: Arc<dyn Storage>,
    pub auth: Arc<dyn AuthProvider>,
    pub exchange: Exchange,
    pub retain: RetainStore,
    pub stats: Arc<Stats>,
    pub queue_opts: QueueOptions,
    next_uid: AtomicU64,
    next_conn_id: AtomicU64,
}

impl Deref for Context {
    type Target = ContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Context {
    pub fn new(settings: Settings, storage: Arc<dyn Storage>, auth: Arc<dyn AuthProvider>) -> Self {
        let namespaces = Namespaces::new(settings.mqtt.system_topic_prefixes.iter().cloned());
        let stats = Arc::new(Stats::default());
        let queue_opts = QueueOptions::from(&settings.mqtt);
        Context {
            inner: Arc::new(ContextInner {
                exchange: Exchange::new(namespaces.clone(), stats.clone()),
                retain: RetainStore::new(namespaces.clone(), stats.clone()),
                settings,
                namespaces,
                storage,
                auth,
                stats,
                queue_opts,
                next_uid: AtomicU64::new(1),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Context authenticating against the `acl` section of `settings`.
    pub fn with_static_acl(settings: Settings, storage: Arc<dyn Storage>) -> Self {
        let namespaces = Namespaces::new(settings.mqtt.system_topic_prefixes.iter().cloned());
        let auth = Arc::new(StaticAuthProvider::new(settings.acl.clone(), namespaces));
        Self::new(settings, storage, auth)
    }

    #[inline]
    pub fn next_uid(&self) -> SessionUid {
        self.next_uid.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub fn next_conn_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context {{ namespaces: {:?}, stats: {} }}", self.namespaces, self.stats.to_json())
    }
}
