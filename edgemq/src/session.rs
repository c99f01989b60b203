use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::acl::Principal;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::MqttError;
use crate::event::Event;
use crate::exchange::{Subscriber, Target};
use crate::inflight::Inflight;
use crate::queue::{DeliveryQueue, PersistentQueue, TemporaryQueue};
use crate::store::set_json;
use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::{ClientId, ConnectionId, LastWill, QoS, SessionInfo, SessionUid, TopicFilter};
use crate::Result;

pub const SESSION_PREFIX: &str = "session/";

#[inline]
pub fn session_key(id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

#[inline]
pub fn queue_name(id: &str) -> String {
    format!("queue/{}", id)
}

/// `Unsubscribed` sessions own no queues, `Subscribed` ones own both.
///
/// A clean session that unsubscribes down to nothing loses its queues and stored data
/// at once but stays registered while its connection lives, so a second connection
/// with the same client id still replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unsubscribed,
    Subscribed,
}

/// The delivery queues of a subscribed session.
#[derive(Clone, Default)]
pub struct Queues {
    pub qos0: Option<Arc<TemporaryQueue>>,
    pub qos1: Option<Arc<PersistentQueue>>,
}

impl Queues {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.qos0.is_none() && self.qos1.is_none()
    }
}

/// The connection a session is currently bound to.
#[derive(Clone)]
pub struct ConnHandle {
    pub id: ConnectionId,
    pub conn: Arc<dyn Connection>,
    /// Ends the whole connection.
    pub cancel: CancellationToken,
    /// Ends only the delivery loops, a child of `cancel`.
    pub delivery: CancellationToken,
    /// Cancelled once the delivery loops have exited.
    pub delivery_stopped: CancellationToken,
    kicked: Arc<AtomicBool>,
    resumed: Arc<AtomicBool>,
}

impl ConnHandle {
    pub fn new(id: ConnectionId, conn: Arc<dyn Connection>) -> Self {
        let cancel = CancellationToken::new();
        let delivery = cancel.child_token();
        Self {
            id,
            conn,
            cancel,
            delivery,
            delivery_stopped: CancellationToken::new(),
            kicked: Arc::new(AtomicBool::new(false)),
            resumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ends the connection because its session went away or was replaced.
    #[inline]
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Ends the connection because a new connection resumed its session.
    #[inline]
    pub fn take_over(&self) {
        self.resumed.store(true, Ordering::SeqCst);
        self.kick();
    }

    #[inline]
    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::SeqCst)
    }

    /// True if the session lives on under another connection.
    #[inline]
    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the delivery loops to exit.
    pub async fn wait_delivery_stopped(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.delivery_stopped.cancelled()).await.is_ok()
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnHandle({}, {})", self.id, self.conn.remote_addr())
    }
}

struct SessionState {
    info: SessionInfo,
    matcher: TopicTree<TopicFilter>,
}

#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

pub struct SessionInner {
    pub uid: SessionUid,
    pub id: ClientId,
    pub ctx: Context,
    state: RwLock<SessionState>,
    queues: watch::Sender<Queues>,
    inflight: Inflight,
    client: Mutex<Option<ConnHandle>>,
    closed: AtomicBool,
}

impl Deref for Session {
    type Target = SessionInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({}, {})", self.id, self.uid)
    }
}

impl Session {
    pub(crate) fn new(ctx: Context, info: SessionInfo) -> Self {
        let inflight = Inflight::new(ctx.settings.mqtt.max_inflight, ctx.settings.mqtt.retry_interval, ctx.stats.clone());
        let (queues, _) = watch::channel(Queues::default());
        let id = info.id.clone();
        Session(Arc::new(SessionInner {
            uid: ctx.next_uid(),
            id,
            state: RwLock::new(SessionState { info, matcher: TopicTree::default() }),
            queues,
            inflight,
            client: Mutex::new(None),
            closed: AtomicBool::new(false),
            ctx,
        }))
    }

    #[inline]
    fn target(&self) -> Target {
        Target::new(Arc::new(self.clone()))
    }

    #[inline]
    pub async fn info(&self) -> SessionInfo {
        self.state.read().await.info.clone()
    }

    #[inline]
    pub async fn clean_session(&self) -> bool {
        self.state.read().await.info.clean_session
    }

    #[inline]
    pub async fn subscriptions(&self) -> BTreeMap<TopicFilter, QoS> {
        self.state.read().await.info.subscriptions.clone()
    }

    #[inline]
    pub async fn is_subscribed(&self, filter: &str) -> bool {
        self.state.read().await.info.subscriptions.contains_key(filter)
    }

    #[inline]
    pub async fn state(&self) -> State {
        if self.state.read().await.info.subscriptions.is_empty() {
            State::Unsubscribed
        } else {
            State::Subscribed
        }
    }

    #[inline]
    pub async fn will(&self) -> Option<LastWill> {
        self.state.read().await.info.will.clone()
    }

    #[inline]
    pub async fn set_will(&self, will: Option<LastWill>) {
        self.state.write().await.info.will = will;
    }

    /// Applies the flags of a new connection to the session.
    pub async fn update(&self, clean_session: bool, will: Option<LastWill>, principal: Option<Principal>) {
        let mut state = self.state.write().await;
        state.info.clean_session = clean_session;
        state.info.will = will;
        state.info.principal = principal;
    }

    #[inline]
    pub fn queues(&self) -> Queues {
        self.queues.borrow().clone()
    }

    /// Follows queue provisioning and teardown.
    #[inline]
    pub fn watch_queues(&self) -> watch::Receiver<Queues> {
        self.queues.subscribe()
    }

    #[inline]
    pub fn inflight(&self) -> &Inflight {
        &self.inflight
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn open_queues(&self) -> Result<()> {
        let opts = &self.ctx.queue_opts;
        let bucket = self.ctx.storage.bucket(&queue_name(&self.id)).await?;
        let qos1 = Arc::new(PersistentQueue::open(bucket, opts, self.inflight.capacity()));
        let qos0 = Arc::new(TemporaryQueue::new(
            format!("{}/qos0", self.id),
            opts.capacity,
            opts.policy,
            self.ctx.stats.clone(),
        ));
        log::debug!("{:?} queues opened", self.id);
        self.queues.send_replace(Queues { qos0: Some(qos0), qos1: Some(qos1) });
        Ok(())
    }

    async fn close_queues(&self, cleanup: bool) -> Result<()> {
        let old = self.queues.send_replace(Queues::default());
        if let Some(q) = old.qos0 {
            q.close(cleanup).await?;
        }
        if let Some(q) = old.qos1 {
            q.close(cleanup).await?;
        }
        if cleanup {
            self.inflight.clear();
        }
        Ok(())
    }

    /// Adds or updates a subscription. The first one provisions the queues.
    ///
    /// Returns true for a new filter. The filter must already be validated.
    pub async fn subscribe(&self, filter: TopicFilter, qos: QoS) -> Result<bool> {
        let topic = Topic::from_str(&filter)?;
        let mut state = self.state.write().await;
        if self.is_closed() {
            return Err(MqttError::ServiceUnavailable.into());
        }
        if state.info.subscriptions.is_empty() {
            self.open_queues().await?;
        }
        let is_new = state.info.subscriptions.insert(filter.clone(), qos).is_none();
        if is_new {
            state.matcher.insert(&topic, filter.clone());
            self.ctx.exchange.bind(&filter, self.target())?;
            self.ctx.stats.subscriptions.inc();
        }
        log::debug!("{:?} subscribed {} {:?}", self.id, filter, qos);
        Ok(is_new)
    }

    /// Removes a subscription, the last one tears the queues down along with their data.
    /// Unknown filters are a no-op returning false.
    pub async fn unsubscribe(&self, filter: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some((filter, _)) = state.info.subscriptions.remove_entry(filter) else {
            return Ok(false);
        };
        if let Ok(topic) = Topic::from_str(&filter) {
            state.matcher.remove(&topic, &filter);
        }
        self.ctx.exchange.unbind(&filter, &self.target())?;
        self.ctx.stats.subscriptions.dec();
        log::debug!("{:?} unsubscribed {}", self.id, filter);
        if state.info.subscriptions.is_empty() {
            self.close_queues(true).await?;
        }
        Ok(true)
    }

    /// Queues a routed message, on the QoS1 queue if any matching subscription asks for
    /// QoS1 and the message itself is QoS1, on the QoS0 queue otherwise.
    pub async fn push(&self, ev: Event) {
        let granted = {
            let state = self.state.read().await;
            let topic = &ev.message().topic;
            let ns = self.ctx.namespaces.split(topic).0;
            state
                .matcher
                .matches(topic)
                .iter()
                .filter(|f| self.ctx.namespaces.split(f).0 == ns)
                .filter_map(|f| state.info.subscriptions.get(f))
                .max()
                .copied()
        };
        match granted {
            Some(qos) => self.push_with_qos(ev, qos).await,
            None => {
                log::debug!("{:?} no longer subscribed to {}", self.id, ev.message().topic);
                ev.done();
            }
        }
    }

    /// Queues a message for a subscription granted `granted`.
    pub async fn push_with_qos(&self, ev: Event, granted: QoS) {
        let queues = self.queues();
        let res = match ev.message().qos.less_value(granted) {
            QoS::AtMostOnce => match queues.qos0 {
                Some(q) => q.push(ev).await,
                None => {
                    ev.done();
                    Ok(())
                }
            },
            _ => match queues.qos1 {
                Some(q) => q.push(ev).await,
                None => {
                    ev.done();
                    Ok(())
                }
            },
        };
        if let Err(e) = res {
            log::warn!("{:?} message not queued, {}", self.id, e);
        }
    }

    /// Binds `handle`, returning the previously bound connection.
    #[inline]
    pub fn set_client(&self, handle: ConnHandle) -> Option<ConnHandle> {
        self.client.lock().replace(handle)
    }

    #[inline]
    pub fn client(&self) -> Option<ConnHandle> {
        self.client.lock().clone()
    }

    /// Unbinds the connection if it is still `conn_id`.
    pub fn take_client_if(&self, conn_id: ConnectionId) -> bool {
        let mut client = self.client.lock();
        if client.as_ref().map(|c| c.id == conn_id).unwrap_or(false) {
            client.take();
            true
        } else {
            false
        }
    }

    /// Writes the session record, or deletes it for a clean session.
    pub async fn persist(&self) -> Result<()> {
        let info = self.info().await;
        let key = session_key(&self.id);
        if info.clean_session {
            self.ctx.storage.del_kv(&key).await
        } else {
            set_json(self.ctx.storage.as_ref(), &key, &info).await
        }
    }

    /// Unbinds the session from the exchange, ends the bound connection and stops the queues.
    /// With `cleanup` the queued data and the session record are deleted.
    pub async fn close(&self, cleanup: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _state = self.state.write().await;
        let n = self.ctx.exchange.unbind_all(&self.target());
        self.ctx.stats.subscriptions.decs(n as isize);
        if let Some(client) = self.client.lock().take() {
            client.kick();
        }
        self.inflight.close();
        self.close_queues(cleanup).await?;
        if cleanup {
            self.ctx.storage.del_kv(&session_key(&self.id)).await?;
        }
        log::debug!("{:?} session closed, cleanup: {}", self.id, cleanup);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for Session {
    #[inline]
    fn uid(&self) -> SessionUid {
        self.0.uid
    }

    async fn deliver(&self, ev: Event) {
        self.push(ev).await
    }
}
