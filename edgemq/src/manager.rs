use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::acl::{Action, Authorizer, Principal};
use crate::context::Context;
use crate::error::MqttError;
use crate::event::Event;
use crate::session::{queue_name, ConnHandle, Session, State, SESSION_PREFIX};
use crate::topic::Topic;
use crate::types::{ClientId, ConnectionId, LastWill, Publish, QoS, SessionInfo, SubscribeReturnCode, TopicFilter};
use crate::Result;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Live sessions by client id.
#[derive(Default)]
pub struct Registry {
    sessions: parking_lot::Mutex<HashMap<ClientId, Session>>,
}

impl Registry {
    #[inline]
    pub fn load(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    #[inline]
    pub fn store(&self, session: Session) -> Option<Session> {
        self.sessions.lock().insert(session.id.clone(), session)
    }

    /// Removes the entry only if it still is the session `uid`.
    pub fn delete(&self, id: &str, uid: u64) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.get(id).map(|s| s.uid == uid).unwrap_or(false) {
            sessions.remove(id);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    #[inline]
    fn drain(&self) -> Vec<Session> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }
}

/// Owns every session of the broker and drives their lifecycle.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

pub struct ManagerInner {
    pub ctx: Context,
    pub registry: Registry,
    pub(crate) conns: DashMap<ConnectionId, ConnHandle>,
    lock: Mutex<()>,
    shutting_down: AtomicBool,
}

impl Deref for SessionManager {
    type Target = ManagerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionManager {{ sessions: {}, connections: {} }}", self.registry.count(), self.conns.len())
    }
}

impl SessionManager {
    /// Loads retained messages and durable sessions from storage.
    ///
    /// Stored subscriptions are checked again against the current topic rules and
    /// permissions, the ones that fail are dropped.
    pub async fn start(ctx: Context) -> Result<Self> {
        let mgr = SessionManager {
            inner: Arc::new(ManagerInner {
                ctx,
                registry: Registry::default(),
                conns: DashMap::default(),
                lock: Mutex::new(()),
                shutting_down: AtomicBool::new(false),
            }),
        };
        let retained = mgr.ctx.retain.load(mgr.ctx.storage.as_ref()).await?;
        let sessions = mgr.restore().await?;
        log::info!("session manager started, {} sessions, {} retained messages", sessions, retained);
        Ok(mgr)
    }

    async fn restore(&self) -> Result<usize> {
        let storage = self.ctx.storage.clone();
        let mut n = 0;
        for (key, data) in storage.list_kv(SESSION_PREFIX).await? {
            let info: SessionInfo = match serde_json::from_slice(&data) {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("invalid session record {}, {}", key, e);
                    storage.del_kv(&key).await?;
                    continue;
                }
            };
            if info.clean_session {
                storage.del_kv(&key).await?;
                continue;
            }

            let authorizer = match info.principal.as_ref() {
                Some(p) => self.ctx.auth.lookup(p).await,
                None => None,
            };
            let mut restored = info.clone();
            restored.subscriptions.clear();
            let session = Session::new(self.ctx.clone(), restored);

            let mut dropped = 0;
            for (filter, qos) in info.subscriptions {
                match self.check_filter(authorizer.as_deref(), &filter) {
                    Ok(()) => {
                        session.subscribe(filter, qos.less_value(QoS::AtLeastOnce)).await?;
                    }
                    Err(e) => {
                        log::warn!("{:?} dropping stored subscription {}, {}", info.id, filter, e);
                        dropped += 1;
                    }
                }
            }
            if dropped > 0 {
                session.persist().await?;
            }
            if session.state().await == State::Unsubscribed {
                storage.bucket(&queue_name(&info.id)).await?.close(true).await?;
            }
            self.registry.store(session);
            self.ctx.stats.sessions.inc();
            n += 1;
        }
        Ok(n)
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.registry.load(id)
    }

    #[inline]
    fn create(&self, id: ClientId, clean_session: bool) -> Session {
        let session = Session::new(self.ctx.clone(), SessionInfo::new(id, clean_session));
        self.registry.store(session.clone());
        self.ctx.stats.sessions.inc();
        session
    }

    /// Finds or creates the session for `id` and binds `handle` to it.
    ///
    /// An existing session is resumed only when neither side asks for a clean session,
    /// otherwise it is destroyed first. With `require_unique` a connection still bound
    /// to the session is closed, without it only that connection's delivery stops.
    /// Returns the session, whether it was resumed, and the connection it replaced.
    pub async fn init_session(
        &self,
        id: ClientId,
        handle: Option<ConnHandle>,
        require_unique: bool,
        clean_session: bool,
        will: Option<LastWill>,
        principal: Option<Principal>,
    ) -> Result<(Session, bool, Option<ConnHandle>)> {
        let _guard = self.lock.lock().await;
        if self.is_shutting_down() {
            return Err(MqttError::ServiceUnavailable.into());
        }
        let (session, present) = match self.registry.load(&id) {
            Some(s) if !clean_session && !s.clean_session().await => (s, true),
            Some(s) => {
                self.destroy_locked(&s).await?;
                (self.create(id, clean_session), false)
            }
            None => (self.create(id, clean_session), false),
        };
        session.update(clean_session, will, principal).await;

        let replaced = match handle {
            Some(handle) => session.set_client(handle),
            None => None,
        };
        if let Some(old) = replaced.as_ref() {
            if require_unique {
                log::info!("{:?} taken over, closing connection {}", session.id, old.id);
                old.take_over();
            } else {
                old.delivery.cancel();
            }
        }
        session.persist().await?;
        Ok((session, present, replaced))
    }

    async fn destroy_locked(&self, session: &Session) -> Result<()> {
        if self.registry.delete(&session.id, session.uid) {
            self.ctx.stats.sessions.dec();
        }
        session.close(true).await
    }

    /// Tears the session down along with its subscriptions and stored data.
    pub async fn destroy(&self, session: &Session) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.destroy_locked(session).await
    }

    /// Called when connection `conn_id` is gone. A clean session whose connection is
    /// gone is destroyed, a connection that was already replaced changes nothing.
    pub async fn del_client(&self, session: &Session, conn_id: ConnectionId) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !session.take_client_if(conn_id) {
            return Ok(());
        }
        if session.clean_session().await && !self.is_shutting_down() {
            self.destroy_locked(session).await?;
        }
        Ok(())
    }

    fn check_filter(&self, authorizer: Option<&dyn Authorizer>, filter: &str) -> Result<()> {
        Topic::validate(filter, true, self.ctx.settings.mqtt.max_topic_levels)?;
        match authorizer {
            Some(a) if a.authorize(Action::Subscribe, filter) => Ok(()),
            _ => Err(MqttError::NotAuthorized.into()),
        }
    }

    /// Applies a SUBSCRIBE request, filter by filter. Returns the return codes and the
    /// granted subscriptions.
    pub async fn subscribe(
        &self,
        session: &Session,
        authorizer: &dyn Authorizer,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) -> Result<(Vec<SubscribeReturnCode>, Vec<(TopicFilter, QoS)>)> {
        let max_subscriptions = self.ctx.settings.mqtt.max_subscriptions;
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut granted = Vec::new();
        for (filter, qos) in topic_filters {
            let mut res = self.check_filter(Some(authorizer), &filter);
            if res.is_ok()
                && max_subscriptions > 0
                && !session.is_subscribed(&filter).await
                && session.subscriptions().await.len() >= max_subscriptions
            {
                res = Err(MqttError::TooManySubscriptions.into());
            }
            match res {
                Ok(()) => {
                    let qos = qos.less_value(QoS::AtLeastOnce);
                    session.subscribe(filter.clone(), qos).await?;
                    status.push(SubscribeReturnCode::Success(qos));
                    granted.push((filter, qos));
                }
                Err(e) => {
                    log::info!("{:?} subscribe {} refused, {}", session.id, filter, e);
                    status.push(SubscribeReturnCode::Failure);
                }
            }
        }
        session.persist().await?;
        Ok((status, granted))
    }

    /// Removes subscriptions, unknown filters are ignored.
    pub async fn unsubscribe(&self, session: &Session, topic_filters: &[TopicFilter]) -> Result<()> {
        for filter in topic_filters {
            session.unsubscribe(filter).await?;
        }
        session.persist().await
    }

    /// Queues the retained messages matching newly granted subscriptions.
    pub async fn replay_retained(&self, session: &Session, granted: &[(TopicFilter, QoS)]) {
        for (filter, qos) in granted {
            for mut msg in self.ctx.retain.matches(filter) {
                msg.retain = true;
                session.push_with_qos(Event::new(msg, 1, || {}), *qos).await;
            }
        }
    }

    /// Routes a message to its subscribers and returns how many matched.
    ///
    /// `on_done` runs once every subscriber has accepted the message. A retained message
    /// also replaces the topic's retained message.
    pub async fn publish<F>(&self, mut msg: Publish, on_done: F) -> usize
    where
        F: FnOnce() + Send + 'static,
    {
        if msg.retain {
            if let Err(e) = self.ctx.retain.set(self.ctx.storage.as_ref(), &msg).await {
                log::warn!("failed to store retained message {:?}, {}", msg, e);
            }
            msg.retain = false;
        }
        msg.dup = false;
        msg.packet_id = None;
        self.ctx.exchange.route(msg, on_done).await
    }

    /// Closes connections, then sessions, then storage. Session data of non-clean
    /// sessions is kept for the next start.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("shutting down, {} connections, {} sessions", self.conns.len(), self.registry.count());
        for c in self.conns.iter() {
            c.cancel.cancel();
        }
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while !self.conns.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("{} connections still open at shutdown", self.conns.len());
        }

        let _guard = self.lock.lock().await;
        for session in self.registry.drain() {
            let clean = session.clean_session().await;
            if let Err(e) = session.close(clean).await {
                log::warn!("{:?} close failed, {}", session.id, e);
            }
            self.ctx.stats.sessions.dec();
        }
        self.ctx.storage.close().await
    }
}
