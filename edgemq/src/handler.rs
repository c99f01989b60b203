//! Per-connection protocol handling.
//!
//! [`SessionManager::handle`] owns a connection from its first packet to teardown:
//! CONNECT and authentication, binding to a session, the receive loop, and the
//! last-will and session cleanup once the connection is gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::acl::{Action, Authorizer, Principal};
use crate::connection::Connection;
use crate::delivery::Delivery;
use crate::error::MqttError;
use crate::manager::SessionManager;
use crate::session::{ConnHandle, Session};
use crate::topic::Topic;
use crate::types::{
    ClientId, Connect, ConnectAckReason, LastWill, Packet, Publish, QoS, MQTT_LEVEL_31, MQTT_LEVEL_311,
};
use crate::Result;

struct Accepted {
    session: Session,
    authorizer: Arc<dyn Authorizer>,
    present: bool,
}

impl SessionManager {
    /// Serves one client connection until it closes.
    ///
    /// Returns an error if the connection ended on a protocol violation, a failed
    /// CONNECT or a keepalive timeout.
    pub async fn handle(&self, conn: Arc<dyn Connection>) -> Result<()> {
        let connect = match self.recv_connect(conn.as_ref()).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                let _ = conn.close().await;
                return Ok(());
            }
            Err(e) => {
                log::info!("{} connect failed, {}", conn.remote_addr(), e);
                let _ = conn.close().await;
                return Err(e);
            }
        };

        let handle = ConnHandle::new(self.ctx.next_conn_id(), conn.clone());
        let accepted = match self.accept(&handle, &connect).await {
            Ok(a) => a,
            Err(e) => {
                log::info!("{} {:?} connect refused, {}", conn.remote_addr(), connect.client_id, e);
                if let Some(reason) = e.downcast_ref::<MqttError>().and_then(|e| e.to_connect_ack_reason()) {
                    let _ = conn.send(Packet::ConnectAck { session_present: false, return_code: reason }).await;
                }
                let _ = conn.close().await;
                return Err(e);
            }
        };
        self.run(handle, accepted, connect.last_will.clone(), connect.keep_alive).await
    }

    async fn recv_connect(&self, conn: &dyn Connection) -> Result<Option<Box<Connect>>> {
        match tokio::time::timeout(self.ctx.settings.mqtt.connect_timeout, conn.recv()).await {
            Err(_) => Err(MqttError::ConnectTimeout.into()),
            Ok(Ok(Some(Packet::Connect(c)))) => Ok(Some(c)),
            Ok(Ok(Some(p))) => Err(MqttError::UnexpectedPacket(p.packet_type()).into()),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    fn client_id(&self, connect: &Connect) -> Result<ClientId> {
        if connect.client_id.is_empty() {
            if connect.clean_session {
                Ok(ClientId::from(format!("edgemq-{}", Uuid::new_v4().simple())))
            } else {
                Err(MqttError::IdentifierRejected.into())
            }
        } else if connect.client_id.len() > self.ctx.settings.mqtt.max_clientid_len {
            Err(MqttError::IdentifierRejected.into())
        } else {
            Ok(connect.client_id.clone())
        }
    }

    /// Username and password first, then the client certificate, then anonymous access.
    async fn authenticate(
        &self,
        conn: &dyn Connection,
        connect: &Connect,
    ) -> Result<(Arc<dyn Authorizer>, Principal)> {
        let auth = &self.ctx.auth;
        if let Some(username) = connect.username.as_ref() {
            let password = connect.password.as_deref().unwrap_or_default();
            return match auth.authenticate_account(username, password).await {
                Some(a) => Ok((a, Principal::Account(username.to_string()))),
                None => Err(MqttError::BadUserNameOrPassword.into()),
            };
        }
        if let Some(cn) = conn.common_name() {
            return match auth.authenticate_certificate(&cn).await {
                Some(a) => Ok((a, Principal::Certificate(cn))),
                None => Err(MqttError::NotAuthorized.into()),
            };
        }
        match auth.anonymous().await {
            Some(a) => Ok((a, Principal::Anonymous)),
            None => Err(MqttError::NotAuthorized.into()),
        }
    }

    fn check_will(&self, authorizer: &dyn Authorizer, will: &LastWill) -> Result<()> {
        if !will.qos.is_supported() {
            return Err(MqttError::QoSNotSupported(will.qos).into());
        }
        Topic::validate(&will.topic, false, self.ctx.settings.mqtt.max_topic_levels).map_err(MqttError::from)?;
        if will.message.len() > *self.ctx.settings.mqtt.max_payload_size {
            return Err(MqttError::PayloadTooLarge(will.message.len()).into());
        }
        if !authorizer.authorize(Action::Publish, &will.topic) {
            return Err(MqttError::NotAuthorized.into());
        }
        Ok(())
    }

    async fn accept(&self, handle: &ConnHandle, connect: &Connect) -> Result<Accepted> {
        if connect.protocol_level != MQTT_LEVEL_31 && connect.protocol_level != MQTT_LEVEL_311 {
            return Err(MqttError::UnsupportedProtocolVersion(connect.protocol_level).into());
        }
        let id = self.client_id(connect)?;
        let (authorizer, principal) = self.authenticate(handle.conn.as_ref(), connect).await?;
        if let Some(will) = connect.last_will.as_ref() {
            self.check_will(authorizer.as_ref(), will)?;
        }

        let (session, present, replaced) = self
            .init_session(
                id,
                Some(handle.clone()),
                true,
                connect.clean_session,
                connect.last_will.clone(),
                Some(principal),
            )
            .await?;
        self.conns.insert(handle.id, handle.clone());
        self.ctx.stats.connections.inc();

        if let Some(old) = replaced {
            if !old.wait_delivery_stopped(self.ctx.settings.mqtt.connect_timeout).await {
                log::warn!("{:?} connection {} still delivering", session.id, old.id);
            }
        }
        log::debug!("{:?} connected from {}, session present: {}", session.id, handle.conn.remote_addr(), present);
        Ok(Accepted { session, authorizer, present })
    }

    async fn run(&self, handle: ConnHandle, accepted: Accepted, will: Option<LastWill>, keep_alive: u16) -> Result<()> {
        let Accepted { session, authorizer, present } = accepted;
        let conn = handle.conn.clone();
        let keepalive = self.ctx.settings.mqtt.keepalive_timeout(keep_alive);

        let res = match conn
            .send(Packet::ConnectAck { session_present: present, return_code: ConnectAckReason::ConnectionAccepted })
            .await
        {
            Ok(()) => {
                let (reply_tx, reply_rx) = mpsc::unbounded_channel();
                let delivery = Delivery::start(session.clone(), &handle, reply_rx);
                let res = loop {
                    let packet = tokio::select! {
                        _ = handle.cancel.cancelled() => break Ok(false),
                        p = recv_packet(conn.as_ref(), keepalive) => p,
                    };
                    match packet {
                        Ok(Some(Packet::Disconnect)) => break Ok(true),
                        Ok(Some(p)) => {
                            let res = self.process(&session, authorizer.as_ref(), conn.as_ref(), &reply_tx, p).await;
                            if let Err(e) = res {
                                break Err(e);
                            }
                        }
                        Ok(None) => break Ok(false),
                        Err(e) => break Err(e),
                    }
                };
                handle.cancel.cancel();
                delivery.join().await;
                res
            }
            Err(e) => Err(e),
        };
        handle.cancel.cancel();
        handle.delivery_stopped.cancel();
        let _ = conn.close().await;

        let graceful = matches!(res, Ok(true));
        if let Err(e) = res.as_ref() {
            log::info!("{:?} connection {} closed, {}", session.id, handle.id, e);
        }
        self.disconnected(&session, &handle, will, graceful).await;
        res.map(|_| ())
    }

    async fn disconnected(&self, session: &Session, handle: &ConnHandle, will: Option<LastWill>, graceful: bool) {
        if self.conns.remove(&handle.id).is_some() {
            self.ctx.stats.connections.dec();
        }
        if self.is_shutting_down() {
            return;
        }
        let bound = session.client().map(|c| c.id == handle.id).unwrap_or(false);
        if graceful {
            if bound {
                session.set_will(None).await;
                if let Err(e) = session.persist().await {
                    log::warn!("{:?} persist failed, {}", session.id, e);
                }
            }
        } else if let Some(will) = will {
            if handle.is_resumed() {
                log::debug!("{:?} session resumed elsewhere, will discarded", session.id);
            } else {
                log::debug!("{:?} publishing will {:?}", session.id, will.topic);
                self.publish(will.to_publish(), || {}).await;
            }
        }
        if let Err(e) = self.del_client(session, handle.id).await {
            log::warn!("{:?} cleanup failed, {}", session.id, e);
        }
    }

    async fn process(
        &self,
        session: &Session,
        authorizer: &dyn Authorizer,
        conn: &dyn Connection,
        reply_tx: &mpsc::UnboundedSender<Packet>,
        packet: Packet,
    ) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.on_publish(authorizer, reply_tx, publish).await,
            Packet::PublishAck { packet_id } => {
                session.inflight().ack(packet_id);
                Ok(())
            }
            Packet::Subscribe { packet_id, topic_filters } => {
                let (status, granted) = self.subscribe(session, authorizer, topic_filters).await?;
                conn.send(Packet::SubscribeAck { packet_id, status }).await?;
                self.replay_retained(session, &granted).await;
                Ok(())
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                self.unsubscribe(session, &topic_filters).await?;
                conn.send(Packet::UnsubscribeAck { packet_id }).await
            }
            Packet::PingRequest => conn.send(Packet::PingResponse).await,
            p => Err(MqttError::UnexpectedPacket(p.packet_type()).into()),
        }
    }

    async fn on_publish(
        &self,
        authorizer: &dyn Authorizer,
        reply_tx: &mpsc::UnboundedSender<Packet>,
        publish: Publish,
    ) -> Result<()> {
        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(
                publish.packet_id.ok_or_else(|| MqttError::InvalidProtocol("QoS1 PUBLISH without packet id".into()))?,
            ),
            QoS::ExactlyOnce => return Err(MqttError::QoSNotSupported(publish.qos).into()),
        };
        Topic::validate(&publish.topic, false, self.ctx.settings.mqtt.max_topic_levels)?;
        if publish.payload.len() > *self.ctx.settings.mqtt.max_payload_size {
            return Err(MqttError::PayloadTooLarge(publish.payload.len()).into());
        }
        if !authorizer.authorize(Action::Publish, &publish.topic) {
            log::info!("publish to {} not authorized", publish.topic);
            return Err(MqttError::NotAuthorized.into());
        }

        let ack = {
            let reply_tx = reply_tx.clone();
            move || {
                if let Some(packet_id) = packet_id {
                    let _ = reply_tx.send(Packet::PublishAck { packet_id });
                }
            }
        };
        self.publish(publish, ack).await;
        Ok(())
    }
}

async fn recv_packet(conn: &dyn Connection, keepalive: Option<Duration>) -> Result<Option<Packet>> {
    match keepalive {
        Some(d) => tokio::time::timeout(d, conn.recv()).await.map_err(|_| MqttError::KeepaliveTimeout)?,
        None => conn.recv().await,
    }
}
