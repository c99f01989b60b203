//! The transport seam.
//!
//! The broker core never touches sockets or the wire codec. It talks to a client through
//! a [`Connection`] that carries already decoded [`Packet`]s. [`pair`] builds an
//! in-process connection, used for internal links and tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::MqttError;
use crate::types::Packet;
use crate::Result;

#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, packet: Packet) -> Result<()>;

    /// Next packet from the peer, `None` once the peer is gone.
    async fn recv(&self) -> Result<Option<Packet>>;

    async fn close(&self) -> Result<()>;

    fn remote_addr(&self) -> String;

    /// Common name of the verified client certificate, if the transport has one.
    fn common_name(&self) -> Option<String> {
        None
    }
}

/// Server side of an in-process connection.
pub struct ChannelConnection {
    remote_addr: String,
    common_name: Option<String>,
    tx: mpsc::UnboundedSender<Packet>,
    rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: CancellationToken,
}

/// Client side of an in-process connection.
pub struct ChannelClient {
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
    closed: CancellationToken,
}

pub fn pair<A: Into<String>>(remote_addr: A) -> (Arc<ChannelConnection>, ChannelClient) {
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let conn = ChannelConnection {
        remote_addr: remote_addr.into(),
        common_name: None,
        tx: server_tx,
        rx: Mutex::new(server_rx),
        closed: closed.clone(),
    };
    (Arc::new(conn), ChannelClient { tx: client_tx, rx: client_rx, closed })
}

impl ChannelConnection {
    /// Presents `cn` as the common name of a verified client certificate.
    #[inline]
    pub fn with_common_name(mut self: Arc<Self>, cn: &str) -> Arc<Self> {
        if let Some(conn) = Arc::get_mut(&mut self) {
            conn.common_name = Some(cn.to_owned());
        }
        self
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelConnection({}, closed: {})", self.remote_addr, self.is_closed())
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, packet: Packet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(MqttError::ConnectionClosed.into());
        }
        self.tx.send(packet).map_err(|_| MqttError::ConnectionClosed)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Packet>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            p = rx.recv() => Ok(p),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }

    #[inline]
    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    #[inline]
    fn common_name(&self) -> Option<String> {
        self.common_name.clone()
    }
}

impl ChannelClient {
    pub fn send(&self, packet: Packet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(MqttError::ConnectionClosed.into());
        }
        self.tx.send(packet).map_err(|_| MqttError::ConnectionClosed)?;
        Ok(())
    }

    /// Next packet from the server. Packets sent before the close are still returned,
    /// `None` after that.
    pub async fn recv(&mut self) -> Option<Packet> {
        if let Ok(p) = self.rx.try_recv() {
            return Some(p);
        }
        tokio::select! {
            p = self.rx.recv() => p,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Drops the link without a DISCONNECT packet.
    #[inline]
    pub fn abort(&self) {
        self.closed.cancel();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
