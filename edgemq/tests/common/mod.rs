#![allow(dead_code)]

use std::num::NonZeroU16;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgemq::conf::{Settings, StorageConfig};
use edgemq::connection::{pair, ChannelClient};
use edgemq::store::{self, RamStorage, Storage};
use edgemq::{
    Connect, ConnectAckReason, Context, LastWill, Packet, Publish, QoS, Result, SessionManager, SubscribeReturnCode,
};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(2);

pub const CONFIG: &str = r##"
[mqtt]
retry_interval = "300ms"
write_batch_interval = "5ms"
delete_batch_interval = "10ms"

[acl]
allow_anonymous = true
anonymous = { publish = ["#", "$link/#"], subscribe = ["#", "$link/#"] }

[[acl.accounts]]
username = "dev1"
password = "secret"
publish = ["devices/${username}/#"]
subscribe = ["devices/+/cmd"]
"##;

pub async fn broker(storage: &Arc<RamStorage>) -> SessionManager {
    broker_with(storage, CONFIG).await
}

pub async fn broker_with(storage: &Arc<RamStorage>, config: &str) -> SessionManager {
    broker_on(storage.clone(), config).await
}

pub async fn broker_on(storage: Arc<dyn Storage>, config: &str) -> SessionManager {
    let settings = Settings::from_toml(config).unwrap();
    let ctx = Context::with_static_acl(settings, storage);
    SessionManager::start(ctx).await.unwrap()
}

/// A sled data directory removed on drop.
pub struct DataDir(PathBuf);

impl DataDir {
    pub fn new() -> Self {
        DataDir(std::env::temp_dir().join(format!("edgemq-it-{}", uuid::Uuid::new_v4().simple())))
    }

    /// Opens the storage, waiting for the previous broker to release the database lock.
    pub async fn open(&self) -> Arc<dyn Storage> {
        let cfg = StorageConfig { path: self.0.clone(), ..Default::default() };
        for _ in 0..100 {
            if let Ok(s) = store::open(&cfg) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("storage at {} still locked", self.0.display());
    }
}

impl Drop for DataDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[inline]
pub fn pid(n: u16) -> NonZeroU16 {
    NonZeroU16::new(n).unwrap()
}

pub struct Client {
    pub inner: ChannelClient,
    pub task: JoinHandle<Result<()>>,
}

impl Client {
    pub async fn recv(&mut self) -> Option<Packet> {
        self.inner.recv_timeout(WAIT).await
    }

    pub fn send(&self, p: Packet) {
        self.inner.send(p).unwrap()
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    /// Asserts that nothing arrives within `d`.
    pub async fn expect_silence(&mut self, d: Duration) {
        if let Some(p) = self.inner.recv_timeout(d).await {
            panic!("unexpected {:?}", p)
        }
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> Vec<SubscribeReturnCode> {
        self.send(Packet::Subscribe { packet_id: pid(packet_id), topic_filters: vec![(filter.into(), qos)] });
        match self.recv().await {
            Some(Packet::SubscribeAck { packet_id: id, status }) if id.get() == packet_id => status,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    pub async fn publish(&mut self, packet_id: u16, topic: &str, payload: &'static str, qos: QoS) {
        let mut p = Publish::new(topic, payload, qos);
        if qos != QoS::AtMostOnce {
            p = p.packet_id(packet_id);
        }
        self.send(Packet::Publish(p));
    }

    pub fn ack(&self, p: &Publish) {
        self.send(Packet::PublishAck { packet_id: p.packet_id.unwrap() })
    }

    pub async fn disconnect(self) {
        self.send(Packet::Disconnect);
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }

    /// Drops the link without DISCONNECT and waits for the broker to notice.
    pub async fn abort(self) {
        self.inner.abort();
        let _ = tokio::time::timeout(WAIT, self.task).await.unwrap();
    }
}

pub async fn open(mgr: &SessionManager, connect: Connect) -> (Client, Option<Packet>) {
    let (conn, inner) = pair(format!("test/{}", connect.client_id));
    let m = mgr.clone();
    let task = tokio::spawn(async move { m.handle(conn).await });
    let mut client = Client { inner, task };
    client.send(Packet::Connect(Box::new(connect)));
    let ack = client.recv().await;
    (client, ack)
}

/// Connects and asserts acceptance, returning the session-present flag.
pub async fn connect(mgr: &SessionManager, id: &str, clean: bool) -> (Client, bool) {
    connect_with(mgr, Connect::new(id, clean)).await
}

pub async fn connect_with(mgr: &SessionManager, connect: Connect) -> (Client, bool) {
    match open(mgr, connect).await {
        (client, Some(Packet::ConnectAck { session_present, return_code: ConnectAckReason::ConnectionAccepted })) => {
            (client, session_present)
        }
        (_, other) => panic!("expected CONNACK, got {:?}", other),
    }
}

pub fn will(topic: &str, message: &'static str) -> LastWill {
    LastWill { qos: QoS::AtMostOnce, retain: false, topic: topic.into(), message: message.into() }
}
