mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgemq::store::RamStorage;
use edgemq::{Connect, ConnectAckReason, Packet, QoS, SubscribeReturnCode};

use common::*;

fn account(id: &str, username: &str, password: &'static str) -> Connect {
    let mut c = Connect::new(id, true);
    c.username = Some(username.into());
    c.password = Some(Bytes::from_static(password.as_bytes()));
    c
}

#[tokio::test]
async fn bad_password_is_refused() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (client, ack) = open(&mgr, account("d", "dev1", "nope")).await;
    assert_eq!(
        ack,
        Some(Packet::ConnectAck { session_present: false, return_code: ConnectAckReason::BadUserNameOrPassword })
    );
    assert!(tokio::time::timeout(WAIT, client.task).await.unwrap().unwrap().is_err());
    assert!(mgr.get("d").is_none());
}

#[tokio::test]
async fn anonymous_refused_when_disabled() {
    let storage = Arc::new(RamStorage::new());
    let config = CONFIG.replace("allow_anonymous = true", "allow_anonymous = false");
    let mgr = broker_with(&storage, &config).await;
    let (_client, ack) = open(&mgr, Connect::new("anon", true)).await;
    assert_eq!(
        ack,
        Some(Packet::ConnectAck { session_present: false, return_code: ConnectAckReason::NotAuthorized })
    );
}

#[tokio::test]
async fn account_permissions_apply() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut d, _) = connect_with(&mgr, account("d", "dev1", "secret")).await;

    d.send(Packet::Subscribe {
        packet_id: pid(1),
        topic_filters: vec![("devices/+/cmd".into(), QoS::AtLeastOnce), ("devices/#".into(), QoS::AtLeastOnce)],
    });
    assert_eq!(
        d.recv().await,
        Some(Packet::SubscribeAck {
            packet_id: pid(1),
            status: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce), SubscribeReturnCode::Failure]
        })
    );

    let (mut watcher, _) = connect(&mgr, "watcher", true).await;
    watcher.subscribe(1, "devices/#", QoS::AtMostOnce).await;

    d.publish(3, "devices/dev1/temp", "20", QoS::AtLeastOnce).await;
    assert_eq!(d.recv().await, Some(Packet::PublishAck { packet_id: pid(3) }));
    assert_eq!(watcher.expect_publish().await.payload.as_ref(), b"20");
}

#[tokio::test]
async fn unauthorized_publish_closes_connection() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut watcher, _) = connect(&mgr, "watcher", true).await;
    watcher.subscribe(1, "#", QoS::AtMostOnce).await;

    let mut c = account("d", "dev1", "secret");
    c.last_will = Some(will("devices/dev1/status", "lost"));
    let (mut d, _) = connect_with(&mgr, c).await;
    d.publish(5, "other/x", "spoofed", QoS::AtLeastOnce).await;
    assert_eq!(d.recv().await, None);
    assert!(d.inner.is_closed());
    assert!(tokio::time::timeout(WAIT, d.task).await.unwrap().unwrap().is_err());

    let m = watcher.expect_publish().await;
    assert_eq!(m.topic, "devices/dev1/status");
    assert_eq!(m.payload.as_ref(), b"lost");
    watcher.expect_silence(Duration::from_millis(200)).await;
    assert!(mgr.get("d").is_none());
}

#[tokio::test]
async fn system_namespace_needs_explicit_grant() {
    let storage = Arc::new(RamStorage::new());
    let config = CONFIG.replace(r##"subscribe = ["#", "$link/#"]"##, r##"subscribe = ["#"]"##);
    let mgr = broker_with(&storage, &config).await;
    let (mut c, _) = connect(&mgr, "c", true).await;
    assert_eq!(c.subscribe(1, "$link/+/status", QoS::AtMostOnce).await, vec![SubscribeReturnCode::Failure]);
    assert_eq!(c.subscribe(2, "+/status", QoS::AtMostOnce).await, vec![SubscribeReturnCode::Success(QoS::AtMostOnce)]);

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(0, "$link/n1/status", "up", QoS::AtMostOnce).await;
    c.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn invalid_filters_fail_individually() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut c, _) = connect(&mgr, "c", true).await;
    c.send(Packet::Subscribe {
        packet_id: pid(1),
        topic_filters: vec![("a/#/b".into(), QoS::AtMostOnce), ("ok/+".into(), QoS::AtMostOnce), ("".into(), QoS::AtMostOnce)],
    });
    assert_eq!(
        c.recv().await,
        Some(Packet::SubscribeAck {
            packet_id: pid(1),
            status: vec![
                SubscribeReturnCode::Failure,
                SubscribeReturnCode::Success(QoS::AtMostOnce),
                SubscribeReturnCode::Failure
            ]
        })
    );
}

#[tokio::test]
async fn revoked_subscriptions_dropped_on_restart() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut c, _) = connect(&mgr, "c", false).await;
    c.subscribe(1, "$link/x", QoS::AtLeastOnce).await;
    c.subscribe(2, "plain", QoS::AtLeastOnce).await;
    c.disconnect().await;
    mgr.shutdown().await.unwrap();
    storage.reopen();

    let config = CONFIG.replace(r##"subscribe = ["#", "$link/#"]"##, r##"subscribe = ["#"]"##);
    let mgr = broker_with(&storage, &config).await;
    let subs = mgr.get("c").unwrap().subscriptions().await;
    assert_eq!(subs.len(), 1);
    assert!(subs.contains_key("plain"));
}
