mod common;

use std::sync::Arc;
use std::time::Duration;

use edgemq::store::{RamStorage, Storage};
use edgemq::{Connect, Packet, QoS, SubscribeReturnCode};

use common::*;

#[tokio::test]
async fn qos1_fanout_acks_publisher_after_queueing() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;

    let (mut s1, _) = connect(&mgr, "s1", false).await;
    let (mut s2, _) = connect(&mgr, "s2", true).await;
    assert_eq!(s1.subscribe(1, "a/#", QoS::AtLeastOnce).await, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
    assert_eq!(s2.subscribe(1, "a/+", QoS::AtMostOnce).await, vec![SubscribeReturnCode::Success(QoS::AtMostOnce)]);

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(7, "a/b", "hello", QoS::AtLeastOnce).await;
    assert_eq!(p.recv().await, Some(Packet::PublishAck { packet_id: pid(7) }));

    let m1 = s1.expect_publish().await;
    assert_eq!(m1.qos, QoS::AtLeastOnce);
    assert!(m1.packet_id.is_some());
    assert!(!m1.dup);
    assert_eq!(m1.payload.as_ref(), b"hello");
    s1.ack(&m1);

    let m2 = s2.expect_publish().await;
    assert_eq!(m2.qos, QoS::AtMostOnce);
    assert_eq!(m2.packet_id, None);

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn qos1_without_subscribers_is_acked_immediately() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(3, "nobody/listens", "x", QoS::AtLeastOnce).await;
    assert_eq!(p.recv().await, Some(Packet::PublishAck { packet_id: pid(3) }));
    assert_eq!(mgr.ctx.stats.unrouted.count(), 1);
}

#[tokio::test]
async fn offline_messages_are_delivered_on_reconnect() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;

    let (mut s, present) = connect(&mgr, "s", false).await;
    assert!(!present);
    s.subscribe(1, "t", QoS::AtLeastOnce).await;
    s.disconnect().await;

    let (mut p, _) = connect(&mgr, "p", true).await;
    for (i, payload) in ["1", "2", "3"].into_iter().enumerate() {
        p.publish(i as u16 + 1, "t", payload, QoS::AtLeastOnce).await;
        assert!(matches!(p.recv().await, Some(Packet::PublishAck { .. })));
    }

    let (mut s, present) = connect(&mgr, "s", false).await;
    assert!(present);
    for expected in ["1", "2", "3"] {
        let m = s.expect_publish().await;
        assert_eq!(m.payload.as_ref(), expected.as_bytes());
        s.ack(&m);
    }
    s.expect_silence(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn unacked_message_is_resent_with_dup() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;

    let (mut s, _) = connect(&mgr, "s", false).await;
    s.subscribe(1, "t", QoS::AtLeastOnce).await;
    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "t", "x", QoS::AtLeastOnce).await;

    let first = s.expect_publish().await;
    assert!(!first.dup);
    let again = s.expect_publish().await;
    assert!(again.dup);
    assert_eq!(again.packet_id, first.packet_id);

    s.ack(&again);
    s.expect_silence(Duration::from_millis(600)).await;
    assert!(mgr.get("s").unwrap().inflight().is_empty());
}

#[tokio::test]
async fn inflight_survives_reconnect() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;

    let (mut s, _) = connect(&mgr, "s", false).await;
    s.subscribe(1, "t", QoS::AtLeastOnce).await;
    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "t", "x", QoS::AtLeastOnce).await;
    let first = s.expect_publish().await;
    s.abort().await;

    let (mut s, present) = connect(&mgr, "s", false).await;
    assert!(present);
    let resent = s.expect_publish().await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, first.packet_id);
    s.ack(&resent);
}

#[tokio::test]
async fn clean_session_leaves_nothing_behind() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;

    let (mut s, _) = connect(&mgr, "c", true).await;
    s.subscribe(1, "t", QoS::AtLeastOnce).await;
    assert!(storage.bucket_exists("queue/c"));
    assert!(storage.get_kv("session/c").await.unwrap().is_none());
    s.disconnect().await;

    assert!(mgr.get("c").is_none());
    assert!(!storage.bucket_exists("queue/c"));

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "t", "lost", QoS::AtLeastOnce).await;
    assert!(matches!(p.recv().await, Some(Packet::PublishAck { .. })));

    let (mut s, present) = connect(&mgr, "c", true).await;
    assert!(!present);
    s.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn durable_session_survives_restart() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut s, _) = connect(&mgr, "s", false).await;
    s.subscribe(1, "t/+", QoS::AtLeastOnce).await;
    s.disconnect().await;

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "t/1", "kept", QoS::AtLeastOnce).await;
    assert!(matches!(p.recv().await, Some(Packet::PublishAck { .. })));

    mgr.shutdown().await.unwrap();
    assert!(storage.is_closed());
    storage.reopen();

    let mgr = broker(&storage).await;
    let session = mgr.get("s").unwrap();
    assert_eq!(session.subscriptions().await.get("t/+"), Some(&QoS::AtLeastOnce));

    let (mut s, present) = connect(&mgr, "s", false).await;
    assert!(present);
    let m = s.expect_publish().await;
    assert_eq!(m.payload.as_ref(), b"kept");
    s.ack(&m);
}

#[tokio::test]
async fn durable_session_survives_restart_on_disk() {
    let dir = DataDir::new();
    {
        let mgr = broker_on(dir.open().await, CONFIG).await;
        let (mut s, _) = connect(&mgr, "s", false).await;
        s.subscribe(1, "t/+", QoS::AtLeastOnce).await;
        s.disconnect().await;

        let (mut p, _) = connect(&mgr, "p", true).await;
        p.publish(1, "t/1", "kept", QoS::AtLeastOnce).await;
        assert!(matches!(p.recv().await, Some(Packet::PublishAck { .. })));
        p.disconnect().await;
        mgr.shutdown().await.unwrap();
    }

    let mgr = broker_on(dir.open().await, CONFIG).await;
    let session = mgr.get("s").unwrap();
    assert_eq!(session.subscriptions().await.get("t/+"), Some(&QoS::AtLeastOnce));
    assert!(mgr.get("p").is_none());

    let (mut s, present) = connect(&mgr, "s", false).await;
    assert!(present);
    let m = s.expect_publish().await;
    assert_eq!(m.payload.as_ref(), b"kept");
    s.ack(&m);
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_to_empty_drops_queues() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut s, _) = connect(&mgr, "s", false).await;
    s.subscribe(1, "a", QoS::AtLeastOnce).await;
    assert!(storage.bucket_exists("queue/s"));

    s.send(Packet::Unsubscribe { packet_id: pid(2), topic_filters: vec!["a".into(), "never".into()] });
    assert_eq!(s.recv().await, Some(Packet::UnsubscribeAck { packet_id: pid(2) }));
    assert!(!storage.bucket_exists("queue/s"));

    s.send(Packet::Unsubscribe { packet_id: pid(3), topic_filters: vec!["a".into()] });
    assert_eq!(s.recv().await, Some(Packet::UnsubscribeAck { packet_id: pid(3) }));

    s.subscribe(4, "b", QoS::AtLeastOnce).await;
    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "b", "again", QoS::AtLeastOnce).await;
    assert_eq!(s.expect_publish().await.payload.as_ref(), b"again");
}

#[tokio::test]
async fn subscription_qos_caps_delivery_qos() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut s, _) = connect(&mgr, "s", true).await;
    assert_eq!(s.subscribe(1, "q", QoS::ExactlyOnce).await, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
    s.subscribe(2, "q0", QoS::AtMostOnce).await;

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(0, "q", "low", QoS::AtMostOnce).await;
    let m = s.expect_publish().await;
    assert_eq!(m.qos, QoS::AtMostOnce);

    p.publish(1, "q0", "high", QoS::AtLeastOnce).await;
    let m = s.expect_publish().await;
    assert_eq!(m.qos, QoS::AtMostOnce);
    assert_eq!(m.payload.as_ref(), b"high");
}

#[tokio::test]
async fn retained_message_is_replayed_on_subscribe() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut p, _) = connect(&mgr, "p", true).await;
    let mut msg = edgemq::Publish::new("sensors/t1", "21.5", QoS::AtLeastOnce).retained(true);
    msg = msg.packet_id(1);
    p.send(Packet::Publish(msg));
    assert!(matches!(p.recv().await, Some(Packet::PublishAck { .. })));

    let (mut s, _) = connect(&mgr, "s", true).await;
    s.subscribe(1, "sensors/#", QoS::AtLeastOnce).await;
    let m = s.expect_publish().await;
    assert!(m.retain);
    assert_eq!(m.payload.as_ref(), b"21.5");
    s.ack(&m);

    p.publish(2, "sensors/t1", "22", QoS::AtLeastOnce).await;
    let live = s.expect_publish().await;
    assert!(!live.retain);
}

#[tokio::test]
async fn will_is_published_on_ungraceful_close_only() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut watcher, _) = connect(&mgr, "watcher", true).await;
    watcher.subscribe(1, "status/#", QoS::AtMostOnce).await;

    let mut c = Connect::new("w1", true);
    c.last_will = Some(will("status/w1", "gone"));
    let (w1, _) = connect_with(&mgr, c).await;
    w1.abort().await;
    assert_eq!(watcher.expect_publish().await.payload.as_ref(), b"gone");

    let mut c = Connect::new("w2", true);
    c.last_will = Some(will("status/w2", "gone"));
    let (w2, _) = connect_with(&mgr, c).await;
    w2.disconnect().await;
    watcher.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn second_connection_takes_over_session() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;

    let mut c = Connect::new("dup", false);
    c.last_will = Some(will("status/dup", "gone"));
    let (mut first, _) = connect_with(&mgr, c).await;
    first.subscribe(1, "x", QoS::AtLeastOnce).await;

    let (mut watcher, _) = connect(&mgr, "watcher", true).await;
    watcher.subscribe(1, "status/#", QoS::AtMostOnce).await;

    let (mut second, present) = connect(&mgr, "dup", false).await;
    assert!(present);
    assert_eq!(first.recv().await, None);
    assert!(tokio::time::timeout(WAIT, first.task).await.unwrap().unwrap().is_ok());
    watcher.expect_silence(Duration::from_millis(200)).await;

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "x", "to-second", QoS::AtLeastOnce).await;
    assert_eq!(second.expect_publish().await.payload.as_ref(), b"to-second");
}

#[tokio::test]
async fn qos2_publish_closes_connection() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut c, _) = connect(&mgr, "c", true).await;
    c.publish(1, "t", "x", QoS::ExactlyOnce).await;
    assert_eq!(c.recv().await, None);
    assert!(tokio::time::timeout(WAIT, c.task).await.unwrap().unwrap().is_err());
}

#[tokio::test]
async fn ping_and_unexpected_packets() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut c, _) = connect(&mgr, "c", true).await;
    c.send(Packet::PingRequest);
    assert_eq!(c.recv().await, Some(Packet::PingResponse));
    c.send(Packet::Connect(Box::new(Connect::new("c", true))));
    assert_eq!(c.recv().await, None);
}

#[tokio::test]
async fn connect_must_come_first_and_in_time() {
    let storage = Arc::new(RamStorage::new());
    let config = CONFIG.replace("[mqtt]\n", "[mqtt]\nconnect_timeout = \"100ms\"\n");
    let mgr = broker_with(&storage, &config).await;

    let (conn, client) = edgemq::connection::pair("idle");
    let res = mgr.handle(conn).await;
    assert!(res.is_err());
    assert!(client.is_closed());

    let (conn, client) = edgemq::connection::pair("rude");
    client.send(Packet::PingRequest).unwrap();
    assert!(mgr.handle(conn).await.is_err());
}

#[tokio::test]
async fn keepalive_expiry_closes_connection() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let mut c = Connect::new("k", true);
    c.keep_alive = 1;
    let (mut client, _) = connect_with(&mgr, c).await;
    assert_eq!(client.inner.recv_timeout(Duration::from_secs(3)).await, None);
    let res = tokio::time::timeout(WAIT, client.task).await.unwrap().unwrap();
    assert!(res.is_err());
}

#[tokio::test]
async fn empty_client_id() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (_c, present) = connect(&mgr, "", true).await;
    assert!(!present);
    assert_eq!(mgr.registry.count(), 1);

    let (_c, ack) = open(&mgr, Connect::new("", false)).await;
    assert_eq!(
        ack,
        Some(Packet::ConnectAck {
            session_present: false,
            return_code: edgemq::ConnectAckReason::IdentifierRejected
        })
    );
}

#[tokio::test]
async fn offline_qos0_subscriber_does_not_hold_publisher_ack() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut s, _) = connect(&mgr, "s", false).await;
    s.subscribe(1, "t", QoS::AtMostOnce).await;
    s.disconnect().await;

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(9, "t", "x", QoS::AtLeastOnce).await;
    assert_eq!(p.recv().await, Some(Packet::PublishAck { packet_id: pid(9) }));

    let (mut s, present) = connect(&mgr, "s", false).await;
    assert!(present);
    let m = s.expect_publish().await;
    assert_eq!(m.qos, QoS::AtMostOnce);
    assert_eq!(m.payload.as_ref(), b"x");
}

#[tokio::test]
async fn clean_reconnect_replaces_session_and_sends_will() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut watcher, _) = connect(&mgr, "watcher", true).await;
    watcher.subscribe(1, "status/#", QoS::AtMostOnce).await;

    let mut c = Connect::new("dup", true);
    c.last_will = Some(will("status/dup", "gone"));
    let (mut first, _) = connect_with(&mgr, c).await;
    first.subscribe(1, "x", QoS::AtLeastOnce).await;
    let old = mgr.get("dup").unwrap();

    let (mut second, present) = connect(&mgr, "dup", true).await;
    assert!(!present);
    assert_eq!(first.recv().await, None);
    assert!(tokio::time::timeout(WAIT, first.task).await.unwrap().unwrap().is_ok());
    assert_eq!(watcher.expect_publish().await.payload.as_ref(), b"gone");

    let new = mgr.get("dup").unwrap();
    assert_ne!(old.uid, new.uid);
    assert!(old.is_closed());
    assert!(new.subscriptions().await.is_empty());
    assert_eq!(mgr.registry.count(), 2);

    let (mut p, _) = connect(&mgr, "p", true).await;
    p.publish(1, "x", "nobody", QoS::AtLeastOnce).await;
    assert_eq!(p.recv().await, Some(Packet::PublishAck { packet_id: pid(1) }));
    second.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn clean_session_unsubscribed_to_empty_keeps_identity() {
    let storage = Arc::new(RamStorage::new());
    let mgr = broker(&storage).await;
    let (mut c, _) = connect(&mgr, "c", true).await;
    c.subscribe(1, "a", QoS::AtLeastOnce).await;
    assert!(storage.bucket_exists("queue/c"));

    c.send(Packet::Unsubscribe { packet_id: pid(2), topic_filters: vec!["a".into()] });
    assert_eq!(c.recv().await, Some(Packet::UnsubscribeAck { packet_id: pid(2) }));
    assert!(!storage.bucket_exists("queue/c"));
    assert!(storage.get_kv("session/c").await.unwrap().is_none());
    let session = mgr.get("c").unwrap();
    assert!(session.queues().is_empty());

    c.send(Packet::PingRequest);
    assert_eq!(c.recv().await, Some(Packet::PingResponse));

    let (_second, present) = connect(&mgr, "c", true).await;
    assert!(!present);
    assert_eq!(c.recv().await, None);
    assert!(session.is_closed());
}
