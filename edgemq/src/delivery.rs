//! Outbound delivery for one bound connection.
//!
//! The sending loop pulls from whichever of the session's queues has a message, QoS1
//! messages only while the in-flight window has room. The resending loop re-sends
//! unacknowledged QoS1 messages, oldest first, once their retry interval has passed.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::event::Event;
use crate::inflight::Inflight;
use crate::queue::{DeliveryQueue, PersistentQueue, TemporaryQueue};
use crate::session::{ConnHandle, Session};
use crate::types::{Packet, PacketId, QoS};
use crate::Result;

pub struct Delivery {
    task: JoinHandle<()>,
}

impl Delivery {
    /// Starts both loops for the connection behind `handle`. `replies` carries control
    /// packets to be sent in order with the deliveries.
    ///
    /// The loops stop when `handle.delivery` is cancelled. A failed send cancels the
    /// whole connection. `handle.delivery_stopped` is cancelled once both have exited.
    pub fn start(session: Session, handle: &ConnHandle, replies: mpsc::UnboundedReceiver<Packet>) -> Self {
        let (awaiting_tx, awaiting_rx) = mpsc::channel(session.inflight().capacity() * 2);
        let conn = handle.conn.clone();
        let cancel = handle.delivery.clone();

        let sending = {
            let (session, conn, cancel, on_error) = (session.clone(), conn.clone(), cancel.clone(), handle.cancel.clone());
            tokio::spawn(async move {
                if let Err(e) = sending(&session, conn.as_ref(), replies, awaiting_tx, &cancel).await {
                    log::debug!("{:?} sending loop ended, {}", session.id, e);
                    on_error.cancel();
                }
            })
        };
        let resending = {
            let on_error = handle.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = resending(&session, conn.as_ref(), awaiting_rx, &cancel).await {
                    log::debug!("{:?} resending loop ended, {}", session.id, e);
                    on_error.cancel();
                }
            })
        };

        let stopped = handle.delivery_stopped.clone();
        let task = tokio::spawn(async move {
            let _ = sending.await;
            let _ = resending.await;
            stopped.cancel();
        });
        Self { task }
    }

    /// Waits for both loops to exit, after their token was cancelled.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn next_qos0(q: &Option<Arc<TemporaryQueue>>) -> Option<Event> {
    match q {
        Some(q) => q.recv().await,
        None => futures::future::pending().await,
    }
}

async fn next_qos1(q: &Option<Arc<PersistentQueue>>, inflight: &Inflight) -> Option<(OwnedSemaphorePermit, Event)> {
    match q {
        Some(q) => {
            let permit = inflight.acquire().await?;
            let ev = q.recv().await?;
            Some((permit, ev))
        }
        None => futures::future::pending().await,
    }
}

async fn sending(
    session: &Session,
    conn: &dyn Connection,
    mut replies: mpsc::UnboundedReceiver<Packet>,
    awaiting_tx: mpsc::Sender<(PacketId, u64)>,
    cancel: &CancellationToken,
) -> Result<()> {
    let inflight = session.inflight();

    //Unacknowledged messages from an earlier connection go first
    for (packet_id, seq) in inflight.pending() {
        if let Some(publish) = inflight.resend(packet_id, seq) {
            log::debug!("{:?} resending {:?}", session.id, publish);
            conn.send(Packet::Publish(publish)).await?;
            awaiting_tx.send((packet_id, seq)).await?;
        }
    }

    //A closed queue disables its branch until the session publishes new queues
    let mut queues_rx = session.watch_queues();
    loop {
        let queues = queues_rx.borrow_and_update().clone();
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = queues_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(packet) = replies.recv() => {
                conn.send(packet).await?;
            }
            Some(ev) = next_qos0(&queues.qos0) => {
                let mut publish = ev.message().clone();
                publish.qos = QoS::AtMostOnce;
                publish.dup = false;
                publish.packet_id = None;
                let res = conn.send(Packet::Publish(publish)).await;
                ev.done();
                res?;
            }
            Some((permit, ev)) = next_qos1(&queues.qos1, inflight) => {
                let (packet_id, seq, publish) = inflight.insert(ev, permit);
                conn.send(Packet::Publish(publish)).await?;
                awaiting_tx.send((packet_id, seq)).await?;
            }
        }
    }
    Ok(())
}

async fn resending(
    session: &Session,
    conn: &dyn Connection,
    mut awaiting_rx: mpsc::Receiver<(PacketId, u64)>,
    cancel: &CancellationToken,
) -> Result<()> {
    let inflight = session.inflight();
    let mut waiting: VecDeque<(PacketId, u64)> = VecDeque::new();
    loop {
        while let Some((packet_id, seq)) = waiting.front() {
            if inflight.is_pending(*packet_id, *seq) {
                break;
            }
            waiting.pop_front();
        }
        let deadline = waiting.front().and_then(|(packet_id, seq)| inflight.deadline(*packet_id, *seq));

        tokio::select! {
            _ = cancel.cancelled() => break,
            item = awaiting_rx.recv() => match item {
                Some(item) => waiting.push_back(item),
                None => break,
            },
            _ = sleep_until_opt(deadline) => {
                if let Some((packet_id, seq)) = waiting.pop_front() {
                    if let Some(publish) = inflight.resend(packet_id, seq) {
                        log::debug!("{:?} retry {:?}", session.id, publish);
                        conn.send(Packet::Publish(publish)).await?;
                        waiting.push_back((packet_id, seq));
                    }
                }
            }
        }
    }
    Ok(())
}

#[inline]
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => futures::future::pending().await,
    }
}
