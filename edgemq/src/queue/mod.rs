//! Per-session delivery queues.
//!
//! [`TemporaryQueue`] buffers QoS0 traffic in memory and sheds load when full.
//! [`PersistentQueue`] writes QoS1 traffic to a [`QueueStore`](crate::store::QueueStore)
//! bucket and feeds it back out in append order.

use std::time::Duration;

use async_trait::async_trait;

use edgemq_conf::Mqtt;

use crate::event::Event;
use crate::Result;

pub mod persistent;
pub mod temporary;

pub use persistent::PersistentQueue;
pub use temporary::TemporaryQueue;

pub use edgemq_conf::Overflow as Policy;

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Hands the event to the queue. A rejected event is completed before the error returns.
    async fn push(&self, ev: Event) -> Result<()>;

    /// Next event to deliver, `None` once the queue is closed.
    async fn recv(&self) -> Option<Event>;

    /// Stops the queue. With `cleanup` any backing data is dropped.
    async fn close(&self, cleanup: bool) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub capacity: usize,
    pub policy: Policy,
    pub write_batch_size: usize,
    pub write_batch_interval: Duration,
    pub delete_batch_size: usize,
    pub delete_batch_interval: Duration,
    pub expiry_sweep_interval: Duration,
    pub message_expiry: Duration,
}

impl From<&Mqtt> for QueueOptions {
    fn from(m: &Mqtt) -> Self {
        Self {
            capacity: m.max_qos0_queue,
            policy: m.qos0_overflow,
            write_batch_size: m.write_batch_size.max(1),
            write_batch_interval: m.write_batch_interval,
            delete_batch_size: m.delete_batch_size.max(1),
            delete_batch_interval: m.delete_batch_interval,
            expiry_sweep_interval: m.expiry_sweep_interval,
            message_expiry: m.message_expiry_interval,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions::from(&Mqtt::default())
    }
}
