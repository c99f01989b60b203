use std::time::Duration;

use serde::Deserialize;

use edgemq_utils::{deserialize_duration, Bytesize};

/// What to do with a QoS0 message when the subscriber's temporary queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    /// Drop the oldest queued message to make room.
    Early,
    /// Drop the message being pushed.
    Current,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Mqtt::max_qos0_queue_default")]
    pub max_qos0_queue: usize,
    #[serde(default = "Mqtt::qos0_overflow_default")]
    pub qos0_overflow: Overflow,
    //Unacknowledged QoS1 window per session, also the capacity of the QoS1 output channel.
    #[serde(default = "Mqtt::max_inflight_default")]
    pub max_inflight: usize,
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,

    #[serde(default = "Mqtt::batch_size_default")]
    pub write_batch_size: usize,
    #[serde(default = "Mqtt::write_batch_interval_default", deserialize_with = "deserialize_duration")]
    pub write_batch_interval: Duration,
    #[serde(default = "Mqtt::batch_size_default")]
    pub delete_batch_size: usize,
    #[serde(default = "Mqtt::delete_batch_interval_default", deserialize_with = "deserialize_duration")]
    pub delete_batch_interval: Duration,
    #[serde(default = "Mqtt::expiry_sweep_interval_default", deserialize_with = "deserialize_duration")]
    pub expiry_sweep_interval: Duration,
    #[serde(default = "Mqtt::message_expiry_interval_default", deserialize_with = "deserialize_duration")]
    pub message_expiry_interval: Duration,

    #[serde(default = "Mqtt::max_payload_size_default")]
    pub max_payload_size: Bytesize,
    #[serde(default = "Mqtt::max_topic_levels_default")]
    pub max_topic_levels: usize,
    //0 means unlimited
    #[serde(default)]
    pub max_subscriptions: usize,
    #[serde(default = "Mqtt::max_clientid_len_default")]
    pub max_clientid_len: usize,
    #[serde(default = "Mqtt::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    #[serde(default = "Mqtt::system_topic_prefixes_default")]
    pub system_topic_prefixes: Vec<String>,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            max_qos0_queue: Self::max_qos0_queue_default(),
            qos0_overflow: Self::qos0_overflow_default(),
            max_inflight: Self::max_inflight_default(),
            retry_interval: Self::retry_interval_default(),
            write_batch_size: Self::batch_size_default(),
            write_batch_interval: Self::write_batch_interval_default(),
            delete_batch_size: Self::batch_size_default(),
            delete_batch_interval: Self::delete_batch_interval_default(),
            expiry_sweep_interval: Self::expiry_sweep_interval_default(),
            message_expiry_interval: Self::message_expiry_interval_default(),
            max_payload_size: Self::max_payload_size_default(),
            max_topic_levels: Self::max_topic_levels_default(),
            max_subscriptions: 0,
            max_clientid_len: Self::max_clientid_len_default(),
            connect_timeout: Self::connect_timeout_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            system_topic_prefixes: Self::system_topic_prefixes_default(),
        }
    }
}

impl Mqtt {
    fn max_qos0_queue_default() -> usize {
        1000
    }
    fn qos0_overflow_default() -> Overflow {
        Overflow::Early
    }
    fn max_inflight_default() -> usize {
        64
    }
    fn retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn batch_size_default() -> usize {
        100
    }
    fn write_batch_interval_default() -> Duration {
        Duration::from_millis(100)
    }
    fn delete_batch_interval_default() -> Duration {
        Duration::from_millis(500)
    }
    fn expiry_sweep_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn message_expiry_interval_default() -> Duration {
        Duration::from_secs(86400)
    }
    fn max_payload_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn max_topic_levels_default() -> usize {
        9
    }
    fn max_clientid_len_default() -> usize {
        65535
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn keepalive_backoff_default() -> f32 {
        0.75
    }
    fn system_topic_prefixes_default() -> Vec<String> {
        vec!["$SYS".into(), "$link".into()]
    }

    /// Idle time after which a client with the given keepalive is considered gone.
    #[inline]
    pub fn keepalive_timeout(&self, keep_alive: u16) -> Option<Duration> {
        if keep_alive == 0 {
            return None;
        }
        let backoff = if self.keepalive_backoff > 0.0 { self.keepalive_backoff } else { 0.75 };
        Some(Duration::from_millis((keep_alive as f32 * 1000.0 / backoff) as u64))
    }
}
