//! Broker gauges, exported as JSON for whatever monitoring sits in front of the broker.

use serde_json::json;

use edgemq_utils::Counter;

#[derive(Debug, Default)]
pub struct Stats {
    pub connections: Counter,
    pub sessions: Counter,
    pub subscriptions: Counter,
    pub inflights: Counter,
    pub retaineds: Counter,
    pub qos0_dropped: Counter,
    pub routed: Counter,
    pub unrouted: Counter,
}

impl Stats {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections.count": self.connections.count(),
            "connections.max": self.connections.max(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "subscriptions.count": self.subscriptions.count(),
            "subscriptions.max": self.subscriptions.max(),
            "inflights.count": self.inflights.count(),
            "inflights.max": self.inflights.max(),
            "retaineds.count": self.retaineds.count(),
            "messages.qos0_dropped": self.qos0_dropped.count(),
            "messages.routed": self.routed.count(),
            "messages.unrouted": self.unrouted.count(),
        })
    }
}
