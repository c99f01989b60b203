use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub use edgemq_utils::TimestampMillis;

use crate::acl::Principal;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type Password = Bytes;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type PacketId = u16;
pub type SessionUid = u64;
pub type ConnectionId = u64;

pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;

/// Quality of Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget, no acknowledgment.
    AtMostOnce = 0,
    /// Acknowledged with PUBACK and resent until then.
    AtLeastOnce = 1,
    /// Never granted by this broker, publishes carrying it are rejected.
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        if self.value() < qos.value() {
            *self
        } else {
            qos
        }
    }

    #[inline]
    pub fn is_supported(&self) -> bool {
        !matches!(self, QoS::ExactlyOnce)
    }
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(v),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
    pub create_time: Option<TimestampMillis>,
}

impl Publish {
    #[inline]
    pub fn new<T: Into<TopicName>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS) -> Self {
        Self {
            dup: false,
            retain: false,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            create_time: Some(edgemq_utils::timestamp_millis()),
        }
    }

    #[inline]
    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = NonZeroU16::new(packet_id);
        self
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("packet_id", &self.packet_id)
            .field("topic", &self.topic)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("qos", &self.qos)
            .field("payload", &"<REDACTED>")
            .field("create_time", &self.create_time)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: TopicName,
    pub message: Bytes,
}

impl LastWill {
    #[inline]
    pub fn to_publish(&self) -> Publish {
        Publish::new(self.topic.clone(), self.message.clone(), self.qos).retained(self.retain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_level: u8,
    pub clean_session: bool,
    /// Seconds, 0 disables the keepalive check.
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub password: Option<Password>,
}

impl Connect {
    #[inline]
    pub fn new<C: Into<ClientId>>(client_id: C, clean_session: bool) -> Self {
        Self {
            protocol_level: MQTT_LEVEL_311,
            clean_session,
            keep_alive: 0,
            last_will: None,
            client_id: client_id.into(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAckReason {
    ConnectionAccepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServiceUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectAckReason {
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            ConnectAckReason::ConnectionAccepted => 0,
            ConnectAckReason::UnacceptableProtocolVersion => 1,
            ConnectAckReason::IdentifierRejected => 2,
            ConnectAckReason::ServiceUnavailable => 3,
            ConnectAckReason::BadUserNameOrPassword => 4,
            ConnectAckReason::NotAuthorized => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

/// Packets exchanged with a client, already decoded at the connection boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck { session_present: bool, return_code: ConnectAckReason },
    Publish(Publish),
    PublishAck { packet_id: NonZeroU16 },
    Subscribe { packet_id: NonZeroU16, topic_filters: Vec<(TopicFilter, QoS)> },
    SubscribeAck { packet_id: NonZeroU16, status: Vec<SubscribeReturnCode> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<TopicFilter> },
    UnsubscribeAck { packet_id: NonZeroU16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl Packet {
    #[inline]
    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubscribeAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubscribeAck { .. } => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// Durable part of a session, stored as JSON under `session/<client id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: ClientId,
    pub clean_session: bool,
    #[serde(default)]
    pub subscriptions: BTreeMap<TopicFilter, QoS>,
    #[serde(default)]
    pub will: Option<LastWill>,
    #[serde(default)]
    pub principal: Option<Principal>,
}

impl SessionInfo {
    #[inline]
    pub fn new(id: ClientId, clean_session: bool) -> Self {
        Self { id, clean_session, subscriptions: BTreeMap::new(), will: None, principal: None }
    }
}
