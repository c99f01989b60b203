use std::num::NonZeroU16;

use crate::topic::TopicError;
use crate::types::{ConnectAckReason, QoS};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MqttError {
    #[error("invalid protocol, {0}")]
    InvalidProtocol(String),
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolVersion(u8),
    #[error("unexpected packet {0}")]
    UnexpectedPacket(&'static str),
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("bad username or password")]
    BadUserNameOrPassword,
    #[error("not authorized")]
    NotAuthorized,
    #[error("unsupported QoS {0:?}")]
    QoSNotSupported(QoS),
    #[error("payload too large, {0} bytes")]
    PayloadTooLarge(usize),
    #[error("topic error, {0}")]
    Topic(#[from] TopicError),
    #[error("too many subscriptions")]
    TooManySubscriptions,
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("keepalive timeout")]
    KeepaliveTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("queue closed")]
    QueueClosed,
    #[error("connection taken over by a new connection")]
    Kicked,
    #[error("provided packet id {0} is not in flight")]
    PacketIdNotFound(NonZeroU16),
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl MqttError {
    /// Negative CONNACK code for errors raised while handling CONNECT.
    #[inline]
    pub fn to_connect_ack_reason(&self) -> Option<ConnectAckReason> {
        match self {
            MqttError::UnsupportedProtocolVersion(_) => Some(ConnectAckReason::UnacceptableProtocolVersion),
            MqttError::IdentifierRejected => Some(ConnectAckReason::IdentifierRejected),
            MqttError::BadUserNameOrPassword => Some(ConnectAckReason::BadUserNameOrPassword),
            MqttError::NotAuthorized | MqttError::Topic(_) | MqttError::QoSNotSupported(_) => {
                Some(ConnectAckReason::NotAuthorized)
            }
            MqttError::ServiceUnavailable => Some(ConnectAckReason::ServiceUnavailable),
            _ => None,
        }
    }
}
