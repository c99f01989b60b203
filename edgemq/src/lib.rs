#![deny(unsafe_code)]

//! # edgemq
//!
//! The core of an MQTT 3.1/3.1.1 broker: sessions, topic routing, durable QoS1 delivery,
//! retained messages and access control. Transports and storage engines plug in through
//! the [`connection::Connection`] and [`store::Storage`] traits.
//!
//! ```rust,no_run
//! use edgemq::conf::Settings;
//! use edgemq::connection::pair;
//! use edgemq::store;
//! use edgemq::{Context, Result, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::new(Default::default())?;
//!     let storage = store::open(&settings.storage)?;
//!     let ctx = Context::with_static_acl(settings, storage);
//!     let manager = SessionManager::start(ctx).await?;
//!
//!     let (conn, _client) = pair("local");
//!     let m = manager.clone();
//!     tokio::spawn(async move { m.handle(conn).await });
//!
//!     manager.shutdown().await
//! }
//! ```

pub mod acl;
pub mod connection;
pub mod context;
pub mod delivery;
pub mod error;
pub mod event;
pub mod exchange;
mod handler;
pub mod inflight;
pub mod logger;
pub mod manager;
pub mod queue;
pub mod retain;
pub mod session;
pub mod stats;
pub mod store;
pub mod topic;
pub mod trie;
pub mod types;

pub use edgemq_conf as conf;
pub use edgemq_utils as utils;

pub use context::Context;
pub use error::{Error, MqttError, Result};
pub use manager::SessionManager;
pub use session::Session;
pub use types::*;
