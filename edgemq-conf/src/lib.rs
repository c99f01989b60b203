#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

pub use self::acl::{Account, Acl, Certificate, Permissions};
pub use self::logging::{Level, Log, To};
pub use self::mqtt::{Mqtt, Overflow};
pub use self::storage::{StorageConfig, StorageType};

pub mod acl;
pub mod logging;
pub mod mqtt;
pub mod storage;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, loaded last so it overrides the default locations.
    pub cfg_name: Option<String>,
}

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub acl: Acl,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/edgemq/edgemq").required(false))
            .add_source(File::with_name("edgemq").required(false))
            .add_source(
                config::Environment::with_prefix("edgemq")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("mqtt.system_topic_prefixes"),
            );

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        inner.check()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    /// Parses settings from TOML text, without consulting files or the environment.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut inner: Inner = Config::builder()
            .add_source(File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        inner.check()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("log config is {:?}, file: {:?}", self.log.to, self.log.path());
        log::info!("max_inflight is {}", self.mqtt.max_inflight);
        log::info!("retry_interval is {:?}", self.mqtt.retry_interval);
        log::info!("storage is {:?} at {:?}", self.storage.typ, self.storage.path);
        log::info!("system_topic_prefixes is {:?}", self.mqtt.system_topic_prefixes);
        log::info!(
            "acl: allow_anonymous is {}, accounts: {}, certificates: {}",
            self.acl.allow_anonymous,
            self.acl.accounts.len(),
            self.acl.certificates.len()
        );
    }
}

impl Inner {
    fn check(&self) -> Result<()> {
        if self.mqtt.max_inflight == 0 {
            return Err(anyhow!("mqtt.max_inflight must be greater than 0"));
        }
        if self.mqtt.max_qos0_queue == 0 {
            return Err(anyhow!("mqtt.max_qos0_queue must be greater than 0"));
        }
        if let Some(p) = self.mqtt.system_topic_prefixes.iter().find(|p| p.is_empty() || p.contains(['/', '+', '#']))
        {
            return Err(anyhow!("invalid system topic prefix `{}`", p));
        }
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.mqtt.max_inflight, 64);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(20));
        assert_eq!(s.mqtt.write_batch_interval, Duration::from_millis(100));
        assert_eq!(s.mqtt.delete_batch_interval, Duration::from_millis(500));
        assert_eq!(s.mqtt.max_payload_size.as_usize(), 1024 * 1024);
        assert_eq!(s.mqtt.qos0_overflow, Overflow::Early);
        assert!(s.mqtt.system_topic_prefixes.contains(&"$link".to_string()));
        assert!(!s.acl.allow_anonymous);
        assert_eq!(s.log.to, To::Console);
        assert_eq!(s.storage.typ, StorageType::Sled);
        assert_eq!(s.storage.cache_capacity.as_usize(), 64 * 1024 * 1024);
    }

    #[test]
    fn test_from_toml() {
        let s = Settings::from_toml(
            r##"
            [log]
            to = "off"
            level = "debug"

            [mqtt]
            max_inflight = 8
            retry_interval = "2s"
            write_batch_interval = "10ms"
            qos0_overflow = "current"
            max_payload_size = "64K"
            system_topic_prefixes = ["$link"]

            [storage]
            type = "ram"
            path = "/tmp/edgemq"
            flush_interval = "1s"

            [acl]
            allow_anonymous = true
            anonymous = { subscribe = ["public/#"] }

            [[acl.accounts]]
            username = "dev1"
            password = "secret"
            publish = ["devices/dev1/#"]
            subscribe = ["devices/dev1/+/cmd"]

            [[acl.certificates]]
            common_name = "gateway"
            superuser = true
            "##,
        )
        .unwrap();

        assert!(s.log.to.off());
        assert_eq!(s.log.level.inner(), slog::Level::Debug);
        assert_eq!(s.mqtt.max_inflight, 8);
        assert_eq!(s.mqtt.retry_interval, Duration::from_secs(2));
        assert_eq!(s.mqtt.write_batch_interval, Duration::from_millis(10));
        assert_eq!(s.mqtt.qos0_overflow, Overflow::Current);
        assert_eq!(s.mqtt.max_payload_size.as_usize(), 65536);
        assert_eq!(s.mqtt.system_topic_prefixes, vec!["$link".to_string()]);
        assert_eq!(s.mqtt.max_topic_levels, 9);
        assert_eq!(s.storage.typ, StorageType::Ram);
        assert_eq!(s.storage.path, std::path::PathBuf::from("/tmp/edgemq"));
        assert_eq!(s.storage.flush_interval, Duration::from_secs(1));
        assert!(s.acl.allow_anonymous);
        assert_eq!(s.acl.anonymous.subscribe, vec!["public/#".to_string()]);
        assert_eq!(s.acl.accounts[0].username, "dev1");
        assert_eq!(s.acl.accounts[0].permissions.publish, vec!["devices/dev1/#".to_string()]);
        assert!(s.acl.certificates[0].permissions.superuser);
    }

    #[test]
    fn test_invalid_values() {
        assert!(Settings::from_toml("[mqtt]\nmax_inflight = 0").is_err());
        assert!(Settings::from_toml("[mqtt]\nsystem_topic_prefixes = [\"a/b\"]").is_err());
        assert!(Settings::from_toml("[log]\nto = \"nowhere\"").is_err());
    }

    #[test]
    fn test_keepalive_timeout() {
        let m = Mqtt::default();
        assert_eq!(m.keepalive_timeout(0), None);
        assert_eq!(m.keepalive_timeout(60), Some(Duration::from_secs(80)));
    }
}
