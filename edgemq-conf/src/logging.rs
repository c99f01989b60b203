//! The `[log]` section.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

/// Log destination and threshold. Missing keys take the defaults of [`Log::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    /// Created at startup when logging to a file.
    pub dir: PathBuf,
    /// File name inside `dir`, empty for no log file.
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: To::Console,
            level: Level(slog::Level::Info),
            dir: PathBuf::from("/var/log/edgemq"),
            file: "edgemq.log".into(),
        }
    }
}

impl Log {
    /// Where file output goes, `None` when `file` is empty.
    #[inline]
    pub fn path(&self) -> Option<PathBuf> {
        (!self.file.is_empty()).then(|| self.dir.join(&self.file))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            _ => Err(format!("unknown log target `{}`, expected off, file, console or both", s)),
        }
    }
}

impl TryFrom<String> for To {
    type Error = String;

    #[inline]
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A `slog::Level` read from names such as `debug` or `warn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&s).map(Level).map_err(|_| format!("unknown log level `{}`", s))
    }
}
