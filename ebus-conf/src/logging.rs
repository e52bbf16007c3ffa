//! `[log]` section of the bus configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// Where log records are written and from which level on.
///
/// ```toml
/// [log]
/// to = "both"
/// level = "debug"
/// dir = "/var/log/ebus"
/// file = "ebus.log"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { to: To::Console, level: Level::default(), dir: "/var/log/ebus".into(), file: "ebus.log".into() }
    }
}

impl Log {
    /// Log file location, `None` when no file name is configured. An empty
    /// `dir` leaves `file` relative to the working directory.
    pub fn path(&self) -> Option<PathBuf> {
        if self.file.is_empty() {
            None
        } else if self.dir.is_empty() {
            Some(PathBuf::from(&self.file))
        } else {
            Some(Path::new(&self.dir).join(&self.file))
        }
    }

    /// The destination the logger should use. File output without a file name
    /// goes to the console instead.
    pub fn destination(&self) -> To {
        if self.to.file() && self.path().is_none() {
            To::Console
        } else {
            self.to
        }
    }
}

/// Log destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    const NAMES: &'static [&'static str] = &["off", "file", "console", "both"];

    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
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
            _ => Err(format!("unknown log destination {s:?}, expected one of {}", Self::NAMES.join(", "))),
        }
    }
}

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            To::Off => "off",
            To::File => "file",
            To::Console => "console",
            To::Both => "both",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// Minimum severity that reaches the log, `info` unless configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Default for Level {
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        slog::Level::from_str(s).map(Level).map_err(|_| format!("invalid log level {s:?}"))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.as_str().to_ascii_lowercase())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}
