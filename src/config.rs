//! Daemon and client configuration.
//!
//! Values come from an optional `<git-dir>/index-helper.toml`; command-line
//! flags override them. None of these settings change the shared-memory
//! format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IndexHelperError, Result};

pub const CONFIG_FILE_NAME: &str = "index-helper.toml";
pub const DEFAULT_NAMESPACE: &str = "git-";

/// How long the daemon may sit without events before exiting.
/// `None` means it never times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawIdle", into = "String")]
pub struct IdleTimeout(Option<Duration>);

impl IdleTimeout {
    pub const UNBOUNDED: IdleTimeout = IdleTimeout(None);

    pub fn from_duration(d: Duration) -> Self {
        if d.is_zero() {
            Self::UNBOUNDED
        } else {
            IdleTimeout(Some(d))
        }
    }

    /// Fails when `m` minutes does not fit in a `Duration` of seconds.
    pub fn minutes(m: u64) -> Result<Self> {
        scaled(m, 60, &m.to_string())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }
}

impl Default for IdleTimeout {
    fn default() -> Self {
        IdleTimeout(Some(Duration::from_secs(10 * 60)))
    }
}

/// Accepts `10` (minutes), `"90s"`, `"10m"`, `"2h"`; zero means unbounded.
impl FromStr for IdleTimeout {
    type Err = IndexHelperError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(i) => s.split_at(i),
            None => (s, "m"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| IndexHelperError::Config(format!("invalid idle timeout {:?}", s)))?;
        let scale = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => {
                return Err(IndexHelperError::Config(format!(
                    "invalid idle timeout unit in {:?} (use s, m or h)",
                    s
                )))
            }
        };
        scaled(value, scale, s)
    }
}

fn scaled(value: u64, scale: u64, text: &str) -> Result<IdleTimeout> {
    let secs = value
        .checked_mul(scale)
        .ok_or_else(|| IndexHelperError::Config(format!("idle timeout {:?} is too large", text)))?;
    Ok(IdleTimeout::from_duration(Duration::from_secs(secs)))
}

impl fmt::Display for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("0"),
            Some(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

impl From<IdleTimeout> for String {
    fn from(t: IdleTimeout) -> String {
        t.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdle {
    Minutes(u64),
    Text(String),
}

impl TryFrom<RawIdle> for IdleTimeout {
    type Error = IndexHelperError;

    fn try_from(raw: RawIdle) -> Result<Self> {
        match raw {
            RawIdle::Minutes(m) => IdleTimeout::minutes(m),
            RawIdle::Text(s) => s.parse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Exit after this long without events
    pub exit_after: IdleTimeout,
    /// Re-read every published segment and compare it with its source
    pub strict: bool,
    /// Detach from the terminal after taking the PID file
    pub detach: bool,
    /// Prefix for every shared segment name
    pub namespace: String,
    /// Use filesystem notifications to skip needless refreshes
    pub watch: bool,
    /// How long a client waits for a poke acknowledgement
    pub poke_timeout_ms: u64,
    /// Clients re-hash shared payloads before trusting them
    pub shared_checksum: bool,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            exit_after: IdleTimeout::default(),
            strict: true,
            detach: false,
            namespace: DEFAULT_NAMESPACE.to_string(),
            watch: true,
            poke_timeout_ms: 1000,
            shared_checksum: false,
        }
    }
}

impl HelperConfig {
    pub fn path(git_dir: &Path) -> PathBuf {
        git_dir.join(CONFIG_FILE_NAME)
    }

    /// Load `<git-dir>/index-helper.toml`, or defaults when it is absent.
    pub fn load(git_dir: &Path) -> Result<Self> {
        let path = Self::path(git_dir);
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content)
                .map_err(|e| IndexHelperError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HelperConfig =
            toml::from_str(content).map_err(|e| IndexHelperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::shm::name::validate_namespace(&self.namespace)
    }

    pub fn poke_timeout(&self) -> Duration {
        Duration::from_millis(self.poke_timeout_ms)
    }
}
