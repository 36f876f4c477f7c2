//! Controller configuration – reads/writes `~/.relaybank/config.toml`.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use relaybank_hal::{ChannelRegistry, DEFAULT_GPIO_ROOT, default_bank};
use relaybank_types::Channel;
use serde::{Deserialize, Serialize};

/// Which line driver backs the relay bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-process simulator; no hardware needed.
    #[default]
    Sim,
    /// Linux sysfs GPIO (`/sys/class/gpio`).
    Sysfs,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Sim => write!(f, "sim"),
            DriverKind::Sysfs => write!(f, "sysfs"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" => Ok(DriverKind::Sim),
            "sysfs" => Ok(DriverKind::Sysfs),
            other => Err(format!("unknown driver '{other}'; use sim or sysfs")),
        }
    }
}

/// Persisted controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// HTTP port for the control API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default)]
    pub driver: DriverKind,

    /// sysfs GPIO root, used by the `sysfs` driver only.
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,

    /// Dead time between releasing one source and engaging the next.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// The relay bank wiring.
    #[serde(default = "default_bank")]
    pub channels: Vec<Channel>,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_http_port() -> u16 {
    8080
}
fn default_gpio_root() -> PathBuf {
    PathBuf::from(DEFAULT_GPIO_ROOT)
}
fn default_settle_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            http_port: default_http_port(),
            driver: DriverKind::default(),
            gpio_root: default_gpio_root(),
            settle_ms: default_settle_ms(),
            channels: default_bank(),
        }
    }
}

impl Config {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Check the values a TOML parse cannot.
    pub fn validate(&self) -> Result<(), String> {
        if self.settle_ms == 0 {
            return Err("settle_ms must be greater than zero".to_string());
        }
        self.registry().map(|_| ())
    }

    /// Build the channel registry described by `channels`.
    pub fn registry(&self) -> Result<ChannelRegistry, String> {
        ChannelRegistry::new(self.channels.clone()).map_err(|e| e.to_string())
    }
}

/// Return the config path: `$RELAYBANK_CONFIG`, else `~/.relaybank/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RELAYBANK_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".relaybank").join("config.toml")
}

/// Load the config, falling back to defaults when no file exists, then
/// apply environment overrides and validate.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `RELAYBANK_*` environment variable overrides to `cfg`.  Values
/// that do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `RELAYBANK_HTTP_PORT` | `http_port` |
/// | `RELAYBANK_DRIVER` | `driver` |
/// | `RELAYBANK_SETTLE_MS` | `settle_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("RELAYBANK_HTTP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.http_port = port;
    }
    if let Ok(v) = std::env::var("RELAYBANK_DRIVER")
        && let Ok(driver) = v.parse::<DriverKind>()
    {
        cfg.driver = driver;
    }
    if let Ok(v) = std::env::var("RELAYBANK_SETTLE_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.settle_ms = ms;
    }
}

/// Save the config to disk, creating the parent directory if necessary.
pub fn save(cfg: &Config) -> Result<PathBuf, String> {
    let path = config_path();
    save_to(cfg, &path)?;
    Ok(path)
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner read/write only (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
