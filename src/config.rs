//! Configuration loading using Figment.
//!
//! Settings are merged from:
//! 1. a TOML file (default `shock-hub.toml`, overridable on the CLI)
//! 2. environment variables prefixed with `SHOCK_HUB_`
//!
//! # Example
//! ```no_run
//! use shock_hub::config::Settings;
//!
//! let settings = Settings::load_from("shock-hub.toml")?;
//! println!("Listening on {}", settings.server.listen);
//! # Ok::<(), shock_hub::error::HubError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{HubError, HubResult};
use crate::scheduler::SchedulerSettings;

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP/WebSocket server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Broadcast hub settings
    #[serde(default)]
    pub hub: HubConfig,
    /// Autonomous scheduler defaults (ranges only; scheduling always starts
    /// disabled)
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
            hub: HubConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. "0.0.0.0:3000"
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate for the controller link
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Preferred endpoint path, tried before anything else when present
    #[serde(default)]
    pub preferred_port: Option<String>,
    /// Common default paths tried after the preferred one
    #[serde(default = "default_common_ports")]
    pub common_ports: Vec<String>,
    /// Settle interval after opening an endpoint, before trusting it (ms)
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            preferred_port: None,
            common_ports: default_common_ports(),
            connect_settle_ms: default_connect_settle_ms(),
        }
    }
}

/// Broadcast hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Interval between periodic full-roster re-broadcasts (ms)
    #[serde(default = "default_roster_interval_ms")]
    pub roster_interval_ms: u64,
    /// Interval between per-connection liveness probes (ms)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            roster_interval_ms: default_roster_interval_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

/// Scheduler configuration: the settle delay between power and start, plus
/// the initial draw ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between `SetPower` and `Start` within one cycle (ms)
    #[serde(default = "default_cycle_settle_ms")]
    pub cycle_settle_ms: u64,
    /// Initial draw ranges. `enabled` in here is ignored; the scheduler
    /// always boots disabled
    #[serde(default)]
    pub defaults: SchedulerSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_settle_ms: default_cycle_settle_ms(),
            defaults: SchedulerSettings::default(),
        }
    }
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_common_ports() -> Vec<String> {
    ["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0", "/dev/ttyUSB1"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_connect_settle_ms() -> u64 {
    1000
}

fn default_roster_interval_ms() -> u64 {
    4000
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_cycle_settle_ms() -> u64 {
    100
}

impl Settings {
    /// Load configuration from the default file and environment variables.
    ///
    /// Environment variables override file values with prefix `SHOCK_HUB_`,
    /// e.g. `SHOCK_HUB_SERVER_LISTEN=127.0.0.1:8080`.
    pub fn load() -> HubResult<Self> {
        Self::load_from("shock-hub.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HubResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SHOCK_HUB_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> HubResult<()> {
        self.server
            .listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                HubError::Configuration(format!(
                    "Invalid server.listen '{}': {}",
                    self.server.listen, e
                ))
            })?;

        if self.serial.baud_rate == 0 {
            return Err(HubError::Configuration(
                "serial.baud_rate must be non-zero".to_string(),
            ));
        }

        if self.hub.roster_interval_ms == 0 || self.hub.probe_interval_ms == 0 {
            return Err(HubError::Configuration(
                "hub intervals must be non-zero".to_string(),
            ));
        }

        self.scheduler
            .defaults
            .validate()
            .map_err(|e| HubError::Configuration(format!("scheduler.defaults: {e}")))?;

        Ok(())
    }
}
