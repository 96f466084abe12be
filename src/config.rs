use crate::csc::SummaryState;
use crate::labjack::{LabJackChannel, DEFAULT_MODBUS_PORT};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Annotated default configuration, printed by `run_mtreflector --print-config`.
///
/// Kept in sync with the `Default` impl by a test below.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"[labjack]
# LabJack model (T4 or T7)
device_type = "T4"
# Connection type (TCP or WIFI)
connection_type = "TCP"
# Host name or IP address of the LabJack (required outside simulation mode)
identifier = ""
# Modbus TCP port
port = 502
# Channel asserted to open the reflector
open_channel = "CIO0"
# Channel asserted to close the reflector
close_channel = "CIO1"
# Time limit for communicating with the LabJack (seconds)
communication_timeout_secs = 5

[csc]
# Initial summary state: standby, disabled or enabled
# Real deployments start in standby; the other values exist for testing
initial_state = "standby"

[system]
# Event bus capacity
event_bus_capacity = 100
# Command channel capacity
command_channel_capacity = 16
"#;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MtReflectorConfig {
    pub labjack: LabJackConfig,
    pub csc: CscConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LabJackConfig {
    /// LabJack model (T4 or T7)
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Connection type (TCP or WIFI)
    #[serde(default = "default_connection_type")]
    pub connection_type: String,

    /// Host name or IP address of the LabJack
    #[serde(default)]
    pub identifier: String,

    /// Modbus TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Channel asserted to open the reflector
    #[serde(default = "default_open_channel")]
    pub open_channel: String,

    /// Channel asserted to close the reflector
    #[serde(default = "default_close_channel")]
    pub close_channel: String,

    /// Time limit for communicating with the LabJack (seconds)
    #[serde(default = "default_communication_timeout")]
    pub communication_timeout_secs: u64,
}

impl LabJackConfig {
    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.communication_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CscConfig {
    /// Initial summary state (standby, disabled or enabled).
    ///
    /// Real deployments start in standby; the other values exist for
    /// testing.
    #[serde(default = "default_initial_state")]
    pub initial_state: String,
}

impl CscConfig {
    /// Parse the configured initial summary state
    pub fn initial_summary_state(&self) -> Result<SummaryState, ConfigError> {
        self.initial_state
            .parse()
            .map_err(ConfigError::Message)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Command channel capacity
    #[serde(default = "default_command_channel_capacity")]
    pub command_channel_capacity: usize,
}

impl MtReflectorConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("mtreflector.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// The file is optional: defaults apply when it does not exist, and
    /// MTREFLECTOR_-prefixed environment variables override both.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("labjack.device_type", default_device_type())?
            .set_default("labjack.connection_type", default_connection_type())?
            .set_default("labjack.identifier", "")?
            .set_default("labjack.port", default_port() as i64)?
            .set_default("labjack.open_channel", default_open_channel())?
            .set_default("labjack.close_channel", default_close_channel())?
            .set_default(
                "labjack.communication_timeout_secs",
                default_communication_timeout() as i64,
            )?
            .set_default("csc.initial_state", default_initial_state())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "system.command_channel_capacity",
                default_command_channel_capacity() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("MTREFLECTOR").separator("__"))
            .build()?;

        let config: MtReflectorConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.labjack.device_type.as_str() {
            "T4" | "T7" => {}
            other => {
                return Err(ConfigError::Message(format!(
                    "Unknown LabJack device type: {}",
                    other
                )));
            }
        }

        match self.labjack.connection_type.as_str() {
            "TCP" | "WIFI" => {}
            "USB" => {
                return Err(ConfigError::Message(
                    "USB connections are not supported; use TCP or WIFI".to_string(),
                ));
            }
            other => {
                return Err(ConfigError::Message(format!(
                    "Unknown connection type: {}",
                    other
                )));
            }
        }

        if LabJackChannel::parse(&self.labjack.open_channel).is_err() {
            return Err(ConfigError::Message(format!(
                "Invalid open channel: {}",
                self.labjack.open_channel
            )));
        }

        if LabJackChannel::parse(&self.labjack.close_channel).is_err() {
            return Err(ConfigError::Message(format!(
                "Invalid close channel: {}",
                self.labjack.close_channel
            )));
        }

        if self.labjack.open_channel == self.labjack.close_channel {
            return Err(ConfigError::Message(
                "Open and close channels must differ".to_string(),
            ));
        }

        if self.labjack.communication_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Communication timeout must be greater than 0".to_string(),
            ));
        }

        let initial_state = self.csc.initial_summary_state()?;
        if !matches!(
            initial_state,
            SummaryState::Standby | SummaryState::Disabled | SummaryState::Enabled
        ) {
            return Err(ConfigError::Message(format!(
                "Initial state must be standby, disabled or enabled, not {}",
                initial_state
            )));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        if self.system.command_channel_capacity == 0 {
            return Err(ConfigError::Message(
                "Command channel capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Additional checks that only apply when driving real hardware
    pub fn validate_for_hardware(&self) -> Result<(), ConfigError> {
        if self.labjack.identifier.is_empty() {
            return Err(ConfigError::Message(
                "A LabJack identifier (host name or IP) is required outside simulation mode"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MtReflectorConfig {
    fn default() -> Self {
        Self {
            labjack: LabJackConfig {
                device_type: default_device_type(),
                connection_type: default_connection_type(),
                identifier: String::new(),
                port: default_port(),
                open_channel: default_open_channel(),
                close_channel: default_close_channel(),
                communication_timeout_secs: default_communication_timeout(),
            },
            csc: CscConfig {
                initial_state: default_initial_state(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                command_channel_capacity: default_command_channel_capacity(),
            },
        }
    }
}

// Default value functions
fn default_device_type() -> String {
    "T4".to_string()
}
fn default_connection_type() -> String {
    "TCP".to_string()
}
fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}
fn default_open_channel() -> String {
    "CIO0".to_string()
}
fn default_close_channel() -> String {
    "CIO1".to_string()
}
fn default_communication_timeout() -> u64 {
    5
}

fn default_initial_state() -> String {
    "standby".to_string()
}

fn default_event_bus_capacity() -> usize {
    100
}
fn default_command_channel_capacity() -> usize {
    16
}
