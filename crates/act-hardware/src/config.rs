//! Actuator configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/actuator.toml`; a missing file means defaults)
//! 2. environment variables prefixed with `ACT_`, sections split on `__`
//!
//! Every field has a default, so an empty file is a complete configuration.
//!
//! # Example
//! ```no_run
//! use act_hardware::config::ActuatorConfig;
//!
//! // ACT_CONNECTION__PORT=/dev/ttyUSB1 overrides [connection] port
//! let config = ActuatorConfig::load()?;
//! println!("baud rate: {}", config.connection.baud_rate);
//! # Ok::<(), act_core::ActError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use act_core::{ActError, ActResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::drivers::modbus_frame::{encode_hex, validate_crc};
use crate::port_resolver;
use crate::transport::FrameTiming;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/actuator.toml";

/// Top-level actuator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Serial endpoint and discovery settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Protocol delays and read windows
    #[serde(default)]
    pub timing: TimingConfig,
    /// Motion limits and defaults
    #[serde(default)]
    pub motion: MotionConfig,
    /// Opaque device command tables
    #[serde(default)]
    pub commands: CommandTable,
}

/// Serial endpoint and discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred endpoint; the platform default is used when absent
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate (the line is always 8-N-1, no flow control)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Deadline for a complete response frame
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Pause after a failed candidate during the scan
    #[serde(default = "default_scan_settle_ms")]
    pub scan_settle_ms: u64,
    /// Explicit scan list replacing the platform list
    #[serde(default)]
    pub candidates: Option<Vec<String>>,
}

/// Protocol delays and read windows, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause after each command of a multi-frame exchange
    #[serde(default = "default_inter_frame_delay_ms")]
    pub inter_frame_delay_ms: u64,
    /// Pause between a request and reading its response
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    /// Quiet window that ends a drain
    #[serde(default = "default_drain_window_ms")]
    pub drain_window_ms: u64,
    /// Bounded read length inside a drain
    #[serde(default = "default_drain_slice_ms")]
    pub drain_slice_ms: u64,
    /// Acknowledgement read after a move
    #[serde(default = "default_ack_window_ms")]
    pub ack_window_ms: u64,
    /// Acknowledgement read after a reset
    #[serde(default = "default_reset_ack_window_ms")]
    pub reset_ack_window_ms: u64,
    /// Position poll interval of the blocking moves
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Motion limits and defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Upper speed clamp for relative moves (absolute moves have none)
    #[serde(default = "default_max_relative_speed")]
    pub max_relative_speed: i32,
    /// Speed used when the caller gives none
    #[serde(default = "default_speed")]
    pub default_speed: i32,
    /// Settle tolerance used when the caller gives none
    #[serde(default = "default_tolerance")]
    pub default_tolerance: u32,
    /// Settle deadline used when the caller gives none
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

/// Device command tables as hex literals.
///
/// These frames are sent verbatim. Their meaning is device trivia; only their
/// order and CRC validity matter here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTable {
    /// Position probe, also used to test candidate endpoints
    pub probe: String,
    /// Sent in order after a successful probe
    pub init: Vec<String>,
    /// Sent in order by `reset`
    pub reset: Vec<String>,
    /// Sent in order after the absolute speed and target writes
    pub absolute_tail: Vec<String>,
    /// Starts a relative move
    pub trigger: String,
    /// Sent after the trigger of a negative relative move
    pub negative_ack: String,
}

/// Decoded command tables, ready to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrames {
    /// Position probe
    pub probe: Vec<u8>,
    /// Initialization sequence
    pub init: Vec<Vec<u8>>,
    /// Reset sequence
    pub reset: Vec<Vec<u8>>,
    /// Absolute-move tail sequence
    pub absolute_tail: Vec<Vec<u8>>,
    /// Relative-move trigger
    pub trigger: Vec<u8>,
    /// Negative relative-move tail
    pub negative_ack: Vec<u8>,
}

// Default value functions
fn default_baud_rate() -> u32 {
    38_400
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_scan_settle_ms() -> u64 {
    50
}

fn default_inter_frame_delay_ms() -> u64 {
    100
}

fn default_probe_delay_ms() -> u64 {
    50
}

fn default_drain_window_ms() -> u64 {
    60
}

fn default_drain_slice_ms() -> u64 {
    20
}

fn default_ack_window_ms() -> u64 {
    300
}

fn default_reset_ack_window_ms() -> u64 {
    150
}

fn default_poll_interval_ms() -> u64 {
    120
}

fn default_max_relative_speed() -> i32 {
    30
}

fn default_speed() -> i32 {
    10
}

fn default_tolerance() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            response_timeout_ms: default_response_timeout_ms(),
            scan_settle_ms: default_scan_settle_ms(),
            candidates: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            inter_frame_delay_ms: default_inter_frame_delay_ms(),
            probe_delay_ms: default_probe_delay_ms(),
            drain_window_ms: default_drain_window_ms(),
            drain_slice_ms: default_drain_slice_ms(),
            ack_window_ms: default_ack_window_ms(),
            reset_ack_window_ms: default_reset_ack_window_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_relative_speed: default_max_relative_speed(),
            default_speed: default_speed(),
            default_tolerance: default_tolerance(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

fn literals(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            probe: "01 03 90 00 00 10 69 06".to_string(),
            init: literals(&[
                "01 03 00 0e 00 08 25 cf",
                "01 03 00 52 00 02 65 da",
                "01 03 00 00 00 70 44 2e",
                "01 03 00 70 00 70 45 f5",
                "01 03 00 e0 00 70 45 d8",
                "01 03 01 50 00 30 44 33",
                "01 03 03 80 00 40 45 96",
                "01 03 04 00 00 70 45 1e",
                "01 03 04 70 00 70 44 c5",
                "01 03 04 e0 00 70 44 e8",
                "01 03 05 50 00 70 44 f3",
                "01 03 05 c0 00 70 44 de",
                "01 03 06 30 00 70 44 a9",
                "01 03 06 a0 00 70 44 84",
                "01 03 07 10 00 70 44 9f",
                "01 03 07 80 00 70 44 b2",
                "01 03 07 f0 00 10 45 41",
                "01 03 90 11 00 02 b9 0e",
                "01 05 00 30 ff 00 8c 35",
                "01 05 00 19 ff 00 5d fd",
            ]),
            reset: literals(&[
                "01 03 03 80 00 40 45 96",
                "01 05 00 45 ff 00 9d ef",
                "01 05 00 1c ff 00 4d fc",
                "01 05 00 1c 00 00 0c 0c",
            ]),
            absolute_tail: literals(&[
                "01 05 00 1a 00 00 ec 0d",
                "01 0f 00 10 00 08 01 01 fe 96",
                "01 05 00 1a ff 00 ad fd",
                "01 05 00 1a 00 00 ec 0d",
            ]),
            trigger: "01 10 91 00 00 01 02 01 00 27 09".to_string(),
            negative_ack: "01 05 00 1a 00 00 ec 0d".to_string(),
        }
    }
}

fn decode(name: &str, literal: &str) -> ActResult<Vec<u8>> {
    let frame = encode_hex(literal);
    if frame.len() < 4 {
        return Err(ActError::Configuration(format!(
            "command '{}' decodes to {} bytes, need at least 4: {:?}",
            name,
            frame.len(),
            literal
        )));
    }
    if !validate_crc(&frame) {
        return Err(ActError::Configuration(format!(
            "command '{}' has an invalid CRC: {:?}",
            name, literal
        )));
    }
    Ok(frame)
}

fn decode_all(name: &str, literals: &[String]) -> ActResult<Vec<Vec<u8>>> {
    literals
        .iter()
        .enumerate()
        .map(|(i, literal)| decode(&format!("{name}[{i}]"), literal))
        .collect()
}

impl CommandTable {
    /// Decode and CRC-check every literal.
    pub fn frames(&self) -> ActResult<CommandFrames> {
        Ok(CommandFrames {
            probe: decode("probe", &self.probe)?,
            init: decode_all("init", &self.init)?,
            reset: decode_all("reset", &self.reset)?,
            absolute_tail: decode_all("absolute_tail", &self.absolute_tail)?,
            trigger: decode("trigger", &self.trigger)?,
            negative_ack: decode("negative_ack", &self.negative_ack)?,
        })
    }
}

impl ActuatorConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> ActResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ActResult<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ACT_").split("__"));
        Self::from_figment(figment)
    }

    /// Extract from an arbitrary figment, then validate.
    pub fn from_figment(figment: Figment) -> ActResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> ActResult<()> {
        if self.connection.baud_rate == 0 {
            return Err(ActError::Configuration(
                "connection.baud_rate must be non-zero".to_string(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ActError::Configuration(
                "timing.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.timing.drain_slice_ms == 0 {
            return Err(ActError::Configuration(
                "timing.drain_slice_ms must be non-zero".to_string(),
            ));
        }
        if self.motion.max_relative_speed < 1 {
            return Err(ActError::Configuration(format!(
                "motion.max_relative_speed {} must be at least 1",
                self.motion.max_relative_speed
            )));
        }
        if let Some(candidates) = &self.connection.candidates {
            if candidates.is_empty() {
                return Err(ActError::Configuration(
                    "connection.candidates must not be empty when set".to_string(),
                ));
            }
        }
        self.commands.frames()?;
        Ok(())
    }

    /// Render as TOML, e.g. to show the effective configuration after env overrides.
    pub fn to_toml_string(&self) -> ActResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ActError::Configuration(format!("cannot render configuration: {e}")))
    }

    /// Transport timing derived from this configuration.
    pub fn frame_timing(&self) -> FrameTiming {
        FrameTiming {
            inter_frame_delay: Duration::from_millis(self.timing.inter_frame_delay_ms),
            probe_delay: Duration::from_millis(self.timing.probe_delay_ms),
            response_timeout: Duration::from_millis(self.connection.response_timeout_ms),
            drain_window: Duration::from_millis(self.timing.drain_window_ms),
            drain_slice: Duration::from_millis(self.timing.drain_slice_ms),
        }
    }

    /// Scan list: the configured candidates, or the platform list.
    pub fn candidates(&self) -> Vec<String> {
        match &self.connection.candidates {
            Some(list) => list.clone(),
            None => port_resolver::candidate_ports(),
        }
    }
}
