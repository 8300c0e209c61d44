//! Configuration for the closed-loop stimulation agent.

use crate::core::arbiter::ArbiterConfig;
use crate::stimulator::{ChannelProgram, ChannelSet, ProgramError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Force-plate server connection
    pub transport: TransportConfig,

    /// Polls per second
    pub read_frequency_hz: f64,

    /// Vertical force (N) whose upward crossing marks a new gait cycle
    pub vertical_force_threshold: f64,

    /// Number of force plates in each frame
    pub plate_count: usize,

    /// Plate whose vertical force drives cycle detection
    pub reference_plate: usize,

    /// Stimulation channels driven for each plate
    pub channel_groups: Vec<ChannelGroup>,

    /// Stimulation start/stop limits
    pub arbiter: ArbiterConfig,

    /// Fetch retry policy
    pub retry: RetryConfig,

    /// Per-channel stimulation parameters
    pub stimulation: Vec<ChannelProgram>,

    /// Whether the stimulator starts armed
    pub stimulator_armed: bool,

    /// Path for persisted loop statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gait-stim-agent");

        Self {
            transport: TransportConfig::default(),
            read_frequency_hz: 100.0,
            vertical_force_threshold: 30.0,
            plate_count: 2,
            reference_plate: 1,
            channel_groups: vec![
                ChannelGroup::new(1, vec![1, 2, 3, 4]),
                ChannelGroup::new(2, vec![5, 6, 7, 8]),
            ],
            arbiter: ArbiterConfig::default(),
            retry: RetryConfig::default(),
            stimulation: Vec::new(),
            stimulator_armed: false,
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from `path`; a missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_path())
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gait-stim-agent")
            .join("config.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|source| ConfigError::Io {
            path: self.data_path.clone(),
            source,
        })
    }

    /// Target duration of one loop iteration.
    pub fn tick_period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.read_frequency_hz).unwrap_or(Duration::MAX)
    }

    /// Channel group bound to `plate`.
    pub fn group_for_plate(&self, plate: usize) -> Option<&ChannelGroup> {
        self.channel_groups.iter().find(|g| g.plate == plate)
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !self.read_frequency_hz.is_finite() || self.read_frequency_hz <= 0.0 {
            return invalid(format!(
                "read frequency must be positive, got {}",
                self.read_frequency_hz
            ));
        }
        if Duration::try_from_secs_f64(1.0 / self.read_frequency_hz).is_err() {
            return invalid(format!(
                "read frequency {} Hz gives an unrepresentable tick period",
                self.read_frequency_hz
            ));
        }
        if !self.vertical_force_threshold.is_finite() {
            return invalid("vertical force threshold must be finite".into());
        }
        if self.plate_count == 0 {
            return invalid("plate count must be at least 1".into());
        }
        if !(1..=self.plate_count).contains(&self.reference_plate) {
            return invalid(format!(
                "reference plate {} outside 1..={}",
                self.reference_plate, self.plate_count
            ));
        }

        for (i, group) in self.channel_groups.iter().enumerate() {
            if !(1..=self.plate_count).contains(&group.plate) {
                return invalid(format!(
                    "channel group for plate {} outside 1..={}",
                    group.plate, self.plate_count
                ));
            }
            if self.channel_groups[..i].iter().any(|g| g.plate == group.plate) {
                return invalid(format!("plate {} has more than one channel group", group.plate));
            }
            if group.channels.is_empty() || group.channels.has_duplicates() {
                return invalid(format!(
                    "plate {} channel set {} must be non-empty without duplicates",
                    group.plate, group.channels
                ));
            }
        }

        if self.retry.attempts == 0 {
            return invalid("retry attempts must be at least 1".into());
        }
        if self.arbiter.min_stimulation > self.arbiter.max_stimulation {
            return invalid(format!(
                "minimum stimulation {:?} exceeds maximum {:?}",
                self.arbiter.min_stimulation, self.arbiter.max_stimulation
            ));
        }

        for program in &self.stimulation {
            program.validate()?;
        }
        if !self.stimulation.is_empty() {
            for group in &self.channel_groups {
                if let Some(&channel) = group
                    .channels
                    .as_slice()
                    .iter()
                    .find(|&&c| !self.stimulation.iter().any(|p| p.channel == c))
                {
                    return invalid(format!(
                        "channel {channel} of plate {} has no stimulation program",
                        group.plate
                    ));
                }
            }
        }

        let budget = self.retry.budget();
        if budget >= self.tick_period() {
            tracing::warn!(
                budget_ms = budget.as_millis() as u64,
                period_ms = self.tick_period().as_millis() as u64,
                "fetch retry budget is not shorter than the tick period"
            );
        }

        Ok(())
    }
}

/// Address of the force-plate server and the channels requested from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Channel keys requested on every poll
    pub command: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50000,
            command: vec![crate::transport::FORCE_KEY.to_string()],
        }
    }
}

impl TransportConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Stimulation channels bound to one plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub plate: usize,
    pub channels: ChannelSet,
}

impl ChannelGroup {
    pub fn new(plate: usize, channels: impl Into<Vec<u8>>) -> Self {
        Self {
            plate,
            channels: ChannelSet::new(channels),
        }
    }
}

/// Bounded retry of a failed fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total fetch attempts per tick
    pub attempts: u32,
    /// Pause between attempts
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(2),
        }
    }
}

impl RetryConfig {
    /// Worst-case time spent waiting between attempts in one tick.
    pub fn budget(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid stimulation program: {0}")]
    Program(#[from] ProgramError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
