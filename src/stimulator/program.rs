//! Per-channel stimulation programs.
//!
//! Starting a channel group sends a program for every configured channel:
//! channels in the group run at their configured amplitude, all others are
//! held at zero amplitude with their timing parameters unchanged.

use super::ChannelSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_AMPLITUDE_MA: f64 = 100.0;
pub const MAX_PULSE_WIDTH_US: u32 = 1000;
pub const MAX_FREQUENCY_HZ: f64 = 200.0;

/// Pulse pattern emitted per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StimMode {
    #[default]
    Single,
    Doublet,
    Triplet,
}

/// Stimulation parameters for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelProgram {
    pub channel: u8,
    #[serde(default)]
    pub name: String,
    pub amplitude_ma: f64,
    pub pulse_width_us: u32,
    pub frequency_hz: f64,
    #[serde(default)]
    pub mode: StimMode,
}

impl ChannelProgram {
    /// Check parameters against the device limits.
    pub fn validate(&self) -> Result<(), ProgramError> {
        if !(0.0..=MAX_AMPLITUDE_MA).contains(&self.amplitude_ma) {
            return Err(ProgramError::Amplitude {
                channel: self.channel,
                value: self.amplitude_ma,
            });
        }
        if self.pulse_width_us > MAX_PULSE_WIDTH_US {
            return Err(ProgramError::PulseWidth {
                channel: self.channel,
                value: self.pulse_width_us,
            });
        }
        if !(0.0..=MAX_FREQUENCY_HZ).contains(&self.frequency_hz) {
            return Err(ProgramError::Frequency {
                channel: self.channel,
                value: self.frequency_hz,
            });
        }
        Ok(())
    }

    fn silenced(&self) -> Self {
        Self {
            amplitude_ma: 0.0,
            ..self.clone()
        }
    }
}

/// Channel parameters outside the device limits.
#[derive(Debug, Error, PartialEq)]
pub enum ProgramError {
    #[error("channel {channel}: amplitude {value} mA outside 0..={}", MAX_AMPLITUDE_MA)]
    Amplitude { channel: u8, value: f64 },

    #[error("channel {channel}: pulse width {value} us above {}", MAX_PULSE_WIDTH_US)]
    PulseWidth { channel: u8, value: u32 },

    #[error("channel {channel}: frequency {value} Hz outside 0..={}", MAX_FREQUENCY_HZ)]
    Frequency { channel: u8, value: f64 },
}

/// Build the full channel program for starting `selected`.
pub fn build_program(programs: &[ChannelProgram], selected: &ChannelSet) -> Vec<ChannelProgram> {
    programs
        .iter()
        .map(|p| {
            if selected.contains(p.channel) {
                p.clone()
            } else {
                p.silenced()
            }
        })
        .collect()
}
