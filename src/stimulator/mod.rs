//! Stimulator capability consumed by the stimulation arbiter.
//!
//! The concrete device driver is not part of this crate. Anything that can
//! start a set of channels, stop output and report whether the hardware is
//! armed implements [`Stimulator`]; [`DryRunStimulator`] stands in when no
//! device is linked.

pub mod dry_run;
pub mod program;

pub use dry_run::DryRunStimulator;
pub use program::{build_program, ChannelProgram, ProgramError, StimMode};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Control surface of an electrical stimulator.
pub trait Stimulator {
    /// Start stimulating on `channels`.
    fn start(&mut self, channels: &ChannelSet) -> Result<(), StimulatorError>;

    /// Stop all stimulation output.
    fn stop(&mut self) -> Result<(), StimulatorError>;

    /// Whether the hardware is connected and armed for closed-loop use.
    fn is_active(&self) -> bool;
}

impl<S: Stimulator + ?Sized> Stimulator for Box<S> {
    fn start(&mut self, channels: &ChannelSet) -> Result<(), StimulatorError> {
        (**self).start(channels)
    }

    fn stop(&mut self) -> Result<(), StimulatorError> {
        (**self).stop()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }
}

/// Ordered set of stimulator channel numbers driven together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSet(Vec<u8>);

impl ChannelSet {
    pub fn new(channels: impl Into<Vec<u8>>) -> Self {
        Self(channels.into())
    }

    pub fn contains(&self, channel: u8) -> bool {
        self.0.contains(&channel)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when a channel number appears more than once.
    pub fn has_duplicates(&self) -> bool {
        self.0
            .iter()
            .enumerate()
            .any(|(i, c)| self.0[i + 1..].contains(c))
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// A start or stop call on the stimulator failed.
#[derive(Debug, Error)]
pub enum StimulatorError {
    #[error("stimulator is not initialized")]
    NotInitialized,

    #[error("no stimulation program configured for channel {0}")]
    UnknownChannel(u8),

    #[error("device error: {0}")]
    Device(String),
}
