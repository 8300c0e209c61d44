//! Stimulator that logs the programs it would send instead of driving hardware.
//!
//! This exists so the closed loop can run end to end without a device driver.
//! The armed flag is shared so an operator surface can toggle it while the
//! loop thread polls [`Stimulator::is_active`].

use super::program::{build_program, ChannelProgram};
use super::{ChannelSet, Stimulator, StimulatorError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A stimulator without a device behind it.
pub struct DryRunStimulator {
    programs: Vec<ChannelProgram>,
    armed: Arc<AtomicBool>,
    running: Option<ChannelSet>,
    starts: u64,
    stops: u64,
}

impl DryRunStimulator {
    /// Create a dry-run stimulator for the configured channel programs.
    pub fn new(programs: Vec<ChannelProgram>, armed: bool) -> Self {
        Self {
            programs,
            armed: Arc::new(AtomicBool::new(armed)),
            running: None,
            starts: 0,
            stops: 0,
        }
    }

    /// Shared handle to the armed flag.
    pub fn armed_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.armed)
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }

    /// Channels currently being stimulated, if any.
    pub fn running(&self) -> Option<&ChannelSet> {
        self.running.as_ref()
    }

    pub fn start_count(&self) -> u64 {
        self.starts
    }

    pub fn stop_count(&self) -> u64 {
        self.stops
    }
}

impl Stimulator for DryRunStimulator {
    fn start(&mut self, channels: &ChannelSet) -> Result<(), StimulatorError> {
        if !self.is_active() {
            return Err(StimulatorError::NotInitialized);
        }
        if !self.programs.is_empty() {
            if let Some(&missing) = channels
                .as_slice()
                .iter()
                .find(|&&c| !self.programs.iter().any(|p| p.channel == c))
            {
                return Err(StimulatorError::UnknownChannel(missing));
            }
        }

        let program = build_program(&self.programs, channels);
        for setting in &program {
            tracing::debug!(
                channel = setting.channel,
                amplitude_ma = setting.amplitude_ma,
                pulse_width_us = setting.pulse_width_us,
                frequency_hz = setting.frequency_hz,
                mode = ?setting.mode,
                "dry-run channel program"
            );
        }
        tracing::info!(%channels, "dry-run stimulation started");

        self.running = Some(channels.clone());
        self.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StimulatorError> {
        match self.running.take() {
            Some(channels) => tracing::info!(%channels, "dry-run stimulation stopped"),
            None => tracing::debug!("dry-run stop with no stimulation running"),
        }
        self.stops += 1;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}
