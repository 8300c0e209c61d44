//! Start/stop decisions for stimulation, one state machine per channel group.
//!
//! Each group is bound to one plate and is either idle or stimulating. The
//! stimulator runs one program at a time and `stop` silences every channel, so
//! at most one group is stimulating at any moment; a group cannot start while
//! another group's session is running. The
//! decision compares the plate's anterior-posterior force mean for this tick
//! against the same-length window already buffered:
//!
//! - idle to stimulating: AP force rising, below `start_below`, stimulator armed
//! - stimulating to idle: AP force falling, above `stop_above`, and at least
//!   `min_stimulation` elapsed; or `max_stimulation` elapsed regardless of force
//!
//! A state only changes after the stimulator call succeeds. A failed call is
//! logged and reported, and the same decision is re-evaluated next tick.

use crate::config::ChannelGroup;
use crate::core::cycle::WindowMeans;
use crate::stimulator::{ChannelSet, Stimulator, StimulatorError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Force and timing limits of the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// AP force (N) below which a rising trend starts stimulation
    pub start_below: f64,
    /// AP force (N) above which a falling trend may stop stimulation
    pub stop_above: f64,
    /// Minimum stimulation time before a force-based stop
    #[serde(with = "crate::config::duration_ms")]
    pub min_stimulation: Duration,
    /// Hard cap on a stimulation session
    #[serde(with = "crate::config::duration_ms")]
    pub max_stimulation: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            start_below: -20.0,
            stop_above: 10.0,
            min_stimulation: Duration::from_millis(200),
            max_stimulation: Duration::from_millis(500),
        }
    }
}

/// State of one channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimulationState {
    Idle,
    Stimulating { since: Instant },
}

/// Why a stimulation session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Force fell back past the stop limit after the minimum time
    Released,
    /// The session hit `max_stimulation`
    Timeout,
    /// The loop is shutting down
    Shutdown,
}

/// Stimulator call attempted by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

/// Outcome of a decision that invoked the stimulator.
#[derive(Debug)]
pub enum ArbiterEvent {
    Started {
        group: usize,
        plate: usize,
        channels: ChannelSet,
    },
    Stopped {
        group: usize,
        plate: usize,
        reason: StopReason,
        elapsed: Duration,
    },
    Failed {
        group: usize,
        plate: usize,
        action: Action,
        error: StimulatorError,
    },
}

#[derive(Debug, Clone)]
struct GroupState {
    plate: usize,
    channels: ChannelSet,
    state: StimulationState,
}

/// Per-group stimulation state machine.
pub struct StimulationArbiter {
    config: ArbiterConfig,
    groups: Vec<GroupState>,
}

impl StimulationArbiter {
    pub fn new(config: ArbiterConfig, groups: &[ChannelGroup]) -> Self {
        Self {
            config,
            groups: groups
                .iter()
                .map(|g| GroupState {
                    plate: g.plate,
                    channels: g.channels.clone(),
                    state: StimulationState::Idle,
                })
                .collect(),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Index of the group bound to `plate`.
    pub fn group_for_plate(&self, plate: usize) -> Option<usize> {
        self.groups.iter().position(|g| g.plate == plate)
    }

    pub fn state(&self, group: usize) -> Option<StimulationState> {
        self.groups.get(group).map(|g| g.state)
    }

    pub fn is_stimulating(&self, group: usize) -> bool {
        matches!(self.state(group), Some(StimulationState::Stimulating { .. }))
    }

    pub fn any_stimulating(&self) -> bool {
        self.active_group().is_some()
    }

    /// The group whose session currently owns the stimulator.
    pub fn active_group(&self) -> Option<usize> {
        (0..self.groups.len()).find(|&g| self.is_stimulating(g))
    }

    /// Run the state machine for `plate` with this tick's AP force windows.
    ///
    /// Returns `None` when no stimulator call was made.
    pub fn evaluate<S: Stimulator + ?Sized>(
        &mut self,
        plate: usize,
        ap_force: WindowMeans,
        now: Instant,
        stimulator: &mut S,
    ) -> Option<ArbiterEvent> {
        let group = self.group_for_plate(plate)?;
        let delta = ap_force.delta();

        match self.groups[group].state {
            StimulationState::Idle => {
                let rising = delta.map_or(false, |d| d > 0.0);
                if !rising || ap_force.current >= self.config.start_below {
                    return None;
                }
                if let Some(active) = self.active_group() {
                    tracing::debug!(plate, group, active, "stimulator busy with another group");
                    return None;
                }
                if stimulator.is_active() {
                    Some(self.start(group, now, stimulator))
                } else {
                    None
                }
            }
            StimulationState::Stimulating { since } => {
                let elapsed = now.saturating_duration_since(since);
                let falling = delta.map_or(false, |d| d < 0.0);
                let released = falling
                    && ap_force.current > self.config.stop_above
                    && elapsed > self.config.min_stimulation;

                if elapsed > self.config.max_stimulation {
                    Some(self.stop(group, StopReason::Timeout, elapsed, stimulator))
                } else if released {
                    Some(self.stop(group, StopReason::Released, elapsed, stimulator))
                } else {
                    None
                }
            }
        }
    }

    /// Stop every group whose session has outlived `max_stimulation`.
    ///
    /// Used on ticks that carried no usable data, so the hard cap holds even
    /// while the force stream is down.
    pub fn enforce_timeouts<S: Stimulator + ?Sized>(
        &mut self,
        now: Instant,
        stimulator: &mut S,
    ) -> Vec<ArbiterEvent> {
        let mut events = Vec::new();
        for group in 0..self.groups.len() {
            if let StimulationState::Stimulating { since } = self.groups[group].state {
                let elapsed = now.saturating_duration_since(since);
                if elapsed > self.config.max_stimulation {
                    events.push(self.stop(group, StopReason::Timeout, elapsed, stimulator));
                }
            }
        }
        events
    }

    /// Stop every stimulating group.
    pub fn stop_all<S: Stimulator + ?Sized>(
        &mut self,
        now: Instant,
        stimulator: &mut S,
    ) -> Vec<ArbiterEvent> {
        let mut events = Vec::new();
        for group in 0..self.groups.len() {
            if let StimulationState::Stimulating { since } = self.groups[group].state {
                let elapsed = now.saturating_duration_since(since);
                events.push(self.stop(group, StopReason::Shutdown, elapsed, stimulator));
            }
        }
        events
    }

    fn start<S: Stimulator + ?Sized>(
        &mut self,
        group: usize,
        now: Instant,
        stimulator: &mut S,
    ) -> ArbiterEvent {
        let GroupState { plate, channels, .. } = self.groups[group].clone();
        match stimulator.start(&channels) {
            Ok(()) => {
                self.groups[group].state = StimulationState::Stimulating { since: now };
                tracing::info!(plate, group, %channels, "stimulation started");
                ArbiterEvent::Started {
                    group,
                    plate,
                    channels,
                }
            }
            Err(error) => {
                tracing::error!(plate, group, %channels, %error, "failed to start stimulation");
                ArbiterEvent::Failed {
                    group,
                    plate,
                    action: Action::Start,
                    error,
                }
            }
        }
    }

    fn stop<S: Stimulator + ?Sized>(
        &mut self,
        group: usize,
        reason: StopReason,
        elapsed: Duration,
        stimulator: &mut S,
    ) -> ArbiterEvent {
        let plate = self.groups[group].plate;
        let elapsed_ms = elapsed.as_millis() as u64;
        match stimulator.stop() {
            Ok(()) => {
                self.groups[group].state = StimulationState::Idle;
                tracing::info!(plate, group, ?reason, elapsed_ms, "stimulation stopped");
                ArbiterEvent::Stopped {
                    group,
                    plate,
                    reason,
                    elapsed,
                }
            }
            Err(error) => {
                tracing::error!(plate, group, ?reason, elapsed_ms, %error, "failed to stop stimulation");
                ArbiterEvent::Failed {
                    group,
                    plate,
                    action: Action::Stop,
                    error,
                }
            }
        }
    }
}
