//! Core functionality for the gait stimulation agent.
//!
//! This module contains:
//! - Frame parsing into per-plate force, moment and CoP blocks
//! - Gait-cycle accumulation and boundary detection
//! - Per-group stimulation start/stop arbitration
//! - The fixed-rate acquisition loop tying them together

pub mod acquisition;
pub mod arbiter;
pub mod cycle;
pub mod frame;

// Re-export commonly used types
pub use acquisition::{pacing_delay, AcquisitionLoop, TickError, TickReport};
pub use arbiter::{
    Action, ArbiterConfig, ArbiterEvent, StimulationArbiter, StimulationState, StopReason,
};
pub use cycle::{CompletedCycle, CycleAccumulator, CycleBuffer, CycleError, SignalKey, WindowMeans};
pub use frame::{
    FrameError, FrameParser, ParsedFrame, PlateSample, Signal, SignalBlock, AP_AXIS,
    CHANNELS_PER_PLATE, VERTICAL_AXIS,
};
