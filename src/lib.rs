//! Gait Stim Agent - closed-loop force-plate acquisition driving an
//! electrical stimulator.
//!
//! A fixed-rate loop polls a force-plate server for the latest frame, splits
//! it into per-plate force, moment and centre-of-pressure blocks, and:
//!
//! - starts stimulation on a plate's channel group when the anterior-posterior
//!   force is still braking but starting to rise,
//! - stops it once the force has turned propulsive and begins to fall (after
//!   a minimum duration), or unconditionally after a maximum duration,
//! - accumulates every frame into a gait-cycle buffer and hands the buffer
//!   off whenever the reference plate's vertical force crosses the cycle
//!   threshold upward.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Gait Stim Agent                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │  Transport  │──▶│ FrameParser │──▶│   Arbiter   │──▶ Stimulator
//! │  │   (TCP)     │   │ (9 ch/plate)│   │ (per group) │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │                           │                                   │
//! │                           ▼                                   │
//! │                    ┌─────────────┐                            │
//! │                    │    Cycle    │──▶ completed cycles         │
//! │                    │ Accumulator │                            │
//! │                    └─────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use gait_stim_agent::{AcquisitionLoop, Config, DryRunStimulator, TcpTransport};
//! use std::sync::atomic::AtomicBool;
//!
//! let config = Config::default();
//! let transport = TcpTransport::connect(config.transport.address()).expect("server reachable");
//! let stimulator = DryRunStimulator::new(config.stimulation.clone(), config.stimulator_armed);
//!
//! let running = AtomicBool::new(true);
//! let mut acquisition = AcquisitionLoop::new(&config, transport, stimulator);
//! acquisition.run(&running);
//! ```

pub mod config;
pub mod core;
pub mod sim;
pub mod status;
pub mod stimulator;
pub mod transport;

// Re-export key types at crate root for convenience
pub use config::{ChannelGroup, Config, ConfigError, RetryConfig, TransportConfig};
pub use core::{
    AcquisitionLoop, ArbiterConfig, ArbiterEvent, CompletedCycle, CycleAccumulator, FrameParser,
    StimulationArbiter, TickError,
};
pub use status::{LoopStats, LoopStatus, SharedLoopStatus};
pub use stimulator::{ChannelSet, DryRunStimulator, Stimulator, StimulatorError};
pub use transport::{FetchError, Payload, RawFrame, TcpTransport, Transport};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stimulation rules that can be displayed to operators.
pub const SAFETY_NOTICE: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║              GAIT STIM AGENT - STIMULATION SAFETY NOTICE          ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This agent switches electrical stimulation on and off from      ║
║  live force-plate data. Each plate drives its own channel group. ║
║  Only one group stimulates at a time.                            ║
║                                                                  ║
║  ✓ STIMULATION STARTS ONLY WHEN:                                 ║
║    • The stimulator reports itself armed                         ║
║    • No channel group is already stimulating                     ║
║    • AP force is below the start level (default -20 N)           ║
║    • AP force is rising since the previous window                ║
║                                                                  ║
║  ✗ STIMULATION STOPS WHEN:                                       ║
║    • AP force is above the stop level (default 10 N), falling,   ║
║      and the minimum duration (default 0.2 s) has passed         ║
║    • The maximum duration (default 0.5 s) has passed, always,    ║
║      even while no data is arriving                              ║
║    • The agent shuts down                                        ║
║                                                                  ║
║  The stimulator starts disarmed unless configured otherwise.     ║
║                                                                  ║
║  You can view loop statistics anytime with:                      ║
║    gait-stim status                                              ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_notice_contents() {
        assert!(SAFETY_NOTICE.contains("SAFETY"));
        assert!(SAFETY_NOTICE.contains("STIMULATION STOPS"));
        assert!(SAFETY_NOTICE.contains("maximum duration"));
    }
}
