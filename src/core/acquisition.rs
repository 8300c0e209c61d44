//! The fixed-rate acquisition loop.
//!
//! Each iteration fetches one frame (with a bounded retry), parses it, runs
//! the stimulation arbiter for every plate, checks for a gait-cycle boundary,
//! appends the frame to the cycle buffer, then sleeps out the remainder of the
//! tick period. Nothing that goes wrong inside an iteration ends the loop.

use crate::config::{Config, RetryConfig};
use crate::core::arbiter::{ArbiterEvent, StimulationArbiter};
use crate::core::cycle::{CompletedCycle, CycleAccumulator};
use crate::core::frame::{FrameError, FrameParser, Signal, AP_AXIS};
use crate::status::{create_shared_status, SharedLoopStatus};
use crate::stimulator::Stimulator;
use crate::transport::{FetchError, Payload, RawFrame, Transport, FORCE_KEY};
use crossbeam_channel::{Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why an iteration processed no data.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("no frame after {attempts} fetch attempts in {elapsed:?}: {last}")]
    FetchExhausted {
        attempts: u32,
        last: FetchError,
        /// Time spent fetching, retry delays included
        elapsed: Duration,
    },

    #[error("server returned no {} data", FORCE_KEY)]
    NoData,

    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
}

/// What a processed iteration did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Stimulator calls made this tick
    pub events: Vec<ArbiterEvent>,
    /// Index of the cycle handed off this tick
    pub cycle: Option<u64>,
    /// Buffer keys whose data was dropped this tick
    pub dropped_keys: usize,
}

/// Time left to sleep so an iteration that took `elapsed` fills `period`.
pub fn pacing_delay(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Closed-loop acquisition over a transport and a stimulator.
pub struct AcquisitionLoop<T, S> {
    transport: T,
    stimulator: S,
    parser: FrameParser,
    arbiter: StimulationArbiter,
    accumulator: CycleAccumulator,
    status: SharedLoopStatus,
    cycle_tx: Option<Sender<CompletedCycle>>,
    period: Duration,
    retry: RetryConfig,
    command: Vec<String>,
    threshold: f64,
}

impl<T: Transport, S: Stimulator> AcquisitionLoop<T, S> {
    /// Build a loop from a validated configuration.
    pub fn new(config: &Config, transport: T, stimulator: S) -> Self {
        Self {
            transport,
            stimulator,
            parser: FrameParser::new(config.plate_count),
            arbiter: StimulationArbiter::new(config.arbiter.clone(), &config.channel_groups),
            accumulator: CycleAccumulator::new(config.reference_plate),
            status: create_shared_status(config.channel_groups.len()),
            cycle_tx: None,
            period: config.tick_period(),
            retry: config.retry.clone(),
            command: config.transport.command.clone(),
            threshold: config.vertical_force_threshold,
        }
    }

    /// Use an externally owned status block.
    pub fn with_status(mut self, status: SharedLoopStatus) -> Self {
        self.status = status;
        self
    }

    /// Send completed cycles to `sender`.
    pub fn with_cycle_sink(mut self, sender: Sender<CompletedCycle>) -> Self {
        self.cycle_tx = Some(sender);
        self
    }

    pub fn status(&self) -> &SharedLoopStatus {
        &self.status
    }

    pub fn arbiter(&self) -> &StimulationArbiter {
        &self.arbiter
    }

    pub fn accumulator(&self) -> &CycleAccumulator {
        &self.accumulator
    }

    pub fn stimulator(&self) -> &S {
        &self.stimulator
    }

    pub fn stimulator_mut(&mut self) -> &mut S {
        &mut self.stimulator
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Fetch one payload, retrying transient failures up to the configured bound.
    pub fn fetch_with_retry(&mut self) -> Result<Payload, TickError> {
        let attempts = self.retry.attempts.max(1);
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match self.transport.fetch(&self.command) {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    self.status.record_fetch_failure();
                    tracing::warn!(attempt, attempts, error = %e, "fetch attempt failed");
                    if attempt >= attempts {
                        return Err(TickError::FetchExhausted {
                            attempts,
                            last: e,
                            elapsed: started.elapsed(),
                        });
                    }
                    if !self.retry.delay.is_zero() {
                        thread::sleep(self.retry.delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Run one iteration (without pacing) as of `now`.
    pub fn tick_at(&mut self, now: Instant) -> Result<TickReport, TickError> {
        self.status.record_tick();
        let started = Instant::now();

        let result = self
            .fetch_with_retry()
            .and_then(|payload| self.process_payload(&payload, now));

        if let Err(ref e) = result {
            self.status.record_skipped_tick();
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match e {
                TickError::FetchExhausted { .. } => {
                    tracing::error!(elapsed_ms, error = %e, "skipping tick: transport unavailable")
                }
                TickError::NoData => tracing::warn!(elapsed_ms, "skipping tick: no data received"),
                TickError::Malformed(frame_err) => {
                    self.status.record_malformed_frame();
                    tracing::warn!(elapsed_ms, error = %frame_err, "skipping tick: malformed frame")
                }
            }

            for event in self.arbiter.enforce_timeouts(now, &mut self.stimulator) {
                self.record_event(&event);
            }
        }

        result
    }

    /// Run one iteration as of the current instant.
    pub fn tick(&mut self) -> Result<TickReport, TickError> {
        self.tick_at(Instant::now())
    }

    /// Process a server response; an absent or empty force payload is "no data".
    pub fn process_payload(
        &mut self,
        payload: &Payload,
        now: Instant,
    ) -> Result<TickReport, TickError> {
        let raw = payload.frame(FORCE_KEY).ok_or(TickError::NoData)?;
        self.process_frame(raw, now)
    }

    /// Parse a frame and drive the arbiter and the cycle accumulator with it.
    pub fn process_frame(&mut self, raw: &RawFrame, now: Instant) -> Result<TickReport, TickError> {
        let frame = self.parser.parse(raw)?;
        let mut report = TickReport::default();

        for (plate, _) in frame.plates() {
            let Some(means) = self
                .accumulator
                .window_means(&frame, plate, Signal::Force, AP_AXIS)
            else {
                continue;
            };
            tracing::trace!(plate, current = means.current, previous = ?means.previous, "AP force window");

            if let Some(event) = self
                .arbiter
                .evaluate(plate, means, now, &mut self.stimulator)
            {
                self.record_event(&event);
                report.events.push(event);
            }
        }

        if let Some(cycle) = self
            .accumulator
            .detect_cycle_boundary_and_reset(&frame, self.threshold)
        {
            report.cycle = Some(cycle.index);
            self.hand_off(cycle);
        }

        let errors = self.accumulator.append(&frame);
        for e in &errors {
            tracing::warn!(error = %e, "dropping buffer key for this tick");
        }
        if !errors.is_empty() {
            self.status.record_shape_errors(errors.len() as u64);
        }
        report.dropped_keys = errors.len();

        self.status.record_processed_tick();
        Ok(report)
    }

    /// Iterate until `running` is cleared, pacing to the configured frequency.
    ///
    /// Overrunning iterations are followed immediately by the next one; missed
    /// ticks are not caught up.
    pub fn run(&mut self, running: &AtomicBool) {
        self.status.set_running(true);
        tracing::info!(
            period_ms = self.period.as_secs_f64() * 1000.0,
            "acquisition loop started"
        );

        while running.load(Ordering::SeqCst) {
            let tic = Instant::now();

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.tick_at(tic)));
            if outcome.is_err() {
                self.status.record_panic();
                tracing::error!("acquisition tick panicked; continuing with next tick");
            }

            let elapsed = tic.elapsed();
            let delay = pacing_delay(self.period, elapsed);
            if delay.is_zero() {
                tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "tick overran its period");
            } else {
                thread::sleep(delay);
            }
        }

        self.status.set_running(false);
        tracing::info!("acquisition loop stopped");
    }

    /// Stop any running stimulation and hand the stimulator back.
    pub fn shutdown(mut self) -> S {
        for event in self.arbiter.stop_all(Instant::now(), &mut self.stimulator) {
            self.record_event(&event);
        }
        self.stimulator
    }

    fn record_event(&self, event: &ArbiterEvent) {
        match event {
            ArbiterEvent::Started { group, .. } => self.status.record_stimulation_started(*group),
            ArbiterEvent::Stopped { group, .. } => self.status.record_stimulation_stopped(*group),
            ArbiterEvent::Failed { .. } => self.status.record_capability_failure(),
        }
    }

    fn hand_off(&mut self, cycle: CompletedCycle) {
        self.status.record_cycle_completed();
        tracing::info!(
            cycle = cycle.index,
            ticks = cycle.ticks,
            samples = cycle.buffer.sample_count(self.accumulator.reference_plate()),
            "gait cycle boundary"
        );

        let Some(tx) = self.cycle_tx.as_ref() else {
            return;
        };
        match tx.try_send(cycle) {
            Ok(()) => {}
            Err(TrySendError::Full(c)) => {
                tracing::warn!(cycle = c.index, "cycle consumer is behind; dropping cycle")
            }
            Err(TrySendError::Disconnected(c)) => {
                tracing::warn!(cycle = c.index, "cycle consumer is gone; dropping cycle");
                self.cycle_tx = None;
            }
        }
    }
}

impl<T, S> AcquisitionLoop<T, S>
where
    T: Transport + Send + 'static,
    S: Stimulator + Send + 'static,
{
    /// Run the loop on a dedicated thread until `running` is cleared.
    ///
    /// The thread hands the loop back on exit so the caller can shut the
    /// stimulator down after acquisition has stopped.
    pub fn spawn(self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<Self>> {
        thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || {
                let mut acquisition = self;
                acquisition.run(&running);
                acquisition
            })
    }
}
