//! Accumulation of force-plate data into gait cycles.
//!
//! Every tick's samples are appended to a [`CycleBuffer`] keyed by plate and
//! signal. A cycle boundary is declared when the reference plate's vertical
//! force crosses the threshold upwards between the previous window and the
//! current one; the buffer is then handed off and a new cycle starts empty.

use crate::core::frame::{ParsedFrame, Signal, SignalBlock, VERTICAL_AXIS};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Buffer key: one signal of one plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub plate: usize,
    pub signal: Signal,
}

impl SignalKey {
    pub fn new(plate: usize, signal: Signal) -> Self {
        Self { plate, signal }
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.signal.name(), self.plate)
    }
}

/// Incoming data could not be concatenated onto the buffer.
#[derive(Debug, Error, PartialEq)]
pub enum CycleError {
    #[error("cannot concatenate {key}: buffered rows span {buffered} samples, incoming rows {incoming}")]
    Shape {
        key: SignalKey,
        buffered: usize,
        incoming: usize,
    },
}

/// Everything recorded since the last cycle boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleBuffer {
    blocks: BTreeMap<SignalKey, SignalBlock>,
}

impl CycleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: SignalKey) -> Option<&SignalBlock> {
        self.blocks.get(&key)
    }

    pub fn block(&self, plate: usize, signal: Signal) -> Option<&SignalBlock> {
        self.get(SignalKey::new(plate, signal))
    }

    pub fn keys(&self) -> impl Iterator<Item = SignalKey> + '_ {
        self.blocks.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(SignalBlock::is_empty)
    }

    /// Number of force samples buffered for `plate`.
    pub fn sample_count(&self, plate: usize) -> usize {
        self.block(plate, Signal::Force)
            .map(SignalBlock::sample_count)
            .unwrap_or(0)
    }

    /// Append one block under `key`, leaving the buffer untouched on a shape mismatch.
    pub fn append_block(&mut self, key: SignalKey, block: &SignalBlock) -> Result<(), CycleError> {
        let entry = self.blocks.entry(key).or_default();
        entry
            .extend_from(block)
            .map_err(|(buffered, incoming)| CycleError::Shape {
                key,
                buffered,
                incoming,
            })
    }
}

/// Mean of the current tick against the same-length suffix already buffered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMeans {
    pub current: f64,
    /// `None` when the buffer does not yet hold a full window.
    pub previous: Option<f64>,
}

impl WindowMeans {
    /// `current - previous`, when a previous window exists.
    pub fn delta(&self) -> Option<f64> {
        self.previous.map(|p| self.current - p)
    }
}

/// A finished gait cycle handed off at a boundary.
#[derive(Debug, Clone)]
pub struct CompletedCycle {
    /// Sequence number of the cycle since startup, starting at 1.
    pub index: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Ticks appended into this cycle.
    pub ticks: u64,
    pub buffer: CycleBuffer,
}

impl CompletedCycle {
    pub fn duration_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Owns the cycle buffer and the window arithmetic over it.
pub struct CycleAccumulator {
    buffer: CycleBuffer,
    reference_plate: usize,
    started_at: DateTime<Utc>,
    ticks: u64,
    cycles_completed: u64,
}

impl CycleAccumulator {
    /// Create an accumulator whose boundaries follow `reference_plate`.
    pub fn new(reference_plate: usize) -> Self {
        Self {
            buffer: CycleBuffer::new(),
            reference_plate,
            started_at: Utc::now(),
            ticks: 0,
            cycles_completed: 0,
        }
    }

    pub fn buffer(&self) -> &CycleBuffer {
        &self.buffer
    }

    pub fn reference_plate(&self) -> usize {
        self.reference_plate
    }

    /// Ticks appended since the last boundary.
    pub fn ticks_in_cycle(&self) -> u64 {
        self.ticks
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Mean of this tick's samples for one row.
    pub fn current_window_mean(
        frame: &ParsedFrame,
        plate: usize,
        signal: Signal,
        axis: usize,
    ) -> Option<f64> {
        frame.plate(plate)?.signal(signal).row_mean(axis)
    }

    /// Mean of the last `length` buffered samples for one row.
    pub fn previous_window_mean(
        &self,
        plate: usize,
        signal: Signal,
        axis: usize,
        length: usize,
    ) -> Option<f64> {
        self.buffer.block(plate, signal)?.suffix_mean(axis, length)
    }

    /// Current and previous window means, the previous window matching the
    /// current tick's sample count. `None` if the plate is absent or empty.
    pub fn window_means(
        &self,
        frame: &ParsedFrame,
        plate: usize,
        signal: Signal,
        axis: usize,
    ) -> Option<WindowMeans> {
        let row = frame.plate(plate)?.signal(signal).row(axis);
        let current = crate::core::frame::mean(row)?;
        Some(WindowMeans {
            current,
            previous: self.previous_window_mean(plate, signal, axis, row.len()),
        })
    }

    /// Append every plate and signal of `frame`.
    ///
    /// Keys that fail to concatenate are skipped and reported; the others are
    /// appended regardless.
    pub fn append(&mut self, frame: &ParsedFrame) -> Vec<CycleError> {
        let mut errors = Vec::new();
        for (plate, sample) in frame.plates() {
            for signal in Signal::ALL {
                let key = SignalKey::new(plate, signal);
                if let Err(e) = self.buffer.append_block(key, sample.signal(signal)) {
                    errors.push(e);
                }
            }
        }
        self.ticks += 1;
        errors
    }

    /// Check the reference plate's vertical force for a cycle boundary.
    ///
    /// A boundary needs a previous window below `threshold` and the current
    /// window above it. On a boundary the buffer is taken and returned, and
    /// the accumulator restarts empty.
    pub fn detect_cycle_boundary_and_reset(
        &mut self,
        frame: &ParsedFrame,
        threshold: f64,
    ) -> Option<CompletedCycle> {
        let means = self.window_means(frame, self.reference_plate, Signal::Force, VERTICAL_AXIS)?;
        let previous = means.previous?;
        if !(means.current > threshold && threshold > previous) {
            return None;
        }

        let now = Utc::now();
        self.cycles_completed += 1;
        let cycle = CompletedCycle {
            index: self.cycles_completed,
            started_at: self.started_at,
            ended_at: now,
            ticks: self.ticks,
            buffer: std::mem::take(&mut self.buffer),
        };
        self.started_at = now;
        self.ticks = 0;
        Some(cycle)
    }
}
