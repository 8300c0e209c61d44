//! Reordering of flat force-plate frames into per-plate signal blocks.
//!
//! A raw frame carries nine channels per plate, in plate order:
//! force x/y/z, moment x/y/z, centre of pressure x/y/z. Each channel holds the
//! samples delivered during one poll.

use crate::transport::RawFrame;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use thiserror::Error;

/// Number of channels each plate contributes to a raw frame.
pub const CHANNELS_PER_PLATE: usize = 9;

/// Number of axes per signal.
pub const AXES: usize = 3;

/// Anterior-posterior axis of the force signal.
pub const AP_AXIS: usize = 0;

/// Vertical axis of the force signal.
pub const VERTICAL_AXIS: usize = 2;

/// Signal measured by a plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Signal {
    Force,
    Moment,
    Cop,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Force, Signal::Moment, Signal::Cop];

    /// Channel offset of this signal inside a plate block.
    pub fn offset(self) -> usize {
        match self {
            Signal::Force => 0,
            Signal::Moment => AXES,
            Signal::Cop => 2 * AXES,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Force => "Force",
            Signal::Moment => "Moment",
            Signal::Cop => "CoP",
        }
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().mean())
    }
}

/// Three rows (one per axis) of samples for one signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBlock {
    rows: [Vec<f64>; AXES],
}

impl SignalBlock {
    pub fn new(rows: [Vec<f64>; AXES]) -> Self {
        Self { rows }
    }

    /// Samples of one axis; empty for an axis out of range.
    pub fn row(&self, axis: usize) -> &[f64] {
        self.rows.get(axis).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Number of samples per row (rows are equal length in a well-formed block).
    pub fn sample_count(&self) -> usize {
        self.rows[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.is_empty())
    }

    /// True when every row holds the same number of samples.
    pub fn is_rectangular(&self) -> bool {
        self.rows.iter().all(|r| r.len() == self.rows[0].len())
    }

    /// Mean of every sample on `axis`.
    pub fn row_mean(&self, axis: usize) -> Option<f64> {
        mean(self.row(axis))
    }

    /// Mean of the last `length` samples on `axis`.
    ///
    /// Returns `None` when the row holds fewer than `length` samples or when
    /// `length` is zero, so "no prior window" is never confused with a mean of 0.
    pub fn suffix_mean(&self, axis: usize, length: usize) -> Option<f64> {
        let row = self.row(axis);
        if length == 0 || row.len() < length {
            return None;
        }
        mean(&row[row.len() - length..])
    }

    /// Append `other` row by row. Both blocks must be rectangular.
    pub(crate) fn extend_from(&mut self, other: &SignalBlock) -> Result<(), (usize, usize)> {
        if !self.is_rectangular() || !other.is_rectangular() {
            let lengths = |b: &SignalBlock| b.rows.iter().map(Vec::len).max().unwrap_or(0);
            return Err((lengths(self), lengths(other)));
        }
        for (row, extra) in self.rows.iter_mut().zip(other.rows.iter()) {
            row.extend_from_slice(extra);
        }
        Ok(())
    }
}

/// Force, moment and centre of pressure for one plate during one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlateSample {
    pub force: SignalBlock,
    pub moment: SignalBlock,
    pub cop: SignalBlock,
}

impl PlateSample {
    pub fn signal(&self, signal: Signal) -> &SignalBlock {
        match signal {
            Signal::Force => &self.force,
            Signal::Moment => &self.moment,
            Signal::Cop => &self.cop,
        }
    }

    /// Samples delivered this tick.
    pub fn sample_count(&self) -> usize {
        self.force.sample_count()
    }
}

/// Per-plate view of one raw frame, keyed by 1-based plate number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFrame {
    plates: BTreeMap<usize, PlateSample>,
}

impl ParsedFrame {
    pub fn plate(&self, plate: usize) -> Option<&PlateSample> {
        self.plates.get(&plate)
    }

    pub fn plates(&self) -> impl Iterator<Item = (usize, &PlateSample)> {
        self.plates.iter().map(|(&p, s)| (p, s))
    }

    pub fn plate_count(&self) -> usize {
        self.plates.len()
    }

    /// Build a frame directly from plate samples.
    pub fn from_plates(plates: impl IntoIterator<Item = (usize, PlateSample)>) -> Self {
        Self {
            plates: plates.into_iter().collect(),
        }
    }
}

/// A raw frame that cannot be split into plates.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame has {actual} channels, expected at least {expected}")]
    TooShort { expected: usize, actual: usize },

    #[error("plate {plate}: channel {channel} is empty")]
    EmptyChannel { plate: usize, channel: usize },

    #[error("plate {plate}: channel {channel} has {actual} samples, expected {expected}")]
    Ragged {
        plate: usize,
        channel: usize,
        expected: usize,
        actual: usize,
    },
}

/// Splits raw frames for a fixed number of plates.
#[derive(Debug, Clone, Copy)]
pub struct FrameParser {
    plate_count: usize,
}

impl FrameParser {
    pub fn new(plate_count: usize) -> Self {
        Self { plate_count }
    }

    pub fn plate_count(&self) -> usize {
        self.plate_count
    }

    /// Parse one raw frame. Channels beyond the last plate are ignored.
    pub fn parse(&self, raw: &RawFrame) -> Result<ParsedFrame, FrameError> {
        let expected = CHANNELS_PER_PLATE * self.plate_count;
        if raw.len() < expected {
            return Err(FrameError::TooShort {
                expected,
                actual: raw.len(),
            });
        }

        let mut plates = BTreeMap::new();
        for plate in 1..=self.plate_count {
            let start = (plate - 1) * CHANNELS_PER_PLATE;
            let samples = raw.channel(start).map(<[f64]>::len).unwrap_or(0);

            let block = |signal: Signal| -> Result<SignalBlock, FrameError> {
                let mut rows: [Vec<f64>; AXES] = Default::default();
                for (axis, row) in rows.iter_mut().enumerate() {
                    let channel = start + signal.offset() + axis;
                    let data = raw.channel(channel).unwrap_or(&[]);
                    if data.is_empty() {
                        return Err(FrameError::EmptyChannel { plate, channel });
                    }
                    if data.len() != samples {
                        return Err(FrameError::Ragged {
                            plate,
                            channel,
                            expected: samples,
                            actual: data.len(),
                        });
                    }
                    row.extend_from_slice(data);
                }
                Ok(SignalBlock::new(rows))
            };

            plates.insert(
                plate,
                PlateSample {
                    force: block(Signal::Force)?,
                    moment: block(Signal::Moment)?,
                    cop: block(Signal::Cop)?,
                },
            );
        }

        Ok(ParsedFrame { plates })
    }
}
