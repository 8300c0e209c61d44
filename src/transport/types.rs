//! Wire-level types exchanged with the force-plate server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Channel key carrying force-plate data in a [`Payload`].
pub const FORCE_KEY: &str = "Force";

/// One poll worth of samples: an ordered list of channels, each holding the
/// samples delivered since the previous poll.
///
/// Channels come in blocks of nine per plate (three force axes, three moment
/// axes, three centre-of-pressure axes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawFrame(pub Vec<Vec<f64>>);

impl RawFrame {
    pub fn new(channels: Vec<Vec<f64>>) -> Self {
        Self(channels)
    }

    /// Number of channels in the frame.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the frame has no channels or only empty channels.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|c| c.is_empty())
    }

    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.0.get(index).map(|c| c.as_slice())
    }

    pub fn channels(&self) -> &[Vec<f64>] {
        &self.0
    }
}

/// Server response: channel name to frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub HashMap<String, RawFrame>);

impl Payload {
    /// Payload holding only force-plate data.
    pub fn force(frame: RawFrame) -> Self {
        let mut channels = HashMap::new();
        channels.insert(FORCE_KEY.to_string(), frame);
        Self(channels)
    }

    /// Frame under `key`, or `None` when the key is absent or carries no samples.
    pub fn frame(&self, key: &str) -> Option<&RawFrame> {
        self.0.get(key).filter(|frame| !frame.is_empty())
    }
}

/// Transient failure to obtain a frame.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not decode server response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed by server")]
    Closed,
}
