mod simulate;
mod streamer;

use std::sync::Arc;

use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};

pub use simulate::{SimulationParam, Simulator};
pub use streamer::{OverflowPolicy, Streamer, StreamerHandle, WorkQueue};

use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Blocking read of exactly N samples per call, in a loop.
    #[default]
    Continuous,
    /// Each read waits for an external trigger edge, then samples N points once.
    Triggered,
    /// Chunks are synthesized by [`Simulator`].
    Simulated,
}

/// One block of samples as delivered by the digitizer, immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    position: Array1<f64>,
    signal: Array1<f64>,
    dark_control: Array1<bool>,
    reference: Option<Array1<f64>>,
}

impl RawChunk {
    pub fn new(
        position: Array1<f64>,
        signal: Array1<f64>,
        dark_control: Array1<bool>,
        reference: Option<Array1<f64>>,
    ) -> Result<RawChunk> {
        let n = position.len();
        if signal.len() != n || dark_control.len() != n {
            return Err(Error::DeviceRead(format!(
                "channel length mismatch: position({n}) signal({}) dark_control({})",
                signal.len(),
                dark_control.len()
            )));
        }
        if let Some(reference) = &reference {
            if reference.len() != n {
                return Err(Error::DeviceRead(format!(
                    "channel length mismatch: position({n}) reference({})",
                    reference.len()
                )));
            }
        }
        Ok(RawChunk {
            position,
            signal,
            dark_control,
            reference,
        })
    }

    /// Builds a chunk from a 3xN or 4xN block of analog samples. Rows are position,
    /// signal, dark control and an optional reference. The dark-control row is a TTL
    /// level, thresholded at the midpoint of its swing.
    pub fn from_block(block: ArrayView2<f64>) -> Result<RawChunk> {
        let nrows = block.nrows();
        if !(3..=4).contains(&nrows) {
            return Err(Error::DeviceRead(format!(
                "expect 3 or 4 channels, got {nrows}"
            )));
        }
        let ttl = block.row(2);
        let (lo, hi) = ttl
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let threshold = if hi > lo { (lo + hi) / 2.0 } else { 0.0 };
        let dark_control = ttl.mapv(|v| v > threshold);
        let reference = (nrows == 4).then(|| block.row(3).to_owned());
        RawChunk::new(
            block.row(0).to_owned(),
            block.row(1).to_owned(),
            dark_control,
            reference,
        )
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    pub fn position(&self) -> &Array1<f64> {
        &self.position
    }

    pub fn signal(&self) -> &Array1<f64> {
        &self.signal
    }

    pub fn dark_control(&self) -> &Array1<bool> {
        &self.dark_control
    }

    pub fn reference(&self) -> Option<&Array1<f64>> {
        self.reference.as_ref()
    }
}

/// Physical channel names of the digitizer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub position: String,
    pub signal: String,
    pub dark_control: String,
    pub reference: Option<String>,
}

impl Default for ChannelSpec {
    fn default() -> Self {
        ChannelSpec {
            position: "Dev1/ai0".to_owned(),
            signal: "Dev1/ai1".to_owned(),
            dark_control: "Dev1/ai2".to_owned(),
            reference: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub source: String,
    pub edge: Edge,
}

/// The digitizer boundary. Any error returned here is fatal for the stream.
pub trait AcquisitionDevice: Send {
    fn open(
        &mut self,
        channels: &ChannelSpec,
        sample_rate: f64,
        trigger: Option<&Trigger>,
    ) -> Result<()>;

    /// Blocks until exactly `n_samples` samples are available.
    fn read_chunk(&mut self, n_samples: usize) -> Result<RawChunk>;

    fn close(&mut self) -> Result<()>;
}

impl<D: AcquisitionDevice + ?Sized> AcquisitionDevice for Box<D> {
    fn open(
        &mut self,
        channels: &ChannelSpec,
        sample_rate: f64,
        trigger: Option<&Trigger>,
    ) -> Result<()> {
        (**self).open(channels, sample_rate, trigger)
    }

    fn read_chunk(&mut self, n_samples: usize) -> Result<RawChunk> {
        (**self).read_chunk(n_samples)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

pub type SharedChunk = Arc<RawChunk>;
