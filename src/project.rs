pub mod smooth;

use std::borrow::Cow;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    daq::RawChunk,
    error::{Error, Result},
};
pub use smooth::Smoothing;

/// Upper bound on the bins of one curve. A wider position range means a glitched
/// position sample, not a real sweep.
const MAX_BINS: usize = 1 << 20;

/// Conversion from raw position-channel units to delay time. Read-only during a session.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct CalibrationParameters {
    /// Quantization of the position channel, in raw units.
    pub step_size: f64,
    /// Delay time per position step, in picoseconds.
    pub ps_per_step: f64,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        CalibrationParameters {
            step_size: 0.000152587890625,
            ps_per_step: 0.05,
        }
    }
}

impl CalibrationParameters {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(Error::Configuration(format!(
                "step size must be positive: {}",
                self.step_size
            )));
        }
        if !(self.ps_per_step.is_finite() && self.ps_per_step > 0.0) {
            return Err(Error::Configuration(format!(
                "ps per step must be positive: {}",
                self.ps_per_step
            )));
        }
        Ok(())
    }

    pub fn position_to_time(&self, position: f64) -> f64 {
        position / self.step_size * self.ps_per_step
    }

    pub fn time_to_position(&self, time: f64) -> f64 {
        time / self.ps_per_step * self.step_size
    }
}

/// Everything a processor needs to project one chunk. A snapshot travels with each
/// job so an in-flight chunk never sees a mix of old and new settings.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct ProjectionParam {
    pub calibration: CalibrationParameters,
    /// Pump-on samples add to the bin, pump-off samples subtract from it.
    pub dark_control: bool,
    /// Divide the signal by the reference channel when the chunk carries one.
    pub normalize_to_reference: bool,
    pub smoothing: Smoothing,
}

/// A binned curve over the delay axis. Bins where no sample landed are NaN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedCurve {
    time: Array1<f64>,
    values: Array1<f64>,
    /// Index of the first bin on the global grid `round(t / ps_per_step)`.
    grid_origin: i64,
}

impl ProjectedCurve {
    pub fn new(time: Array1<f64>, values: Array1<f64>, grid_origin: i64) -> ProjectedCurve {
        assert_eq!(time.len(), values.len());
        ProjectedCurve {
            time,
            values,
            grid_origin,
        }
    }

    pub fn time(&self) -> ArrayView1<f64> {
        self.time.view()
    }

    pub fn values(&self) -> ArrayView1<f64> {
        self.values.view()
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn grid_origin(&self) -> i64 {
        self.grid_origin
    }

    /// `(grid index, time, value)` of every bin.
    pub fn bins(&self) -> impl Iterator<Item = (i64, f64, f64)> + '_ {
        self.time
            .iter()
            .zip(&self.values)
            .enumerate()
            .map(|(k, (&t, &v))| (self.grid_origin + k as i64, t, v))
    }
}

/// Projects a raw chunk onto a regular delay axis.
///
/// Position samples are digitized into bins of width `step_size` starting at the
/// smallest position. With dark control enabled, pump-on samples add to their bin
/// and count towards its normalization, pump-off samples only subtract their
/// baseline. The bin value is the accumulated sum divided by the count.
#[instrument(level = "trace", skip_all, fields(n = chunk.len()), err)]
pub fn project(chunk: &RawChunk, param: &ProjectionParam) -> Result<ProjectedCurve> {
    if chunk.is_empty() {
        return Err(Error::Projection("empty chunk".to_owned()));
    }
    let CalibrationParameters {
        step_size,
        ps_per_step,
    } = param.calibration;

    let position: Cow<Array1<f64>> = smooth::smooth(chunk.position(), param.smoothing)?;
    let (min_pos, max_pos) = position
        .iter()
        .try_fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| {
            p.is_finite().then(|| (lo.min(p), hi.max(p)))
        })
        .ok_or_else(|| Error::Projection("non-finite position sample".to_owned()))?;
    if max_pos <= min_pos {
        return Err(Error::Projection(format!(
            "degenerate position range: [{min_pos}, {max_pos}]"
        )));
    }

    let span = (max_pos - min_pos) / step_size;
    if !(span < MAX_BINS as f64) {
        return Err(Error::Projection(format!(
            "position range [{min_pos}, {max_pos}] spans more than {MAX_BINS} bins"
        )));
    }
    let nbins = span.floor() as usize + 1;
    let origin = min_pos / step_size;
    let time = Array1::from_shape_fn(nbins, |k| (origin + k as f64) * ps_per_step);

    let reference = chunk.reference().filter(|_| param.normalize_to_reference);
    let mut result = Array1::<f64>::zeros(nbins);
    let mut norm = Array1::<u32>::zeros(nbins);
    for (i, (&pos, &signal)) in position.iter().zip(chunk.signal()).enumerate() {
        let signal = match reference {
            Some(reference) => {
                let r = reference[i];
                if r == 0.0 || !r.is_finite() {
                    continue;
                }
                signal / r
            }
            None => signal,
        };
        let b = (((pos - min_pos) / step_size).floor() as usize).min(nbins - 1);
        if !param.dark_control || chunk.dark_control()[i] {
            result[b] += signal;
            norm[b] += 1;
        } else {
            result[b] -= signal;
        }
    }

    let values = ndarray::Zip::from(&result)
        .and(&norm)
        .map_collect(|&r, &n| if n == 0 { f64::NAN } else { r / n as f64 });

    Ok(ProjectedCurve {
        time,
        values,
        grid_origin: origin.round() as i64,
    })
}
