use std::{
    f64::consts::PI,
    thread,
    time::{Duration, Instant},
};

use ndarray::{Array1, Zip};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{AcquisitionDevice, ChannelSpec, RawChunk, Trigger};
use crate::{
    error::{Error, Result},
    fit::PulseShape,
    project::CalibrationParameters,
};

/// Physics of the simulated experiment.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SimulationParam {
    pub shape: PulseShape,
    pub amplitude: f64,
    /// Pulse center, in picoseconds.
    pub center: f64,
    /// Width parameter of the pulse shape, in picoseconds.
    pub width: f64,
    /// Constant background present in every shot.
    pub offset: f64,
    /// Peak-to-peak uniform noise added to every sample.
    pub noise: f64,
    /// Shaker amplitude in raw position units.
    pub position_amplitude: f64,
    pub position_offset: f64,
    /// One mechanical cycle of the shaker, in samples.
    pub period_samples: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationParam {
    fn default() -> Self {
        SimulationParam {
            shape: PulseShape::Sech2,
            amplitude: 1.0,
            center: 0.0,
            width: 0.1,
            offset: 0.0,
            noise: 0.0,
            position_amplitude: 0.01,
            position_offset: 0.0,
            period_samples: 30000.0,
            seed: None,
        }
    }
}

/// A virtual digitizer: sinusoidal shaker position, a pulse signal on
/// even-indexed (pump-on) samples and baseline only on odd-indexed (pump-off) ones.
pub struct Simulator {
    param: SimulationParam,
    calibration: CalibrationParameters,
    /// Sleep so that a chunk takes as long as the real acquisition would.
    realtime: bool,
    sample_rate: Option<f64>,
    /// Global index of the next sample, keeps the shaker phase continuous.
    next_sample: u64,
    rng: StdRng,
}

impl Simulator {
    pub fn new(param: SimulationParam, calibration: CalibrationParameters, realtime: bool) -> Self {
        let rng = match param.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Simulator {
            param,
            calibration,
            realtime,
            sample_rate: None,
            next_sample: 0,
            rng,
        }
    }

    /// Synthesizes `n_samples` samples starting at the current shaker phase.
    pub fn generate(&mut self, n_samples: usize) -> RawChunk {
        let SimulationParam {
            shape,
            amplitude,
            center,
            width,
            offset,
            noise,
            position_amplitude,
            position_offset,
            period_samples,
            ..
        } = self.param;
        let calibration = self.calibration;
        let start = self.next_sample;
        self.next_sample += n_samples as u64;

        let index = Array1::from_shape_fn(n_samples, |i| start + i as u64);
        let position = index.mapv(|i| {
            position_offset + position_amplitude * (2.0 * PI * i as f64 / period_samples).sin()
        });
        let dark_control = index.mapv(|i| i % 2 == 0);

        let mut signal = Array1::from_elem(n_samples, offset);
        Zip::from(&mut signal)
            .and(&position)
            .and(&dark_control)
            .par_for_each(|s, &p, &pump_on| {
                if pump_on {
                    let t = calibration.position_to_time(p);
                    *s += shape.eval(t, amplitude, center, width, 0.0);
                }
            });
        if noise > 0.0 {
            let half = noise / 2.0;
            signal
                .iter_mut()
                .for_each(|s| *s += self.rng.gen_range(-half..half));
        }

        // Lengths agree by construction.
        RawChunk {
            position,
            signal,
            dark_control,
            reference: None,
        }
    }
}

impl AcquisitionDevice for Simulator {
    fn open(
        &mut self,
        _channels: &ChannelSpec,
        sample_rate: f64,
        trigger: Option<&Trigger>,
    ) -> Result<()> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::DeviceRead(format!("invalid sample rate: {sample_rate}")));
        }
        debug!(sample_rate, ?trigger, "open simulator");
        self.sample_rate = Some(sample_rate);
        Ok(())
    }

    #[instrument(level = "trace", skip(self), err)]
    fn read_chunk(&mut self, n_samples: usize) -> Result<RawChunk> {
        let sample_rate = self
            .sample_rate
            .ok_or_else(|| Error::DeviceRead("simulator not opened".to_owned()))?;
        let t0 = Instant::now();
        let chunk = self.generate(n_samples);
        if self.realtime {
            let acquisition_time = Duration::from_secs_f64(n_samples as f64 / sample_rate);
            if let Some(rest) = acquisition_time.checked_sub(t0.elapsed()) {
                thread::sleep(rest);
            }
        }
        Ok(chunk)
    }

    fn close(&mut self) -> Result<()> {
        self.sample_rate = None;
        Ok(())
    }
}
