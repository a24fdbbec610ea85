pub mod lm;
#[cfg(test)]
mod tests;

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    util::timing,
};
use lm::{levenberg_marquardt, LmSetup, Model};

/// Initial width guess as a fraction of the axis span.
const WIDTH_FRACTION: f64 = 0.05;
/// Fraction of points on each end of the axis treated as background.
const TAIL_FRACTION: f64 = 0.1;

/// Cross-correlation shape of the two pulses.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PulseShape {
    /// `sech^2(u)`
    #[default]
    Sech2,
    /// `exp(-u^2)`
    Gaussian,
}

impl PulseShape {
    /// Unit-height shape at reduced coordinate `u = (t - center) / width`.
    pub fn unit(self, u: f64) -> f64 {
        match self {
            PulseShape::Sech2 => {
                let c = u.cosh();
                1.0 / (c * c)
            }
            PulseShape::Gaussian => (-u * u).exp(),
        }
    }

    fn unit_derivative(self, u: f64) -> f64 {
        match self {
            PulseShape::Sech2 => -2.0 * self.unit(u) * u.tanh(),
            PulseShape::Gaussian => -2.0 * u * self.unit(u),
        }
    }

    /// `a * shape((t - center) / width) + offset`
    pub fn eval(self, t: f64, amplitude: f64, center: f64, width: f64, offset: f64) -> f64 {
        amplitude * self.unit((t - center) / width) + offset
    }

    /// Ratio between full width at half maximum and the width parameter.
    pub fn fwhm_factor(self) -> f64 {
        match self {
            // 2 * acosh(sqrt(2))
            PulseShape::Sech2 => 2.0 * std::f64::consts::SQRT_2.acosh(),
            // 2 * sqrt(ln 2)
            PulseShape::Gaussian => 2.0 * std::f64::consts::LN_2.sqrt(),
        }
    }
}

/// Parameters are `[amplitude, center, width, offset]`.
struct PulseModel(PulseShape);

impl Model<4> for PulseModel {
    fn eval(&self, t: f64, p: &[f64; 4]) -> f64 {
        self.0.eval(t, p[0], p[1], p[2], p[3])
    }

    fn gradient(&self, t: f64, p: &[f64; 4]) -> [f64; 4] {
        let [a, x0, w, _] = *p;
        let u = (t - x0) / w;
        let s = self.0.unit(u);
        let ds = self.0.unit_derivative(u);
        [s, -a * ds / w, -a * ds * u / w, 1.0]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    pub shape: PulseShape,
    pub amplitude: f64,
    pub center: f64,
    pub width: f64,
    pub fwhm: f64,
    pub offset: f64,
    /// Covariance of `[amplitude, center, width, offset]`.
    pub covariance: Array2<f64>,
    /// Standard errors of `[amplitude, center, fwhm, offset]`.
    pub std_errors: [f64; 4],
    pub chi2: f64,
    pub iterations: usize,
    pub time: Array1<f64>,
    pub curve: Array1<f64>,
}

impl FitResult {
    /// `[amplitude, center, fwhm, offset]`
    pub fn params(&self) -> [f64; 4] {
        [self.amplitude, self.center, self.fwhm, self.offset]
    }
}

/// Guess `[amplitude, center, width, offset]` from the data: the peak position is the
/// argmax, the background is the mean of both tails.
pub fn initial_guess(time: &[f64], values: &[f64]) -> Option<[f64; 4]> {
    let n = time.len();
    if n == 0 {
        return None;
    }
    let (peak_index, &peak) = values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    let tail = ((n as f64 * TAIL_FRACTION) as usize).max(1);
    let tails: Vec<_> = values[..tail.min(n)]
        .iter()
        .chain(&values[n.saturating_sub(tail)..])
        .collect();
    let tail_mean = tails.iter().copied().sum::<f64>() / tails.len() as f64;
    let span = time[n - 1] - time[0];
    Some([
        peak - tail_mean,
        time[peak_index],
        span * WIDTH_FRACTION,
        tail_mean,
    ])
}

/// Fits the pulse shape to a curve. NaN bins are ignored.
#[instrument(level = "debug", skip(time, values), fields(n = time.len()), err)]
pub fn fit_pulse(
    time: ArrayView1<f64>,
    values: ArrayView1<f64>,
    shape: PulseShape,
    setup: &LmSetup,
) -> Result<FitResult> {
    let _timing = timing::start("fit_pulse");
    let (t, y): (Vec<_>, Vec<_>) = time
        .iter()
        .zip(values.iter())
        .filter(|(t, y)| t.is_finite() && y.is_finite())
        .map(|(&t, &y)| (t, y))
        .unzip();

    let guess = initial_guess(&t, &y)
        .ok_or_else(|| Error::FitConvergence("no valid points".to_owned()))?;
    if guess[2] <= 0.0 {
        return Err(Error::FitConvergence("degenerate time axis".to_owned()));
    }
    debug!(?guess);

    let model = PulseModel(shape);
    let outcome = levenberg_marquardt(&model, &t, &y, guess, setup)?;
    let [amplitude, center, width, offset] = outcome.params;
    if width == 0.0 {
        return Err(Error::FitConvergence("zero width".to_owned()));
    }
    // The model is symmetric in the sign of the width.
    let width = width.abs();

    let covariance = Array2::from_shape_fn((4, 4), |(i, j)| outcome.covariance[(i, j)]);
    let sigma = |i: usize| covariance[(i, i)].max(0.0).sqrt();
    let fwhm_factor = shape.fwhm_factor();
    let time = time.to_owned();
    let curve = time.mapv(|t| shape.eval(t, amplitude, center, width, offset));

    Ok(FitResult {
        shape,
        amplitude,
        center,
        width,
        fwhm: width * fwhm_factor,
        offset,
        std_errors: [sigma(0), sigma(1), sigma(2) * fwhm_factor, sigma(3)],
        covariance,
        chi2: outcome.chi2,
        iterations: outcome.iterations,
        time,
        curve,
    })
}
