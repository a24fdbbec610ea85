//! Smoothing of the position channel before binning.
//!
//! Noise on the shaker position read-back moves samples into neighbouring bins.
//! Two remedies are offered: fit one sinusoid to the whole chunk, or run a
//! zero-phase Butterworth low-pass over it.

use std::{borrow::Cow, f64::consts::PI};

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::{Error, Result},
    fit::lm::{levenberg_marquardt, LmSetup, Model},
};

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Smoothing {
    #[default]
    None,
    /// Replace the trace by `a * sin(w * i + phi) + c`.
    SineFit {
        /// Initial guess of the shaker period in samples.
        period_samples: f64,
    },
    /// Forward-backward Butterworth low-pass.
    LowPass {
        /// Cutoff as a fraction of the Nyquist frequency, in (0, 1).
        cutoff: f64,
        order: usize,
    },
}

impl Smoothing {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Smoothing::None => Ok(()),
            Smoothing::SineFit { period_samples } => {
                if !(period_samples.is_finite() && period_samples > 0.0) {
                    return Err(Error::Configuration(format!(
                        "invalid shaker period: {period_samples}"
                    )));
                }
                Ok(())
            }
            Smoothing::LowPass { cutoff, order } => {
                if !(cutoff > 0.0 && cutoff < 1.0) {
                    return Err(Error::Configuration(format!(
                        "cutoff must belong to (0, 1): {cutoff}"
                    )));
                }
                if order == 0 {
                    return Err(Error::Configuration("filter order can not be zero".to_owned()));
                }
                Ok(())
            }
        }
    }
}

pub fn smooth(position: &Array1<f64>, smoothing: Smoothing) -> Result<Cow<'_, Array1<f64>>> {
    match smoothing {
        Smoothing::None => Ok(Cow::Borrowed(position)),
        Smoothing::SineFit { period_samples } => {
            fit_sine(position, period_samples).map(Cow::Owned)
        }
        Smoothing::LowPass { cutoff, order } => {
            let filter = Butterworth::lowpass(cutoff, order);
            Ok(Cow::Owned(filter.filtfilt(position.as_slice().ok_or_else(
                || Error::Projection("position channel not contiguous".to_owned()),
            )?)))
        }
    }
}

/// Parameters are `[amplitude, angular frequency, phase, offset]`, x is the sample index.
struct Sine;

impl Model<4> for Sine {
    fn eval(&self, x: f64, p: &[f64; 4]) -> f64 {
        p[0] * (p[1] * x + p[2]).sin() + p[3]
    }

    fn gradient(&self, x: f64, p: &[f64; 4]) -> [f64; 4] {
        let (s, c) = (p[1] * x + p[2]).sin_cos();
        [s, p[0] * x * c, p[0] * c, 1.0]
    }
}

#[instrument(level = "trace", skip(position), err)]
fn fit_sine(position: &Array1<f64>, period_samples: f64) -> Result<Array1<f64>> {
    let n = position.len();
    if n < 5 {
        return Err(Error::Projection(format!("too few samples to fit: {n}")));
    }
    let (lo, hi) = position
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| {
            (lo.min(p), hi.max(p))
        });
    let amplitude = (hi - lo) / 2.0;
    let offset = (hi + lo) / 2.0;
    if !(amplitude.is_finite() && amplitude > 0.0) {
        return Err(Error::Projection(format!(
            "degenerate position range: [{lo}, {hi}]"
        )));
    }
    let omega = 2.0 * PI / period_samples;
    // Phase from the first sample, the slope decides which branch of asin.
    let s0 = ((position[0] - offset) / amplitude).clamp(-1.0, 1.0);
    let mut phase = s0.asin();
    if position[(n / 100).max(1)] < position[0] {
        phase = PI - phase;
    }

    let x: Vec<_> = (0..n).map(|i| i as f64).collect();
    let y = position.to_vec();
    let outcome = levenberg_marquardt(
        &Sine,
        &x,
        &y,
        [amplitude, omega, phase, offset],
        &LmSetup::default(),
    )
    .map_err(|e| Error::Projection(format!("position sine fit: {e}")))?;

    Ok(Array1::from_shape_fn(n, |i| Sine.eval(i as f64, &outcome.params)))
}

/// `H(z) = (b0 + b1 z^-1 + b2 z^-2) / (1 + a1 z^-1 + a2 z^-2)`
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Direct form II transposed.
    #[inline]
    fn process(&self, state: &mut [f64; 2], input: f64) -> f64 {
        let output = self.b0 * input + state[0];
        state[0] = self.b1 * input - self.a1 * output + state[1];
        state[1] = self.b2 * input - self.a2 * output;
        output
    }

    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// State in which a constant input `x` passes through without transient.
    fn steady_state(&self, x: f64) -> [f64; 2] {
        let y = self.dc_gain() * x;
        let z1 = self.b2 * x - self.a2 * y;
        let z0 = self.b1 * x - self.a1 * y + z1;
        [z0, z1]
    }
}

/// Butterworth low-pass as cascaded second-order sections.
#[derive(Debug, Clone)]
pub(crate) struct Butterworth {
    sections: Vec<Biquad>,
}

impl Butterworth {
    /// `cutoff` is a fraction of the Nyquist frequency.
    pub(crate) fn lowpass(cutoff: f64, order: usize) -> Butterworth {
        // Prewarp for the bilinear transform.
        let wn = (PI * cutoff / 2.0).tan();
        let wn2 = wn * wn;
        let mut sections = Vec::with_capacity((order + 1) / 2);

        for k in 0..order / 2 {
            // Analog section s^2 + b * wn * s + wn^2.
            let b = 2.0 * (PI * (2 * k + 1) as f64 / (2 * order) as f64).sin();
            let d = 1.0 + b * wn + wn2;
            sections.push(Biquad {
                b0: wn2 / d,
                b1: 2.0 * wn2 / d,
                b2: wn2 / d,
                a1: 2.0 * (wn2 - 1.0) / d,
                a2: (1.0 - b * wn + wn2) / d,
            });
        }
        if order % 2 == 1 {
            let k = wn / (1.0 + wn);
            sections.push(Biquad {
                b0: k,
                b1: k,
                b2: 0.0,
                a1: (wn - 1.0) / (wn + 1.0),
                a2: 0.0,
            });
        }

        Butterworth { sections }
    }

    fn run(&self, signal: &mut [f64]) {
        let Some(&first) = signal.first() else {
            return;
        };
        let mut input = first;
        let mut states: Vec<_> = self
            .sections
            .iter()
            .map(|section| {
                let state = section.steady_state(input);
                input *= section.dc_gain();
                state
            })
            .collect();
        for sample in signal.iter_mut() {
            *sample = self
                .sections
                .iter()
                .zip(&mut states)
                .fold(*sample, |x, (section, state)| section.process(state, x));
        }
    }

    /// Zero-phase filtering: forward pass, backward pass, with odd reflection at both
    /// ends to suppress edge transients.
    pub(crate) fn filtfilt(&self, signal: &[f64]) -> Array1<f64> {
        let n = signal.len();
        if n < 2 {
            return Array1::from(signal.to_vec());
        }
        let pad = (3 * (2 * self.sections.len() + 1)).min(n - 1);
        let (first, last) = (signal[0], signal[n - 1]);

        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
        ext.extend_from_slice(signal);
        ext.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

        self.run(&mut ext);
        ext.reverse();
        self.run(&mut ext);
        ext.reverse();

        Array1::from(ext[pad..pad + n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_lowpass_passes_dc() {
        let filter = Butterworth::lowpass(0.1, 4);
        let out = filter.filtfilt(&[2.5; 200]);
        out.iter().for_each(|&v| assert_abs_diff_eq!(v, 2.5, epsilon = 1e-9));
    }

    #[test]
    fn test_lowpass_odd_order_passes_dc() {
        let filter = Butterworth::lowpass(0.2, 3);
        let out = filter.filtfilt(&[-1.0; 100]);
        out.iter().for_each(|&v| assert_abs_diff_eq!(v, -1.0, epsilon = 1e-9));
    }

    #[test]
    fn test_lowpass_removes_alternating_noise() {
        let n = 2000;
        let clean: Vec<_> = (0..n)
            .map(|i| (2.0 * PI * i as f64 / 1000.0).sin())
            .collect();
        let noisy: Vec<_> = clean
            .iter()
            .enumerate()
            .map(|(i, v)| v + if i % 2 == 0 { 0.05 } else { -0.05 })
            .collect();
        let out = Butterworth::lowpass(0.05, 2).filtfilt(&noisy);
        // Away from the edges the Nyquist-rate noise is gone and the phase is kept.
        for i in 100..n - 100 {
            assert_abs_diff_eq!(out[i], clean[i], epsilon = 5e-3);
        }
    }

    #[test]
    fn test_sine_fit_recovers_trace() {
        let n = 3000;
        let truth = |i: usize| 0.8 * (2.0 * PI * i as f64 / 2900.0 + 0.3).sin() + 0.1;
        let position = Array1::from_shape_fn(n, |i| {
            truth(i) + if i % 3 == 0 { 1e-3 } else { -5e-4 }
        });
        let smoothed = fit_sine(&position, 3000.0).unwrap();
        for i in 0..n {
            assert_abs_diff_eq!(smoothed[i], truth(i), epsilon = 2e-3);
        }
    }

    #[test]
    fn test_sine_fit_degenerate() {
        let position = Array1::from_elem(100, 1.0);
        assert!(matches!(
            fit_sine(&position, 30.0).unwrap_err(),
            Error::Projection(_)
        ));
    }

    #[test]
    fn test_validate() {
        let low_pass = |cutoff, order| Smoothing::LowPass { cutoff, order };
        assert!(low_pass(1.5, 2).validate().is_err());
        assert!(low_pass(0.5, 0).validate().is_err());
        assert!(low_pass(0.5, 2).validate().is_ok());
        let sine_fit = Smoothing::SineFit {
            period_samples: -1.0,
        };
        assert!(sine_fit.validate().is_err());
    }
}
