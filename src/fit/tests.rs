use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::Array1;

use super::*;

fn axis() -> Array1<f64> {
    Array1::linspace(-1.0, 1.0, 401)
}

fn synthesize(shape: PulseShape, params: [f64; 4]) -> (Array1<f64>, Array1<f64>) {
    let [a, x0, w, c] = params;
    let t = axis();
    let y = t.mapv(|t| shape.eval(t, a, x0, w, c));
    (t, y)
}

#[test]
fn test_fwhm_factor() {
    for shape in [PulseShape::Sech2, PulseShape::Gaussian] {
        let half = shape.fwhm_factor() / 2.0;
        assert_relative_eq!(shape.unit(half), 0.5, max_relative = 1e-12);
        assert_relative_eq!(shape.unit(-half), 0.5, max_relative = 1e-12);
    }
    assert_relative_eq!(PulseShape::Sech2.fwhm_factor(), 1.7627471740390861);
    assert_relative_eq!(PulseShape::Gaussian.fwhm_factor(), 1.6651092223153954);
}

#[test]
fn test_initial_guess() {
    let (t, y) = synthesize(PulseShape::Sech2, [2.0, 0.3, 0.05, 0.5]);
    let [a, x0, w, c] = initial_guess(t.as_slice().unwrap(), y.as_slice().unwrap()).unwrap();
    assert_relative_eq!(x0, 0.3, epsilon = 1e-9);
    assert_relative_eq!(c, 0.5, max_relative = 1e-6);
    assert_relative_eq!(a, 2.0, max_relative = 1e-6);
    assert_relative_eq!(w, 2.0 * WIDTH_FRACTION, max_relative = 1e-12);
    assert!(initial_guess(&[], &[]).is_none());
}

#[test]
fn test_fit_sech2_exact() {
    let truth = [1.3, 0.02, 0.1, 0.05];
    let (t, y) = synthesize(PulseShape::Sech2, truth);
    let fit = fit_pulse(t.view(), y.view(), PulseShape::Sech2, &LmSetup::default()).unwrap();
    assert_relative_eq!(fit.amplitude, 1.3, max_relative = 1e-6);
    assert_abs_diff_eq!(fit.center, 0.02, epsilon = 1e-8);
    assert_relative_eq!(fit.width, 0.1, max_relative = 1e-6);
    assert_relative_eq!(fit.fwhm, 0.1 * PulseShape::Sech2.fwhm_factor(), max_relative = 1e-6);
    assert_abs_diff_eq!(fit.offset, 0.05, epsilon = 1e-8);
    assert_eq!(fit.curve.len(), t.len());
    assert_eq!(fit.covariance.dim(), (4, 4));
    assert_relative_eq!(fit.params()[2], fit.fwhm);
}

#[test]
fn test_fit_gaussian_with_noise() {
    let truth = [0.8, -0.1, 0.15, 0.0];
    let (t, mut y) = synthesize(PulseShape::Gaussian, truth);
    // Deterministic pseudo-noise.
    y.iter_mut()
        .enumerate()
        .for_each(|(i, y)| *y += 0.01 * ((i * 7919) % 13) as f64 / 13.0 - 0.005);
    let fit = fit_pulse(t.view(), y.view(), PulseShape::Gaussian, &LmSetup::default()).unwrap();
    assert_relative_eq!(fit.amplitude, 0.8, max_relative = 0.02);
    assert_abs_diff_eq!(fit.center, -0.1, epsilon = 0.005);
    assert_relative_eq!(fit.width, 0.15, max_relative = 0.02);
    assert!(fit.std_errors.iter().all(|e| e.is_finite() && *e > 0.0));
}

#[test]
fn test_nan_bins_ignored() {
    let (t, mut y) = synthesize(PulseShape::Sech2, [1.0, 0.0, 0.1, 0.0]);
    y.iter_mut().step_by(3).for_each(|y| *y = f64::NAN);
    let fit = fit_pulse(t.view(), y.view(), PulseShape::Sech2, &LmSetup::default()).unwrap();
    assert_relative_eq!(fit.amplitude, 1.0, max_relative = 1e-6);
    assert_relative_eq!(fit.width, 0.1, max_relative = 1e-6);
    // The curve is still sampled on the whole axis.
    assert_eq!(fit.curve.len(), t.len());
}

#[test]
fn test_fit_failures() {
    let t = axis();
    let nan = Array1::from_elem(t.len(), f64::NAN);
    assert!(matches!(
        fit_pulse(t.view(), nan.view(), PulseShape::Sech2, &LmSetup::default()),
        Err(Error::FitConvergence(_))
    ));

    let flat = Array1::from_elem(t.len(), 0.3);
    assert!(matches!(
        fit_pulse(t.view(), flat.view(), PulseShape::Sech2, &LmSetup::default()),
        Err(Error::FitConvergence(_))
    ));

    let few = Array1::from(vec![0.0, 1.0, 0.0]);
    assert!(matches!(
        fit_pulse(
            few.view(),
            few.view(),
            PulseShape::Gaussian,
            &LmSetup::default()
        ),
        Err(Error::FitConvergence(_))
    ));
}
