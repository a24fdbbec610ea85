use std::{fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    daq::{AcquisitionMode, ChannelSpec, OverflowPolicy, SimulationParam, Trigger},
    error::{Error, Result},
    fit::PulseShape,
    project::{CalibrationParameters, ProjectionParam, Smoothing},
    state::{AveragePolicy, ManagerSetting},
};

#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingMethod {
    #[default]
    None,
    SineFit,
    LowPass,
}

/// Configuration of one acquisition session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Samples per chunk.
    pub n_samples: usize,
    pub n_processors: usize,
    /// Depth of the running average.
    pub n_averages: usize,
    pub dark_control: bool,
    /// Raw-unit quantization of the position channel.
    pub shaker_position_step: f64,
    /// Delay per position step, in picoseconds.
    pub shaker_ps_per_step: f64,
    pub acquisition_mode: AcquisitionMode,
    /// Forces the simulated mode.
    pub simulate: bool,
    pub sample_rate: f64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub fit_enabled: bool,
    pub fit_shape: PulseShape,
    pub average_policy: AveragePolicy,
    pub normalize_to_reference: bool,
    pub smoothing: SmoothingMethod,
    /// Low-pass cutoff as a fraction of the Nyquist frequency.
    pub smoothing_cutoff: f64,
    pub smoothing_order: usize,
    /// One mechanical shaker cycle, in samples.
    pub shaker_period_samples: f64,
    pub event_capacity: usize,
    pub channels: ChannelSpec,
    pub trigger: Option<Trigger>,
    pub simulation: SimulationParam,
}

impl Default for Config {
    fn default() -> Self {
        let calibration = CalibrationParameters::default();
        Config {
            n_samples: 30000,
            n_processors: 4,
            n_averages: 10,
            dark_control: true,
            shaker_position_step: calibration.step_size,
            shaker_ps_per_step: calibration.ps_per_step,
            acquisition_mode: AcquisitionMode::Continuous,
            simulate: false,
            sample_rate: 273000.0,
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            fit_enabled: true,
            fit_shape: PulseShape::Sech2,
            average_policy: AveragePolicy::Strict,
            normalize_to_reference: false,
            smoothing: SmoothingMethod::None,
            smoothing_cutoff: 0.01,
            smoothing_order: 2,
            shaker_period_samples: 30000.0,
            event_capacity: 64,
            channels: ChannelSpec::default(),
            trigger: None,
            simulation: SimulationParam::default(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid value of {key}: {value}")))
}

/// Enum values are written the same way as in the toml file.
fn parse_enum<T: for<'de> Deserialize<'de>>(key: &str, value: &str) -> Result<T> {
    T::deserialize(serde::de::value::StrDeserializer::<serde::de::value::Error>::new(
        value.trim(),
    ))
    .map_err(|_| Error::Configuration(format!("invalid value of {key}: {value}")))
}

impl Config {
    #[instrument(level = "debug", skip_all, fields(path = ?path.as_ref()), err)]
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from a flat key-value lookup, unknown keys are rejected.
    /// `simulation.*` keys address the simulator table.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Config>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Config::default();
        for (key, value) in pairs {
            match key.trim() {
                "n_samples" => config.n_samples = parse(key, value)?,
                "n_processors" => config.n_processors = parse(key, value)?,
                "n_averages" => config.n_averages = parse(key, value)?,
                "dark_control" => config.dark_control = parse(key, value)?,
                "shaker_position_step" => config.shaker_position_step = parse(key, value)?,
                "shaker_ps_per_step" => config.shaker_ps_per_step = parse(key, value)?,
                "acquisition_mode" => config.acquisition_mode = parse_enum(key, value)?,
                "simulate" => config.simulate = parse(key, value)?,
                "sample_rate" => config.sample_rate = parse(key, value)?,
                "queue_capacity" => config.queue_capacity = parse(key, value)?,
                "overflow_policy" => config.overflow_policy = parse_enum(key, value)?,
                "fit_enabled" => config.fit_enabled = parse(key, value)?,
                "fit_shape" => config.fit_shape = parse_enum(key, value)?,
                "average_policy" => config.average_policy = parse_enum(key, value)?,
                "normalize_to_reference" => config.normalize_to_reference = parse(key, value)?,
                "smoothing" => config.smoothing = parse_enum(key, value)?,
                "smoothing_cutoff" => config.smoothing_cutoff = parse(key, value)?,
                "smoothing_order" => config.smoothing_order = parse(key, value)?,
                "shaker_period_samples" => config.shaker_period_samples = parse(key, value)?,
                "event_capacity" => config.event_capacity = parse(key, value)?,
                "simulation.shape" => config.simulation.shape = parse_enum(key, value)?,
                "simulation.amplitude" => config.simulation.amplitude = parse(key, value)?,
                "simulation.center" => config.simulation.center = parse(key, value)?,
                "simulation.width" => config.simulation.width = parse(key, value)?,
                "simulation.offset" => config.simulation.offset = parse(key, value)?,
                "simulation.noise" => config.simulation.noise = parse(key, value)?,
                "simulation.position_amplitude" => {
                    config.simulation.position_amplitude = parse(key, value)?
                }
                "simulation.position_offset" => {
                    config.simulation.position_offset = parse(key, value)?
                }
                "simulation.seed" => config.simulation.seed = Some(parse(key, value)?),
                _ => return Err(Error::Configuration(format!("unknown key: {key}"))),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("n_samples", self.n_samples),
            ("queue_capacity", self.queue_capacity),
            ("event_capacity", self.event_capacity),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{key} can not be zero")));
            }
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(Error::Configuration(format!(
                "invalid sample rate: {}",
                self.sample_rate
            )));
        }
        if !(self.shaker_period_samples.is_finite() && self.shaker_period_samples > 0.0) {
            return Err(Error::Configuration(format!(
                "invalid shaker period: {}",
                self.shaker_period_samples
            )));
        }
        if self.acquisition_mode() == AcquisitionMode::Triggered && self.trigger.is_none() {
            return Err(Error::Configuration(
                "triggered mode needs a trigger".to_owned(),
            ));
        }
        self.manager_setting().validate()
    }

    /// `simulate` overrides the configured mode.
    pub fn acquisition_mode(&self) -> AcquisitionMode {
        if self.simulate {
            AcquisitionMode::Simulated
        } else {
            self.acquisition_mode
        }
    }

    pub fn calibration(&self) -> CalibrationParameters {
        CalibrationParameters {
            step_size: self.shaker_position_step,
            ps_per_step: self.shaker_ps_per_step,
        }
    }

    pub fn smoothing(&self) -> Smoothing {
        match self.smoothing {
            SmoothingMethod::None => Smoothing::None,
            SmoothingMethod::SineFit => Smoothing::SineFit {
                period_samples: self.shaker_period_samples,
            },
            SmoothingMethod::LowPass => Smoothing::LowPass {
                cutoff: self.smoothing_cutoff,
                order: self.smoothing_order,
            },
        }
    }

    pub fn projection_param(&self) -> ProjectionParam {
        ProjectionParam {
            calibration: self.calibration(),
            dark_control: self.dark_control,
            normalize_to_reference: self.normalize_to_reference,
            smoothing: self.smoothing(),
        }
    }

    pub fn manager_setting(&self) -> ManagerSetting {
        ManagerSetting {
            n_processors: self.n_processors,
            n_averages: self.n_averages,
            average_policy: self.average_policy,
            projection: self.projection_param(),
            fit_enabled: self.fit_enabled,
            fit_shape: self.fit_shape,
        }
    }

    /// Simulator parameters, the shaker cycle follows `shaker_period_samples`.
    pub fn simulation_param(&self) -> SimulationParam {
        SimulationParam {
            period_samples: self.shaker_period_samples,
            ..self.simulation
        }
    }
}
