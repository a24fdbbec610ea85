pub mod config;
pub mod daq;
pub mod error;
pub mod event;
pub mod fit;
pub mod pipeline;
pub mod project;
pub mod request;
pub mod save;
pub mod state;
mod util;

pub use config::Config;
pub use daq::{AcquisitionDevice, AcquisitionMode, RawChunk, Simulator};
pub use error::{Error, Result};
pub use event::{Event, EventSender};
pub use fit::{fit_pulse, FitResult, PulseShape};
pub use pipeline::Pipeline;
pub use project::{project, CalibrationParameters, ProjectedCurve, ProjectionParam};
pub use state::{RunningAverage, Status};

pub fn init() {
    util::log::init();
}
