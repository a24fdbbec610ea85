use super::pool::WorkerId;
use crate::{
    error::Result,
    fit::{FitResult, PulseShape},
    project::ProjectedCurve,
};

/// Completion message of a processor. `generation` is the manager's generation at
/// dispatch time; results from an older generation are stale.
pub enum Output {
    Project {
        worker: WorkerId,
        generation: u64,
        curve: Result<ProjectedCurve>,
    },
    Fit {
        worker: WorkerId,
        generation: u64,
        shape: PulseShape,
        fit: Result<FitResult>,
    },
}
