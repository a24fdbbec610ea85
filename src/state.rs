mod average;
mod handle;
mod output;
mod pool;
#[cfg(test)]
mod tests;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::info;

pub use average::{AlignedCurves, AveragePolicy, History, RunningAverage};
pub use output::Output;
pub use pool::{Job, Numerics, Pool, Processor, ProcessorSlot, WorkerId};

use crate::{
    daq::WorkQueue,
    error::{Error, Result},
    event::EventSender,
    fit::{FitResult, PulseShape},
    project::ProjectionParam,
    request::Request,
};

/// Live-tunable settings of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ManagerSetting {
    pub n_processors: usize,
    /// Average depth K.
    pub n_averages: usize,
    pub average_policy: AveragePolicy,
    pub projection: ProjectionParam,
    pub fit_enabled: bool,
    pub fit_shape: PulseShape,
}

impl Default for ManagerSetting {
    fn default() -> Self {
        ManagerSetting {
            n_processors: 4,
            n_averages: 10,
            average_policy: AveragePolicy::default(),
            projection: ProjectionParam {
                dark_control: true,
                ..Default::default()
            },
            fit_enabled: true,
            fit_shape: PulseShape::default(),
        }
    }
}

impl ManagerSetting {
    pub fn validate(&self) -> Result<()> {
        if self.n_processors == 0 {
            return Err(Error::Configuration("processor count can not be zero".to_owned()));
        }
        if self.n_averages == 0 {
            return Err(Error::Configuration("average depth can not be zero".to_owned()));
        }
        self.projection.calibration.validate()?;
        self.projection.smoothing.validate()
    }
}

/// Counters and occupancy of the pipeline at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    pub generation: u64,
    /// Chunks taken from the work queue.
    pub chunks_received: u64,
    /// Chunks evicted from the work queue on overflow.
    pub chunks_dropped: u64,
    pub chunks_projected: u64,
    pub chunks_failed: u64,
    /// Curves discarded on arrival because a reconfiguration happened meanwhile.
    pub chunks_stale: u64,
    pub fits_succeeded: u64,
    pub fits_failed: u64,
    pub history_len: usize,
    pub average_depth: usize,
    pub queue_len: usize,
    pub n_processors: usize,
    pub busy_processors: usize,
    pub fit_in_flight: bool,
}

/// The aggregator: the single owner of every piece of cross-chunk state. Processors
/// only ever see immutable snapshots travelling with their jobs.
pub struct Manager {
    setting: ManagerSetting,
    /// Bumped whenever results computed so far become invalid.
    generation: u64,
    history: History,
    fit_result: Option<Arc<FitResult>>,
    /// Newest average waiting for a processor while another fit runs.
    pending_fit: Option<Arc<RunningAverage>>,
    fit_in_flight: bool,
    pool: Pool,
    processor: Arc<dyn Processor>,
    queue: WorkQueue,
    output_sender: Sender<Output>,
    output_receiver: Receiver<Output>,
    events: EventSender,
    counters: Status,
}

impl Manager {
    pub fn new(
        setting: ManagerSetting,
        queue: WorkQueue,
        processor: Arc<dyn Processor>,
        events: EventSender,
    ) -> Result<Manager> {
        setting.validate()?;
        let (output_sender, output_receiver) = unbounded();
        let pool = Pool::launch(0, setting.n_processors, &processor, &output_sender)?;
        Ok(Manager {
            setting,
            generation: 0,
            history: History::new(setting.n_averages, setting.average_policy),
            fit_result: None,
            pending_fit: None,
            fit_in_flight: false,
            pool,
            processor,
            queue,
            output_sender,
            output_receiver,
            events,
            counters: Status::default(),
        })
    }

    pub fn setting(&self) -> &ManagerSetting {
        &self.setting
    }

    pub fn status(&self) -> Status {
        Status {
            generation: self.generation,
            chunks_dropped: self.queue.dropped(),
            history_len: self.history.len(),
            average_depth: self.history.depth(),
            queue_len: self.queue.len(),
            n_processors: self.pool.len(),
            busy_processors: self.pool.busy(),
            fit_in_flight: self.fit_in_flight,
            ..self.counters
        }
    }

    pub fn run(mut self, request_receiver: Receiver<Request>) {
        while self.handle(&request_receiver).is_continue() {}
        info!("exit main loop");
    }

    pub fn spawn(self, request_receiver: Receiver<Request>) -> Result<JoinHandle<()>> {
        let join_handle = thread::Builder::new()
            .name("manager".to_owned())
            .spawn(move || self.run(request_receiver))?;
        Ok(join_handle)
    }
}
