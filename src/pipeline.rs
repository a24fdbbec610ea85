use std::{fmt::Debug, path::PathBuf, sync::Arc, thread::JoinHandle};

use anyhow::anyhow;
use crossbeam::channel::{bounded, Sender};
use function_name::named;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

use crate::{
    config::Config,
    daq::{AcquisitionDevice, AcquisitionMode, Simulator, Streamer, StreamerHandle, WorkQueue},
    error::{Error, Result},
    event::EventSender,
    fit::FitResult,
    request::{Request, Responder},
    state::{Manager, Numerics, Processor, RunningAverage, Status},
};

const REQUEST_CAPACITY: usize = 16;

/// Streamer → work queue → processor pool → manager, running in their own threads.
pub struct Pipeline {
    streamer: Option<StreamerHandle>,
    manager: Option<JoinHandle<()>>,
    request_sender: Sender<Request>,
}

impl Pipeline {
    pub fn start<D: AcquisitionDevice + 'static>(
        config: &Config,
        device: D,
        events: EventSender,
    ) -> Result<Pipeline> {
        Pipeline::start_with_processor(config, device, Arc::new(Numerics::default()), events)
    }

    /// Real-time simulated session built from the `simulation` table.
    pub fn start_simulated(config: &Config, events: EventSender) -> Result<Pipeline> {
        let simulator = Simulator::new(config.simulation_param(), config.calibration(), true);
        Pipeline::start(config, simulator, events)
    }

    /// The manager and its pool come up before the streamer delivers anything.
    #[instrument(level = "info", skip_all, fields(mode = ?config.acquisition_mode()), err)]
    pub fn start_with_processor<D: AcquisitionDevice + 'static>(
        config: &Config,
        device: D,
        processor: Arc<dyn Processor>,
        events: EventSender,
    ) -> Result<Pipeline> {
        config.validate()?;
        let queue = WorkQueue::new(config.queue_capacity, config.overflow_policy);
        let (request_sender, request_receiver) = bounded(REQUEST_CAPACITY);
        let manager = Manager::new(
            config.manager_setting(),
            queue.clone(),
            processor,
            events.clone(),
        )?
        .spawn(request_receiver)?;

        let trigger = match config.acquisition_mode() {
            AcquisitionMode::Triggered => config.trigger.clone(),
            AcquisitionMode::Continuous | AcquisitionMode::Simulated => None,
        };
        let streamer = Streamer {
            device,
            channels: config.channels.clone(),
            sample_rate: config.sample_rate,
            trigger,
            n_samples: config.n_samples,
            queue,
            events,
        }
        .spawn()?;
        info!("pipeline started");

        Ok(Pipeline {
            streamer: Some(streamer),
            manager: Some(manager),
            request_sender,
        })
    }

    /// For the async helpers of [`crate::request`].
    pub fn request_sender(&self) -> &Sender<Request> {
        &self.request_sender
    }

    /// `false` once stopped, or after a fatal device error.
    pub fn is_streaming(&self) -> bool {
        self.streamer
            .as_ref()
            .map_or(false, |streamer| !streamer.is_finished())
    }

    /// Stops the streamer and waits for it. Returns the number of chunks streamed.
    pub fn stop_streaming(&mut self) -> Result<u64> {
        match self.streamer.take() {
            Some(streamer) => streamer.join(),
            None => Ok(0),
        }
    }

    fn call<T: Debug>(
        &self,
        name: &str,
        make_request: impl FnOnce(Responder<T>) -> Request,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.request_sender
            .send(make_request(Responder::new(name, tx)))
            .map_err(|_| Error::Disconnected)?;
        rx.blocking_recv()?
    }

    #[named]
    pub fn status(&self) -> anyhow::Result<Status> {
        self.call(function_name!(), |responder| Request::GetStatus { responder })
    }

    #[named]
    pub fn running_average(&self) -> anyhow::Result<Option<Arc<RunningAverage>>> {
        self.call(function_name!(), |responder| Request::GetRunningAverage {
            responder,
        })
    }

    #[named]
    pub fn fit_result(&self) -> anyhow::Result<Option<Arc<FitResult>>> {
        self.call(function_name!(), |responder| Request::GetFitResult { responder })
    }

    #[named]
    pub fn save(&self, save_dir: PathBuf) -> anyhow::Result<PathBuf> {
        self.call(function_name!(), |responder| Request::Save {
            save_dir,
            responder,
        })
    }

    /// Tears down in order: the streamer first, then the manager drains and joins the
    /// processors. Returns the final counters.
    #[named]
    pub fn shutdown(mut self) -> anyhow::Result<Status> {
        match self.stop_streaming() {
            Ok(chunks) => info!(chunks, "streamer joined"),
            // Already reported as an error event when it happened.
            Err(e) => warn!(%e, "streamer ended with error"),
        }
        let status = self.call(function_name!(), |responder| Request::Shutdown {
            responder,
        })?;
        if let Some(manager) = self.manager.take() {
            manager.join().map_err(|_| anyhow!("manager panicked"))?;
        }
        info!(?status, "pipeline shut down");
        Ok(status)
    }
}

impl Drop for Pipeline {
    /// Without an explicit shutdown the streamer is told to stop, the manager follows
    /// once the request channel closes.
    fn drop(&mut self) {
        if let Some(streamer) = &self.streamer {
            streamer.stop();
        }
    }
}
