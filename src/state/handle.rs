use std::{ops::ControlFlow, path::PathBuf, sync::Arc, thread};

use crossbeam::{
    channel::{never, Receiver},
    select,
};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

use super::{Job, Manager, Output, Pool, RunningAverage, Status};
use crate::{
    daq::SharedChunk,
    error::{Error, Result},
    event::Event,
    fit::{FitResult, PulseShape},
    project::{CalibrationParameters, ProjectedCurve, Smoothing},
    request::{Request, Responder},
    save::{self, Setting, Snapshot},
};

impl Manager {
    /// `handle` keeps receiving `Request`s, worker `Output`s and, as long as some
    /// processor is ready, chunks from the work queue. It never blocks on anything else
    /// and never computes: projection, fitting and saving all run in other threads.
    pub fn handle(&mut self, request_receiver: &Receiver<Request>) -> ControlFlow<()> {
        let chunk_receiver = if self.pool.has_ready() {
            self.queue.receiver().clone()
        } else {
            never()
        };
        let output_receiver = self.output_receiver.clone();
        select! {
            recv(request_receiver) -> request => match request {
                Ok(request) => self.handle_request(request),
                Err(_) => {
                    info!("request channel closed");
                    self.drain();
                    ControlFlow::Break(())
                }
            },
            // Both channels keep a sender on this side and can not disconnect.
            recv(output_receiver) -> output => {
                if let Ok(output) = output {
                    self.handle_output(output);
                }
                ControlFlow::Continue(())
            },
            recv(chunk_receiver) -> chunk => {
                if let Ok(chunk) = chunk {
                    self.dispatch_chunk(chunk);
                }
                ControlFlow::Continue(())
            },
        }
    }

    fn handle_request(&mut self, request: Request) -> ControlFlow<()> {
        use Request::*;
        match request {
            Reset { responder } => self.on_reset(responder),
            SetAverageDepth {
                n_averages,
                responder,
            } => self.on_set_average_depth(n_averages, responder),
            SetDarkControl {
                dark_control,
                responder,
            } => self.on_set_dark_control(dark_control, responder),
            SetProcessorCount {
                n_processors,
                responder,
            } => self.on_set_processor_count(n_processors, responder),
            SetFitEnabled {
                fit_enabled,
                responder,
            } => self.on_set_fit_enabled(fit_enabled, responder),
            SetFitShape {
                fit_shape,
                responder,
            } => self.on_set_fit_shape(fit_shape, responder),
            SetCalibration {
                calibration,
                responder,
            } => self.on_set_calibration(calibration, responder),
            SetSmoothing {
                smoothing,
                responder,
            } => self.on_set_smoothing(smoothing, responder),
            GetRunningAverage { responder } => {
                responder.respond_ok_no_result_log(self.history.average().cloned())
            }
            GetFitResult { responder } => {
                responder.respond_ok_no_result_log(self.fit_result.clone())
            }
            GetStatus { responder } => responder.respond_ok(self.status()),
            Save {
                save_dir,
                responder,
            } => self.on_save(save_dir, responder),
            Shutdown { responder } => {
                self.drain();
                responder.respond_ok(self.status());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_output(&mut self, output: Output) {
        match output {
            Output::Project {
                worker,
                generation,
                curve,
            } => {
                self.pool.complete(worker);
                self.on_complete_project(generation, curve);
            }
            Output::Fit {
                worker,
                generation,
                shape,
                fit,
            } => {
                self.pool.complete(worker);
                self.fit_in_flight = false;
                self.on_complete_fit(generation, shape, fit);
            }
        }
        // A processor is free again, a waiting fit goes first.
        self.try_dispatch_fit();
    }

    fn dispatch_chunk(&mut self, chunk: SharedChunk) {
        self.counters.chunks_received += 1;
        let job = Job::Project {
            generation: self.generation,
            chunk,
            param: self.setting.projection,
        };
        if let Err(e) = self.pool.dispatch(job) {
            error!(%e, "failed to dispatch chunk");
            self.counters.chunks_failed += 1;
            self.events.error(e);
        }
    }

    fn on_complete_project(&mut self, generation: u64, curve: Result<ProjectedCurve>) {
        if generation != self.generation {
            self.counters.chunks_stale += 1;
            debug!(generation, current = self.generation, "discard stale curve");
            return;
        }
        match curve {
            Ok(curve) => {
                self.counters.chunks_projected += 1;
                let curve = Arc::new(curve);
                let average = self.history.push(curve.clone());
                self.events.publish(Event::ProjectedCurve(curve));
                self.events.publish(Event::RunningAverage(average.clone()));
                self.schedule_fit(average);
            }
            Err(e) => {
                self.counters.chunks_failed += 1;
                warn!(%e, "chunk dropped");
                self.events.error(e);
            }
        }
    }

    fn on_complete_fit(&mut self, generation: u64, shape: PulseShape, fit: Result<FitResult>) {
        if generation != self.generation
            || shape != self.setting.fit_shape
            || !self.setting.fit_enabled
        {
            debug!(generation, ?shape, "discard outdated fit");
            return;
        }
        match fit {
            Ok(fit) => {
                self.counters.fits_succeeded += 1;
                debug!(
                    amplitude = fit.amplitude,
                    center = fit.center,
                    fwhm = fit.fwhm,
                    offset = fit.offset,
                    "fit converged"
                );
                let fit = Arc::new(fit);
                self.fit_result = Some(fit.clone());
                self.events.publish(Event::FitResult(fit));
            }
            Err(e) => {
                // The previous result stays the visible one.
                self.counters.fits_failed += 1;
                warn!(%e, "fit failed");
                self.events.error(e);
            }
        }
    }

    fn schedule_fit(&mut self, average: Arc<RunningAverage>) {
        if !self.setting.fit_enabled {
            return;
        }
        self.pending_fit = Some(average);
        self.try_dispatch_fit();
    }

    /// At most one fit runs at a time, always on the newest average.
    fn try_dispatch_fit(&mut self) {
        if self.fit_in_flight || !self.pool.has_ready() {
            return;
        }
        let Some(average) = self.pending_fit.take() else {
            return;
        };
        if average.is_empty() {
            debug!("nothing to fit");
            return;
        }
        let job = Job::Fit {
            generation: self.generation,
            average,
            shape: self.setting.fit_shape,
        };
        match self.pool.dispatch(job) {
            Ok(_) => self.fit_in_flight = true,
            Err(e) => {
                error!(%e, "failed to dispatch fit");
                self.events.error(e);
            }
        }
    }

    /// Everything computed so far is dropped, in-flight results will arrive stale.
    fn invalidate(&mut self) {
        self.generation += 1;
        self.history.clear();
        self.pending_fit = None;
        self.fit_result = None;
        info!(generation = self.generation, "history reset");
    }

    fn on_reset(&mut self, responder: Responder<()>) {
        self.invalidate();
        responder.respond_ok(());
    }

    #[instrument(level = "debug", skip(self, responder))]
    fn on_set_average_depth(&mut self, n_averages: usize, responder: Responder<()>) {
        if n_averages == 0 {
            responder.respond_err(Error::Configuration(
                "average depth can not be zero".to_owned(),
            ));
            return;
        }
        self.setting.n_averages = n_averages;
        if let Some(average) = self.history.resize(n_averages) {
            self.events.publish(Event::RunningAverage(average.clone()));
            self.schedule_fit(average);
        }
        responder.respond_ok(());
    }

    #[instrument(level = "debug", skip(self, responder))]
    fn on_set_dark_control(&mut self, dark_control: bool, responder: Responder<()>) {
        if self.setting.projection.dark_control != dark_control {
            self.setting.projection.dark_control = dark_control;
            self.invalidate();
        }
        responder.respond_ok(());
    }

    /// Tears the pool down and relaunches it. Chunks still in the work queue are
    /// picked up by the new pool, those already dispatched complete in the old one.
    #[instrument(level = "debug", skip(self, responder))]
    fn on_set_processor_count(&mut self, n_processors: usize, responder: Responder<()>) {
        if n_processors == 0 {
            responder.respond_err(Error::Configuration(
                "processor count can not be zero".to_owned(),
            ));
            return;
        }
        if n_processors == self.pool.len() {
            responder.respond_ok(());
            return;
        }
        let epoch = self.pool.epoch() + 1;
        std::mem::take(&mut self.pool).shutdown();
        match Pool::launch(epoch, n_processors, &self.processor, &self.output_sender) {
            Ok(pool) => {
                self.pool = pool;
                self.setting.n_processors = n_processors;
                responder.respond_ok(());
            }
            Err(e) => {
                error!(%e, "failed to relaunch processor pool");
                responder.respond_err(e);
            }
        }
    }

    fn on_set_fit_enabled(&mut self, fit_enabled: bool, responder: Responder<()>) {
        self.setting.fit_enabled = fit_enabled;
        if fit_enabled {
            if let Some(average) = self.history.average().cloned() {
                self.schedule_fit(average);
            }
        } else {
            self.pending_fit = None;
        }
        responder.respond_ok(());
    }

    fn on_set_fit_shape(&mut self, fit_shape: PulseShape, responder: Responder<()>) {
        if self.setting.fit_shape != fit_shape {
            self.setting.fit_shape = fit_shape;
            self.fit_result = None;
            if let Some(average) = self.history.average().cloned() {
                self.schedule_fit(average);
            }
        }
        responder.respond_ok(());
    }

    #[instrument(level = "debug", skip(self, responder))]
    fn on_set_calibration(
        &mut self,
        calibration: CalibrationParameters,
        responder: Responder<()>,
    ) {
        if let Err(e) = calibration.validate() {
            responder.respond_err(e);
            return;
        }
        if self.setting.projection.calibration != calibration {
            self.setting.projection.calibration = calibration;
            self.invalidate();
        }
        responder.respond_ok(());
    }

    #[instrument(level = "debug", skip(self, responder))]
    fn on_set_smoothing(&mut self, smoothing: Smoothing, responder: Responder<()>) {
        if let Err(e) = smoothing.validate() {
            responder.respond_err(e);
            return;
        }
        if self.setting.projection.smoothing != smoothing {
            self.setting.projection.smoothing = smoothing;
            self.invalidate();
        }
        responder.respond_ok(());
    }

    /// Takes a snapshot here, writes it in another thread.
    fn on_save(&mut self, save_dir: PathBuf, responder: Responder<PathBuf>) {
        let snapshot = Snapshot {
            aligned: self.history.align(),
            average: self.history.average().cloned(),
            setting: Setting {
                manager: self.setting,
                status: self.status(),
                fit: self.fit_result.as_deref().cloned(),
                saved_at: OffsetDateTime::now_utc(),
            },
        };
        let spawned = thread::Builder::new()
            .name("save".to_owned())
            .spawn(move || match save::save(&save_dir, &snapshot) {
                Ok(()) => responder.respond_ok(save_dir),
                Err(e) => {
                    error!(%e, "failed to save");
                    responder.respond_err(e);
                }
            });
        if let Err(e) = spawned {
            error!(%e, "failed to spawn save thread");
        }
    }

    /// Stops dispatching, lets every processor finish what it holds and folds their
    /// results in. Chunks still queued are left behind.
    fn drain(&mut self) {
        let _span = tracing::info_span!("drain").entered();
        std::mem::take(&mut self.pool).shutdown();
        while let Ok(output) = self.output_receiver.try_recv() {
            self.handle_output(output);
        }
        let Status {
            chunks_received,
            chunks_projected,
            chunks_failed,
            chunks_stale,
            queue_len,
            ..
        } = self.status();
        info!(
            chunks_received,
            chunks_projected,
            chunks_failed,
            chunks_stale,
            left_in_queue = queue_len,
            "manager drained"
        );
    }
}
