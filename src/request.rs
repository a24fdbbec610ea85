use std::{fmt::Debug, path::PathBuf, sync::Arc, time::Instant};

use anyhow::Result;
use crossbeam::channel::Sender;
use function_name::named;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    fit::{FitResult, PulseShape},
    project::{CalibrationParameters, Smoothing},
    state::{RunningAverage, Status},
};

pub enum Request {
    Reset {
        responder: Responder<()>,
    },
    SetAverageDepth {
        n_averages: usize,
        responder: Responder<()>,
    },
    SetDarkControl {
        dark_control: bool,
        responder: Responder<()>,
    },
    SetProcessorCount {
        n_processors: usize,
        responder: Responder<()>,
    },
    SetFitEnabled {
        fit_enabled: bool,
        responder: Responder<()>,
    },
    SetFitShape {
        fit_shape: PulseShape,
        responder: Responder<()>,
    },
    SetCalibration {
        calibration: CalibrationParameters,
        responder: Responder<()>,
    },
    SetSmoothing {
        smoothing: Smoothing,
        responder: Responder<()>,
    },
    GetRunningAverage {
        responder: Responder<Option<Arc<RunningAverage>>>,
    },
    GetFitResult {
        responder: Responder<Option<Arc<FitResult>>>,
    },
    GetStatus {
        responder: Responder<Status>,
    },
    Save {
        save_dir: PathBuf,
        responder: Responder<PathBuf>,
    },
    Shutdown {
        responder: Responder<Status>,
    },
}

pub struct Responder<T> {
    name: String,
    start_time: Instant,
    tx: oneshot::Sender<Result<T>>,
}

impl<T: Debug> Responder<T> {
    pub(crate) fn new(name: &str, tx: oneshot::Sender<Result<T>>) -> Responder<T> {
        Responder {
            name: name.to_owned(),
            tx,
            start_time: Instant::now(),
        }
    }

    pub(crate) fn respond(self, result: Result<T>) {
        self.respond_inner(result, true);
    }

    pub(crate) fn respond_ok(self, v: T) {
        self.respond(Ok(v))
    }

    /// For values too large to be worth a log line.
    pub(crate) fn respond_ok_no_result_log(self, v: T) {
        self.respond_inner(Ok(v), false);
    }

    pub(crate) fn respond_err<E: Into<anyhow::Error>>(self, e: E) {
        self.respond(Err(e.into()))
    }

    fn respond_inner(self, result: Result<T>, print_result: bool) {
        let name = self.name;
        let elapsed = self.start_time.elapsed();
        match &result {
            Ok(result) => {
                if print_result {
                    trace!(name, ?result, ?elapsed, "respond_ok");
                } else {
                    trace!(name, ?elapsed, "respond_ok");
                }
            }
            Err(e) => trace!(name, %e, ?elapsed, "respond_err"),
        }

        // The caller may have given up waiting.
        let _ = self.tx.send(result);
    }
}

#[named]
pub async fn reset(request_sender: &Sender<Request>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::Reset {
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_average_depth(n_averages: usize, request_sender: &Sender<Request>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetAverageDepth {
        n_averages,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_dark_control(dark_control: bool, request_sender: &Sender<Request>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetDarkControl {
        dark_control,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_processor_count(
    n_processors: usize,
    request_sender: &Sender<Request>,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetProcessorCount {
        n_processors,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_fit_enabled(fit_enabled: bool, request_sender: &Sender<Request>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetFitEnabled {
        fit_enabled,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_fit_shape(fit_shape: PulseShape, request_sender: &Sender<Request>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetFitShape {
        fit_shape,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_calibration(
    calibration: CalibrationParameters,
    request_sender: &Sender<Request>,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetCalibration {
        calibration,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn set_smoothing(smoothing: Smoothing, request_sender: &Sender<Request>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::SetSmoothing {
        smoothing,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn get_running_average(
    request_sender: &Sender<Request>,
) -> Result<Option<Arc<RunningAverage>>> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::GetRunningAverage {
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn get_fit_result(request_sender: &Sender<Request>) -> Result<Option<Arc<FitResult>>> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::GetFitResult {
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

#[named]
pub async fn get_status(request_sender: &Sender<Request>) -> Result<Status> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::GetStatus {
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

/// Writes the current window and average under `save_dir`, returns the directory.
#[named]
pub async fn save(save_dir: PathBuf, request_sender: &Sender<Request>) -> Result<PathBuf> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::Save {
        save_dir,
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}

/// Drains the processors and stops the manager, returns the final counters.
#[named]
pub async fn shutdown(request_sender: &Sender<Request>) -> Result<Status> {
    let (tx, rx) = oneshot::channel();
    let _ = request_sender.try_send(Request::Shutdown {
        responder: Responder::new(function_name!(), tx),
    });
    rx.await?
}
