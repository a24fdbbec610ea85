use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tracing::trace;

use crate::{
    daq::SharedChunk, error::Error, fit::FitResult, project::ProjectedCurve,
    state::RunningAverage,
};

/// Everything published to plotting / saving consumers.
#[derive(Debug, Clone)]
pub enum Event {
    RawChunk(SharedChunk),
    ProjectedCurve(Arc<ProjectedCurve>),
    RunningAverage(Arc<RunningAverage>),
    FitResult(Arc<FitResult>),
    Error(Arc<Error>),
    /// The streamer left its read loop, either stopped or after a device error.
    StreamStopped { chunks: u64 },
}

/// Publishing never blocks the pipeline: when the consumer lags behind and the
/// channel is full, the event is dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSender(Option<Sender<Event>>);

impl EventSender {
    pub fn new(capacity: usize) -> (EventSender, Receiver<Event>) {
        let (tx, rx) = bounded(capacity);
        (EventSender(Some(tx)), rx)
    }

    /// Publishes into the void, for headless runs and tests.
    pub fn disabled() -> EventSender {
        EventSender(None)
    }

    pub fn publish(&self, event: Event) {
        let Some(tx) = &self.0 else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("consumer lagging, event dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn error(&self, e: Error) {
        self.publish(Event::Error(Arc::new(e)));
    }
}
