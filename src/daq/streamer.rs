use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};

use super::{AcquisitionDevice, ChannelSpec, SharedChunk, Trigger};
use crate::{
    error::{Error, Result},
    event::{Event, EventSender},
};

/// How often a streamer blocked on a full queue checks for a stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the streamer does when processors can not keep up.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued chunk, the streamer never waits.
    #[default]
    DropOldest,
    /// Wait for room in the queue, delaying the next device read.
    Block,
}

/// Bounded FIFO handoff between the streamer and the processor pool.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: Sender<SharedChunk>,
    receiver: Receiver<SharedChunk>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl WorkQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> WorkQueue {
        assert!(capacity > 0);
        let (sender, receiver) = bounded(capacity);
        WorkQueue {
            sender,
            receiver,
            policy,
            dropped: Arc::default(),
        }
    }

    pub fn receiver(&self) -> &Receiver<SharedChunk> {
        &self.receiver
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(usize::MAX)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of chunks evicted by [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueues according to the overflow policy. Returns `false` if `stop` was raised
    /// while waiting for room.
    pub fn push(&self, mut chunk: SharedChunk, stop: &AtomicBool) -> bool {
        match self.policy {
            OverflowPolicy::DropOldest => loop {
                match self.sender.try_send(chunk) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(c)) => {
                        if self.receiver.try_recv().is_ok() {
                            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(dropped, "work queue full, oldest chunk dropped");
                        }
                        chunk = c;
                    }
                    // The queue owns a receiver, it can not disconnect.
                    Err(TrySendError::Disconnected(_)) => unreachable!(),
                }
            },
            OverflowPolicy::Block => loop {
                match self.sender.send_timeout(chunk, STOP_POLL_INTERVAL) {
                    Ok(()) => return true,
                    Err(SendTimeoutError::Timeout(c)) => {
                        if stop.load(Ordering::Relaxed) {
                            return false;
                        }
                        chunk = c;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => unreachable!(),
                }
            },
        }
    }
}

/// Reads chunks from a device in a dedicated thread and feeds the work queue,
/// independent of how fast they are consumed.
pub struct Streamer<D> {
    pub device: D,
    pub channels: ChannelSpec,
    pub sample_rate: f64,
    /// `Some` in triggered mode: every read waits for the trigger edge.
    pub trigger: Option<Trigger>,
    pub n_samples: usize,
    pub queue: WorkQueue,
    pub events: EventSender,
}

pub struct StreamerHandle {
    stop: Arc<AtomicBool>,
    streamed: Arc<AtomicU64>,
    join_handle: JoinHandle<Result<u64>>,
}

impl<D: AcquisitionDevice + 'static> Streamer<D> {
    pub fn spawn(self) -> Result<StreamerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let streamed = Arc::new(AtomicU64::new(0));
        let join_handle = thread::Builder::new().name("streamer".to_owned()).spawn({
            let stop = stop.clone();
            let streamed = streamed.clone();
            move || self.run(&stop, &streamed)
        })?;
        Ok(StreamerHandle {
            stop,
            streamed,
            join_handle,
        })
    }

    fn run(mut self, stop: &AtomicBool, streamed: &AtomicU64) -> Result<u64> {
        let _span = info_span!("streamer", n_samples = self.n_samples).entered();
        let ret = self.read_loop(stop, streamed);
        if let Err(e) = self.device.close() {
            warn!(%e, "failed to close device");
        }
        let chunks = streamed.load(Ordering::Relaxed);
        let ret = match ret {
            Ok(()) => {
                info!(chunks, "stream stopped");
                Ok(chunks)
            }
            Err(e) => {
                error!(%e, chunks, "stream aborted");
                let msg = match &e {
                    Error::DeviceRead(msg) => msg.clone(),
                    e => e.to_string(),
                };
                self.events.error(e);
                Err(Error::DeviceRead(msg))
            }
        };
        self.events.publish(Event::StreamStopped { chunks });
        ret
    }

    fn read_loop(&mut self, stop: &AtomicBool, streamed: &AtomicU64) -> Result<()> {
        self.device
            .open(&self.channels, self.sample_rate, self.trigger.as_ref())?;
        while !stop.load(Ordering::Relaxed) {
            let chunk = self.device.read_chunk(self.n_samples)?;
            if chunk.len() != self.n_samples {
                return Err(Error::DeviceRead(format!(
                    "expect {} samples, got {}",
                    self.n_samples,
                    chunk.len()
                )));
            }
            let chunk = Arc::new(chunk);
            if !self.queue.push(chunk.clone(), stop) {
                break;
            }
            streamed.fetch_add(1, Ordering::Relaxed);
            self.events.publish(Event::RawChunk(chunk));
        }
        Ok(())
    }
}

impl StreamerHandle {
    /// Soft stop: the read loop exits after the current chunk.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub fn streamed(&self) -> u64 {
        self.streamed.load(Ordering::Relaxed)
    }

    /// Stops and waits for the thread, returning the number of chunks streamed.
    pub fn join(self) -> Result<u64> {
        self.stop();
        self.join_handle
            .join()
            .unwrap_or_else(|_| Err(Error::DeviceRead("streamer thread panicked".to_owned())))
    }
}
