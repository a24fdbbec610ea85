use std::{
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{bounded, Sender, TrySendError};
use tracing::{debug, debug_span, error, info};

use super::{average::RunningAverage, Output};
use crate::{
    daq::{RawChunk, SharedChunk},
    error::{Error, Result},
    fit::{fit_pulse, lm::LmSetup, FitResult, PulseShape},
    project::{project, ProjectedCurve, ProjectionParam},
};

/// The numerical work a processor performs. Swappable so that tests can inject latency.
pub trait Processor: Send + Sync {
    fn project(&self, chunk: &RawChunk, param: &ProjectionParam) -> Result<ProjectedCurve>;

    fn fit(&self, average: &RunningAverage, shape: PulseShape) -> Result<FitResult>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Numerics {
    pub setup: LmSetup,
}

impl Processor for Numerics {
    fn project(&self, chunk: &RawChunk, param: &ProjectionParam) -> Result<ProjectedCurve> {
        project(chunk, param)
    }

    fn fit(&self, average: &RunningAverage, shape: PulseShape) -> Result<FitResult> {
        fit_pulse(average.time(), average.values(), shape, &self.setup)
    }
}

/// Identity of a processor across pool relaunches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub epoch: u64,
    pub index: usize,
}

pub enum Job {
    Project {
        generation: u64,
        chunk: SharedChunk,
        param: ProjectionParam,
    },
    Fit {
        generation: u64,
        average: Arc<RunningAverage>,
        shape: PulseShape,
    },
}

impl Job {
    fn execute(self, worker: WorkerId, processor: &dyn Processor) -> Output {
        match self {
            Job::Project {
                generation,
                chunk,
                param,
            } => Output::Project {
                worker,
                generation,
                curve: catch_unwind(AssertUnwindSafe(|| processor.project(&chunk, &param)))
                    .unwrap_or_else(|_| Err(Error::Projection("processor panicked".to_owned()))),
            },
            Job::Fit {
                generation,
                average,
                shape,
            } => Output::Fit {
                worker,
                generation,
                shape,
                fit: catch_unwind(AssertUnwindSafe(|| processor.fit(&average, shape)))
                    .unwrap_or_else(|_| {
                        Err(Error::FitConvergence("processor panicked".to_owned()))
                    }),
            },
        }
    }
}

/// A worker plus its readiness flag. Only the manager flips `ready`.
#[derive(Debug)]
pub struct ProcessorSlot {
    id: WorkerId,
    ready: bool,
    job_sender: Sender<Job>,
}

impl ProcessorSlot {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

fn spawn_worker(
    id: WorkerId,
    processor: &Arc<dyn Processor>,
    output_sender: &Sender<Output>,
) -> Result<(Sender<Job>, JoinHandle<()>)> {
    let WorkerId { epoch, index } = id;
    let (job_sender, job_receiver) = bounded::<Job>(1);
    let processor = processor.clone();
    let output_sender = output_sender.clone();
    let worker = thread::Builder::new()
        .name(format!("processor-{epoch}-{index}"))
        .spawn(move || {
            let _span = debug_span!("processor", epoch, index).entered();
            // Ends once the manager drops the job sender and the slot is drained.
            for job in job_receiver {
                let output = job.execute(id, processor.as_ref());
                if output_sender.send(output).is_err() {
                    break;
                }
            }
            debug!("processor exited");
        })?;
    Ok((job_sender, worker))
}

/// A fixed set of processor threads, each fed through its own single-slot channel.
#[derive(Default)]
pub struct Pool {
    epoch: u64,
    slots: Vec<ProcessorSlot>,
    workers: Vec<JoinHandle<()>>,
    /// Kept to relaunch a worker whose thread is gone.
    processor: Option<Arc<dyn Processor>>,
    output_sender: Option<Sender<Output>>,
}

impl Pool {
    pub fn launch(
        epoch: u64,
        n: usize,
        processor: &Arc<dyn Processor>,
        output_sender: &Sender<Output>,
    ) -> Result<Pool> {
        let mut slots = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        for index in 0..n {
            let id = WorkerId { epoch, index };
            let (job_sender, worker) = spawn_worker(id, processor, output_sender)?;
            slots.push(ProcessorSlot {
                id,
                ready: true,
                job_sender,
            });
            workers.push(worker);
        }
        info!(epoch, n, "processor pool launched");
        Ok(Pool {
            epoch,
            slots,
            workers,
            processor: Some(processor.clone()),
            output_sender: Some(output_sender.clone()),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ProcessorSlot] {
        &self.slots
    }

    pub fn has_ready(&self) -> bool {
        self.slots.iter().any(|slot| slot.ready)
    }

    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.ready).count()
    }

    /// Hands the job to the first ready slot and marks it busy. A slot whose thread is
    /// gone gets a fresh worker, the job is reported as failed.
    pub fn dispatch(&mut self, job: Job) -> Result<WorkerId> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.ready)
            .ok_or_else(|| Error::Projection("no ready processor".to_owned()))?;
        match slot.job_sender.try_send(job) {
            Ok(()) => {
                slot.ready = false;
                Ok(slot.id)
            }
            Err(TrySendError::Full(_)) => {
                error!(?slot.id, "ready processor still holds a job");
                slot.ready = false;
                Err(Error::Projection(format!("processor {:?} is busy", slot.id)))
            }
            Err(TrySendError::Disconnected(_)) => {
                let id = slot.id;
                error!(?id, "processor is gone, relaunching");
                slot.ready = false;
                if let (Some(processor), Some(output_sender)) =
                    (&self.processor, &self.output_sender)
                {
                    let (job_sender, worker) = spawn_worker(id, processor, output_sender)?;
                    slot.job_sender = job_sender;
                    slot.ready = true;
                    if mem::replace(&mut self.workers[id.index], worker)
                        .join()
                        .is_err()
                    {
                        error!(?id, "processor panicked");
                    }
                }
                Err(Error::Projection(format!(
                    "processor {id:?} was gone, job dropped"
                )))
            }
        }
    }

    /// Marks the worker ready again. Completions from an older pool leave the
    /// current slots untouched.
    pub fn complete(&mut self, worker: WorkerId) {
        if worker.epoch != self.epoch {
            return;
        }
        if let Some(slot) = self.slots.get_mut(worker.index) {
            slot.ready = true;
        }
    }

    /// Closes every job channel and waits until the workers have finished what they
    /// already hold. Their outputs stay in the output channel.
    pub fn shutdown(self) {
        let Pool {
            epoch,
            slots,
            workers,
            ..
        } = self;
        drop(slots);
        for worker in workers {
            if worker.join().is_err() {
                error!(epoch, "processor panicked");
            }
        }
        debug!(epoch, "processor pool joined");
    }
}
