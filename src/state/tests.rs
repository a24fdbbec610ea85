use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use approx::assert_relative_eq;
use crossbeam::channel::{bounded, unbounded, Sender};
use ndarray::Array1;
use rand::Rng;

use super::*;
use crate::{
    daq::{OverflowPolicy, RawChunk, SimulationParam, Simulator},
    project::{project, CalibrationParameters, ProjectedCurve, Smoothing},
    request::{self, Request},
    util,
};

const TIMEOUT: Duration = Duration::from_secs(20);

struct Harness {
    request_sender: Sender<Request>,
    queue: WorkQueue,
    stop: AtomicBool,
    manager: JoinHandle<()>,
}

impl Harness {
    fn launch(setting: ManagerSetting, processor: Arc<dyn Processor>) -> Harness {
        util::log::init();
        let queue = WorkQueue::new(256, OverflowPolicy::Block);
        let (request_sender, request_receiver) = bounded(16);
        let manager = Manager::new(setting, queue.clone(), processor, EventSender::disabled())
            .unwrap()
            .spawn(request_receiver)
            .unwrap();
        Harness {
            request_sender,
            queue,
            stop: AtomicBool::new(false),
            manager,
        }
    }

    fn feed(&self, chunk: RawChunk) {
        assert!(self.queue.push(Arc::new(chunk), &self.stop));
    }

    async fn wait_until(&self, predicate: impl Fn(&Status) -> bool) -> Status {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let status = request::get_status(&self.request_sender).await.unwrap();
            if predicate(&status) {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "timeout: {status:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn shutdown(self) -> Status {
        let status = request::shutdown(&self.request_sender).await.unwrap();
        self.manager.join().unwrap();
        status
    }
}

fn setting(n_processors: usize, n_averages: usize) -> ManagerSetting {
    ManagerSetting {
        n_processors,
        n_averages,
        fit_enabled: false,
        ..Default::default()
    }
}

/// Chunks covering one full shaker cycle each, distinct through noise.
fn simulated_chunks(n: usize, seed: u64) -> Vec<RawChunk> {
    let param = SimulationParam {
        width: 0.3,
        noise: 0.05,
        period_samples: 4000.0,
        seed: Some(seed),
        ..Default::default()
    };
    let mut simulator = Simulator::new(param, CalibrationParameters::default(), false);
    (0..n).map(|_| simulator.generate(4000)).collect()
}

/// A chunk every sample of which sits at the same position.
fn degenerate_chunk() -> RawChunk {
    RawChunk::new(
        Array1::from_elem(100, 0.001),
        Array1::ones(100),
        Array1::from_shape_fn(100, |i| i % 2 == 0),
        None,
    )
    .unwrap()
}

/// A sweep with one glitched position sample far outside the shaker range.
fn glitched_chunk() -> RawChunk {
    let mut position = Array1::linspace(0.0, 0.01, 100);
    position[50] = 1e9;
    RawChunk::new(
        position,
        Array1::ones(100),
        Array1::from_shape_fn(100, |i| i % 2 == 0),
        None,
    )
    .unwrap()
}

/// Sleeps a random while before projecting, so that completions arrive out of order.
struct Jittery(Numerics);

impl Processor for Jittery {
    fn project(&self, chunk: &RawChunk, param: &ProjectionParam) -> Result<ProjectedCurve> {
        let ms = rand::thread_rng().gen_range(0..8);
        thread::sleep(Duration::from_millis(ms));
        self.0.project(chunk, param)
    }

    fn fit(&self, average: &RunningAverage, shape: PulseShape) -> Result<FitResult> {
        self.0.fit(average, shape)
    }
}

/// Holds every projection until the test lets it through.
struct Gate {
    entered: Sender<()>,
    release: crossbeam::channel::Receiver<()>,
}

impl Processor for Gate {
    fn project(&self, chunk: &RawChunk, param: &ProjectionParam) -> Result<ProjectedCurve> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        project(chunk, param)
    }

    fn fit(&self, average: &RunningAverage, shape: PulseShape) -> Result<FitResult> {
        Numerics::default().fit(average, shape)
    }
}

/// Panics on its first projection, then behaves.
#[derive(Default)]
struct PanicsOnce(AtomicBool);

impl Processor for PanicsOnce {
    fn project(&self, chunk: &RawChunk, param: &ProjectionParam) -> Result<ProjectedCurve> {
        if !self.0.swap(true, Ordering::Relaxed) {
            panic!("projection blew up");
        }
        project(chunk, param)
    }

    fn fit(&self, average: &RunningAverage, shape: PulseShape) -> Result<FitResult> {
        Numerics::default().fit(average, shape)
    }
}

#[tokio::test]
async fn test_window_keeps_newest_curves() {
    let harness = Harness::launch(setting(2, 3), Arc::new(Numerics::default()));
    for chunk in simulated_chunks(5, 0) {
        harness.feed(chunk);
    }
    let status = harness.wait_until(|s| s.chunks_projected == 5).await;
    assert_eq!(status.history_len, 3);
    assert_eq!(status.average_depth, 3);
    let average = request::get_running_average(&harness.request_sender)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(average.n_curves(), 3);

    request::set_average_depth(2, &harness.request_sender)
        .await
        .unwrap();
    let status = request::get_status(&harness.request_sender).await.unwrap();
    assert_eq!(status.history_len, 2);
    assert_eq!(status.generation, 0);
    let average = request::get_running_average(&harness.request_sender)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(average.n_curves(), 2);

    let status = harness.shutdown().await;
    assert_eq!(status.chunks_received, 5);
    assert_eq!(status.chunks_failed, 0);
}

#[tokio::test]
async fn test_reset_discards_in_flight_curve() {
    let (entered_sender, entered) = unbounded();
    let (release, release_receiver) = unbounded();
    let gate = Gate {
        entered: entered_sender,
        release: release_receiver,
    };
    let harness = Harness::launch(setting(1, 10), Arc::new(gate));
    let mut chunks = simulated_chunks(2, 1).into_iter();

    harness.feed(chunks.next().unwrap());
    entered.recv_timeout(TIMEOUT).unwrap();
    request::reset(&harness.request_sender).await.unwrap();
    release.send(()).unwrap();

    let status = harness.wait_until(|s| s.chunks_stale == 1).await;
    assert_eq!(status.generation, 1);
    assert_eq!(status.history_len, 0);
    assert_eq!(status.chunks_projected, 0);
    assert!(request::get_running_average(&harness.request_sender)
        .await
        .unwrap()
        .is_none());

    // Work started after the reset counts again.
    release.send(()).unwrap();
    harness.feed(chunks.next().unwrap());
    let status = harness.wait_until(|s| s.chunks_projected == 1).await;
    assert_eq!(status.history_len, 1);
    assert_eq!(status.chunks_stale, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_invalid_reconfiguration_is_rejected() {
    let harness = Harness::launch(setting(2, 4), Arc::new(Numerics::default()));
    for chunk in simulated_chunks(2, 2) {
        harness.feed(chunk);
    }
    let before = harness.wait_until(|s| s.chunks_projected == 2).await;

    let is_configuration_error = |e: anyhow::Error| {
        matches!(e.downcast_ref::<Error>(), Some(Error::Configuration(_)))
    };
    let e = request::set_average_depth(0, &harness.request_sender)
        .await
        .unwrap_err();
    assert!(is_configuration_error(e));
    let e = request::set_processor_count(0, &harness.request_sender)
        .await
        .unwrap_err();
    assert!(is_configuration_error(e));
    let calibration = CalibrationParameters {
        step_size: 0.0,
        ps_per_step: 0.05,
    };
    let e = request::set_calibration(calibration, &harness.request_sender)
        .await
        .unwrap_err();
    assert!(is_configuration_error(e));
    let smoothing = Smoothing::LowPass {
        cutoff: 1.5,
        order: 2,
    };
    let e = request::set_smoothing(smoothing, &harness.request_sender)
        .await
        .unwrap_err();
    assert!(is_configuration_error(e));

    let after = request::get_status(&harness.request_sender).await.unwrap();
    assert_eq!(before, after);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reconfiguration_clears_history() {
    let harness = Harness::launch(setting(2, 4), Arc::new(Numerics::default()));
    for chunk in simulated_chunks(2, 3) {
        harness.feed(chunk);
    }
    harness.wait_until(|s| s.chunks_projected == 2).await;

    // Same value, nothing to invalidate.
    request::set_dark_control(true, &harness.request_sender)
        .await
        .unwrap();
    let status = request::get_status(&harness.request_sender).await.unwrap();
    assert_eq!((status.generation, status.history_len), (0, 2));

    request::set_dark_control(false, &harness.request_sender)
        .await
        .unwrap();
    let status = request::get_status(&harness.request_sender).await.unwrap();
    assert_eq!((status.generation, status.history_len), (1, 0));

    let calibration = CalibrationParameters {
        ps_per_step: 0.1,
        ..Default::default()
    };
    request::set_calibration(calibration, &harness.request_sender)
        .await
        .unwrap();
    let status = request::get_status(&harness.request_sender).await.unwrap();
    assert_eq!(status.generation, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_average_is_independent_of_completion_order() {
    const K: usize = 100;
    let chunks = simulated_chunks(K, 4);
    let param = setting(4, K).projection;
    let mut reference = History::new(K, AveragePolicy::Strict);
    for chunk in &chunks {
        reference.push(Arc::new(project(chunk, &param).unwrap()));
    }
    let reference = reference.average().unwrap().clone();

    let harness = Harness::launch(setting(4, K), Arc::new(Jittery(Numerics::default())));
    for chunk in chunks {
        harness.feed(chunk);
    }
    let status = harness
        .wait_until(|s| s.chunks_projected == K as u64)
        .await;
    assert_eq!(status.history_len, K);
    let average = request::get_running_average(&harness.request_sender)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(average.n_curves(), K);
    assert_eq!(average.len(), reference.len());
    assert!(!average.is_empty());
    for (a, b) in average.time().iter().zip(reference.time()) {
        assert_relative_eq!(a, b, max_relative = 1e-9);
    }
    for (a, b) in average.values().iter().zip(reference.values()) {
        assert_relative_eq!(a, b, max_relative = 1e-9, epsilon = 1e-12);
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_processor_count_change_keeps_queued_chunks() {
    let harness = Harness::launch(setting(1, 50), Arc::new(Jittery(Numerics::default())));
    for chunk in simulated_chunks(30, 5) {
        harness.feed(chunk);
    }
    request::set_processor_count(3, &harness.request_sender)
        .await
        .unwrap();
    let status = harness.wait_until(|s| s.chunks_projected == 30).await;
    assert_eq!(status.n_processors, 3);
    assert_eq!(status.chunks_received, 30);
    assert_eq!(status.history_len, 30);

    request::set_processor_count(2, &harness.request_sender)
        .await
        .unwrap();
    let status = harness.wait_until(|s| s.busy_processors == 0).await;
    assert_eq!(status.n_processors, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_projection_error_keeps_worker() {
    let harness = Harness::launch(setting(1, 10), Arc::new(Numerics::default()));
    harness.feed(degenerate_chunk());
    harness.feed(glitched_chunk());
    harness.feed(simulated_chunks(1, 6).remove(0));
    let status = harness
        .wait_until(|s| s.chunks_failed == 2 && s.chunks_projected == 1)
        .await;
    assert_eq!(status.history_len, 1);
    assert_eq!(status.n_processors, 1);

    let status = harness.wait_until(|s| s.busy_processors == 0).await;
    assert_eq!(status.chunks_received, 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_processor_panic_is_reported() {
    let harness = Harness::launch(setting(1, 10), Arc::new(PanicsOnce::default()));
    let mut chunks = simulated_chunks(2, 12).into_iter();
    harness.feed(chunks.next().unwrap());
    harness.wait_until(|s| s.chunks_failed == 1).await;
    harness.feed(chunks.next().unwrap());
    let status = harness
        .wait_until(|s| s.chunks_projected == 1 && s.busy_processors == 0)
        .await;
    assert_eq!(status.chunks_failed, 1);
    assert_eq!(status.n_processors, 1);
    assert_eq!(status.history_len, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_fit_follows_average() {
    let harness = Harness::launch(
        ManagerSetting {
            fit_enabled: true,
            ..setting(2, 5)
        },
        Arc::new(Numerics::default()),
    );
    for chunk in simulated_chunks(5, 7) {
        harness.feed(chunk);
    }
    harness
        .wait_until(|s| s.chunks_projected == 5 && s.fits_succeeded > 0 && !s.fit_in_flight)
        .await;
    let fit = request::get_fit_result(&harness.request_sender)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fit.shape, PulseShape::Sech2);
    assert_relative_eq!(fit.amplitude, 1.0, max_relative = 0.1);
    assert_relative_eq!(fit.width, 0.3, max_relative = 0.1);
    assert!(fit.center.abs() < 0.05);

    // Switching the shape drops the result, a late sech2 fit is discarded on arrival.
    request::set_fit_shape(PulseShape::Gaussian, &harness.request_sender)
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let fit = loop {
        if let Some(fit) = request::get_fit_result(&harness.request_sender)
            .await
            .unwrap()
        {
            break fit;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(fit.shape, PulseShape::Gaussian);

    request::set_fit_enabled(false, &harness.request_sender)
        .await
        .unwrap();
    request::reset(&harness.request_sender).await.unwrap();
    assert!(request::get_fit_result(&harness.request_sender)
        .await
        .unwrap()
        .is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_save_writes_window() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::launch(setting(2, 3), Arc::new(Numerics::default()));
    for chunk in simulated_chunks(4, 8) {
        harness.feed(chunk);
    }
    harness.wait_until(|s| s.chunks_projected == 4).await;

    let save_dir = request::save(dir.path().join("run"), &harness.request_sender)
        .await
        .unwrap();
    let values = std::fs::read_to_string(save_dir.join("all_data").join("values.csv")).unwrap();
    assert_eq!(values.lines().count(), 3);
    assert!(save_dir.join("avg").join("values.csv").is_file());
    let setting: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(save_dir.join("setting.json")).unwrap())
            .unwrap();
    assert_eq!(setting["manager"]["n_averages"], 3);
    assert_eq!(setting["status"]["history_len"], 3);

    harness.shutdown().await;
}

#[test]
fn test_pool_ignores_completion_from_old_epoch() {
    let (output_sender, output_receiver) = unbounded();
    let processor: Arc<dyn Processor> = Arc::new(Numerics::default());
    let mut pool = Pool::launch(1, 2, &processor, &output_sender).unwrap();
    let chunk = Arc::new(simulated_chunks(1, 9).remove(0));
    let job = || Job::Project {
        generation: 0,
        chunk: chunk.clone(),
        param: ProjectionParam::default(),
    };

    let first = pool.dispatch(job()).unwrap();
    let second = pool.dispatch(job()).unwrap();
    assert_ne!(first, second);
    assert!(!pool.has_ready());
    assert_eq!(pool.busy(), 2);
    assert!(pool.dispatch(job()).is_err());

    pool.complete(WorkerId { epoch: 0, ..first });
    assert!(!pool.has_ready());
    pool.complete(first);
    assert!(pool.slots()[first.index].is_ready());

    pool.shutdown();
    let outputs: Vec<_> = output_receiver.try_iter().collect();
    assert_eq!(outputs.len(), 2);
    assert!(outputs
        .iter()
        .all(|o| matches!(o, Output::Project { curve: Ok(_), .. })));
}

#[test]
fn test_pool_relaunches_dead_worker() {
    let (output_sender, output_receiver) = unbounded();
    let processor: Arc<dyn Processor> = Arc::new(Numerics::default());
    let mut pool = Pool::launch(0, 1, &processor, &output_sender).unwrap();
    let chunk = Arc::new(simulated_chunks(1, 13).remove(0));
    let job = || Job::Project {
        generation: 0,
        chunk: chunk.clone(),
        param: ProjectionParam::default(),
    };

    // The worker exits once it cannot hand its output back.
    drop(output_receiver);
    let worker = pool.dispatch(job()).unwrap();
    pool.complete(worker);
    thread::sleep(Duration::from_millis(200));

    assert!(matches!(pool.dispatch(job()), Err(Error::Projection(_))));
    assert!(pool.has_ready());
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.dispatch(job()).unwrap(), worker);
    pool.shutdown();
}
