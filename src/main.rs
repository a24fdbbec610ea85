use std::{
    env,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use fastscan::{AcquisitionMode, Config, Event, EventSender, Pipeline};
use tracing::{error, info, warn};

const USAGE: &str = "usage: fastscan [config.toml] [seconds] [save_dir]";

fn main() -> anyhow::Result<()> {
    fastscan::init();

    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(arg) if arg == "-h" || arg == "--help" => {
            println!("{USAGE}");
            return Ok(());
        }
        Some(path) => Config::from_path(&path).with_context(|| format!("load {path}"))?,
        None => Config {
            simulate: true,
            ..Default::default()
        },
    };
    let seconds: f64 = match args.next() {
        Some(arg) => arg.parse().with_context(|| USAGE)?,
        None => 10.0,
    };
    let save_dir = args.next().map(PathBuf::from);

    if config.acquisition_mode() != AcquisitionMode::Simulated {
        bail!("no hardware driver in this build, set `simulate = true`");
    }

    let (events, event_receiver) = EventSender::new(config.event_capacity);
    let mut pipeline = Pipeline::start_simulated(&config, events)?;

    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline && pipeline.is_streaming() {
        match event_receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(Event::FitResult(fit)) => info!(
                amplitude = fit.amplitude,
                center = fit.center,
                fwhm = fit.fwhm,
                offset = fit.offset,
                "fit"
            ),
            Ok(Event::Error(e)) if e.is_fatal() => error!(%e),
            Ok(Event::Error(e)) => warn!(%e),
            Ok(Event::StreamStopped { chunks }) => info!(chunks, "stream stopped"),
            Ok(_) => {}
            Err(_) => thread::yield_now(),
        }
    }

    if let Err(e) = pipeline.stop_streaming() {
        error!(%e, "acquisition failed");
    }
    if let Some(save_dir) = save_dir {
        let save_dir = pipeline.save(save_dir)?;
        info!(?save_dir, "saved");
    }
    let status = pipeline.shutdown()?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
