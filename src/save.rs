use std::{
    fs::{self, File},
    io::BufWriter,
    path::Path,
    sync::Arc,
};

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::Serialize;
use tracing::instrument;

use crate::{
    error::Result,
    fit::FitResult,
    state::{AlignedCurves, ManagerSetting, RunningAverage, Status},
    util::timing,
};

/// `Setting` is saved together with the arrays for later check.
#[derive(Debug, Serialize)]
pub struct Setting {
    pub manager: ManagerSetting,
    pub status: Status,
    pub fit: Option<FitResult>,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: time::OffsetDateTime,
}

/// Everything written by one save request.
#[derive(Debug)]
pub struct Snapshot {
    pub aligned: AlignedCurves,
    pub average: Option<Arc<RunningAverage>>,
    pub setting: Setting,
}

/// Layout under `save_dir`:
/// * all_data/time.csv, all_data/values.csv: every curve of the window on the common
///   grid, one row per curve
/// * avg/time.csv, avg/values.csv: the running average
/// * setting.json
#[instrument(level = "debug", skip(snapshot), err)]
pub fn save(save_dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let _timing = timing::start("save");
    let all_data_dir = save_dir.join("all_data");
    let avg_dir = save_dir.join("avg");
    fs::create_dir_all(&all_data_dir)?;
    fs::create_dir_all(&avg_dir)?;

    save_vector(snapshot.aligned.time.view(), all_data_dir.join("time.csv"))?;
    save_matrix(snapshot.aligned.values.view(), all_data_dir.join("values.csv"))?;
    match &snapshot.average {
        Some(average) => {
            save_vector(average.time(), avg_dir.join("time.csv"))?;
            save_vector(average.values(), avg_dir.join("values.csv"))?;
        }
        None => {
            let empty = Array1::zeros(0);
            save_vector(empty.view(), avg_dir.join("time.csv"))?;
            save_vector(empty.view(), avg_dir.join("values.csv"))?;
        }
    }

    let writer = BufWriter::new(File::create(save_dir.join("setting.json"))?);
    serde_json::to_writer_pretty(writer, &snapshot.setting)?;

    Ok(())
}

fn save_vector<P: AsRef<Path>>(data: ArrayView1<f64>, path: P) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for x in data {
        wtr.write_record([x.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

fn save_matrix<P: AsRef<Path>>(data: ArrayView2<f64>, path: P) -> Result<()> {
    let records: Vec<Vec<String>> = data
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| row.iter().map(|x| x.to_string()).collect())
        .collect();
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for record in records {
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
