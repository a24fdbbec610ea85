use std::{collections::VecDeque, sync::Arc};

use ndarray::{Array1, Array2, ArrayView, ArrayView1, Axis, Dimension};
use serde::{Deserialize, Serialize};

use crate::project::ProjectedCurve;

/// How bins missing from some curves of the window are treated.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AveragePolicy {
    /// A bin that is NaN or absent in any curve is dropped from the average.
    #[default]
    Strict,
    /// Each bin is the mean of the curves that have a value there.
    NanMean,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningAverage {
    time: Array1<f64>,
    values: Array1<f64>,
    /// Number of curves in the window when this average was computed.
    n_curves: usize,
}

impl RunningAverage {
    pub fn time(&self) -> ArrayView1<f64> {
        self.time.view()
    }

    pub fn values(&self) -> ArrayView1<f64> {
        self.values.view()
    }

    pub fn n_curves(&self) -> usize {
        self.n_curves
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// The curves of a window laid onto their common grid, one row per curve, NaN where a
/// curve has no bin.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedCurves {
    pub time: Array1<f64>,
    pub values: Array2<f64>,
}

/// Most recent `depth` projected curves and their average.
#[derive(Debug)]
pub struct History {
    depth: usize,
    policy: AveragePolicy,
    curves: VecDeque<Arc<ProjectedCurve>>,
    average: Option<Arc<RunningAverage>>,
}

impl History {
    pub fn new(depth: usize, policy: AveragePolicy) -> History {
        assert!(depth > 0);
        History {
            depth,
            policy,
            curves: VecDeque::with_capacity(depth),
            average: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn average(&self) -> Option<&Arc<RunningAverage>> {
        self.average.as_ref()
    }

    pub fn curves(&self) -> impl Iterator<Item = &Arc<ProjectedCurve>> + '_ {
        self.curves.iter()
    }

    /// Appends a curve, evicting the oldest ones beyond the depth, and recomputes the
    /// average from the retained window.
    pub fn push(&mut self, curve: Arc<ProjectedCurve>) -> Arc<RunningAverage> {
        self.curves.push_back(curve);
        self.evict();
        self.refresh()
    }

    /// Shrinking the depth evicts immediately; the average is recomputed when curves
    /// remain.
    pub fn resize(&mut self, depth: usize) -> Option<Arc<RunningAverage>> {
        assert!(depth > 0);
        self.depth = depth;
        self.evict();
        if self.curves.is_empty() {
            return None;
        }
        Some(self.refresh())
    }

    pub fn clear(&mut self) {
        self.curves.clear();
        self.average = None;
    }

    fn evict(&mut self) {
        while self.curves.len() > self.depth {
            self.curves.pop_front();
        }
    }

    fn refresh(&mut self) -> Arc<RunningAverage> {
        let average = Arc::new(average(&self.align(), self.policy));
        self.average = Some(average.clone());
        average
    }

    /// Lays the window onto the union of its grids. The time of a column is the mean
    /// time of the bins landing there.
    pub fn align(&self) -> AlignedCurves {
        let Some(lo) = self.curves.iter().map(|c| c.grid_origin()).min() else {
            return AlignedCurves {
                time: Array1::zeros(0),
                values: Array2::zeros((0, 0)),
            };
        };
        let hi = self
            .curves
            .iter()
            .map(|c| c.grid_origin() + c.len() as i64)
            .max()
            .unwrap_or(lo);
        let ncols = (hi - lo) as usize;

        let mut values = Array2::from_elem((self.curves.len(), ncols), f64::NAN);
        let mut t_sum = Array1::<f64>::zeros(ncols);
        let mut t_cnt = Array1::<u32>::zeros(ncols);
        for (mut row, curve) in values.axis_iter_mut(Axis(0)).zip(&self.curves) {
            for (g, t, v) in curve.bins() {
                let k = (g - lo) as usize;
                row[k] = v;
                t_sum[k] += t;
                t_cnt[k] += 1;
            }
        }
        let time = ndarray::Zip::from(&t_sum)
            .and(&t_cnt)
            .map_collect(|&s, &n| if n == 0 { f64::NAN } else { s / n as f64 });

        AlignedCurves { time, values }
    }
}

fn average(aligned: &AlignedCurves, policy: AveragePolicy) -> RunningAverage {
    let n_curves = aligned.values.nrows();
    let (time, values): (Vec<_>, Vec<_>) = aligned
        .values
        .axis_iter(Axis(1))
        .zip(&aligned.time)
        .filter(|(_, t)| t.is_finite())
        .filter_map(|(column, &t)| match policy {
            AveragePolicy::Strict => column
                .iter()
                .all(|v| v.is_finite())
                .then(|| (t, column.sum() / n_curves as f64)),
            AveragePolicy::NanMean => Some((t, nan_mean(column))),
        })
        .unzip();

    RunningAverage {
        time: Array1::from(time),
        values: Array1::from(values),
        n_curves,
    }
}

/// Mean of the non-NaN elements, NaN if there are none.
pub(crate) fn nan_mean<D: Dimension>(data: ArrayView<f64, D>) -> f64 {
    let (sum, cnt) = data.iter().fold((0., 0), |(sum, cnt), &x| {
        if x.is_nan() {
            (sum, cnt)
        } else {
            (sum + x, cnt + 1)
        }
    });
    if cnt == 0 {
        f64::NAN
    } else {
        sum / cnt as f64
    }
}
