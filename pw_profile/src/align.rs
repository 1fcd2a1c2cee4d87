//! Uniform time grids and linear channel alignment.
//!
//! Telemetry channels are recorded at their own native rates (GPS speed at
//! 100 Hz, throttle at 50 Hz, oil temperature at a handful of Hz), so pairing
//! samples by row index smears the signals. Everything here resamples onto a
//! shared grid using the real timestamps.
//!
//! Source timestamps must be ascending. Debug builds assert this; release
//! builds trust the caller.

use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::{NoopMetrics, ProfileMetrics};
use crate::PwError;

/// Upper bound on grid length: a full day at 500 Hz.
pub const MAX_GRID_POINTS: usize = 43_200_000;

/// Uniform grid from `start_s` at `frequency_hz`, covering `end_s`.
///
/// Holds `ceil((end - start) * hz) + 1` points, so the last one may overshoot
/// `end_s` by less than a step. A zero or negative span yields an empty grid;
/// a span needing more than [`MAX_GRID_POINTS`] points is rejected.
pub fn create_time_grid(start_s: f64, end_s: f64, frequency_hz: f64) -> Result<Vec<f64>, PwError> {
    if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
        return Err(PwError::InvalidArgument("frequency must be positive".into()));
    }
    if !start_s.is_finite() || !end_s.is_finite() {
        return Err(PwError::InvalidArgument(format!(
            "grid bounds must be finite (start={start_s}, end={end_s})"
        )));
    }
    if end_s <= start_s {
        return Ok(Vec::new());
    }
    let steps = ((end_s - start_s) * frequency_hz).ceil();
    if !(steps.is_finite() && steps < MAX_GRID_POINTS as f64) {
        return Err(PwError::InvalidArgument(format!(
            "grid over [{start_s}, {end_s}] at {frequency_hz} Hz exceeds {MAX_GRID_POINTS} points"
        )));
    }
    let len = steps as usize + 1;
    Ok((0..len)
        .map(|i| start_s + i as f64 / frequency_hz)
        .collect())
}

/// Timestamps for a channel known only by sample count and session bounds,
/// spread linearly over `[start_s, end_s]` inclusive.
pub fn estimate_channel_timestamps(sample_count: usize, start_s: f64, end_s: f64) -> Vec<f64> {
    match sample_count {
        0 => Vec::new(),
        1 => vec![start_s],
        n => {
            let duration = end_s - start_s;
            let last = (n - 1) as f64;
            (0..n)
                .map(|i| start_s + i as f64 / last * duration)
                .collect()
        }
    }
}

/// Linearly interpolate `source_values` onto `target_times`, then scale.
///
/// Targets outside the source span clamp to the first/last value. Empty
/// source or target degrades to zeros sized to the target rather than an
/// error. A single forward cursor walks the source, so an ascending target
/// costs O(source + target).
pub fn interpolate(
    source_times: &[f64],
    source_values: &[f64],
    target_times: &[f64],
    scale_factor: f64,
) -> Result<Vec<f64>, PwError> {
    if source_times.len() != source_values.len() {
        return Err(PwError::LengthMismatch {
            timestamps: source_times.len(),
            values: source_values.len(),
        });
    }
    if source_times.is_empty() || target_times.is_empty() {
        return Ok(vec![0.0; target_times.len()]);
    }
    debug_assert!(
        is_ascending(source_times),
        "source timestamps must be ascending"
    );

    let n = source_times.len();
    let first_t = source_times[0];
    let last_t = source_times[n - 1];
    let mut out = Vec::with_capacity(target_times.len());
    let mut idx = 0usize;

    for &target in target_times {
        let value = if target <= first_t {
            source_values[0]
        } else if target >= last_t {
            source_values[n - 1]
        } else {
            if target < source_times[idx] {
                // Target went backwards; restart the scan.
                idx = 0;
            }
            while idx + 2 < n && source_times[idx + 1] <= target {
                idx += 1;
            }
            let (t0, y0) = (source_times[idx], source_values[idx]);
            let (t1, y1) = (source_times[idx + 1], source_values[idx + 1]);
            let denom = t1 - t0;
            if denom == 0.0 {
                y0
            } else {
                y0 + (y1 - y0) * ((target - t0) / denom)
            }
        };
        out.push(value * scale_factor);
    }
    Ok(out)
}

/// [`interpolate`] applied to each column independently against one
/// shared set of source timestamps (e.g. four tyre temperatures).
pub fn interpolate_multi_column(
    source_times: &[f64],
    source_columns: &[Vec<f64>],
    target_times: &[f64],
    scale_factor: f64,
) -> Result<Vec<Vec<f64>>, PwError> {
    source_columns
        .iter()
        .map(|column| interpolate(source_times, column, target_times, scale_factor))
        .collect()
}

fn is_ascending(times: &[f64]) -> bool {
    times.windows(2).all(|w| w[0] <= w[1])
}

fn unit_scale() -> f64 {
    1.0
}

/// Where a channel's sample times come from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelSource {
    /// Per-sample timestamps recorded alongside the values.
    Timestamped { timestamps: Vec<f64>, values: Vec<f64> },
    /// Only the sample count and session bounds are known.
    Estimated { values: Vec<f64>, start: f64, end: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub name: String,
    #[serde(flatten)]
    pub source: ChannelSource,
    /// Unit conversion applied after interpolation (3.6 for m/s → km/h).
    #[serde(default = "unit_scale")]
    pub scale_factor: f64,
    /// Declared recording rate, checked against the sample spacing.
    #[serde(default)]
    pub native_hz: Option<f64>,
}

/// Relative disagreement between declared and observed rate tolerated before warning.
const RATE_TOLERANCE: f64 = 0.1;

impl Channel {
    pub fn timestamped(name: impl Into<String>, timestamps: Vec<f64>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            source: ChannelSource::Timestamped { timestamps, values },
            scale_factor: 1.0,
            native_hz: None,
        }
    }

    pub fn estimated(name: impl Into<String>, values: Vec<f64>, start: f64, end: f64) -> Self {
        Self {
            name: name.into(),
            source: ChannelSource::Estimated { values, start, end },
            scale_factor: 1.0,
            native_hz: None,
        }
    }

    pub fn with_scale(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    pub fn values(&self) -> &[f64] {
        match &self.source {
            ChannelSource::Timestamped { values, .. } => values,
            ChannelSource::Estimated { values, .. } => values,
        }
    }

    pub fn with_native_hz(mut self, native_hz: f64) -> Self {
        self.native_hz = Some(native_hz);
        self
    }

    /// Rate implied by the sample count over the covered span.
    pub fn observed_hz(&self) -> Option<f64> {
        let (first, last) = match &self.source {
            ChannelSource::Timestamped { timestamps, .. } => {
                (*timestamps.first()?, *timestamps.last()?)
            }
            ChannelSource::Estimated { start, end, .. } => (*start, *end),
        };
        let span = last - first;
        let n = self.len();
        if n < 2 || !(span.is_finite() && span > 0.0) {
            return None;
        }
        Some((n - 1) as f64 / span)
    }

    /// Relative gap between `native_hz` and [`Self::observed_hz`], when it
    /// exceeds 10%. `None` if either rate is unknown or they agree.
    pub fn rate_mismatch(&self) -> Option<f64> {
        let declared = self.native_hz.filter(|hz| hz.is_finite() && *hz > 0.0)?;
        let observed = self.observed_hz()?;
        let relative = (observed - declared).abs() / declared;
        (relative > RATE_TOLERANCE).then_some(relative)
    }

    /// Resample this channel onto `grid`.
    pub fn resample(&self, grid: &[f64]) -> Result<Vec<f64>, PwError> {
        match &self.source {
            ChannelSource::Timestamped { timestamps, values } => {
                interpolate(timestamps, values, grid, self.scale_factor)
            }
            ChannelSource::Estimated { values, start, end } => {
                let timestamps = estimate_channel_timestamps(values.len(), *start, *end);
                interpolate(&timestamps, values, grid, self.scale_factor)
            }
        }
    }
}

/// Uniformly sampled channels: one row per grid point, one column per channel.
#[derive(Clone, Debug)]
pub struct SampleMatrix {
    pub times: Array1<f64>,
    pub names: Vec<String>,
    pub values: Array2<f64>,
}

impl SampleMatrix {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.names.len()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.values.column(idx))
    }
}

/// Align every channel onto one grid over `[start_s, end_s]`.
pub fn align_channels(
    channels: &[Channel],
    start_s: f64,
    end_s: f64,
    frequency_hz: f64,
) -> Result<SampleMatrix, PwError> {
    align_channels_observed(channels, start_s, end_s, frequency_hz, &NoopMetrics)
}

/// [`align_channels`] reporting per-channel counts to `metrics`.
///
/// Channels are independent and are interpolated in parallel; column order
/// follows `channels`.
pub fn align_channels_observed(
    channels: &[Channel],
    start_s: f64,
    end_s: f64,
    frequency_hz: f64,
    metrics: &dyn ProfileMetrics,
) -> Result<SampleMatrix, PwError> {
    let grid = create_time_grid(start_s, end_s, frequency_hz)?;
    for channel in channels.iter().filter(|c| c.is_empty()) {
        warn!("channel {} has no samples; filling with zeros", channel.name);
    }
    for channel in channels {
        if let (Some(gap), Some(declared), Some(observed)) =
            (channel.rate_mismatch(), channel.native_hz, channel.observed_hz())
        {
            warn!(
                "channel {} declares {} Hz but its samples span {:.3} Hz ({:.0}% apart)",
                channel.name,
                declared,
                observed,
                gap * 100.0
            );
        }
    }

    let columns = channels
        .par_iter()
        .map(|channel| channel.resample(&grid))
        .collect::<Result<Vec<_>, PwError>>()?;

    let mut values = Array2::<f64>::zeros((grid.len(), channels.len()));
    for (j, (channel, column)) in channels.iter().zip(columns.iter()).enumerate() {
        values.column_mut(j).assign(&ArrayView1::from(column.as_slice()));
        metrics.channel_aligned(&channel.name, channel.len(), column.len());
    }
    debug!(
        "aligned {} channels onto {} points at {} Hz",
        channels.len(),
        grid.len(),
        frequency_hz
    );

    Ok(SampleMatrix {
        times: Array1::from_vec(grid),
        names: channels.iter().map(|c| c.name.clone()).collect(),
        values,
    })
}
