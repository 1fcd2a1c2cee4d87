//! Session and lap aggregates handed over by the importer, plus the lap
//! statistics the profiles are built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Style classification needs at least this many timed laps.
const STYLE_MIN_LAPS: usize = 5;
const SMOOTH_MAX_CV: f64 = 0.02;
const AGGRESSIVE_MIN_CV: f64 = 0.05;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapMetadata {
    pub lap_number: u32,
    pub lap_time_s: f64,
    /// Counts toward statistics (excludes out laps, formation laps).
    #[serde(default = "yes")]
    pub is_valid: bool,
    /// Completed without incidents.
    #[serde(default = "yes")]
    pub is_clear: bool,
    #[serde(default)]
    pub fuel_used: f64,
    #[serde(default)]
    pub fuel_remaining: f64,
    #[serde(default)]
    pub avg_speed: f64,
    /// Average tyre wear at lap end, 0.0-1.0.
    #[serde(default)]
    pub tyre_wear: f64,
    pub lap_start: DateTime<Utc>,
}

fn yes() -> bool {
    true
}

impl LapMetadata {
    /// A lap whose time contributes to averages and consistency.
    pub fn is_timed(&self) -> bool {
        self.is_valid && self.lap_time_s.is_finite() && self.lap_time_s > 0.0
    }

    /// A timed lap with a plausible fuel figure.
    pub fn has_fuel_sample(&self, max_fuel_per_lap: f64) -> bool {
        self.is_timed() && self.fuel_used > 0.0 && self.fuel_used < max_fuel_per_lap
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub session_date: DateTime<Utc>,
    #[serde(default)]
    pub session_type: String,
    pub driver_id: String,
    #[serde(default)]
    pub driver_name: String,
    pub car_id: String,
    #[serde(default)]
    pub car_name: String,
    pub track_id: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub lap_count: u32,
    #[serde(default)]
    pub total_fuel_used: f64,
    #[serde(default)]
    pub avg_fuel_per_lap: f64,
}

/// One completed session together with its laps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub laps: Vec<LapMetadata>,
}

impl SessionRecord {
    pub fn new(metadata: SessionMetadata, laps: Vec<LapMetadata>) -> Self {
        Self { metadata, laps }
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.metadata.session_date
    }

    pub fn timed_laps(&self) -> impl Iterator<Item = &LapMetadata> {
        self.laps.iter().filter(|lap| lap.is_timed())
    }

    /// Mean positive tyre-wear increase between consecutive laps, ordered by
    /// lap number. `None` when no lap shows an increase.
    pub fn tyre_degradation_per_lap(&self) -> Option<f64> {
        let mut laps: Vec<&LapMetadata> = self.laps.iter().filter(|l| l.is_valid).collect();
        laps.sort_by_key(|l| l.lap_number);
        let deltas: Vec<f64> = laps
            .windows(2)
            .map(|w| w[1].tyre_wear - w[0].tyre_wear)
            .filter(|d| *d > 0.0)
            .collect();
        if deltas.is_empty() {
            None
        } else {
            Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DrivingStyle {
    Unknown,
    Smooth,
    Aggressive,
    Mixed,
}

impl Default for DrivingStyle {
    fn default() -> Self {
        DrivingStyle::Unknown
    }
}

impl DrivingStyle {
    /// Classify from the lap-time coefficient of variation.
    pub fn classify(lap_times: &[f64]) -> Self {
        if lap_times.len() < STYLE_MIN_LAPS {
            return DrivingStyle::Unknown;
        }
        let mean = mean(lap_times);
        if mean <= 0.0 {
            return DrivingStyle::Unknown;
        }
        let cv = population_std_dev(lap_times) / mean;
        if cv < SMOOTH_MAX_CV {
            DrivingStyle::Smooth
        } else if cv > AGGRESSIVE_MIN_CV {
            DrivingStyle::Aggressive
        } else {
            DrivingStyle::Mixed
        }
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub(crate) fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
