//! Telemetry channel alignment and confidence-scored driving profiles.
//!
//! Two halves share this crate: [`align`] resamples multi-rate telemetry
//! channels onto a uniform time grid, and [`profile`] folds completed
//! sessions into a Driver → Car → Track hierarchy whose trust is scored by
//! [`confidence`] using the exponential decay in [`recency`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod align;
pub mod confidence;
pub mod metrics;
pub mod profile;
pub mod recency;
pub mod session;

pub use align::{
    align_channels, create_time_grid, estimate_channel_timestamps, interpolate,
    interpolate_multi_column, Channel, ChannelSource, SampleMatrix,
};
pub use confidence::ConfidenceScorer;
pub use metrics::{CountingMetrics, MetricsSnapshot, NoopMetrics, ProfileLevel, ProfileMetrics};
pub use profile::{
    CarKey, CarProfile, DriverId, DriverProfile, ProfileAggregator, ProfileState, TrackKey,
    TrackProfile,
};
pub use recency::{Clock, RecencyWeighter};
pub use session::{DrivingStyle, LapMetadata, SessionMetadata, SessionRecord};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PwError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("source timestamps ({timestamps}) and values ({values}) must have the same length")]
    LengthMismatch { timestamps: usize, values: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Tunables shared by the aligner, the scorer and the aggregator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfileParams {
    /// Age at which a session's recency weight halves.
    pub half_life_days: f64,
    /// Profiles whose newest session is older than this read as stale.
    pub stale_after_days: f64,
    pub grid_frequency_hz: f64,
    /// Child confidences above this earn the parent a diversity bonus.
    pub high_confidence_threshold: f64,
    pub diversity_bonus_step: f64,
    pub diversity_bonus_cap: f64,
    /// Laps reporting more fuel than this are treated as sensor outliers.
    pub max_fuel_per_lap: f64,
}

impl Default for ProfileParams {
    fn default() -> Self {
        Self {
            half_life_days: 90.0,
            stale_after_days: 90.0,
            grid_frequency_hz: 50.0,
            high_confidence_threshold: 0.7,
            diversity_bonus_step: 0.05,
            diversity_bonus_cap: 0.2,
            max_fuel_per_lap: 50.0,
        }
    }
}

impl ProfileParams {
    /// Parse parameters from JSON; missing keys fall back to defaults.
    pub fn from_json_str(text: &str) -> Result<Self, PwError> {
        let params: ProfileParams =
            serde_json::from_str(text).map_err(|e| PwError::InvalidConfig(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), PwError> {
        let positive = [
            ("half_life_days", self.half_life_days),
            ("stale_after_days", self.stale_after_days),
            ("grid_frequency_hz", self.grid_frequency_hz),
            ("max_fuel_per_lap", self.max_fuel_per_lap),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(PwError::InvalidConfig(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        let unit = [
            ("high_confidence_threshold", self.high_confidence_threshold),
            ("diversity_bonus_step", self.diversity_bonus_step),
            ("diversity_bonus_cap", self.diversity_bonus_cap),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(PwError::InvalidConfig(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Stable hash of the effective parameters, used to stamp reports.
    pub fn params_hash_sha256(&self) -> Result<String, PwError> {
        let bytes = serde_json::to_vec(self).map_err(|e| PwError::InvalidConfig(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
