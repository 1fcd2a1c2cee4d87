//! Exponential recency decay.
//!
//! `weight = exp(-ln(2) * age_days / half_life)`: 1.0 today, 0.5 one
//! half-life ago, 0.25 two half-lives ago, never reaching zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HALF_LIFE_DAYS: f64 = 90.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Source of "now" for age computations.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }

    /// Fractional days from `date` to now; future dates count as age zero.
    pub fn days_since(&self, date: DateTime<Utc>) -> f64 {
        let millis = (self.now() - date).num_milliseconds() as f64;
        (millis / MILLIS_PER_DAY).max(0.0)
    }
}

#[derive(Clone, Debug)]
pub struct RecencyWeighter {
    half_life_days: f64,
    clock: Clock,
}

impl Default for RecencyWeighter {
    fn default() -> Self {
        Self::new(DEFAULT_HALF_LIFE_DAYS, Clock::System)
    }
}

impl RecencyWeighter {
    /// Non-finite or non-positive half-lives fall back to the default.
    pub fn new(half_life_days: f64, clock: Clock) -> Self {
        let half_life_days = if half_life_days.is_finite() && half_life_days > 0.0 {
            half_life_days
        } else {
            DEFAULT_HALF_LIFE_DAYS
        };
        Self {
            half_life_days,
            clock,
        }
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self::new(DEFAULT_HALF_LIFE_DAYS, clock)
    }

    pub fn half_life_days(&self) -> f64 {
        self.half_life_days
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Importance of an event dated `event_date`, in `(0, 1]`.
    pub fn weight(&self, event_date: DateTime<Utc>) -> f64 {
        self.weight_for_age(self.clock.days_since(event_date))
    }

    pub fn weight_for_age(&self, age_days: f64) -> f64 {
        let age_days = age_days.max(0.0);
        let weight = (-std::f64::consts::LN_2 * age_days / self.half_life_days).exp();
        // exp underflows to 0 after a few centuries; keep the weight positive.
        weight.clamp(f64::MIN_POSITIVE, 1.0)
    }

    /// `Σ(value·weight) / Σ(weight)`; 0.0 for an empty list.
    pub fn weighted_average(&self, measurements: &[(DateTime<Utc>, f64)]) -> f64 {
        if measurements.is_empty() {
            return 0.0;
        }
        let mut total_value = 0.0;
        let mut total_weight = 0.0;
        for (date, value) in measurements {
            let weight = self.weight(*date);
            total_value += value * weight;
            total_weight += weight;
        }
        if total_weight > 0.0 {
            total_value / total_weight
        } else {
            0.0
        }
    }
}
