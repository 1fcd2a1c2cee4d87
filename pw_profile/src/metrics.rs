//! Counters hooks for the aligner and the aggregator.
//!
//! Callers pass an implementation in explicitly; nothing here is global.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
pub enum ProfileLevel {
    Driver,
    Car,
    Track,
}

/// Every hook defaults to a no-op so implementors only override what they count.
pub trait ProfileMetrics: Send + Sync {
    fn channel_aligned(&self, _name: &str, _source_samples: usize, _output_samples: usize) {}

    fn session_recorded(&self, _driver: &str, _car: &str, _track: &str) {}

    fn profile_created(&self, _level: ProfileLevel) {}

    fn profile_reset(&self, _level: ProfileLevel) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ProfileMetrics for NoopMetrics {}

/// Lock-free tallies, safe to share across rayon workers.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    channels_aligned: AtomicU64,
    samples_emitted: AtomicU64,
    sessions_recorded: AtomicU64,
    drivers_created: AtomicU64,
    cars_created: AtomicU64,
    tracks_created: AtomicU64,
    profiles_reset: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub channels_aligned: u64,
    pub samples_emitted: u64,
    pub sessions_recorded: u64,
    pub drivers_created: u64,
    pub cars_created: u64,
    pub tracks_created: u64,
    pub profiles_reset: u64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_aligned: self.channels_aligned.load(Ordering::Relaxed),
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
            sessions_recorded: self.sessions_recorded.load(Ordering::Relaxed),
            drivers_created: self.drivers_created.load(Ordering::Relaxed),
            cars_created: self.cars_created.load(Ordering::Relaxed),
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            profiles_reset: self.profiles_reset.load(Ordering::Relaxed),
        }
    }
}

impl ProfileMetrics for CountingMetrics {
    fn channel_aligned(&self, _name: &str, _source_samples: usize, output_samples: usize) {
        self.channels_aligned.fetch_add(1, Ordering::Relaxed);
        self.samples_emitted
            .fetch_add(output_samples as u64, Ordering::Relaxed);
    }

    fn session_recorded(&self, _driver: &str, _car: &str, _track: &str) {
        self.sessions_recorded.fetch_add(1, Ordering::Relaxed);
    }

    fn profile_created(&self, level: ProfileLevel) {
        let counter = match level {
            ProfileLevel::Driver => &self.drivers_created,
            ProfileLevel::Car => &self.cars_created,
            ProfileLevel::Track => &self.tracks_created,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn profile_reset(&self, _level: ProfileLevel) {
        self.profiles_reset.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_metrics_tallies() {
        let metrics = CountingMetrics::new();
        metrics.channel_aligned("speed", 100, 51);
        metrics.channel_aligned("rpm", 10, 51);
        metrics.profile_created(ProfileLevel::Track);
        metrics.profile_created(ProfileLevel::Driver);
        metrics.session_recorded("d", "c", "t");

        let snap = metrics.snapshot();
        assert_eq!(snap.channels_aligned, 2);
        assert_eq!(snap.samples_emitted, 102);
        assert_eq!(snap.tracks_created, 1);
        assert_eq!(snap.drivers_created, 1);
        assert_eq!(snap.cars_created, 0);
        assert_eq!(snap.sessions_recorded, 1);
    }
}
