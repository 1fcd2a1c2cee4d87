//! Multi-factor confidence for aggregated profiles.
//!
//! Track-level confidence is the product of four factors, each in `[0, 1]`:
//!
//! - recency: mean recency weight of the contributing sessions
//! - sample size: `min(1, log10(laps + 1) / 3)`, ~0.35 at 10 laps, 1.0 near 1000
//! - consistency: 1.0 below 0.5 s lap-time deviation, falling linearly to 0 at 2.5 s
//! - session count: `min(1, 0.3 + 0.07 * sessions)`
//!
//! Any weak factor drags the whole score down. Parents (car, driver) roll up
//! their children's confidences with a capped bonus for well-supported breadth.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::recency::RecencyWeighter;
use crate::session::{LapMetadata, SessionMetadata};
use crate::ProfileParams;

const CONSISTENT_STD_DEV_S: f64 = 0.5;
const CONSISTENCY_FALLOFF_S: f64 = 2.0;
const SAMPLE_SATURATION_LOG10: f64 = 3.0;
const SESSION_FACTOR_BASE: f64 = 0.3;
const SESSION_FACTOR_STEP: f64 = 0.07;

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq)]
pub struct ConfidenceBreakdown {
    pub recency: f64,
    pub sample: f64,
    pub consistency: f64,
    pub session: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug)]
pub struct ConfidenceScorer {
    weighter: RecencyWeighter,
    high_confidence_threshold: f64,
    diversity_bonus_step: f64,
    diversity_bonus_cap: f64,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(RecencyWeighter::default(), &ProfileParams::default())
    }
}

impl ConfidenceScorer {
    pub fn new(weighter: RecencyWeighter, params: &ProfileParams) -> Self {
        Self {
            weighter,
            high_confidence_threshold: params.high_confidence_threshold,
            diversity_bonus_step: params.diversity_bonus_step,
            diversity_bonus_cap: params.diversity_bonus_cap,
        }
    }

    pub fn weighter(&self) -> &RecencyWeighter {
        &self.weighter
    }

    /// Confidence for a track profile; 0.0 when there are no sessions or laps.
    pub fn calculate_confidence(
        &self,
        sessions: &[SessionMetadata],
        laps: &[LapMetadata],
        lap_time_std_dev: f64,
    ) -> f64 {
        self.score(
            sessions.iter().map(|s| s.session_date),
            laps.len(),
            lap_time_std_dev,
        )
        .confidence
    }

    /// Per-factor view of [`Self::calculate_confidence`].
    pub fn score<I>(&self, session_dates: I, lap_count: usize, lap_time_std_dev: f64) -> ConfidenceBreakdown
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let dates: Vec<DateTime<Utc>> = session_dates.into_iter().collect();
        if dates.is_empty() || lap_count == 0 {
            return ConfidenceBreakdown::default();
        }

        let recency = self.recency_factor(&dates);
        let sample = sample_factor(lap_count);
        let consistency = consistency_factor(lap_time_std_dev);
        let session = session_factor(dates.len());
        let confidence = (recency * sample * consistency * session).clamp(0.0, 1.0);

        ConfidenceBreakdown {
            recency,
            sample,
            consistency,
            session,
            confidence,
        }
    }

    pub fn recency_factor(&self, session_dates: &[DateTime<Utc>]) -> f64 {
        if session_dates.is_empty() {
            return 0.0;
        }
        let total: f64 = session_dates.iter().map(|d| self.weighter.weight(*d)).sum();
        total / session_dates.len() as f64
    }

    /// Roll child confidences up into a parent: mean plus a capped bonus per
    /// child above the high-confidence threshold, clamped to 1.0.
    pub fn calculate_driver_confidence(&self, child_confidences: &[f64]) -> f64 {
        if child_confidences.is_empty() {
            return 0.0;
        }
        let mean = child_confidences.iter().sum::<f64>() / child_confidences.len() as f64;
        let strong = child_confidences
            .iter()
            .filter(|c| **c > self.high_confidence_threshold)
            .count();
        let bonus = (strong as f64 * self.diversity_bonus_step).min(self.diversity_bonus_cap);
        (mean + bonus).clamp(0.0, 1.0)
    }
}

pub fn sample_factor(lap_count: usize) -> f64 {
    ((lap_count as f64 + 1.0).log10() / SAMPLE_SATURATION_LOG10).min(1.0)
}

pub fn consistency_factor(lap_time_std_dev: f64) -> f64 {
    if lap_time_std_dev < CONSISTENT_STD_DEV_S {
        1.0
    } else {
        (1.0 - (lap_time_std_dev - CONSISTENT_STD_DEV_S) / CONSISTENCY_FALLOFF_S).max(0.0)
    }
}

pub fn session_factor(session_count: usize) -> f64 {
    (SESSION_FACTOR_BASE + session_count as f64 * SESSION_FACTOR_STEP).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recency::Clock;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn scorer() -> ConfidenceScorer {
        ConfidenceScorer::new(
            RecencyWeighter::with_clock(Clock::Fixed(now())),
            &ProfileParams::default(),
        )
    }

    fn session(days_ago: i64) -> SessionMetadata {
        let mut s: SessionMetadata = serde_json::from_value(serde_json::json!({
            "session_id": format!("s{days_ago}"),
            "session_date": "2026-10-18T12:00:00Z",
            "driver_id": "d1",
            "car_id": "c1",
            "track_id": "t1",
        }))
        .unwrap();
        s.session_date = now() - Duration::days(days_ago);
        s
    }

    fn laps(count: u32) -> Vec<LapMetadata> {
        (0..count)
            .map(|i| LapMetadata {
                lap_number: i + 1,
                lap_time_s: 120.0,
                is_valid: true,
                is_clear: true,
                fuel_used: 1.9,
                fuel_remaining: 0.0,
                avg_speed: 0.0,
                tyre_wear: 0.0,
                lap_start: now(),
            })
            .collect()
    }

    #[test]
    fn test_no_data_is_zero() {
        let s = scorer();
        for std in [0.0, 0.5, 3.0] {
            assert_eq!(s.calculate_confidence(&[], &[], std), 0.0);
        }
        assert_eq!(s.calculate_confidence(&[session(1)], &[], 0.3), 0.0);
        assert_eq!(s.calculate_confidence(&[], &laps(10), 0.3), 0.0);
    }

    #[test]
    fn test_factor_anchor_points() {
        assert!((sample_factor(9) - 1.0 / 3.0).abs() < 1e-12);
        assert!((sample_factor(99) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(sample_factor(5000), 1.0);
        assert_eq!(consistency_factor(0.3), 1.0);
        assert!((consistency_factor(1.5) - 0.5).abs() < 1e-12);
        assert_eq!(consistency_factor(2.5), 0.0);
        assert_eq!(consistency_factor(4.0), 0.0);
        assert!((session_factor(1) - 0.37).abs() < 1e-12);
        assert!((session_factor(10) - 1.0).abs() < 1e-12);
        assert_eq!(session_factor(25), 1.0);
    }

    #[test]
    fn test_product_of_factors() {
        let s = scorer();
        let b = s.score([now() - Duration::days(90)], 99, 1.5);
        assert!((b.recency - 0.5).abs() < 1e-12);
        let expected = 0.5 * (2.0 / 3.0) * 0.5 * 0.37;
        assert!((b.confidence - expected).abs() < 1e-12);
    }

    #[test]
    fn test_recent_beats_old() {
        let s = scorer();
        let fresh = s.calculate_confidence(&[session(1)], &laps(50), 0.3);
        let old = s.calculate_confidence(&[session(180)], &laps(50), 0.3);
        assert!(fresh > old);
        assert!(old < 0.4);
    }

    #[test]
    fn test_monotone_in_laps_and_std_dev() {
        let s = scorer();
        let sessions = [session(3), session(10)];
        let mut last = 0.0;
        for count in [1, 2, 5, 10, 50, 200, 1000, 2000] {
            let c = s.calculate_confidence(&sessions, &laps(count), 0.4);
            assert!(c >= last, "lap count {count}");
            last = c;
        }
        let lap_set = laps(100);
        let mut last = f64::INFINITY;
        for std in [0.0, 0.4, 0.5, 0.8, 1.2, 2.0, 2.5, 3.0] {
            let c = s.calculate_confidence(&sessions, &lap_set, std);
            assert!(c <= last, "std dev {std}");
            last = c;
        }
    }

    #[test]
    fn test_confidence_bounded() {
        let s = scorer();
        let sessions: Vec<_> = (0..20).map(|_| session(0)).collect();
        let c = s.calculate_confidence(&sessions, &laps(2000), 0.1);
        assert!(c <= 1.0 && c > 0.99);
    }

    #[test]
    fn test_rollup() {
        let s = scorer();
        assert_eq!(s.calculate_driver_confidence(&[]), 0.0);

        let children = [0.8, 0.7, 0.6];
        let mean = 0.7;
        let rolled = s.calculate_driver_confidence(&children);
        assert!(rolled > mean && rolled < mean + 0.2);
        assert!((rolled - 0.75).abs() < 1e-12);

        let capped = s.calculate_driver_confidence(&[0.95; 6]);
        assert_eq!(capped, 1.0);
        let bonus_cap = s.calculate_driver_confidence(&[0.75; 6]);
        assert!((bonus_cap - 0.95).abs() < 1e-12);
    }
}
