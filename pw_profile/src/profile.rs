//! Driver → Car → Track profile hierarchy.
//!
//! Profiles live in an arena of ordered maps keyed by stable ids rather than
//! in nested owning collections: a car's tracks are found with a range scan
//! over `TrackKey`, so no child ever points back at its parent. Only track
//! entries hold data (their session history and derived statistics); car and
//! driver figures are rolled up from children whenever they are read.
//!
//! Staleness and confidence both depend on "now" and are evaluated lazily on
//! read against the aggregator's [`Clock`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::confidence::{ConfidenceBreakdown, ConfidenceScorer};
use crate::metrics::{NoopMetrics, ProfileLevel, ProfileMetrics};
use crate::recency::{Clock, RecencyWeighter};
use crate::session::{population_std_dev, DrivingStyle, SessionMetadata, SessionRecord};
use crate::{ProfileParams, PwError};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriverId(pub String);

impl DriverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Field order matters: ordering by driver first makes a driver's cars contiguous.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CarKey {
    pub driver: String,
    pub car: String,
}

impl CarKey {
    pub fn new(driver: impl Into<String>, car: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            car: car.into(),
        }
    }

    pub fn driver_id(&self) -> DriverId {
        DriverId(self.driver.clone())
    }
}

impl fmt::Display for CarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.driver, self.car)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackKey {
    pub driver: String,
    pub car: String,
    pub track: String,
}

impl TrackKey {
    pub fn new(driver: impl Into<String>, car: impl Into<String>, track: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            car: car.into(),
            track: track.into(),
        }
    }

    pub fn from_session(metadata: &SessionMetadata) -> Self {
        Self::new(
            metadata.driver_id.trim(),
            metadata.car_id.trim(),
            metadata.track_id.trim(),
        )
    }

    pub fn car_key(&self) -> CarKey {
        CarKey::new(self.driver.clone(), self.car.clone())
    }

    pub fn driver_id(&self) -> DriverId {
        DriverId(self.driver.clone())
    }

    fn validate(&self) -> Result<(), PwError> {
        if self.driver.is_empty() || self.car.is_empty() || self.track.is_empty() {
            return Err(PwError::InvalidArgument(format!(
                "session needs non-empty driver, car and track ids (got {self})"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.driver, self.car, self.track)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProfileState {
    Uninitialized,
    Active,
    Stale,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TrackProfile {
    pub track_id: String,
    pub track_name: String,
    pub avg_fuel_per_lap: f64,
    pub avg_lap_time_s: f64,
    pub lap_time_std_dev: f64,
    /// Tyre wear gained per lap, 0.0-1.0 scale.
    pub tyre_degradation: f64,
    pub lap_count: usize,
    pub session_count: usize,
    pub style: DrivingStyle,
    pub confidence: f64,
    pub confidence_factors: ConfidenceBreakdown,
    pub state: ProfileState,
    pub is_stale: bool,
    pub last_session_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CarProfile {
    pub car_id: String,
    pub car_name: String,
    pub avg_fuel_per_lap: f64,
    pub lap_count: usize,
    pub session_count: usize,
    pub confidence: f64,
    pub state: ProfileState,
    pub is_stale: bool,
    pub last_session_date: DateTime<Utc>,
    pub tracks: Vec<TrackProfile>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DriverProfile {
    pub driver_id: String,
    pub driver_name: String,
    pub lap_count: usize,
    pub session_count: usize,
    pub style: DrivingStyle,
    pub confidence: f64,
    pub state: ProfileState,
    pub is_stale: bool,
    pub last_session_date: DateTime<Utc>,
    pub cars: Vec<CarProfile>,
}

#[derive(Clone, Debug)]
struct DriverEntry {
    name: String,
}

#[derive(Clone, Debug)]
struct CarEntry {
    name: String,
}

/// Statistics derived from a track's full session history.
#[derive(Clone, Debug)]
struct TrackStats {
    avg_fuel_per_lap: f64,
    avg_lap_time_s: f64,
    lap_time_std_dev: f64,
    tyre_degradation: f64,
    lap_count: usize,
    style: DrivingStyle,
    last_session_date: DateTime<Utc>,
    /// Score at the time of the last update, kept for change logging.
    confidence: f64,
}

#[derive(Clone, Debug)]
struct TrackEntry {
    name: String,
    sessions: Vec<SessionRecord>,
    stats: TrackStats,
    last_updated: DateTime<Utc>,
}

impl TrackEntry {
    fn session_dates(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.sessions.iter().map(|s| s.date())
    }
}

fn compute_track_stats(
    sessions: &[SessionRecord],
    weighter: &RecencyWeighter,
    scorer: &ConfidenceScorer,
    params: &ProfileParams,
) -> TrackStats {
    let mut lap_times = Vec::new();
    let mut timed = Vec::new();
    let mut fuel = Vec::new();
    let mut degradation = Vec::new();

    for session in sessions {
        for lap in session.timed_laps() {
            lap_times.push(lap.lap_time_s);
            timed.push((lap.lap_start, lap.lap_time_s));
            if lap.has_fuel_sample(params.max_fuel_per_lap) {
                fuel.push((lap.lap_start, lap.fuel_used));
            }
        }
        if let Some(rate) = session.tyre_degradation_per_lap() {
            degradation.push((session.date(), rate));
        }
    }

    if fuel.is_empty() {
        // No per-lap fuel; fall back to the session aggregates.
        fuel = sessions
            .iter()
            .filter(|s| {
                s.metadata.avg_fuel_per_lap > 0.0
                    && s.metadata.avg_fuel_per_lap < params.max_fuel_per_lap
            })
            .map(|s| (s.date(), s.metadata.avg_fuel_per_lap))
            .collect();
    }

    let lap_time_std_dev = population_std_dev(&lap_times);
    let last_session_date = sessions
        .iter()
        .map(|s| s.date())
        .max()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let confidence = scorer
        .score(sessions.iter().map(|s| s.date()), lap_times.len(), lap_time_std_dev)
        .confidence;

    TrackStats {
        avg_fuel_per_lap: weighter.weighted_average(&fuel),
        avg_lap_time_s: weighter.weighted_average(&timed),
        lap_time_std_dev,
        tyre_degradation: weighter.weighted_average(&degradation),
        lap_count: lap_times.len(),
        style: DrivingStyle::classify(&lap_times),
        last_session_date,
        confidence,
    }
}

pub struct ProfileAggregator {
    params: ProfileParams,
    clock: Clock,
    weighter: RecencyWeighter,
    scorer: ConfidenceScorer,
    metrics: Arc<dyn ProfileMetrics>,
    drivers: BTreeMap<DriverId, DriverEntry>,
    cars: BTreeMap<CarKey, CarEntry>,
    tracks: BTreeMap<TrackKey, TrackEntry>,
}

impl Default for ProfileAggregator {
    fn default() -> Self {
        Self::new(ProfileParams::default(), Clock::System)
    }
}

impl fmt::Debug for ProfileAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileAggregator")
            .field("clock", &self.clock)
            .field("drivers", &self.drivers.len())
            .field("cars", &self.cars.len())
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

impl ProfileAggregator {
    pub fn new(params: ProfileParams, clock: Clock) -> Self {
        let weighter = RecencyWeighter::new(params.half_life_days, clock);
        let scorer = ConfidenceScorer::new(weighter.clone(), &params);
        Self {
            params,
            clock,
            weighter,
            scorer,
            metrics: Arc::new(NoopMetrics),
            drivers: BTreeMap::new(),
            cars: BTreeMap::new(),
            tracks: BTreeMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ProfileMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn params(&self) -> &ProfileParams {
        &self.params
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn scorer(&self) -> &ConfidenceScorer {
        &self.scorer
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn car_count(&self) -> usize {
        self.cars.len()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Fold one completed session into its driver/car/track profiles,
    /// creating any missing level. Re-recording a session id replaces the
    /// earlier copy instead of counting it twice.
    pub fn record_session(&mut self, record: SessionRecord) -> Result<TrackKey, PwError> {
        let key = TrackKey::from_session(&record.metadata);
        key.validate()?;
        let now = self.clock.now();
        let metadata = record.metadata.clone();

        let driver_id = key.driver_id();
        match self.drivers.get_mut(&driver_id) {
            Some(entry) => refresh_name(&mut entry.name, &metadata.driver_name),
            None => {
                info!("driver profile created: {}", driver_id);
                self.drivers.insert(
                    driver_id,
                    DriverEntry {
                        name: name_or_id(&metadata.driver_name, &key.driver),
                    },
                );
                self.metrics.profile_created(ProfileLevel::Driver);
            }
        }

        let car_key = key.car_key();
        match self.cars.get_mut(&car_key) {
            Some(entry) => refresh_name(&mut entry.name, &metadata.car_name),
            None => {
                info!("car profile created: {}", car_key);
                self.cars.insert(
                    car_key,
                    CarEntry {
                        name: name_or_id(&metadata.car_name, &key.car),
                    },
                );
                self.metrics.profile_created(ProfileLevel::Car);
            }
        }

        match self.tracks.get_mut(&key) {
            Some(entry) => {
                refresh_name(&mut entry.name, &metadata.track_name);
                let previous = entry.stats.confidence;
                match entry
                    .sessions
                    .iter()
                    .position(|s| s.metadata.session_id == metadata.session_id)
                {
                    Some(idx) => {
                        warn!(
                            "session {} already recorded for {}; replacing it",
                            metadata.session_id, key
                        );
                        entry.sessions[idx] = record;
                    }
                    None => entry.sessions.push(record),
                }
                entry.stats =
                    compute_track_stats(&entry.sessions, &self.weighter, &self.scorer, &self.params);
                entry.last_updated = now;
                debug!(
                    "track profile {} updated: {} sessions, confidence {:.3} -> {:.3}",
                    key,
                    entry.sessions.len(),
                    previous,
                    entry.stats.confidence
                );
            }
            None => {
                let sessions = vec![record];
                let stats = compute_track_stats(&sessions, &self.weighter, &self.scorer, &self.params);
                info!(
                    "track profile created: {} ({} laps, confidence {:.3})",
                    key, stats.lap_count, stats.confidence
                );
                self.tracks.insert(
                    key.clone(),
                    TrackEntry {
                        name: name_or_id(&metadata.track_name, &key.track),
                        sessions,
                        stats,
                        last_updated: now,
                    },
                );
                self.metrics.profile_created(ProfileLevel::Track);
            }
        }

        self.metrics
            .session_recorded(&key.driver, &key.car, &key.track);
        Ok(key)
    }

    /// Record sessions one after another; stops at the first invalid record.
    pub fn record_sessions<I>(&mut self, records: I) -> Result<usize, PwError>
    where
        I: IntoIterator<Item = SessionRecord>,
    {
        let mut count = 0;
        for record in records {
            self.record_session(record)?;
            count += 1;
        }
        Ok(count)
    }

    /// Record a batch with one worker per driver subtree.
    ///
    /// Each driver's existing profiles are moved into a private shard, the
    /// shard applies that driver's sessions in input order, and the shards
    /// are merged back. Subtrees share nothing, so no locking is needed and
    /// the result matches [`Self::record_sessions`]. The whole batch is
    /// validated first; an invalid record rejects the batch untouched.
    pub fn ingest_parallel(&mut self, records: Vec<SessionRecord>) -> Result<usize, PwError> {
        for record in &records {
            TrackKey::from_session(&record.metadata).validate()?;
        }

        let mut by_driver: BTreeMap<DriverId, Vec<SessionRecord>> = BTreeMap::new();
        for record in records {
            let driver = DriverId::new(record.metadata.driver_id.trim());
            by_driver.entry(driver).or_default().push(record);
        }

        let shards: Vec<(ProfileAggregator, Vec<SessionRecord>)> = by_driver
            .into_iter()
            .map(|(driver, batch)| (self.take_subtree(&driver), batch))
            .collect();
        debug!("ingesting batch across {} driver shards", shards.len());

        let results: Vec<(ProfileAggregator, Result<usize, PwError>)> = shards
            .into_par_iter()
            .map(|(mut shard, batch)| {
                let outcome = shard.record_sessions(batch);
                (shard, outcome)
            })
            .collect();

        let mut total = 0;
        let mut first_err = None;
        for (shard, outcome) in results {
            self.merge(shard);
            match outcome {
                Ok(n) => total += n,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    fn empty_like(&self) -> Self {
        Self {
            params: self.params.clone(),
            clock: self.clock,
            weighter: self.weighter.clone(),
            scorer: self.scorer.clone(),
            metrics: Arc::clone(&self.metrics),
            drivers: BTreeMap::new(),
            cars: BTreeMap::new(),
            tracks: BTreeMap::new(),
        }
    }

    fn take_subtree(&mut self, driver: &DriverId) -> Self {
        let mut shard = self.empty_like();
        if let Some(entry) = self.drivers.remove(driver) {
            shard.drivers.insert(driver.clone(), entry);
        }
        let car_keys: Vec<CarKey> = self.cars_of(driver).map(|(k, _)| k.clone()).collect();
        for key in car_keys {
            if let Some(entry) = self.cars.remove(&key) {
                shard.cars.insert(key, entry);
            }
        }
        let track_keys: Vec<TrackKey> = self
            .tracks_of_driver(driver)
            .map(|(k, _)| k.clone())
            .collect();
        for key in track_keys {
            if let Some(entry) = self.tracks.remove(&key) {
                shard.tracks.insert(key, entry);
            }
        }
        shard
    }

    fn merge(&mut self, shard: Self) {
        self.drivers.extend(shard.drivers);
        self.cars.extend(shard.cars);
        self.tracks.extend(shard.tracks);
    }

    fn cars_of<'a>(
        &'a self,
        driver: &'a DriverId,
    ) -> impl Iterator<Item = (&'a CarKey, &'a CarEntry)> + 'a {
        self.cars
            .range(CarKey::new(driver.as_str(), "")..)
            .take_while(move |(k, _)| k.driver == driver.0)
    }

    fn tracks_of_car<'a>(
        &'a self,
        car: &'a CarKey,
    ) -> impl Iterator<Item = (&'a TrackKey, &'a TrackEntry)> + 'a {
        self.tracks
            .range(TrackKey::new(car.driver.as_str(), car.car.as_str(), "")..)
            .take_while(move |(k, _)| k.driver == car.driver && k.car == car.car)
    }

    fn tracks_of_driver<'a>(
        &'a self,
        driver: &'a DriverId,
    ) -> impl Iterator<Item = (&'a TrackKey, &'a TrackEntry)> + 'a {
        self.tracks
            .range(TrackKey::new(driver.as_str(), "", "")..)
            .take_while(move |(k, _)| k.driver == driver.0)
    }

    fn state_for(&self, last_session_date: DateTime<Utc>) -> ProfileState {
        if self.clock.days_since(last_session_date) > self.params.stale_after_days {
            ProfileState::Stale
        } else {
            ProfileState::Active
        }
    }

    /// Lifecycle state of a driver+car+track triple as of now.
    pub fn track_state(&self, key: &TrackKey) -> ProfileState {
        match self.tracks.get(key) {
            Some(entry) => self.state_for(entry.stats.last_session_date),
            None => ProfileState::Uninitialized,
        }
    }

    pub fn sessions_for(&self, key: &TrackKey) -> Option<&[SessionRecord]> {
        self.tracks.get(key).map(|e| e.sessions.as_slice())
    }

    pub fn track_profile(&self, key: &TrackKey) -> Option<TrackProfile> {
        let entry = self.tracks.get(key)?;
        Some(self.track_snapshot(key, entry))
    }

    fn track_snapshot(&self, key: &TrackKey, entry: &TrackEntry) -> TrackProfile {
        let stats = &entry.stats;
        let factors = self
            .scorer
            .score(entry.session_dates(), stats.lap_count, stats.lap_time_std_dev);
        let state = self.state_for(stats.last_session_date);
        TrackProfile {
            track_id: key.track.clone(),
            track_name: entry.name.clone(),
            avg_fuel_per_lap: stats.avg_fuel_per_lap,
            avg_lap_time_s: stats.avg_lap_time_s,
            lap_time_std_dev: stats.lap_time_std_dev,
            tyre_degradation: stats.tyre_degradation,
            lap_count: stats.lap_count,
            session_count: entry.sessions.len(),
            style: stats.style,
            confidence: factors.confidence,
            confidence_factors: factors,
            state,
            is_stale: state == ProfileState::Stale,
            last_session_date: stats.last_session_date,
            last_updated: entry.last_updated,
        }
    }

    pub fn car_profile(&self, key: &CarKey) -> Option<CarProfile> {
        let entry = self.cars.get(key)?;
        Some(self.car_snapshot(key, entry))
    }

    fn car_snapshot(&self, key: &CarKey, entry: &CarEntry) -> CarProfile {
        let tracks: Vec<TrackProfile> = self
            .tracks_of_car(key)
            .map(|(k, e)| self.track_snapshot(k, e))
            .collect();
        let confidences: Vec<f64> = tracks.iter().map(|t| t.confidence).collect();
        let confidence = self.scorer.calculate_driver_confidence(&confidences);

        let fuel_laps: usize = tracks
            .iter()
            .filter(|t| t.avg_fuel_per_lap > 0.0)
            .map(|t| t.lap_count)
            .sum();
        let avg_fuel_per_lap = if fuel_laps > 0 {
            tracks
                .iter()
                .filter(|t| t.avg_fuel_per_lap > 0.0)
                .map(|t| t.avg_fuel_per_lap * t.lap_count as f64)
                .sum::<f64>()
                / fuel_laps as f64
        } else {
            0.0
        };

        let last_session_date = tracks
            .iter()
            .map(|t| t.last_session_date)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let state = self.state_for(last_session_date);

        CarProfile {
            car_id: key.car.clone(),
            car_name: entry.name.clone(),
            avg_fuel_per_lap,
            lap_count: tracks.iter().map(|t| t.lap_count).sum(),
            session_count: tracks.iter().map(|t| t.session_count).sum(),
            confidence,
            state,
            is_stale: state == ProfileState::Stale,
            last_session_date,
            tracks,
        }
    }

    pub fn driver_profile(&self, driver: &DriverId) -> Option<DriverProfile> {
        let entry = self.drivers.get(driver)?;
        Some(self.driver_snapshot(driver, entry))
    }

    fn driver_snapshot(&self, driver: &DriverId, entry: &DriverEntry) -> DriverProfile {
        let cars: Vec<CarProfile> = self
            .cars_of(driver)
            .map(|(k, e)| self.car_snapshot(k, e))
            .collect();
        let confidences: Vec<f64> = cars.iter().map(|c| c.confidence).collect();
        let confidence = self.scorer.calculate_driver_confidence(&confidences);
        let style = cars
            .iter()
            .flat_map(|c| c.tracks.iter())
            .filter(|t| t.style != DrivingStyle::Unknown)
            .max_by_key(|t| t.lap_count)
            .map(|t| t.style)
            .unwrap_or_default();
        let last_session_date = cars
            .iter()
            .map(|c| c.last_session_date)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let state = self.state_for(last_session_date);

        DriverProfile {
            driver_id: driver.0.clone(),
            driver_name: entry.name.clone(),
            lap_count: cars.iter().map(|c| c.lap_count).sum(),
            session_count: cars.iter().map(|c| c.session_count).sum(),
            style,
            confidence,
            state,
            is_stale: state == ProfileState::Stale,
            last_session_date,
            cars,
        }
    }

    /// Every driver hierarchy, ordered by driver id.
    pub fn drivers(&self) -> Vec<DriverProfile> {
        self.drivers
            .iter()
            .map(|(id, entry)| self.driver_snapshot(id, entry))
            .collect()
    }

    /// Drop one track profile. A car or driver left without children goes too.
    pub fn reset_track(&mut self, key: &TrackKey) -> bool {
        if self.tracks.remove(key).is_none() {
            return false;
        }
        info!("track profile reset: {}", key);
        self.metrics.profile_reset(ProfileLevel::Track);
        self.prune_car(&key.car_key());
        true
    }

    pub fn reset_car(&mut self, key: &CarKey) -> bool {
        if !self.cars.contains_key(key) {
            return false;
        }
        let track_keys: Vec<TrackKey> = self.tracks_of_car(key).map(|(k, _)| k.clone()).collect();
        for track in &track_keys {
            self.tracks.remove(track);
        }
        self.cars.remove(key);
        info!("car profile reset: {} ({} tracks)", key, track_keys.len());
        self.metrics.profile_reset(ProfileLevel::Car);
        self.prune_driver(&key.driver_id());
        true
    }

    pub fn reset_driver(&mut self, driver: &DriverId) -> bool {
        if !self.drivers.contains_key(driver) {
            return false;
        }
        let removed = self.take_subtree(driver);
        info!(
            "driver profile reset: {} ({} cars, {} tracks)",
            driver,
            removed.cars.len(),
            removed.tracks.len()
        );
        self.metrics.profile_reset(ProfileLevel::Driver);
        true
    }

    fn prune_car(&mut self, key: &CarKey) {
        if self.tracks_of_car(key).next().is_none() && self.cars.remove(key).is_some() {
            debug!("car profile {} has no tracks left; removed", key);
            self.prune_driver(&key.driver_id());
        }
    }

    fn prune_driver(&mut self, driver: &DriverId) {
        if self.cars_of(driver).next().is_none() && self.drivers.remove(driver).is_some() {
            debug!("driver profile {} has no cars left; removed", driver);
        }
    }
}

fn name_or_id(name: &str, id: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        id.to_string()
    } else {
        trimmed.to_string()
    }
}

fn refresh_name(current: &mut String, incoming: &str) {
    let trimmed = incoming.trim();
    if !trimmed.is_empty() && trimmed != current {
        *current = trimmed.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingMetrics;
    use crate::session::LapMetadata;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn aggregator() -> ProfileAggregator {
        ProfileAggregator::new(ProfileParams::default(), Clock::Fixed(now()))
    }

    fn session(
        id: &str,
        driver: &str,
        car: &str,
        track: &str,
        days_ago: i64,
        lap_times: &[f64],
    ) -> SessionRecord {
        let date = now() - Duration::days(days_ago);
        let metadata = SessionMetadata {
            session_id: id.to_string(),
            session_date: date,
            session_type: "Race".to_string(),
            driver_id: driver.to_string(),
            driver_name: format!("Driver {driver}"),
            car_id: car.to_string(),
            car_name: String::new(),
            track_id: track.to_string(),
            track_name: String::new(),
            lap_count: lap_times.len() as u32,
            total_fuel_used: 0.0,
            avg_fuel_per_lap: 0.0,
        };
        let laps = lap_times
            .iter()
            .enumerate()
            .map(|(i, t)| LapMetadata {
                lap_number: i as u32 + 1,
                lap_time_s: *t,
                is_valid: true,
                is_clear: true,
                fuel_used: 2.0,
                fuel_remaining: 0.0,
                avg_speed: 0.0,
                tyre_wear: 0.01 * (i as f64 + 1.0),
                lap_start: date + Duration::seconds(i as i64 * 90),
            })
            .collect();
        SessionRecord::new(metadata, laps)
    }

    #[test]
    fn test_first_session_creates_hierarchy() {
        let mut agg = aggregator();
        let key = TrackKey::new("d1", "gt3", "spa");
        assert_eq!(agg.track_state(&key), ProfileState::Uninitialized);

        let recorded = agg
            .record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0, 90.2, 89.8]))
            .unwrap();
        assert_eq!(recorded, key);
        assert_eq!(agg.track_state(&key), ProfileState::Active);
        assert_eq!((agg.driver_count(), agg.car_count(), agg.track_count()), (1, 1, 1));

        let track = agg.track_profile(&key).unwrap();
        assert_eq!(track.session_count, 1);
        assert_eq!(track.lap_count, 3);
        assert_eq!(track.track_name, "spa");
        // Lap starts differ by seconds, so weights are nearly equal.
        assert!((track.avg_lap_time_s - 90.0).abs() < 1e-4);
        assert!((track.avg_fuel_per_lap - 2.0).abs() < 1e-12);
        assert!((track.tyre_degradation - 0.01).abs() < 1e-12);
        assert!(track.confidence > 0.0 && track.confidence <= 1.0);
        assert!(!track.is_stale);
    }

    #[test]
    fn test_update_reaverages_and_rescores() {
        let mut agg = aggregator();
        let key = TrackKey::new("d1", "gt3", "spa");
        agg.record_session(session("s1", "d1", "gt3", "spa", 90, &[100.0; 5]))
            .unwrap();
        let before = agg.track_profile(&key).unwrap();

        agg.record_session(session("s2", "d1", "gt3", "spa", 0, &[94.0; 5]))
            .unwrap();
        let after = agg.track_profile(&key).unwrap();

        assert_eq!(after.session_count, 2);
        assert_eq!(after.lap_count, 10);
        // Weights 0.5 and 1.0: (100*0.5 + 94*1.0) / 1.5 = 96
        assert!((after.avg_lap_time_s - 96.0).abs() < 1e-3);
        assert_eq!(after.last_session_date, now());
        assert!(after.confidence != before.confidence);
    }

    #[test]
    fn test_duplicate_session_replaced() {
        let mut agg = aggregator();
        let key = TrackKey::new("d1", "gt3", "spa");
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 4]))
            .unwrap();
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[91.0; 6]))
            .unwrap();
        let track = agg.track_profile(&key).unwrap();
        assert_eq!(track.session_count, 1);
        assert_eq!(track.lap_count, 6);
    }

    #[test]
    fn test_staleness_is_lazy() {
        let key = TrackKey::new("d1", "gt3", "spa");
        let mut agg = aggregator();
        agg.record_session(session("s1", "d1", "gt3", "spa", 100, &[90.0; 5]))
            .unwrap();
        assert_eq!(agg.track_state(&key), ProfileState::Stale);
        let driver = agg.driver_profile(&DriverId::new("d1")).unwrap();
        assert!(driver.is_stale);
        assert!(driver.cars[0].is_stale);

        agg.record_session(session("s2", "d1", "gt3", "spa", 2, &[90.0; 5]))
            .unwrap();
        assert_eq!(agg.track_state(&key), ProfileState::Active);
        assert!(!agg.driver_profile(&DriverId::new("d1")).unwrap().is_stale);
    }

    #[test]
    fn test_rollup_follows_children() {
        let mut agg = aggregator();
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 20]))
            .unwrap();
        agg.record_session(session("s2", "d1", "gt3", "monza", 1, &[80.0; 3]))
            .unwrap();
        agg.record_session(session("s3", "d1", "lmp2", "spa", 1, &[85.0; 8]))
            .unwrap();

        let car = agg.car_profile(&CarKey::new("d1", "gt3")).unwrap();
        assert_eq!(car.tracks.len(), 2);
        assert_eq!(car.tracks[0].track_id, "monza");
        let expected = agg
            .scorer()
            .calculate_driver_confidence(&[car.tracks[0].confidence, car.tracks[1].confidence]);
        assert!((car.confidence - expected).abs() < 1e-12);
        assert_eq!(car.lap_count, 23);
        assert_eq!(car.session_count, 2);

        let driver = agg.driver_profile(&DriverId::new("d1")).unwrap();
        assert_eq!(driver.cars.len(), 2);
        let expected = agg
            .scorer()
            .calculate_driver_confidence(&[driver.cars[0].confidence, driver.cars[1].confidence]);
        assert!((driver.confidence - expected).abs() < 1e-12);
        assert_eq!(driver.session_count, 3);
        assert_eq!(driver.driver_name, "Driver d1");
        assert_eq!(driver.style, DrivingStyle::Smooth);
    }

    #[test]
    fn test_children_do_not_leak_across_prefixes() {
        let mut agg = aggregator();
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        agg.record_session(session("s2", "d10", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        agg.record_session(session("s3", "d1", "gt3x", "spa", 1, &[90.0; 5]))
            .unwrap();
        let d1 = agg.driver_profile(&DriverId::new("d1")).unwrap();
        assert_eq!(d1.cars.len(), 2);
        let gt3 = agg.car_profile(&CarKey::new("d1", "gt3")).unwrap();
        assert_eq!(gt3.tracks.len(), 1);
    }

    #[test]
    fn test_reset_prunes_empty_parents() {
        let mut agg = aggregator();
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        agg.record_session(session("s2", "d1", "gt3", "monza", 1, &[90.0; 5]))
            .unwrap();
        agg.record_session(session("s3", "d1", "lmp2", "spa", 1, &[90.0; 5]))
            .unwrap();

        assert!(agg.reset_track(&TrackKey::new("d1", "gt3", "spa")));
        assert!(!agg.reset_track(&TrackKey::new("d1", "gt3", "spa")));
        assert_eq!(agg.car_count(), 2);

        assert!(agg.reset_track(&TrackKey::new("d1", "gt3", "monza")));
        assert!(agg.car_profile(&CarKey::new("d1", "gt3")).is_none());
        assert_eq!(agg.driver_count(), 1);

        assert!(agg.reset_car(&CarKey::new("d1", "lmp2")));
        assert!(agg.is_empty());
        assert_eq!(agg.track_count(), 0);
    }

    #[test]
    fn test_reset_driver_removes_subtree() {
        let mut agg = aggregator();
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        agg.record_session(session("s2", "d2", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        assert!(agg.reset_driver(&DriverId::new("d1")));
        assert!(!agg.reset_driver(&DriverId::new("d1")));
        assert_eq!(agg.driver_count(), 1);
        assert_eq!(agg.track_count(), 1);
        assert!(agg.driver_profile(&DriverId::new("d2")).is_some());
    }

    #[test]
    fn test_rejects_missing_ids() {
        let mut agg = aggregator();
        let err = agg
            .record_session(session("s1", "d1", " ", "spa", 1, &[90.0]))
            .unwrap_err();
        assert!(matches!(err, PwError::InvalidArgument(_)));
        assert!(agg.is_empty());
    }

    #[test]
    fn test_parallel_ingest_matches_sequential() {
        let batch = vec![
            session("s1", "d1", "gt3", "spa", 30, &[90.0, 91.0, 90.5, 90.2, 90.8]),
            session("s2", "d2", "gt3", "spa", 10, &[95.0; 5]),
            session("s3", "d1", "gt3", "spa", 2, &[89.5, 89.9, 90.1, 89.7, 90.0]),
            session("s4", "d3", "lmp2", "monza", 5, &[80.0; 12]),
            session("s5", "d2", "gt4", "spa", 1, &[101.0; 3]),
        ];

        let seed = session("s0", "d1", "gt3", "spa", 60, &[92.0; 5]);

        let mut sequential = aggregator();
        sequential.record_session(seed.clone()).unwrap();
        sequential.record_sessions(batch.clone()).unwrap();

        let mut parallel = aggregator();
        parallel.record_session(seed).unwrap();
        assert_eq!(parallel.ingest_parallel(batch).unwrap(), 5);

        let seq = sequential.drivers();
        let par = parallel.drivers();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.len(), par.len());
        for (a, b) in seq.iter().zip(par.iter()) {
            assert_eq!(a.driver_id, b.driver_id);
            assert_eq!(a.session_count, b.session_count);
            assert_eq!(a.lap_count, b.lap_count);
            assert!((a.confidence - b.confidence).abs() < 1e-12);
        }
    }

    #[test]
    fn test_parallel_ingest_rejects_invalid_batch() {
        let mut agg = aggregator();
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        let batch = vec![
            session("s2", "d1", "gt3", "spa", 1, &[90.0; 5]),
            session("s3", "", "gt3", "spa", 1, &[90.0; 5]),
        ];
        assert!(agg.ingest_parallel(batch).is_err());
        let track = agg.track_profile(&TrackKey::new("d1", "gt3", "spa")).unwrap();
        assert_eq!(track.session_count, 1);
    }

    #[test]
    fn test_metrics_are_injected() {
        let metrics = Arc::new(CountingMetrics::new());
        let mut agg = aggregator().with_metrics(metrics.clone());
        agg.record_session(session("s1", "d1", "gt3", "spa", 1, &[90.0; 5]))
            .unwrap();
        agg.record_session(session("s2", "d1", "gt3", "monza", 1, &[90.0; 5]))
            .unwrap();
        agg.reset_track(&TrackKey::new("d1", "gt3", "monza"));

        let snap = metrics.snapshot();
        assert_eq!(snap.sessions_recorded, 2);
        assert_eq!(snap.drivers_created, 1);
        assert_eq!(snap.cars_created, 1);
        assert_eq!(snap.tracks_created, 2);
        assert_eq!(snap.profiles_reset, 1);
    }

    #[test]
    fn test_session_fuel_fallback() {
        let mut agg = aggregator();
        let mut record = session("s1", "d1", "gt3", "spa", 1, &[90.0; 5]);
        for lap in &mut record.laps {
            lap.fuel_used = 0.0;
        }
        record.metadata.avg_fuel_per_lap = 2.4;
        agg.record_session(record).unwrap();
        let track = agg.track_profile(&TrackKey::new("d1", "gt3", "spa")).unwrap();
        assert!((track.avg_fuel_per_lap - 2.4).abs() < 1e-12);
    }
}
