use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use pw_profile::align::align_channels_observed;
use pw_profile::{
    Channel, ChannelSource, Clock, CountingMetrics, DriverProfile, ProfileAggregator,
    ProfileParams, SampleMatrix, SessionRecord,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Telemetry alignment and driver profile CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resample telemetry channels onto one uniform time grid (CSV output)
    Align(AlignArgs),
    /// Build driver/car/track profiles from completed sessions (JSON output)
    Profile(ProfileArgs),
}

#[derive(Parser, Debug)]
struct AlignArgs {
    /// JSON array of channels
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "aligned.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Grid start in seconds (defaults to the earliest channel time)
    #[arg(long)]
    start: Option<f64>,

    /// Grid end in seconds (defaults to the latest channel time)
    #[arg(long)]
    end: Option<f64>,

    /// Grid frequency in Hz (defaults to `grid_frequency_hz` from the config)
    #[arg(long)]
    hz: Option<f64>,

    /// Optional parameter JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ProfileArgs {
    /// JSON array of session records
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output JSON path (`-` for stdout)
    #[arg(short, long, default_value = "profiles.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Evaluate recency and staleness at this RFC 3339 instant instead of now
    #[arg(long)]
    now: Option<String>,

    /// Override the staleness threshold (days)
    #[arg(long)]
    stale_days: Option<f64>,

    /// Override the recency half-life (days)
    #[arg(long)]
    half_life: Option<f64>,

    /// Optional parameter JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Align(args) => args.verbose,
        Command::Profile(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Align(args) => handle_align(args),
        Command::Profile(args) => handle_profile(args),
    }
}

fn load_params(path: Option<&Path>) -> Result<ProfileParams> {
    let Some(path) = path else {
        return Ok(ProfileParams::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let params = ProfileParams::from_json_str(&text)
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!("loaded parameters from {}", path.display());
    Ok(params)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn channel_extent(channels: &[Channel]) -> Option<(f64, f64)> {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for channel in channels {
        let (first, last) = match &channel.source {
            ChannelSource::Timestamped { timestamps, .. } => {
                match (timestamps.first(), timestamps.last()) {
                    (Some(a), Some(b)) => (*a, *b),
                    _ => continue,
                }
            }
            ChannelSource::Estimated { values, start, end } => {
                if values.is_empty() {
                    continue;
                }
                (*start, *end)
            }
        };
        lo = lo.min(first);
        hi = hi.max(last);
    }
    if lo.is_finite() && hi.is_finite() {
        Some((lo, hi))
    } else {
        None
    }
}

fn handle_align(args: AlignArgs) -> Result<()> {
    let params = load_params(args.config.as_deref())?;
    let channels: Vec<Channel> = read_json(&args.input)?;
    if channels.is_empty() {
        return Err(anyhow!("{} contains no channels", args.input.display()));
    }

    let extent = channel_extent(&channels);
    let start = match (args.start, extent) {
        (Some(s), _) => s,
        (None, Some((lo, _))) => lo,
        (None, None) => return Err(anyhow!("--start is required when no channel has samples")),
    };
    let end = match (args.end, extent) {
        (Some(e), _) => e,
        (None, Some((_, hi))) => hi,
        (None, None) => return Err(anyhow!("--end is required when no channel has samples")),
    };
    let hz = args.hz.unwrap_or(params.grid_frequency_hz);
    if end <= start {
        warn!("grid end {} is not after start {}; output will be empty", end, start);
    }

    let metrics = CountingMetrics::new();
    let t0 = Instant::now();
    let matrix = align_channels_observed(&channels, start, end, hz, &metrics)
        .with_context(|| format!("failed to align {}", args.input.display()))?;
    let snapshot = metrics.snapshot();
    info!(
        "Aligned {} channels onto {} points ({} samples) in {:.2?}",
        snapshot.channels_aligned,
        matrix.len(),
        snapshot.samples_emitted,
        t0.elapsed()
    );

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_matrix_rows(&matrix, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_matrix_rows(&matrix, &mut writer)?;
        info!("CSV written: {}", args.output.display());
    }
    Ok(())
}

fn write_matrix_rows<W: Write>(matrix: &SampleMatrix, writer: &mut csv::Writer<W>) -> Result<()> {
    let mut header = Vec::with_capacity(matrix.channel_count() + 1);
    header.push("time_s".to_string());
    header.extend(matrix.names.iter().cloned());
    writer.write_record(&header)?;

    for (i, t) in matrix.times.iter().enumerate() {
        let mut row = Vec::with_capacity(header.len());
        row.push(format!("{:.6}", t));
        row.extend(matrix.values.row(i).iter().map(|v| format!("{:.6}", v)));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ProfileReport<'a> {
    generated_at: DateTime<Utc>,
    params: &'a ProfileParams,
    params_hash: String,
    sessions: usize,
    drivers: Vec<DriverProfile>,
}

fn handle_profile(args: ProfileArgs) -> Result<()> {
    let mut params = load_params(args.config.as_deref())?;
    if let Some(days) = args.stale_days {
        params.stale_after_days = days;
    }
    if let Some(days) = args.half_life {
        params.half_life_days = days;
    }
    params.validate().context("invalid parameter overrides")?;

    let clock = match args.now.as_deref() {
        Some(text) => {
            let at = DateTime::parse_from_rfc3339(text)
                .with_context(|| format!("invalid --now '{}': expected RFC 3339", text))?;
            Clock::Fixed(at.with_timezone(&Utc))
        }
        None => Clock::System,
    };

    let records: Vec<SessionRecord> = read_json(&args.input)?;
    if records.is_empty() {
        warn!("{} contains no sessions", args.input.display());
    }
    let session_count = records.len();

    let metrics = Arc::new(CountingMetrics::new());
    let mut aggregator = ProfileAggregator::new(params.clone(), clock).with_metrics(metrics.clone());
    let t0 = Instant::now();
    aggregator
        .ingest_parallel(records)
        .with_context(|| format!("failed to ingest {}", args.input.display()))?;
    let snapshot = metrics.snapshot();
    info!(
        "Recorded {} sessions into {} drivers, {} cars, {} tracks in {:.2?}",
        snapshot.sessions_recorded,
        aggregator.driver_count(),
        aggregator.car_count(),
        aggregator.track_count(),
        t0.elapsed()
    );

    let drivers = aggregator.drivers();
    for driver in &drivers {
        info!(
            "{} ({}): {} sessions, {} laps, confidence {:.3}, style {:?}{}",
            driver.driver_id,
            driver.driver_name,
            driver.session_count,
            driver.lap_count,
            driver.confidence,
            driver.style,
            if driver.is_stale { ", stale" } else { "" }
        );
    }

    let report = ProfileReport {
        generated_at: clock.now(),
        params: &params,
        params_hash: params.params_hash_sha256()?,
        sessions: session_count,
        drivers,
    };
    let text = serde_json::to_string_pretty(&report)?;
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(text.as_bytes())?;
        handle.write_all(b"\n")?;
    } else {
        fs::write(&args.output, text)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Profiles written: {}", args.output.display());
    }
    Ok(())
}
