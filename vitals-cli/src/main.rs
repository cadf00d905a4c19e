//! CLI for the vitals telemetry core.
//!
//! Host-side companion for firmware integrators: inspects a telemetry
//! configuration, sizes event storage for it, and simulates heartbeats to
//! show the exact bytes a device would store.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use vitals::config::TelemetryConfig;
use vitals::platform::{ManualClock, NoopLock};
use vitals::schema::{MetricKey, MetricType, ResolvedSchema, SessionKey};
use vitals::serializer::{compute_trace_worst_case_size, compute_worst_case_size};
use vitals::storage::{DataSource, RECORD_HEADER_SIZE};
use vitals::telemetry::{BootStatus, Telemetry};

/// vitals: on-device telemetry core CLI.
#[derive(Parser)]
#[command(name = "vitals", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Print the resolved schema: keys, names, types, sessions and ranges.
    Schema {
        /// Path to the JSON configuration file.
        config: PathBuf,
    },

    /// Print worst-case event sizes and the minimum storage size.
    Size {
        /// Path to the JSON configuration file.
        config: PathBuf,
    },

    /// Boot telemetry over a RAM buffer, fire heartbeats, and dump the
    /// stored events.
    Simulate {
        /// Path to the JSON configuration file.
        config: PathBuf,

        /// Size of the event storage buffer in bytes.
        #[arg(long, default_value = "1024")]
        storage_bytes: usize,

        /// Number of heartbeats to fire.
        #[arg(long, default_value = "3")]
        heartbeats: u32,

        /// Output format.
        #[arg(long, default_value = "hex")]
        format: OutputFormat,
    },
}

/// Output format for simulated events.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// One hex-encoded event per line.
    Hex,
    /// JSON document with every event.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Schema { config } => cmd_schema(&config),
        Commands::Size { config } => cmd_size(&config),
        Commands::Simulate {
            config,
            storage_bytes,
            heartbeats,
            format,
        } => cmd_simulate(&config, storage_bytes, heartbeats, &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_schema(path: &Path) -> Result<(TelemetryConfig, ResolvedSchema), Box<dyn std::error::Error>> {
    let config = TelemetryConfig::load(path)?;
    let schema = config.effective_schema().resolve()?;
    Ok((config, schema))
}

/// Implements `vitals schema <config>`.
fn cmd_schema(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (config, schema) = load_schema(path)?;

    println!("Device: {}", config.device.device_serial);
    println!(
        "Software: {} {}",
        config.device.software_type, config.device.software_version
    );
    println!("Hardware: {}", config.device.hardware_version);
    println!("Heartbeat interval: {}s", config.heartbeat_interval_secs);
    println!();

    for session in schema.sessions() {
        let name = schema.session_name(session).unwrap_or("unknown");
        let keys = schema.session_metrics(session);
        println!("Session {} ({name}): {} metrics", session.raw(), keys.len());

        for &key in keys {
            let Some(info) = schema.metric(key) else {
                continue;
            };
            let detail = match (info.metric_type, info.min, info.max) {
                (MetricType::String, _, _) => format!("max_length={}", info.max_length),
                (_, Some(min), Some(max)) => format!("range=[{min}, {max}]"),
                (_, Some(min), None) => format!("min={min}"),
                (_, None, Some(max)) => format!("max={max}"),
                _ => String::new(),
            };
            println!(
                "  {:>5}  {:<32} {:<9} {detail}",
                key.raw(),
                info.name,
                info.metric_type.to_string()
            );
        }
        println!();
    }

    Ok(())
}

/// Implements `vitals size <config>`.
fn cmd_size(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (config, schema) = load_schema(path)?;

    println!("Worst-case event sizes (payload, record header excluded):");
    let mut largest = 0;
    for session in schema.sessions() {
        let size = compute_worst_case_size(&schema, &config.device, session);
        let name = schema.session_name(session).unwrap_or("unknown");
        println!("  session {:<3} {name:<24} {size:>6} B", session.raw());
        largest = largest.max(size);
    }
    let trace = compute_trace_worst_case_size(&config.device);
    println!("  trace       {:<24} {trace:>6} B", "");
    largest = largest.max(trace);

    println!();
    println!(
        "Minimum storage size: {} B (largest event + {RECORD_HEADER_SIZE} B record header)",
        largest + RECORD_HEADER_SIZE
    );

    Ok(())
}

/// Implements `vitals simulate <config>`.
fn cmd_simulate(
    path: &Path,
    storage_bytes: usize,
    heartbeats: u32,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = TelemetryConfig::load(path)?;
    let clock = ManualClock::new(0);
    let mut telemetry = Telemetry::boot(vec![0u8; storage_bytes], &config, clock.clone(), NoopLock)?;

    if let BootStatus::StorageTooSmall { needed, available } = telemetry.boot_status() {
        eprintln!("Warning: storage holds {available} B, largest event needs {needed} B");
    }

    let interval_ms = u64::try_from(telemetry.heartbeat_interval().as_millis())?;
    let user_sessions: Vec<SessionKey> = telemetry
        .schema()
        .sessions()
        .filter(|s| !s.is_heartbeat())
        .collect();

    for round in 0..heartbeats {
        drive_session(&mut telemetry, SessionKey::HEARTBEAT, round)?;

        for &session in &user_sessions {
            if let Err(e) = telemetry.session_start(session) {
                warn!(session = session.raw(), error = %e, "session start failed");
                continue;
            }
            drive_session(&mut telemetry, session, round)?;
            clock.advance(interval_ms / 4);
            if let Err(e) = telemetry.session_end(session) {
                warn!(session = session.raw(), error = %e, "session event dropped");
            }
        }

        clock.advance(interval_ms);
        if let Err(e) = telemetry.heartbeat_tick() {
            warn!(round, error = %e, "heartbeat dropped");
        }
        debug!(round, used = telemetry.bytes_used(), "heartbeat fired");
    }

    let dropped = telemetry.dropped_events();
    let mut events = Vec::new();
    while let Some(size) = telemetry.has_more() {
        let mut buf = vec![0u8; size];
        if !telemetry.read(0, &mut buf) {
            return Err("failed to read stored event".into());
        }
        telemetry.mark_read();
        events.push(buf);
    }

    match format {
        OutputFormat::Hex => {
            for (i, event) in events.iter().enumerate() {
                println!("#{i} ({} B): {}", event.len(), to_hex(event));
            }
            println!();
            println!("Events: {}, dropped: {dropped}", events.len());
        }
        OutputFormat::Json => {
            let json_events: Vec<serde_json::Value> = events
                .iter()
                .enumerate()
                .map(|(i, event)| {
                    serde_json::json!({
                        "index": i,
                        "size": event.len(),
                        "hex": to_hex(event),
                    })
                })
                .collect();
            let output = serde_json::json!({
                "storage_bytes": storage_bytes,
                "heartbeats": heartbeats,
                "dropped": dropped,
                "events": json_events,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Applies one synthetic update to every metric in `session`.
fn drive_session(
    telemetry: &mut Telemetry<Vec<u8>, ManualClock, NoopLock>,
    session: SessionKey,
    round: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let keys: Vec<(MetricKey, MetricType)> = telemetry
        .schema()
        .session_metrics(session)
        .iter()
        .filter(|&&key| Some(key) != telemetry.schema().session_timer(session))
        .filter_map(|&key| telemetry.schema().metric(key).map(|m| (key, m.metric_type)))
        .collect();

    let step = i32::try_from(round % 1_000)?;
    for (key, metric_type) in keys {
        match metric_type {
            MetricType::Unsigned => telemetry.add(key, step + 1)?,
            MetricType::Signed => telemetry.set_signed(key, -step)?,
            MetricType::String => telemetry.set_string(key, &format!("round-{round}"))?,
            MetricType::Timer => {
                if let Err(e) = telemetry.timer_start(key) {
                    debug!(key = key.raw(), error = %e, "timer already running");
                }
            }
        }
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
