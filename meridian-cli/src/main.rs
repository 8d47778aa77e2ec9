//! CLI for the meridian time-series storage engine.
//!
//! Provides commands for inspecting, querying, and benchmarking meridian
//! databases.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use meridian::point::{SeriesType, Value};
use meridian::{AggrKind, Aggregation, Database, DatabaseConfig};

/// meridian — distributed time-series storage and query engine CLI.
#[derive(Parser)]
#[command(name = "meridian", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display database metadata and registered series.
    Info {
        /// Path to the database directory.
        db_path: PathBuf,
    },

    /// Query time-series data from a database.
    Query {
        /// Path to the database directory.
        db_path: PathBuf,

        /// Series name to query.
        series: String,

        /// Time range to query (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "1h")]
        range: String,

        /// Aggregation to apply to the result (count, mean, sum, min, max,
        /// first, last). "none" returns raw points.
        #[arg(long, default_value = "none")]
        aggr: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Report progress of an in-progress re-index pass, if any (§4.8).
    ///
    /// Cluster topology and the wire transport that actually moves a
    /// series' points to its new pool are host responsibilities (§1); this
    /// only reports what the local `.reindex` journal says is left to do.
    ReindexStatus {
        /// Path to the database directory.
        db_path: PathBuf,
    },

    /// Run a write-path microbenchmark.
    Bench {
        /// Number of data points to write.
        #[arg(long, default_value = "1000000")]
        points: u64,

        /// Number of series to register.
        #[arg(long, default_value = "30")]
        series: u32,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    meridian::telemetry::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { db_path } => cmd_info(&db_path),
        Commands::Query {
            db_path,
            series,
            range,
            aggr,
            format,
        } => cmd_query(&db_path, &series, &range, &aggr, &format),
        Commands::ReindexStatus { db_path } => cmd_reindex_status(&db_path),
        Commands::Bench { points, series } => cmd_bench(points, series),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `meridian info <db_path>`.
fn cmd_info(db_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !db_path.exists() {
        return Err(format!("No database found at '{}'", db_path.display()).into());
    }

    let db = Database::open(db_path, DatabaseConfig::default())?;

    println!("Database: {}", db_path.display());
    println!();

    let total_size = dir_size(db_path)?;
    println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));

    let info = db.series_info();
    println!();
    println!("Registered series: {}", info.len());
    for (name, series_type, chunk_count) in &info {
        println!("  - {name} (type={}, chunks={chunk_count})", type_name(*series_type));
    }

    Ok(())
}

/// Implements `meridian query <db_path> <series>`.
fn cmd_query(
    db_path: &PathBuf,
    series_name: &str,
    range: &str,
    aggr: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if !db_path.exists() {
        return Err(format!("No database found at '{}'", db_path.display()).into());
    }

    let db = Database::open(db_path, DatabaseConfig::default())?;

    let range_secs = parse_duration(range)?;
    let now_secs = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs();
    let start = now_secs.saturating_sub(range_secs);
    let end = now_secs;

    let data = if aggr == "none" {
        db.query_range(series_name, start, end)?
    } else {
        let kind = parse_aggr_kind(aggr)?;
        db.query_aggregate(series_name, start, end, &Aggregation::new(kind))?
    };

    match format {
        OutputFormat::Csv => {
            println!("# series={series_name}, aggr={aggr}, points={}", data.len());
            println!("timestamp,value");
            for point in &data {
                println!("{},{}", point.ts, format_value(&point.value));
            }
        }
        OutputFormat::Json => {
            let json_data: Vec<serde_json::Value> = data
                .iter()
                .map(|point| {
                    serde_json::json!({
                        "timestamp": point.ts,
                        "value": value_to_json(&point.value),
                    })
                })
                .collect();

            let output = serde_json::json!({
                "series": series_name,
                "aggr": aggr,
                "count": data.len(),
                "data": json_data,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `meridian reindex-status <db_path>`.
fn cmd_reindex_status(db_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !db_path.exists() {
        return Err(format!("No database found at '{}'", db_path.display()).into());
    }

    let db = Database::open(db_path, DatabaseConfig::default())?;

    match db.resume_reindex()? {
        Some(journal) => {
            println!("Re-index in progress: {} series remaining", journal.remaining());
        }
        None => println!("No re-index in progress."),
    }

    Ok(())
}

/// Implements `meridian bench`.
#[allow(clippy::cast_precision_loss)]
fn cmd_bench(points: u64, series_count: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("meridian write-path benchmark");
    println!("  Points: {points}");
    println!("  Series: {series_count}");
    println!();

    let temp_dir = std::env::temp_dir().join("meridian_bench");
    let _ = std::fs::remove_dir_all(&temp_dir);

    let db = Database::open(&temp_dir, DatabaseConfig::default())?;

    println!("Writing {points} data points across {series_count} series...");

    let base_ts = 1_700_000_000u64;
    let points_per_series = points / u64::from(series_count);

    let start = Instant::now();

    let mut ts = base_ts;
    for _ in 0..points_per_series {
        ts += 1;
        for i in 0..series_count {
            db.insert(&format!("metric_{i}"), SeriesType::Float, ts, Value::Float(f64::from(i)))?;
        }
    }
    db.flush_all()?;

    let elapsed = start.elapsed();
    let total_writes = points_per_series * u64::from(series_count);
    let ns_per_write = elapsed.as_nanos() as f64 / total_writes as f64;
    let writes_per_sec = total_writes as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  Total writes: {total_writes}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!();

    let _ = std::fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse()?;

    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    Ok(secs)
}

fn parse_aggr_kind(name: &str) -> Result<AggrKind, Box<dyn std::error::Error>> {
    match name {
        "count" => Ok(AggrKind::Count),
        "mean" => Ok(AggrKind::Mean),
        "sum" => Ok(AggrKind::Sum),
        "min" => Ok(AggrKind::Min),
        "max" => Ok(AggrKind::Max),
        "first" => Ok(AggrKind::First),
        "last" => Ok(AggrKind::Last),
        other => Err(format!("Unknown aggregation: '{other}'. Use count, mean, sum, min, max, first, or last.").into()),
    }
}

fn type_name(t: SeriesType) -> &'static str {
    match t {
        SeriesType::Integer => "integer",
        SeriesType::Float => "float",
        SeriesType::String => "string",
    }
}

fn format_value(v: &Value) -> String {
    match v {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Int(i) => serde_json::json!(i),
        Value::Float(f) => serde_json::json!(f),
        Value::Str(s) => serde_json::json!(s),
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &PathBuf) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
