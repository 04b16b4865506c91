#![allow(clippy::print_stdout)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use channel_coords::config::AppConfig;
use channel_coords::file_writer::export_coordinates_csv;
use channel_coords::ingest::{ChannelOutcome, IngestOptions, IngestPipeline};
use channel_coords::logging::{init_logging, OperationTimer};
use channel_coords::recommend::StoreRecommendations;
use channel_coords::retry::Cancellation;
use channel_coords::source::JsonExportSource;
use channel_coords::sync::{export_to_file, ImportOptions, Importer, MergeStrategy};
use channel_coords::utils::parse_watermark;
use channel_coords::validation::InputValidator;
use channel_coords::{Database, RegexExtractor};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file layered over the defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store path, overriding `database.path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest Telegram Desktop JSON exports (`result.json`)
    Ingest {
        /// Export files, one per channel
        #[arg(required = true)]
        exports: Vec<String>,

        /// Only ingest messages dated at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(short, long)]
        since: Option<String>,

        /// Continue each channel after its highest stored message id
        #[arg(short, long)]
        resume: bool,

        /// Messages per batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Leave stored messages untouched
        #[arg(long)]
        skip_existing: bool,
    },
    /// Export the store to a snapshot file
    Export {
        /// Output file (`.gz` is appended when compressing)
        path: PathBuf,

        /// Only rows changed after this time
        #[arg(short, long)]
        since: Option<String>,

        /// Gzip the snapshot
        #[arg(long, conflicts_with = "no_compress")]
        compress: bool,

        /// Write plain JSON even if compression is configured
        #[arg(long)]
        no_compress: bool,
    },
    /// Merge a snapshot (.json / .json.gz) or another store (.db / .sqlite) into this one
    Import {
        /// Snapshot or store file
        path: PathBuf,

        /// conservative, aggressive or smart
        #[arg(short, long)]
        strategy: Option<String>,

        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the pre-import backup
        #[arg(long)]
        no_backup: bool,
    },
    /// Show store statistics
    Stats,
    /// List recent ingestion sessions
    Sessions {
        /// Number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// List recent imports
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Back up the store
    Backup {
        /// Destination file; timestamped next to the store when omitted
        path: Option<PathBuf>,
    },
    /// Rebuild the database file
    Vacuum,
    /// Write every extracted coordinate to a CSV file
    ExportCsv {
        /// Output CSV file
        path: PathBuf,

        /// Limit to one channel id
        #[arg(long)]
        channel: Option<i64>,
    },
    /// Delete a channel's messages and coordinates
    ResetChannel {
        /// Channel id
        channel: i64,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = AppConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db_path) = &cli.db {
        config.database.path = db_path.to_string_lossy().into_owned();
    }

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(
        Some(&config.get_log_level()),
        &config.logging.format,
        config.logging.file_path.as_deref().map(Path::new),
    )?;

    info!("Starting channel-coords");

    // Initialize database with configuration
    let db = Database::from_config(&config.database)
        .with_context(|| format!("Failed to open store at {}", config.database.path))?;

    // Process command
    match cli.command {
        Commands::Ingest {
            exports,
            since,
            resume,
            batch_size,
            skip_existing,
        } => ingest(&config, db, &exports, since.as_deref(), resume, batch_size, skip_existing).await?,
        Commands::Export {
            path,
            since,
            compress,
            no_compress,
        } => {
            let compress = compress || (config.sync.compress && !no_compress);
            export(&db, &path, since.as_deref(), compress)?;
        }
        Commands::Import {
            path,
            strategy,
            dry_run,
            no_backup,
        } => import(&config, db, &path, strategy.as_deref(), dry_run, no_backup)?,
        Commands::Stats => show_stats(&db)?,
        Commands::Sessions { limit } => show_sessions(&db, limit)?,
        Commands::History { limit } => show_history(&db, limit)?,
        Commands::Backup { path } => {
            let written = match path {
                Some(path) => {
                    InputValidator::validate_file_path(&path)?;
                    db.backup_to(&path)?
                }
                None => db.backup_timestamped(config.sync.backup_dir.as_deref().map(Path::new))?,
            };
            println!("Backup written to {}", written.display());
        }
        Commands::Vacuum => {
            let timer = OperationTimer::new("vacuum");
            db.vacuum()?;
            timer.finish();
            println!("Store vacuumed");
        }
        Commands::ExportCsv { path, channel } => {
            InputValidator::validate_file_path(&path)?;
            let rows = export_coordinates_csv(&db, &path, channel)?;
            println!("Wrote {rows} coordinates to {}", path.display());
        }
        Commands::ResetChannel { channel, yes } => {
            if !yes {
                bail!("Refusing to delete channel {channel} without --yes");
            }
            if db.reset_channel(channel)? {
                println!("Channel {channel} reset");
            } else {
                warn!(channel, "Channel not found");
                println!("Channel {channel} not found");
            }
        }
    }

    Ok(())
}

/// Parse and check a `--since` argument
fn parse_since(raw: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|raw| {
        let since = parse_watermark(raw)?;
        InputValidator::validate_since(&since)?;
        Ok(since)
    })
    .transpose()
}

/// Ingest export files, cancelling cleanly on Ctrl-C
async fn ingest(
    config: &AppConfig,
    db: Database,
    exports: &[String],
    since: Option<&str>,
    resume: bool,
    batch_size: Option<usize>,
    skip_existing: bool,
) -> Result<()> {
    for reference in exports {
        InputValidator::validate_channel_reference(reference)
            .with_context(|| format!("Invalid channel reference: {reference}"))?;
    }

    let mut options = IngestOptions::from(&config.ingest);
    options.since = parse_since(since)?;
    options.resume = resume;
    options.skip_existing |= skip_existing;
    if let Some(size) = batch_size {
        InputValidator::validate_batch_size(size)?;
        options.batch_size = size;
    }

    let mut pipeline = IngestPipeline::new(
        db.clone(),
        Arc::new(JsonExportSource::new()),
        Arc::new(RegexExtractor::new()?),
        options,
    )?;
    if config.recommendations.enabled {
        pipeline = pipeline.with_recommendations(Arc::new(StoreRecommendations::new(
            db,
            config.recommendations.min_channel_id,
        )));
    }

    let cancel = Cancellation::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current batch");
            on_signal.cancel();
        }
    });

    let report = pipeline.run(exports, &cancel).await?;

    println!("Session {} finished: {}", report.session_id, report.status.as_str());
    for channel in &report.channels {
        let name = channel.title.as_deref().unwrap_or(&channel.reference);
        match &channel.outcome {
            ChannelOutcome::Completed => println!(
                "  {name}: {} new, {} updated, {} skipped, {} coordinates",
                channel.stats.inserted, channel.stats.updated, channel.stats.skipped, channel.stats.coordinates
            ),
            ChannelOutcome::Cancelled => println!("  {name}: cancelled after {} batches", channel.batches),
            ChannelOutcome::Failed(reason) | ChannelOutcome::Aborted(reason) => {
                println!("  {name}: failed: {reason}");
            }
        }
    }
    println!(
        "Total: {} fetched, {} new, {} coordinates, {} malformed, {} recommendations",
        report.totals.fetched,
        report.totals.inserted,
        report.totals.coordinates,
        report.totals.malformed,
        report.totals.recommendations
    );
    if let Some(error) = &report.error {
        bail!("Ingestion did not complete: {error}");
    }
    Ok(())
}

/// Export a snapshot
fn export(db: &Database, path: &Path, since: Option<&str>, compress: bool) -> Result<()> {
    InputValidator::validate_file_path(path)?;
    let since = parse_since(since)?;
    let summary = export_to_file(db, path, since, compress)
        .with_context(|| format!("Failed to export to {}", path.display()))?;

    println!("Exported to {} ({} bytes)", summary.path.display(), summary.size_bytes);
    println!(
        "  {} channels, {} messages, {} coordinates, {} sessions, {} recommendations",
        summary.channel_count,
        summary.message_count,
        summary.coordinate_count,
        summary.session_count,
        summary.recommendation_count
    );
    Ok(())
}

/// Import a snapshot or a foreign store
fn import(
    config: &AppConfig,
    db: Database,
    path: &Path,
    strategy: Option<&str>,
    dry_run: bool,
    no_backup: bool,
) -> Result<()> {
    InputValidator::validate_import_path(path)?;

    let mut options = ImportOptions::from_config(&config.sync)?;
    if let Some(strategy) = strategy {
        options.strategy = strategy.parse::<MergeStrategy>()?;
    }
    options.dry_run = dry_run;
    options.backup &= !no_backup;

    let strategy = options.strategy;
    let stats = Importer::new(db, options)
        .import_path(path)
        .with_context(|| format!("Failed to import {}", path.display()))?;

    if dry_run {
        println!("Dry run ({strategy}); nothing was written");
    } else {
        println!("Imported {} ({strategy})", path.display());
    }
    println!(
        "  messages: {} new, {} updated, {} skipped",
        stats.messages_imported, stats.messages_updated, stats.messages_skipped
    );
    println!(
        "  coordinates: {} new, {} skipped",
        stats.coordinates_imported, stats.coordinates_skipped
    );
    println!(
        "  channels: {} added, {} updated; {} recommendations, {} sessions",
        stats.channels_added, stats.channels_updated, stats.recommendations_merged, stats.sessions_merged
    );
    println!(
        "  {} conflicts resolved, {} malformed rows",
        stats.conflicts_resolved, stats.malformed_rows
    );
    Ok(())
}

fn show_stats(db: &Database) -> Result<()> {
    let stats = db.statistics()?;
    println!("Messages:     {}", stats.total_messages);
    println!("Coordinates:  {}", stats.total_coordinates);
    println!("Channels:     {} ({} active)", stats.tracked_channels, stats.active_channels);
    println!("Avg density:  {:.2}%", stats.average_density);
    match stats.last_scrape {
        Some(last) => println!("Last scrape:  {last}"),
        None => println!("Last scrape:  never"),
    }

    for channel in db.list_channels()? {
        println!(
            "  {:>14}  {:<32}  {:>7} msgs  {:>6.2}%",
            channel.id,
            channel.title.as_deref().or(channel.username.as_deref()).unwrap_or("-"),
            channel.total_messages,
            channel.coordinate_density
        );
    }
    Ok(())
}

fn show_sessions(db: &Database, limit: usize) -> Result<()> {
    let sessions = db.recent_sessions(limit)?;
    if sessions.is_empty() {
        println!("No sessions recorded");
        return Ok(());
    }
    for session in sessions {
        println!(
            "#{} {} {} [{}] {} new messages, {} new coordinates, {} skipped{}",
            session.id,
            session.session_start,
            session.session_type,
            session.status.as_str(),
            session.new_messages,
            session.new_coordinates,
            session.skipped_messages,
            session.error_log.map(|e| format!(" ({e})")).unwrap_or_default()
        );
    }
    Ok(())
}

fn show_history(db: &Database, limit: usize) -> Result<()> {
    let history = db.import_history(limit)?;
    if history.is_empty() {
        println!("No imports recorded");
        return Ok(());
    }
    for entry in history {
        println!(
            "{} [{}] {} via {} from {}{}",
            entry.source_file,
            entry.status,
            entry.import_type,
            entry.strategy,
            entry.source_device.as_deref().unwrap_or("unknown device"),
            entry.error.map(|e| format!(": {e}")).unwrap_or_default()
        );
    }
    Ok(())
}
