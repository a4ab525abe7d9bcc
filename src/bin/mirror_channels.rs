#![forbid(unsafe_code)]

//! Mirrors configured YouTube channels into a MediaCMS instance.
//!
//! Each channel runs through its own download and upload pools. Progress is
//! logged line by line, or painted as a live table with `--live`. The first
//! Ctrl+C lets in-flight items finish within the grace period; a second one
//! stops immediately.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tubemirror_tools::{
    config::{RuntimeOverrides, load_mirror_config, resolve_runtime_paths},
    discovery::YouTubeApi,
    mediacms::MediaCmsConnector,
    orchestrator::{Orchestrator, RunMode, RunReport},
    render::LiveRenderer,
    retry::TokioPacer,
    security::{ensure_not_root, redact},
    shutdown::Shutdown,
    source::{YtDlpSource, ensure_program_available, upload_date_to_utc},
    staging::StagingArea,
    state::SyncStore,
    status::{StatusBus, spawn_line_logger},
};

const RENDER_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(
    name = "mirror_channels",
    about = "Mirror YouTube channels into a MediaCMS instance"
)]
struct Cli {
    /// Channel and pipeline configuration (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    staging_root: Option<PathBuf>,
    #[arg(long)]
    state_db: Option<PathBuf>,
    #[arg(long)]
    mediacms_url: Option<String>,
    /// MediaCMS token used by channels without their own.
    #[arg(long)]
    token: Option<String>,
    /// Only process the channel with this name.
    #[arg(long)]
    channel: Option<String>,
    #[arg(long)]
    download_workers: Option<usize>,
    #[arg(long)]
    upload_workers: Option<usize>,
    #[arg(long)]
    queue_capacity: Option<usize>,
    /// Do not wait for server-side encoding after each upload.
    #[arg(long)]
    no_wait_encoding: bool,
    /// Keep staged files after a verified upload.
    #[arg(long)]
    keep_files: bool,
    /// Seconds each upload worker pauses after an upload.
    #[arg(long, value_name = "SECS")]
    delay: Option<u64>,
    /// Do not refresh the destination profile before syncing.
    #[arg(long)]
    skip_channel_update: bool,
    /// Only consider videos published after this date (YYYYMMDD).
    #[arg(long, value_parser = parse_since)]
    since: Option<DateTime<Utc>>,
    /// Paint a live status table instead of log lines.
    #[arg(long)]
    live: bool,
    /// Also append log lines to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Videos newer than the stored cutoff (default).
    New,
    /// Every video in the channel listing.
    Full,
    /// Specific video identifiers, uploaded to the selected channel.
    VideoIds {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Only refresh the destination profile.
    UpdateChannel,
}

impl Cli {
    fn mode(&self) -> Result<RunMode> {
        let command = self.command.clone().unwrap_or(Command::New);
        if self.since.is_some() && !matches!(command, Command::New) {
            bail!("--since only applies to the new mode");
        }
        Ok(match command {
            Command::New => RunMode::New { since: self.since },
            Command::Full => RunMode::Full,
            Command::VideoIds { ids } => RunMode::VideoIds(ids),
            Command::UpdateChannel => RunMode::UpdateChannel,
        })
    }
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    upload_date_to_utc(raw).ok_or_else(|| format!("expected YYYYMMDD, got {raw:?}"))
}

fn level_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

/// The console stays quiet under `--live`; the log file keeps full detail.
fn init_tracing(verbose: bool, live: bool, log_file: Option<&Path>) -> Result<()> {
    let console_level = if verbose {
        "debug"
    } else if live {
        "warn"
    } else {
        "info"
    };
    let file_level = if verbose { "debug" } else { "info" };

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(level_filter(console_level));
    let file = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_filter(level_filter(file_level)),
        ),
        None => None,
    };
    tracing_subscriber::registry().with(console).with(file).init();
    Ok(())
}

/// First Ctrl+C drains, the second aborts.
fn spawn_signal_handler(shutdown: Shutdown, grace: Duration) {
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl+C handler: {}", err);
            return;
        }
        eprintln!(
            "\nInterrupt received; finishing in-flight items for up to {}s (Ctrl+C again stops now).",
            grace.as_secs()
        );
        shutdown.begin(grace);
        if signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping immediately.");
            shutdown.abort();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.live, cli.log_file.as_deref())?;
    ensure_not_root("mirror_channels")?;

    let mode = cli.mode()?;
    let runtime = resolve_runtime_paths(RuntimeOverrides {
        staging_root: cli.staging_root.clone(),
        state_db: cli.state_db.clone(),
        config_path: cli.config.clone(),
        mediacms_url: cli.mediacms_url.clone(),
        mediacms_token: cli.token.clone(),
        env_path: cli.env_file.clone(),
    })?;
    let config = load_mirror_config(&runtime.config_path)?;

    let mut pipeline = config.pipeline.clone();
    if let Some(workers) = cli.download_workers {
        pipeline.download_workers = workers;
    }
    if let Some(workers) = cli.upload_workers {
        pipeline.upload_workers = workers;
    }
    if let Some(capacity) = cli.queue_capacity {
        pipeline.upload_queue_capacity = capacity;
    }
    if cli.no_wait_encoding {
        pipeline.wait_for_encoding = false;
    }
    if cli.keep_files {
        pipeline.keep_files = true;
    }
    if let Some(delay) = cli.delay {
        pipeline.upload_delay_secs = delay;
    }
    pipeline.validate().context("invalid pipeline settings")?;

    let global_token = runtime
        .mediacms_token
        .clone()
        .or_else(|| config.mediacms_token.clone());
    let targets = config.channel_targets(global_token.as_deref(), cli.channel.as_deref())?;
    if matches!(mode, RunMode::VideoIds(_)) && targets.len() != 1 {
        bail!(
            "video-ids needs exactly one channel; {} are configured (use --channel)",
            targets.len()
        );
    }
    let mediacms_url = runtime
        .mediacms_url
        .clone()
        .or_else(|| config.mediacms_url.clone())
        .context("MEDIACMS_URL not set")?;
    let api_key = runtime
        .youtube_api_key
        .clone()
        .or_else(|| config.youtube_api_key.clone())
        .context("YOUTUBE_API_KEY not set")?;

    if !matches!(mode, RunMode::UpdateChannel) {
        ensure_program_available(&runtime.ytdlp_bin.to_string_lossy())?;
    }
    let staging = StagingArea::new(&runtime.staging_root);
    staging
        .prepare()
        .with_context(|| format!("creating {}", runtime.staging_root.display()))?;
    let store = SyncStore::open(&runtime.state_db)
        .await
        .context("initializing sync state database")?;

    println!("Staging root: {}", runtime.staging_root.display());
    println!("State database: {}", runtime.state_db.display());
    println!("Destination: {}", mediacms_url);
    println!("Mode: {}", mode.label());
    let leftovers = staging.leftovers();
    if !leftovers.is_empty() {
        println!("Found {} staged item(s) from an earlier run.", leftovers.len());
    }
    println!("Channels queued:");
    for target in &targets {
        println!("  - {} ({})", target.name, target.url);
        info!(channel = %target.name, token = %redact(&target.token), "channel configured");
    }

    let bus = StatusBus::new(pipeline.status_capacity);
    let logger = spawn_line_logger(bus.subscribe());
    let renderer = cli
        .live
        .then(|| LiveRenderer::spawn(bus.subscribe(), RENDER_INTERVAL));

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone(), pipeline.shutdown_grace());

    let orchestrator = Orchestrator {
        settings: pipeline.to_settings(),
        discovery: Arc::new(YouTubeApi::new(&api_key)?),
        source: Arc::new(YtDlpSource::new(&runtime.ytdlp_bin, staging.clone())),
        connector: Arc::new(MediaCmsConnector::new(&mediacms_url)?),
        staging,
        store,
        bus,
        pacer: Arc::new(TokioPacer),
        shutdown,
        skip_channel_update: cli.skip_channel_update,
    };
    let result = orchestrator.run(&mode, &targets).await;
    drop(orchestrator);
    if let Err(err) = logger.await {
        eprintln!("Status logger stopped unexpectedly: {}", err);
    }
    if let Some(renderer) = renderer {
        renderer.finish().await;
    }

    let report = result?;
    print_summary(&report);
    if let Some(reason) = &report.aborted {
        bail!("run aborted: {reason}");
    }
    if report.interrupted {
        bail!("run interrupted; staged files were kept, re-run to resume");
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Run summary:");
    for channel in &report.channels {
        let cutoff = channel
            .cutoff
            .map(|cutoff| cutoff.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}: {} ({}); cutoff {}",
            channel.name, channel.summary, channel.status, cutoff
        );
        for outcome in &channel.outcomes {
            if let Some(reason) = &outcome.reason {
                println!("    {} {}: {}", outcome.identifier(), outcome.kind, reason);
            }
        }
    }
    println!("Total: {}", report.total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_mode_is_new() {
        let cli = Cli::try_parse_from(["mirror_channels"]).unwrap();
        assert_eq!(cli.mode().unwrap(), RunMode::New { since: None });
    }

    #[test]
    fn since_is_parsed_as_utc_midnight() {
        let cli = Cli::try_parse_from(["mirror_channels", "--since", "20240131", "new"]).unwrap();
        assert_eq!(
            cli.mode().unwrap(),
            RunMode::New {
                since: Some(Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap())
            }
        );
        assert!(Cli::try_parse_from(["mirror_channels", "--since", "yesterday"]).is_err());
    }

    #[test]
    fn since_is_rejected_outside_new_mode() {
        let cli = Cli::try_parse_from(["mirror_channels", "--since", "20240131", "full"]).unwrap();
        assert!(cli.mode().is_err());
    }

    #[test]
    fn video_ids_require_at_least_one_id() {
        assert!(Cli::try_parse_from(["mirror_channels", "video-ids"]).is_err());
        let cli = Cli::try_parse_from(["mirror_channels", "video-ids", "abc", "def"]).unwrap();
        assert_eq!(
            cli.mode().unwrap(),
            RunMode::VideoIds(vec!["abc".into(), "def".into()])
        );
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "mirror_channels",
            "--download-workers",
            "4",
            "--no-wait-encoding",
            "--keep-files",
            "--delay",
            "15",
            "--log-file",
            "logs/mirror.log",
            "--channel",
            "science",
            "update-channel",
        ])
        .unwrap();
        assert_eq!(cli.download_workers, Some(4));
        assert!(cli.no_wait_encoding && cli.keep_files);
        assert_eq!(cli.delay, Some(15));
        assert_eq!(cli.log_file, Some(PathBuf::from("logs/mirror.log")));
        assert_eq!(cli.channel.as_deref(), Some("science"));
        assert_eq!(cli.mode().unwrap(), RunMode::UpdateChannel);
    }

    #[test]
    fn log_file_is_created_and_appended() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/mirror.log");
        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
