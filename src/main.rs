use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use joyremap::config::EngineSettings;
use joyremap::controller::{GilrsBackend, PollerHandle};
use joyremap::diagnostics::{self, DiagnosticOptions};
use joyremap::mapping::{EngineHandle, ProfileStore};
use joyremap::output::LoggingSink;
use joyremap::persistence;
use joyremap::report::{Reporter, RuntimeReport};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "joyremap")]
#[command(about = "Remaps HOTAS and joystick input onto virtual joysticks")]
struct Cli {
    /// Show a live console of all physical devices and exit on any key
    #[arg(long)]
    diagnose: bool,

    /// Mapping profile (default: ~/.config/joyremap/profile.toml)
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Engine settings (default: ~/.config/joyremap/settings.toml)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Override the poll rate from the settings file
    #[arg(long)]
    rate_hz: Option<u32>,

    /// Directory for diagnostic failure logs
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(&cli.log_level)?;

    let settings_path = cli.settings.clone().unwrap_or_else(EngineSettings::default_path);

    if cli.diagnose {
        let mut options = DiagnosticOptions::from_settings_file(&settings_path, cli.log_dir.clone())?;
        if let Some(rate_hz) = cli.rate_hz {
            options.poller = options.poller.with_rate(rate_hz);
        }
        return diagnostics::run(GilrsBackend::boxed, options).await;
    }

    let mut settings = EngineSettings::load(&settings_path)?;
    if let Some(rate_hz) = cli.rate_hz {
        settings.poll_rate_hz = rate_hz;
    }

    let profile_path = cli.profile.clone().unwrap_or_else(persistence::default_profile_path);
    run_remap(settings, profile_path).await
}

fn setup(log_level: &str) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}

async fn run_remap(settings: EngineSettings, profile_path: PathBuf) -> Result<()> {
    info!("Loading profile from {}", profile_path.display());
    let profile = persistence::load_or_default(&profile_path).await?;
    profile
        .validate()
        .map_err(|e| eyre!("Profile {} is invalid: {}", profile_path.display(), e))?;
    let store = ProfileStore::new(profile);

    let (reporter, mut reports) = Reporter::channel(settings.report_capacity);
    // Reports are already logged where they are raised; this only tallies
    // device dropouts for the shutdown summary.
    let report_task = tokio::spawn(async move {
        let mut disconnects = 0u64;
        while let Some(report) = reports.recv().await {
            debug!("Runtime report: {:?}", report);
            if matches!(report, RuntimeReport::DeviceDisconnected { .. }) {
                disconnects += 1;
            }
        }
        disconnects
    });

    let poller_settings = settings.poller_settings();
    let poller_reporter = reporter.clone();
    let (mut poller, batches) = tokio::task::spawn_blocking(move || {
        PollerHandle::start(GilrsBackend::boxed, poller_settings, poller_reporter)
    })
    .await
    .map_err(|e| eyre!("Poller start task failed: {}", e))?
    .map_err(|e| eyre!("Failed to start device poller: {}", e))?;

    for device in poller.devices() {
        match store.current().resolve_slot(&device.identity.stable_guid, &device.identity.vid_pid) {
            Some(slot) => info!("{} feeds virtual device {}", device.identity, slot),
            None => info!("{} is not assigned", device.identity),
        }
    }

    let mut engine = EngineHandle::spawn(
        batches,
        store.subscribe(),
        Box::new(LoggingSink::new()),
        settings.output_retries,
        reporter,
    );

    info!("Remapping active. Press Ctrl+C to exit.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
    }

    info!("Shutting down");
    // The poll thread must be gone before the sink is torn down
    tokio::task::spawn_blocking(move || poller.stop())
        .await
        .map_err(|e| eyre!("Poller stop task failed: {}", e))?;
    let stats = engine.shutdown().await?;
    info!(
        "Resolved {} ticks, delivered {} frames, dropped {}",
        stats.ticks_resolved, stats.frames_delivered, stats.frames_dropped
    );

    // Every reporter clone is gone once poller and engine are down
    match report_task.await {
        Ok(disconnects) => info!("{} device disconnects during this session", disconnects),
        Err(e) => warn!("Report task failed: {}", e),
    }
    Ok(())
}
