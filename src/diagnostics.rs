//! Diagnostic console
//!
//! Brings up the device layer, lists every physical device, polls at
//! [`DIAGNOSTIC_RATE_HZ`] and redraws one line per device with its axis
//! values, pressed buttons and hat angles until any key is pressed.
//!
//! If the settings file is unusable, the device layer fails to start or it
//! finds no device, a log file named
//! `joyremap-diagnostics-<YYYYmmdd-HHMMSS>.log` is written and an error is
//! returned, which makes the process exit non-zero.

use crate::config::EngineSettings;
use crate::controller::backend::{BackendError, DeviceBackend};
use crate::controller::device::{DeviceInputState, PhysicalDeviceInfo};
use crate::controller::poller::{PollerHandle, PollerSettings, SnapshotBatch, DIAGNOSTIC_RATE_HZ};
use crate::report::Reporter;
use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use crossterm::{
    cursor,
    event::{Event, EventStream, KeyEventKind},
    queue,
    style::Print,
    terminal::{self, disable_raw_mode, enable_raw_mode, ClearType},
};
use futures::StreamExt;
use std::fmt::Write as _;
use std::io::{stdout, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Screen refresh interval; polling itself runs faster
const REDRAW_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct DiagnosticOptions {
    pub poller: PollerSettings,
    /// Directory receiving the failure log
    pub log_dir: PathBuf,
}

impl Default for DiagnosticOptions {
    fn default() -> Self {
        Self {
            poller: PollerSettings::default().with_rate(DIAGNOSTIC_RATE_HZ),
            log_dir: PathBuf::from("."),
        }
    }
}

impl DiagnosticOptions {
    /// Poller timing from the settings file at `path`, at the diagnostic rate.
    ///
    /// An unreadable or malformed file is a diagnostic failure like any other:
    /// the log is written to `log_dir` and an error returned.
    pub fn from_settings_file(path: &Path, log_dir: PathBuf) -> Result<Self> {
        match EngineSettings::load(path) {
            Ok(settings) => Ok(Self {
                poller: settings.poller_settings().with_rate(DIAGNOSTIC_RATE_HZ),
                log_dir,
            }),
            Err(e) => Err(fail(&log_dir, &format!("Settings unusable: {}", e), &[])),
        }
    }
}

/// Runs the console until a key is pressed.
pub async fn run<F>(factory: F, options: DiagnosticOptions) -> Result<()>
where
    F: FnOnce() -> Result<Box<dyn DeviceBackend>, BackendError> + Send + 'static,
{
    info!("Starting diagnostic console at {} Hz", options.poller.rate_hz);

    let settings = options.poller.clone();
    let started = tokio::task::spawn_blocking(move || {
        PollerHandle::start(factory, settings, Reporter::log_only())
    })
    .await
    .map_err(|e| eyre!("Poller start task failed: {}", e))?;

    let (mut poller, mut batches) = match started {
        Ok(started) => started,
        Err(e) => {
            let reason = format!("Device layer initialization failed: {}", e);
            return Err(fail(&options.log_dir, &reason, &[]));
        }
    };

    if poller.devices().is_empty() {
        poller.stop();
        return Err(fail(&options.log_dir, "No physical devices found", &[]));
    }

    let devices = poller.devices().to_vec();
    println!("Found {} devices:", devices.len());
    for (idx, device) in devices.iter().enumerate() {
        println!(
            "  [{}] {} ({} axes, {} buttons, {} hats)",
            idx,
            device.identity,
            device.axis_count(),
            device.button_count,
            device.hat_count
        );
    }
    println!("Press any key to exit.");

    enable_raw_mode().map_err(|e| eyre!("Failed to enable raw mode: {}", e))?;
    let result = render_until_key(&mut batches).await;
    if let Err(e) = disable_raw_mode() {
        warn!("Failed to restore terminal: {}", e);
    }

    tokio::task::spawn_blocking(move || poller.stop())
        .await
        .map_err(|e| eyre!("Poller stop task failed: {}", e))?;
    println!();
    info!("Diagnostic console finished");
    result
}

async fn render_until_key(
    batches: &mut tokio::sync::broadcast::Receiver<SnapshotBatch>,
) -> Result<()> {
    let mut events = EventStream::new();
    let mut out = stdout();
    let mut drawn_lines: u16 = 0;
    let mut last_draw: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    debug!("Key pressed, leaving diagnostic console");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(eyre!("Terminal event error: {}", e)),
                None => return Ok(()),
            },

            received = batches.recv() => match received {
                Ok(batch) => {
                    let due = last_draw.map_or(true, |at| at.elapsed() >= REDRAW_INTERVAL);
                    if due {
                        last_draw = Some(Instant::now());
                        drawn_lines = draw(&mut out, &batch, drawn_lines)
                            .map_err(|e| eyre!("Failed to draw device lines: {}", e))?;
                    }
                }
                Err(RecvError::Lagged(count)) => debug!("Console skipped {} batches", count),
                Err(RecvError::Closed) => {
                    return Err(eyre!("Poller stopped unexpectedly"));
                }
            },
        }
    }
}

fn draw(out: &mut impl Write, batch: &SnapshotBatch, previous_lines: u16) -> std::io::Result<u16> {
    if previous_lines > 0 {
        queue!(out, cursor::MoveUp(previous_lines))?;
    }
    let mut lines = 0;
    for device in batch.devices.iter() {
        let line = format_device_line(device, batch.state_for(&device.identity));
        queue!(
            out,
            cursor::MoveToColumn(0),
            terminal::Clear(ClearType::CurrentLine),
            Print(line),
            Print("\r\n")
        )?;
        lines += 1;
    }
    out.flush()?;
    Ok(lines)
}

/// One console line: identity, axis values, pressed buttons, hat angles.
pub fn format_device_line(info: &PhysicalDeviceInfo, state: Option<&DeviceInputState>) -> String {
    let mut line = format!("{:<28}", truncate(&info.identity.name, 28));
    let Some(state) = state else {
        line.push_str(" (disconnected)");
        return line;
    };

    for (idx, value) in state.axes.iter().enumerate() {
        let label = info.axes.get(idx).map_or("?", |kind| kind.label());
        let _ = write!(line, " {}:{:+.2}", label, value);
    }

    let pressed: Vec<String> = state.pressed_buttons().map(|b| b.to_string()).collect();
    let _ = write!(line, " | buttons: [{}]", pressed.join(" "));

    if !state.hats.is_empty() {
        let hats: Vec<String> = state
            .hats
            .iter()
            .map(|hat| hat.map_or_else(|| "-".to_string(), |angle| angle.to_string()))
            .collect();
        let _ = write!(line, " | hats: {}", hats.join(" "));
    }
    line
}

fn truncate(name: &str, max: usize) -> String {
    name.chars().take(max).collect()
}

/// Writes the failure log and returns its path.
pub fn write_failure_log(
    dir: &Path,
    reason: &str,
    devices: &[PhysicalDeviceInfo],
) -> Result<PathBuf> {
    let now = Local::now();
    let path = dir.join(format!(
        "joyremap-diagnostics-{}.log",
        now.format("%Y%m%d-%H%M%S")
    ));

    let mut content = String::new();
    let _ = writeln!(content, "joyremap diagnostics {}", now.to_rfc3339());
    let _ = writeln!(content, "error: {}", reason);
    let _ = writeln!(content, "devices found: {}", devices.len());
    for device in devices {
        let _ = writeln!(
            content,
            "  {} ({} axes, {} buttons, {} hats, connected: {})",
            device.identity,
            device.axis_count(),
            device.button_count,
            device.hat_count,
            device.connected
        );
    }

    std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
    std::fs::write(&path, content)
        .map_err(|e| eyre!("Failed to write diagnostics log {}: {}", path.display(), e))?;
    Ok(path)
}

fn fail(log_dir: &Path, reason: &str, devices: &[PhysicalDeviceInfo]) -> color_eyre::Report {
    error!("{}", reason);
    match write_failure_log(log_dir, reason, devices) {
        Ok(path) => {
            eprintln!("{} (details in {})", reason, path.display());
            eyre!("{} (log written to {})", reason, path.display())
        }
        Err(e) => eyre!("{} (writing the log failed too: {})", reason, e),
    }
}
