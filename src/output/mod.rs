//! Output sink boundary
//!
//! The engine hands every [`ResolvedOutput`] to an [`OutputSink`]. A sink
//! writes one slot's frame as a unit (axes, buttons and POVs together) and
//! reports failure as a [`SinkError`]. The engine retries a failed write a
//! bounded number of times through [`deliver_with_retry`] and then drops the
//! frame. An unavailable device is not retried.

use crate::mapping::resolver::ResolvedOutput;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    /// The driver refused or failed the write
    #[error("Write to virtual device {slot} failed: {reason}")]
    WriteFailed { slot: u32, reason: String },

    /// The driver or virtual device is not available
    #[error("Virtual device unavailable: {0}")]
    Unavailable(String),
}

/// A frame that could not be delivered within the retry budget
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Gave up after {attempts} attempts: {last}")]
pub struct DeliveryError {
    pub attempts: u32,
    #[source]
    pub last: SinkError,
}

/// Destination of resolved frames.
///
/// `write` must apply the whole frame atomically from the driver's point of
/// view. It is called from the engine task only.
pub trait OutputSink: Send {
    fn write(&mut self, output: &ResolvedOutput) -> Result<(), SinkError>;

    /// Called once when the engine shuts down.
    fn close(&mut self) {}
}

/// Writes `output`, retrying up to `max_attempts` times in total.
pub fn deliver_with_retry(
    sink: &mut dyn OutputSink,
    output: &ResolvedOutput,
    max_attempts: u32,
) -> Result<(), DeliveryError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sink.write(output) {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= max_attempts || matches!(e, SinkError::Unavailable(_)) => {
                return Err(DeliveryError {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => debug!(
                "Write attempt {}/{} for slot {} failed: {}",
                attempt, max_attempts, output.slot, e
            ),
        }
    }
}

/// Sink that only traces frames. Used when no driver sink is configured.
#[derive(Debug, Default)]
pub struct LoggingSink {
    frames: u64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputSink for LoggingSink {
    fn write(&mut self, output: &ResolvedOutput) -> Result<(), SinkError> {
        self.frames += 1;
        trace!(
            "vJoy {} tick {}: axes {:?} buttons {:?} povs {:?}",
            output.slot,
            output.tick,
            output.axes,
            output.buttons,
            output.povs
        );
        Ok(())
    }

    fn close(&mut self) {
        info!("Logging sink closed after {} frames", self.frames);
    }
}

#[derive(Debug, Default)]
struct RecordingInner {
    frames: Vec<ResolvedOutput>,
    failures_left: u32,
    write_attempts: u64,
    closed: bool,
}

/// In-memory sink that keeps every delivered frame.
///
/// Clones share the same record, so a test keeps one clone and hands the
/// other to the engine. Failures can be injected with [`fail_next`].
///
/// [`fail_next`]: RecordingSink::fail_next
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<RecordingInner>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: u32) {
        self.lock().failures_left = count;
    }

    pub fn frames(&self) -> Vec<ResolvedOutput> {
        self.lock().frames.clone()
    }

    pub fn write_attempts(&self) -> u64 {
        self.lock().write_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutputSink for RecordingSink {
    fn write(&mut self, output: &ResolvedOutput) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.write_attempts += 1;
        if inner.closed {
            return Err(SinkError::Unavailable(format!(
                "virtual device {} closed",
                output.slot
            )));
        }
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            return Err(SinkError::WriteFailed {
                slot: output.slot,
                reason: "injected failure".to_string(),
            });
        }
        inner.frames.push(output.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }
}
