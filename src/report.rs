//! Runtime reporting channel
//!
//! Recoverable conditions (device dropouts, skipped mapping entries, dropped
//! output frames) never unwind across component boundaries. They are logged
//! and, when a consumer is attached, forwarded as [`RuntimeReport`] values on
//! a bounded channel. Sending never blocks: a full channel drops the report.

use crate::controller::device::PhysicalDeviceRef;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeReport {
    /// A device stopped answering and is excluded from snapshots
    DeviceDisconnected {
        device: PhysicalDeviceRef,
        reason: String,
    },
    /// A previously disconnected device answered an enumeration pass again
    DeviceReconnected { device: PhysicalDeviceRef },
    /// The poll loop fell behind its schedule and skipped ticks
    TicksSkipped { count: u64 },
    /// The resolver fell behind and the oldest pending batches were dropped
    BatchesDropped { count: u64 },
    /// A mapping entry could not be resolved; reported once per entry
    MappingSkipped { mapping: String, reason: String },
    /// A resolved frame was dropped after exhausting output retries
    OutputDropped {
        slot: u32,
        tick: u64,
        attempts: u32,
        reason: String,
    },
}

/// Cheap, cloneable sender half used by the poller and the engine.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<mpsc::Sender<RuntimeReport>>,
}

impl Reporter {
    pub fn new(tx: mpsc::Sender<RuntimeReport>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a reporter plus the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RuntimeReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// A reporter that only logs.
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, report: RuntimeReport) {
        match &report {
            RuntimeReport::DeviceReconnected { device } => {
                info!("Device reconnected: {}", device)
            }
            RuntimeReport::DeviceDisconnected { device, reason } => {
                warn!("Device disconnected: {} ({})", device, reason)
            }
            RuntimeReport::TicksSkipped { count } => {
                warn!("Poll loop behind schedule, skipped {} ticks", count)
            }
            RuntimeReport::BatchesDropped { count } => {
                warn!("Resolver behind, dropped {} oldest snapshot batches", count)
            }
            RuntimeReport::MappingSkipped { mapping, reason } => {
                warn!("Skipping mapping '{}': {}", mapping, reason)
            }
            RuntimeReport::OutputDropped {
                slot,
                tick,
                attempts,
                reason,
            } => warn!(
                "Dropped frame {} for virtual device {} after {} attempts: {}",
                tick, slot, attempts, reason
            ),
        }

        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(report) {
                warn!("Report channel unavailable, report dropped: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (reporter, mut rx) = Reporter::channel(1);
        reporter.report(RuntimeReport::TicksSkipped { count: 1 });
        reporter.report(RuntimeReport::TicksSkipped { count: 2 });

        assert_eq!(rx.try_recv().ok(), Some(RuntimeReport::TicksSkipped { count: 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_only_reporter_accepts_reports() {
        Reporter::log_only().report(RuntimeReport::BatchesDropped { count: 3 });
    }
}
