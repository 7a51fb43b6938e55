//! Remap engine with statum state machine
//!
//! Drains snapshot batches from the poller, resolves them against the
//! active profile and delivers the resulting frames to an output sink. Runs
//! in its own tokio task.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──(configure: sink)──► Configured ──(activate)──► Active ──(shutdown / stream closed)──► Deactivated
//! ```
//!
//! # Architecture
//!
//! ```text
//! broadcast<SnapshotBatch> ──► MappingResolver ──► ResolvedOutput per slot ──► OutputSink
//!                                    ▲                                           │
//!              watch<Arc<MappingProfile>> (checked at each tick boundary)     retries, then
//!                                                                            OutputDropped report
//! ```
//!
//! A batch is fully resolved and delivered before the next one is taken, so
//! ticks never overlap. When the engine falls behind, the poller's ring drops
//! the oldest batches and the engine reports how many it missed.

use crate::controller::poller::SnapshotBatch;
use crate::mapping::error::MappingError;
use crate::mapping::profile::MappingProfile;
use crate::mapping::resolver::MappingResolver;
use crate::output::{deliver_with_retry, OutputSink};
use crate::report::{Reporter, RuntimeReport};
use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counters of one engine run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks_resolved: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub batches_missed: u64,
}

/// States for remap engine lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum RemapEngineState {
    Initializing, // Channels wired, no sink yet
    Configured,   // Sink attached, resolver built from the current profile
    Active,       // Resolving batches
    Deactivated,  // Stream ended or shutdown requested, sink closed
}

#[machine]
pub struct RemapEngine<S: RemapEngineState> {
    batches: broadcast::Receiver<SnapshotBatch>,
    profile_rx: watch::Receiver<Arc<MappingProfile>>,
    reporter: Reporter,
    output_retries: u32,
    sink: Option<Box<dyn OutputSink>>,
    resolver: Option<MappingResolver>,
    stats: EngineStats,
}

impl<S: RemapEngineState> RemapEngine<S> {
    pub fn stats(&self) -> EngineStats {
        self.stats
    }
}

impl RemapEngine<Initializing> {
    pub fn create(
        batches: broadcast::Receiver<SnapshotBatch>,
        profile_rx: watch::Receiver<Arc<MappingProfile>>,
        reporter: Reporter,
        output_retries: u32,
    ) -> Self {
        info!("Initializing remap engine");
        Self::new(
            batches,
            profile_rx,
            reporter,
            output_retries,
            None,                  // sink
            None,                  // resolver
            EngineStats::default(), // stats
        )
    }

    /// Attaches the sink and builds the resolver from the current profile.
    pub fn configure(mut self, sink: Box<dyn OutputSink>) -> RemapEngine<Configured> {
        let profile = self.profile_rx.borrow_and_update().clone();
        info!(
            "Configuring remap engine: {} assignments, {} axis mappings, {} button mappings",
            profile.device_assignments.len(),
            profile.axis_mappings.len(),
            profile.button_mappings.len()
        );
        self.resolver = Some(MappingResolver::new(profile));
        self.sink = Some(sink);
        self.transition()
    }
}

impl RemapEngine<Configured> {
    pub fn activate(self) -> RemapEngine<Active> {
        info!("Activating remap engine");
        self.transition()
    }
}

impl RemapEngine<Active> {
    /// Resolves one batch and delivers every slot's frame.
    ///
    /// A profile applied since the previous batch takes effect here, before
    /// anything of this batch is resolved.
    pub fn process_batch(&mut self, batch: &SnapshotBatch) -> Result<(), MappingError> {
        let (Some(resolver), Some(sink)) = (self.resolver.as_mut(), self.sink.as_mut()) else {
            return Err(MappingError::TaskError(
                "engine active without resolver or sink".to_string(),
            ));
        };

        if self.profile_rx.has_changed().unwrap_or(false) {
            let profile = self.profile_rx.borrow_and_update().clone();
            info!("Profile change picked up at tick {}", batch.tick);
            resolver.set_profile(profile);
        }

        let frame = resolver.resolve(batch, batch.captured_at);
        for (mapping, reason) in frame.skipped {
            self.reporter.report(RuntimeReport::MappingSkipped {
                mapping,
                reason: reason.to_string(),
            });
        }

        for output in &frame.outputs {
            match deliver_with_retry(&mut **sink, output, self.output_retries) {
                Ok(()) => self.stats.frames_delivered += 1,
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    self.reporter.report(RuntimeReport::OutputDropped {
                        slot: output.slot,
                        tick: output.tick,
                        attempts: e.attempts,
                        reason: e.last.to_string(),
                    });
                }
            }
        }

        self.stats.ticks_resolved += 1;
        Ok(())
    }

    /// Main loop; returns when shutdown is signalled or the batch stream ends.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> RemapEngine<Deactivated> {
        info!("Starting remap loop");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received for remap engine");
                    break;
                }

                received = self.batches.recv() => match received {
                    Ok(batch) => {
                        if let Err(e) = self.process_batch(&batch) {
                            error!("Error processing tick {}: {}", batch.tick, e);
                        }
                    }
                    Err(RecvError::Lagged(count)) => {
                        self.stats.batches_missed += count;
                        self.reporter.report(RuntimeReport::BatchesDropped { count });
                    }
                    Err(RecvError::Closed) => {
                        info!("Snapshot stream closed, leaving remap loop");
                        break;
                    }
                },
            }
        }

        self.deactivate()
    }

    fn deactivate(mut self) -> RemapEngine<Deactivated> {
        if let Some(sink) = self.sink.as_mut() {
            debug!("Closing output sink");
            sink.close();
        }
        info!(
            "Remap engine deactivated: {} ticks, {} frames delivered, {} dropped, {} batches missed",
            self.stats.ticks_resolved,
            self.stats.frames_delivered,
            self.stats.frames_dropped,
            self.stats.batches_missed
        );
        self.transition()
    }
}

impl RemapEngine<Deactivated> {}

/// Handle for the engine task
///
/// Spawns the engine on the current tokio runtime and shuts it down again.
#[derive(Debug)]
pub struct EngineHandle {
    task_handle: Option<JoinHandle<EngineStats>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EngineHandle {
    pub fn spawn(
        batches: broadcast::Receiver<SnapshotBatch>,
        profile_rx: watch::Receiver<Arc<MappingProfile>>,
        sink: Box<dyn OutputSink>,
        output_retries: u32,
        reporter: Reporter,
    ) -> Self {
        let active = RemapEngine::create(batches, profile_rx, reporter, output_retries)
            .configure(sink)
            .activate();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            debug!("Spawning remap engine task");
            let deactivated = active.run_until_shutdown(shutdown_rx).await;
            deactivated.stats()
        });

        Self {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Signals shutdown and waits for the task. Idempotent.
    pub async fn shutdown(&mut self) -> Result<EngineStats, MappingError> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("Remap engine task already finished");
            }
        }

        match self.task_handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                error!("Remap engine task panicked: {}", e);
                MappingError::TaskError(format!("Remap engine task panicked: {}", e))
            }),
            None => {
                warn!("Remap engine already shut down");
                Ok(EngineStats::default())
            }
        }
    }
}
