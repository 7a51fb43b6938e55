//! Device poller with statum lifecycle
//!
//! Samples every enumerated physical device at a fixed rate on a dedicated
//! thread and publishes one [`SnapshotBatch`] per tick.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──(initialize: enumerate devices)──► Polling
//! ```
//!
//! # Delivery
//!
//! ```text
//! DeviceBackend ──► poll_tick() ──► SnapshotBatch ──► broadcast ring ──► resolver
//!                                                         │
//!                                        full: oldest batch is overwritten,
//!                                        receiver sees Lagged(n)
//! ```
//!
//! Batches are delivered in tick order. When the consumer falls behind, the
//! ring drops the oldest pending batch instead of blocking the poll thread.
//! A device that fails to answer is marked disconnected (kept in the list),
//! left out of the snapshot set, and retried on a later enumeration pass.

use crate::controller::backend::{BackendError, DeviceBackend};
use crate::controller::device::{
    match_device, match_identity, DeviceInputState, PhysicalDeviceInfo, PhysicalDeviceRef,
};
use crate::report::{Reporter, RuntimeReport};
use statum::{machine, state};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Poll rate used by the diagnostic console
pub const DIAGNOSTIC_RATE_HZ: u32 = 100;

#[derive(Clone, Debug)]
pub struct PollerSettings {
    /// Ticks per second
    pub rate_hz: u32,
    /// Upper bound for a single device read
    pub device_timeout: Duration,
    /// How often disconnected devices are looked for again
    pub reconnect_interval: Duration,
    /// Pending batches kept for a slow consumer before the oldest is dropped
    pub queue_capacity: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            rate_hz: 250,
            device_timeout: Duration::from_millis(5),
            reconnect_interval: Duration::from_secs(2),
            queue_capacity: 8,
        }
    }
}

impl PollerSettings {
    pub fn with_rate(mut self, rate_hz: u32) -> Self {
        self.rate_hz = rate_hz;
        self
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_hz.clamp(1, 10_000)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Fatal: the polling subsystem never started
    #[error("Failed to initialize device layer: {0}")]
    DeviceLayerInit(#[source] BackendError),

    #[error("Poll thread error: {0}")]
    ThreadError(String),
}

/// One device's sample inside a batch
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device: PhysicalDeviceRef,
    pub state: DeviceInputState,
}

/// Everything sampled during one tick.
///
/// `devices` lists every known device including disconnected ones, `states`
/// only holds devices that answered this tick. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SnapshotBatch {
    pub tick: u64,
    pub captured_at: Instant,
    pub devices: Arc<[PhysicalDeviceInfo]>,
    pub states: Arc<[DeviceSnapshot]>,
}

impl SnapshotBatch {
    /// Latest sample of the device matching `identity`.
    ///
    /// Same rule as profile slot resolution: GUID first, `VID:PID` fallback.
    /// When a listed device carries the wanted GUID only that device
    /// answers, so a silent stick is not replaced by an identical twin.
    /// `None` when the device did not answer this tick.
    pub fn state_for(&self, identity: &PhysicalDeviceRef) -> Option<&DeviceInputState> {
        let states = self.states.iter().map(|s| (&s.device, &s.state));
        let listed = self
            .devices
            .iter()
            .any(|d| d.identity.guid_matches(&identity.stable_guid));
        if listed {
            return match_identity(states, &identity.stable_guid, "");
        }
        match_identity(states, &identity.stable_guid, &identity.vid_pid)
    }

    /// Enumeration info of the device matching `identity`, connected or not.
    ///
    /// GUID first, `VID:PID` fallback.
    pub fn device_info(&self, identity: &PhysicalDeviceRef) -> Option<&PhysicalDeviceInfo> {
        match_identity(
            self.devices.iter().map(|d| (&d.identity, d)),
            &identity.stable_guid,
            &identity.vid_pid,
        )
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum PollerState {
    Initializing,
    Polling,
}

#[machine]
pub struct DevicePoller<S: PollerState> {
    backend: Box<dyn DeviceBackend>,

    settings: PollerSettings,

    // Known devices, including disconnected ones
    devices: Vec<PhysicalDeviceInfo>,

    // Shared copy of `devices` handed out with every batch
    published_devices: Arc<[PhysicalDeviceInfo]>,

    batch_sender: broadcast::Sender<SnapshotBatch>,

    reporter: Reporter,

    rescan_requested: Arc<AtomicBool>,

    tick: u64,

    last_enumeration: Option<Instant>,
}

impl<S: PollerState> DevicePoller<S> {
    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub fn devices(&self) -> &[PhysicalDeviceInfo] {
        &self.devices
    }

    fn publish_device_list(&mut self) {
        self.published_devices = Arc::from(self.devices.clone());
    }
}

impl DevicePoller<Initializing> {
    pub fn create(
        backend: Box<dyn DeviceBackend>,
        settings: PollerSettings,
        batch_sender: broadcast::Sender<SnapshotBatch>,
        reporter: Reporter,
        rescan_requested: Arc<AtomicBool>,
    ) -> Self {
        debug!("Creating device poller with settings: {:?}", settings);
        Self::new(
            backend,
            settings,
            Vec::new(),
            Arc::from(Vec::new()),
            batch_sender,
            reporter,
            rescan_requested,
            0,    // tick
            None, // last_enumeration
        )
    }

    /// Enumerates devices and transitions to `Polling`.
    ///
    /// An enumeration failure here is fatal; zero devices is not.
    pub fn initialize(mut self) -> Result<DevicePoller<Polling>, PollerError> {
        info!("Initializing device poller");

        let devices = match self.backend.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Device layer initialization failed: {}", e);
                return Err(PollerError::DeviceLayerInit(e));
            }
        };

        if devices.is_empty() {
            warn!("No physical devices found, polling anyway");
        } else {
            info!("Found {} devices:", devices.len());
            for (idx, device) in devices.iter().enumerate() {
                info!(
                    "  [{}] {} ({} axes, {} buttons, {} hats)",
                    idx,
                    device.identity,
                    device.axis_count(),
                    device.button_count,
                    device.hat_count
                );
            }
        }

        self.devices = devices;
        self.last_enumeration = Some(Instant::now());
        self.publish_device_list();

        info!("Device poller initialized, transitioning to Polling state");
        Ok(self.transition())
    }
}

impl DevicePoller<Polling> {
    /// Samples every connected device once.
    ///
    /// Never blocks beyond the per-device timeout of each read. A device that
    /// times out is left out of this batch only; any other failure marks it
    /// disconnected until a later enumeration pass finds it again.
    pub fn poll_tick(&mut self, now: Instant) -> SnapshotBatch {
        self.tick += 1;

        if self.rescan_requested.swap(false, Ordering::AcqRel) {
            self.rebuild_device_list(now);
        } else if self.reconnect_due(now) {
            self.reconnect_pass(now);
        }

        self.backend.refresh();

        let timeout = self.settings.device_timeout;
        let mut states = Vec::with_capacity(self.devices.len());
        let mut list_changed = false;

        for device in self.devices.iter_mut().filter(|d| d.connected) {
            match self.backend.read_state(device.handle, timeout) {
                Ok(state) => states.push(DeviceSnapshot {
                    device: device.identity.clone(),
                    state,
                }),
                // A late answer only costs this tick
                Err(BackendError::Timeout { handle, timeout }) => {
                    debug!("Device {:?} missed tick {} ({:?})", handle, self.tick, timeout);
                }
                Err(e) => {
                    device.connected = false;
                    list_changed = true;
                    self.reporter.report(RuntimeReport::DeviceDisconnected {
                        device: device.identity.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if list_changed {
            self.publish_device_list();
        }

        trace!("Tick {} sampled {} devices", self.tick, states.len());
        SnapshotBatch {
            tick: self.tick,
            captured_at: now,
            devices: self.published_devices.clone(),
            states: Arc::from(states),
        }
    }

    /// Hands a batch to the consumer side.
    pub fn publish(&self, batch: SnapshotBatch) {
        if self.batch_sender.send(batch).is_err() {
            trace!("No snapshot consumer attached");
        }
    }

    /// Fixed-rate loop; returns once `cancel` fires.
    ///
    /// Ticks never overlap. When a tick overruns by one period or more the
    /// missed ticks are skipped rather than replayed.
    pub fn run_until_cancelled(&mut self, cancel: &CancellationToken) {
        let period = self.settings.tick_period();
        info!(
            "Starting poll loop at {} Hz ({:?} per tick)",
            self.settings.rate_hz, period
        );

        let mut next_tick = Instant::now();
        while !cancel.is_cancelled() {
            let batch = self.poll_tick(Instant::now());
            self.publish(batch);

            next_tick += period;
            let now = Instant::now();
            if now < next_tick {
                std::thread::sleep(next_tick - now);
            } else {
                let behind = now.duration_since(next_tick);
                let skipped = (behind.as_nanos() / period.as_nanos().max(1)) as u64;
                if skipped > 0 {
                    self.reporter
                        .report(RuntimeReport::TicksSkipped { count: skipped });
                }
                next_tick = now;
            }
        }

        info!("Poll loop cancelled after {} ticks", self.tick);
    }

    fn reconnect_due(&self, now: Instant) -> bool {
        if self.devices.iter().all(|d| d.connected) {
            return false;
        }
        match self.last_enumeration {
            Some(last) => now.duration_since(last) >= self.settings.reconnect_interval,
            None => true,
        }
    }

    /// Looks for disconnected devices again without touching connected ones.
    fn reconnect_pass(&mut self, now: Instant) {
        self.last_enumeration = Some(now);
        let listed = match self.backend.enumerate() {
            Ok(listed) => listed,
            Err(e) => {
                warn!("Reconnection pass failed: {}", e);
                return;
            }
        };

        let mut changed = false;
        for device in self.devices.iter_mut().filter(|d| !d.connected) {
            let candidates = listed.iter().filter(|l| l.connected).map(|l| (&l.identity, l));
            if let Some(found) = match_device(candidates, &device.identity) {
                device.handle = found.handle;
                device.axes = found.axes.clone();
                device.button_count = found.button_count;
                device.hat_count = found.hat_count;
                device.connected = true;
                changed = true;
                self.reporter.report(RuntimeReport::DeviceReconnected {
                    device: device.identity.clone(),
                });
            }
        }

        if changed {
            self.publish_device_list();
        } else {
            debug!("Reconnection pass found no returning devices");
        }
    }

    /// Replaces the device list wholesale.
    fn rebuild_device_list(&mut self, now: Instant) {
        self.last_enumeration = Some(now);
        match self.backend.enumerate() {
            Ok(listed) => {
                info!(
                    "Rescan: {} devices (previously {})",
                    listed.len(),
                    self.devices.len()
                );
                self.devices = listed;
                self.publish_device_list();
            }
            Err(e) => warn!("Rescan failed, keeping previous device list: {}", e),
        }
    }
}

/// Owner of the polling thread.
///
/// `stop` cancels the loop and joins the thread, so no batch is published
/// after it returns. The thread owns the only batch sender, so receivers
/// observe `Closed` from then on. Dropping the handle stops the poller as well.
pub struct PollerHandle {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    rescan_requested: Arc<AtomicBool>,
    devices: Vec<PhysicalDeviceInfo>,
}

impl PollerHandle {
    /// Starts polling on a dedicated thread.
    ///
    /// The backend is built on that thread by `factory`. This call waits for
    /// initialization to finish and surfaces its failure; it returns the
    /// first receiver of the batch stream.
    pub fn start<F>(
        factory: F,
        settings: PollerSettings,
        reporter: Reporter,
    ) -> Result<(Self, broadcast::Receiver<SnapshotBatch>), PollerError>
    where
        F: FnOnce() -> Result<Box<dyn DeviceBackend>, BackendError> + Send + 'static,
    {
        info!("Spawning device poller with settings: {:?}", settings);

        let (batch_sender, batch_receiver) = broadcast::channel(settings.queue_capacity.max(1));
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);
        let cancel = CancellationToken::new();
        let rescan_requested = Arc::new(AtomicBool::new(false));

        let thread_cancel = cancel.clone();
        let thread_rescan = rescan_requested.clone();

        let thread = std::thread::Builder::new()
            .name("device-poller".to_string())
            .spawn(move || {
                let backend = match factory() {
                    Ok(backend) => backend,
                    Err(e) => {
                        error!("Failed to create device backend: {}", e);
                        let _ = init_tx.send(Err(PollerError::DeviceLayerInit(e)));
                        return;
                    }
                };

                let poller = DevicePoller::create(
                    backend,
                    settings,
                    batch_sender,
                    reporter,
                    thread_rescan,
                );
                match poller.initialize() {
                    Ok(mut polling) => {
                        let _ = init_tx.send(Ok(polling.devices().to_vec()));
                        polling.run_until_cancelled(&thread_cancel);
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
                info!("Device poller thread finished");
            })
            .map_err(|e| PollerError::ThreadError(e.to_string()))?;

        let devices = match init_rx.recv() {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PollerError::ThreadError(
                    "poll thread exited during initialization".to_string(),
                ));
            }
        };

        info!("Device poller started with {} devices", devices.len());
        Ok((
            Self {
                cancel,
                thread: Some(thread),
                rescan_requested,
                devices,
            },
            batch_receiver,
        ))
    }

    /// Devices found during initialization.
    pub fn devices(&self) -> &[PhysicalDeviceInfo] {
        &self.devices
    }

    /// Rebuilds the device list on the next tick.
    pub fn request_rescan(&self) {
        debug!("Device rescan requested");
        self.rescan_requested.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stops polling and waits for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            debug!("Waiting for poll thread to exit");
            if thread.join().is_err() {
                error!("Poll thread panicked");
            }
            info!("Device poller stopped");
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::backend::ScriptedDevices;
    use crate::controller::device::{AxisKind, DeviceHandle};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn stick(guid: &str) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            identity: PhysicalDeviceRef::new("Stick", guid, "044f:b10a"),
            handle: DeviceHandle(0),
            axes: vec![AxisKind::X, AxisKind::Y],
            button_count: 4,
            hat_count: 1,
            connected: true,
        }
    }

    fn polling(
        devices: &ScriptedDevices,
        settings: PollerSettings,
    ) -> (DevicePoller<Polling>, broadcast::Receiver<SnapshotBatch>, Arc<AtomicBool>) {
        let (tx, rx) = broadcast::channel(settings.queue_capacity);
        let flag = Arc::new(AtomicBool::new(false));
        let poller = DevicePoller::create(
            Box::new(devices.backend()),
            settings,
            tx,
            Reporter::log_only(),
            flag.clone(),
        )
        .initialize()
        .expect("scripted init succeeds");
        (poller, rx, flag)
    }

    #[test]
    fn tick_produces_one_snapshot_per_connected_device() {
        let devices = ScriptedDevices::new();
        let a = devices.attach(stick("a"));
        devices.attach(stick("b"));
        devices.set_state(
            a,
            DeviceInputState {
                axes: vec![0.5, -0.25],
                buttons: vec![true, false, false, false],
                hats: vec![Some(90)],
            },
        );

        let (mut poller, _rx, _) = polling(&devices, PollerSettings::default());
        let batch = poller.poll_tick(Instant::now());

        assert_eq!(batch.tick, 1);
        assert_eq!(batch.states.len(), 2);
        let state = batch
            .state_for(&PhysicalDeviceRef::new("", "A", ""))
            .expect("device a sampled");
        assert_eq!(state.axes, vec![0.5, -0.25]);
        assert_eq!(poller.poll_tick(Instant::now()).tick, 2);
    }

    #[test]
    fn failed_device_is_marked_disconnected_not_removed() {
        let devices = ScriptedDevices::new();
        let a = devices.attach(stick("a"));
        devices.attach(stick("b"));
        let (mut poller, _rx, _) = polling(&devices, PollerSettings::default());

        devices.set_attached(a, false);
        let batch = poller.poll_tick(Instant::now());

        assert_eq!(batch.states.len(), 1);
        assert_eq!(batch.devices.len(), 2);
        assert!(!batch.devices[0].connected);
        assert!(batch.state_for(&batch.devices[0].identity).is_none());
    }

    #[test]
    fn disconnected_device_returns_on_reconnect_pass() {
        let devices = ScriptedDevices::new();
        let a = devices.attach(stick("a"));
        let settings = PollerSettings {
            reconnect_interval: Duration::from_millis(100),
            ..PollerSettings::default()
        };
        let (mut poller, _rx, _) = polling(&devices, settings);
        let start = Instant::now();

        devices.set_attached(a, false);
        assert!(poller.poll_tick(start).states.is_empty());

        devices.set_attached(a, true);
        // Interval not yet elapsed
        let enumerations = devices.enumerations();
        assert!(poller.poll_tick(start + Duration::from_millis(10)).states.is_empty());
        assert_eq!(devices.enumerations(), enumerations);

        let batch = poller.poll_tick(start + Duration::from_millis(500));
        assert_eq!(batch.states.len(), 1);
        assert!(batch.devices[0].connected);
    }

    #[test]
    fn explicit_rescan_rebuilds_device_list() {
        let devices = ScriptedDevices::new();
        let a = devices.attach(stick("a"));
        devices.attach(stick("b"));
        let (mut poller, _rx, flag) = polling(&devices, PollerSettings::default());

        devices.set_attached(a, false);
        flag.store(true, Ordering::Release);
        let batch = poller.poll_tick(Instant::now());

        assert_eq!(batch.devices.len(), 1);
        assert_eq!(batch.devices[0].identity.stable_guid, "b");
    }

    #[test]
    fn stalled_device_misses_tick_but_stays_connected() {
        let devices = ScriptedDevices::new();
        let a = devices.attach(stick("a"));
        devices.attach(stick("b"));
        let (mut poller, _rx, _) = polling(&devices, PollerSettings::default());
        let enumerations = devices.enumerations();

        devices.set_stalled(a, true);
        let batch = poller.poll_tick(Instant::now());
        assert_eq!(batch.states.len(), 1);
        assert!(batch.devices.iter().all(|d| d.connected));
        assert!(batch.state_for(&batch.devices[0].identity).is_none());

        devices.set_stalled(a, false);
        let batch = poller.poll_tick(Instant::now());
        assert_eq!(batch.states.len(), 2);
        assert_eq!(devices.enumerations(), enumerations);
    }

    #[test]
    fn failed_rescan_keeps_previous_device_list() {
        let devices = ScriptedDevices::new();
        devices.attach(stick("a"));
        devices.attach(stick("b"));
        let (mut poller, _rx, flag) = polling(&devices, PollerSettings::default());

        devices.set_enumeration_failing(true);
        flag.store(true, Ordering::Release);
        let batch = poller.poll_tick(Instant::now());

        assert_eq!(batch.devices.len(), 2);
        assert_eq!(batch.states.len(), 2);
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn handle_rescan_drops_unplugged_device_from_list() {
        let devices = ScriptedDevices::new();
        devices.attach(stick("a"));
        let b = devices.attach(stick("b"));
        let scripted = devices.clone();
        let (mut handle, mut rx) = PollerHandle::start(
            move || Ok(Box::new(scripted.backend()) as Box<dyn DeviceBackend>),
            PollerSettings::default().with_rate(500),
            Reporter::log_only(),
        )
        .expect("poller starts");
        assert_eq!(handle.devices().len(), 2);

        devices.set_attached(b, false);
        handle.request_rescan();

        let mut rebuilt = None;
        for _ in 0..2000 {
            match rx.blocking_recv() {
                Ok(batch) if batch.devices.len() == 1 => {
                    rebuilt = Some(batch);
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        handle.stop();

        let batch = rebuilt.expect("rescan published a rebuilt list");
        assert_eq!(batch.devices[0].identity.stable_guid, "a");
        assert!(batch.devices[0].connected);
    }

    #[test]
    fn initialization_failure_is_fatal() {
        let devices = ScriptedDevices::new();
        let (tx, _rx) = broadcast::channel(4);
        let result = DevicePoller::create(
            Box::new(devices.failing_backend()),
            PollerSettings::default(),
            tx,
            Reporter::log_only(),
            Arc::new(AtomicBool::new(false)),
        )
        .initialize();

        assert!(matches!(result, Err(PollerError::DeviceLayerInit(_))));
    }

    #[test]
    fn slow_consumer_loses_oldest_batches_in_order() {
        let devices = ScriptedDevices::new();
        devices.attach(stick("a"));
        let settings = PollerSettings {
            queue_capacity: 2,
            ..PollerSettings::default()
        };
        let (mut poller, mut rx, _) = polling(&devices, settings);

        for _ in 0..5 {
            let batch = poller.poll_tick(Instant::now());
            poller.publish(batch);
        }

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(3))));
        assert_eq!(rx.try_recv().map(|b| b.tick).ok(), Some(4));
        assert_eq!(rx.try_recv().map(|b| b.tick).ok(), Some(5));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn handle_reports_init_failure() {
        let devices = ScriptedDevices::new();
        let scripted = devices.clone();
        let result = PollerHandle::start(
            move || Ok(Box::new(scripted.failing_backend()) as Box<dyn DeviceBackend>),
            PollerSettings::default(),
            Reporter::log_only(),
        );
        assert!(matches!(result, Err(PollerError::DeviceLayerInit(_))));
    }

    #[test]
    fn no_batches_after_stop_returns() {
        let devices = ScriptedDevices::new();
        devices.attach(stick("a"));
        let scripted = devices.clone();
        let (mut handle, mut rx) = PollerHandle::start(
            move || Ok(Box::new(scripted.backend()) as Box<dyn DeviceBackend>),
            PollerSettings::default().with_rate(500),
            Reporter::log_only(),
        )
        .expect("poller starts");

        assert_eq!(handle.devices().len(), 1);
        let first = rx.blocking_recv().expect("first batch");
        assert!(first.tick >= 1);

        handle.stop();
        assert!(!handle.is_running());
        handle.stop();

        // Drain whatever was buffered before the join, then the stream ends
        loop {
            match rx.blocking_recv() {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }
}
