//! Device layer boundary
//!
//! The poller never talks to a native input library directly. It goes
//! through [`DeviceBackend`], which enumerates devices and samples one device
//! at a time under a caller-supplied timeout.

use crate::controller::device::{DeviceHandle, DeviceInputState, PhysicalDeviceInfo};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Errors reported by a device backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The native input layer could not be brought up
    #[error("Device layer initialization failed: {0}")]
    InitializationError(String),

    /// Enumeration failed after a successful init
    #[error("Device enumeration failed: {0}")]
    EnumerationError(String),

    /// The device is gone or stopped answering
    #[error("Device {0:?} disconnected")]
    Disconnected(DeviceHandle),

    /// The device did not answer within the per-device budget
    #[error("Device {handle:?} timed out after {timeout:?}")]
    Timeout { handle: DeviceHandle, timeout: Duration },
}

/// Source of physical device data.
///
/// [`DeviceBackend::read_state`] must return within `timeout`; the poll loop
/// relies on it to stay bounded. Backends that read the device itself report
/// an overrun as [`BackendError::Timeout`]. Backends that answer from a state
/// cache filled in [`DeviceBackend::refresh`] never block and may ignore it.
/// Backends are constructed on the polling thread and never leave it.
pub trait DeviceBackend {
    /// Lists currently attached devices.
    fn enumerate(&mut self) -> Result<Vec<PhysicalDeviceInfo>, BackendError>;

    /// Called once at the start of every tick before any device is read.
    fn refresh(&mut self) {}

    /// Samples one device, bounded by `timeout`.
    fn read_state(
        &mut self,
        handle: DeviceHandle,
        timeout: Duration,
    ) -> Result<DeviceInputState, BackendError>;
}

#[derive(Debug, Clone)]
struct ScriptedDevice {
    info: PhysicalDeviceInfo,
    state: DeviceInputState,
    attached: bool,
    stalled: bool,
}

#[derive(Debug, Default)]
struct ScriptedInner {
    devices: Vec<ScriptedDevice>,
    enumerations: usize,
    enumeration_failing: bool,
}

/// Shared control surface of a [`ScriptedBackend`].
///
/// Cloned freely; every clone drives the same backend. Used for dry runs of a
/// profile without hardware and throughout the test suites.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevices {
    inner: Arc<Mutex<ScriptedInner>>,
}

impl ScriptedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a device and returns its handle.
    pub fn attach(&self, mut info: PhysicalDeviceInfo) -> DeviceHandle {
        let mut inner = self.lock();
        let handle = DeviceHandle(inner.devices.len());
        info.handle = handle;
        info.connected = true;
        let state = info.neutral_state();
        inner.devices.push(ScriptedDevice {
            info,
            state,
            attached: true,
            stalled: false,
        });
        handle
    }

    /// Replaces the sample returned for `handle`.
    pub fn set_state(&self, handle: DeviceHandle, state: DeviceInputState) {
        if let Some(device) = self.lock().devices.get_mut(handle.0) {
            device.state = state;
        }
    }

    /// Simulates unplugging (`false`) or replugging (`true`) a device.
    pub fn set_attached(&self, handle: DeviceHandle, attached: bool) {
        if let Some(device) = self.lock().devices.get_mut(handle.0) {
            device.attached = attached;
        }
    }

    /// Makes reads of `handle` time out while it stays attached.
    pub fn set_stalled(&self, handle: DeviceHandle, stalled: bool) {
        if let Some(device) = self.lock().devices.get_mut(handle.0) {
            device.stalled = stalled;
        }
    }

    /// Makes later `enumerate` calls fail (init is unaffected once done).
    pub fn set_enumeration_failing(&self, failing: bool) {
        self.lock().enumeration_failing = failing;
    }

    /// Number of `enumerate` calls served so far.
    pub fn enumerations(&self) -> usize {
        self.lock().enumerations
    }

    /// Builds a backend bound to this control surface.
    pub fn backend(&self) -> ScriptedBackend {
        ScriptedBackend {
            devices: self.clone(),
            fail_init: false,
        }
    }

    /// Builds a backend whose enumeration always fails.
    pub fn failing_backend(&self) -> ScriptedBackend {
        ScriptedBackend {
            devices: self.clone(),
            fail_init: true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedInner> {
        // A poisoned lock only means a test thread panicked mid-update; the
        // data itself is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory backend driven through [`ScriptedDevices`].
#[derive(Debug)]
pub struct ScriptedBackend {
    devices: ScriptedDevices,
    fail_init: bool,
}

impl DeviceBackend for ScriptedBackend {
    fn enumerate(&mut self) -> Result<Vec<PhysicalDeviceInfo>, BackendError> {
        if self.fail_init {
            return Err(BackendError::InitializationError(
                "scripted device layer unavailable".to_string(),
            ));
        }
        let mut inner = self.devices.lock();
        if inner.enumeration_failing {
            return Err(BackendError::EnumerationError(
                "scripted enumeration failure".to_string(),
            ));
        }
        inner.enumerations += 1;
        let listed: Vec<PhysicalDeviceInfo> = inner
            .devices
            .iter()
            .filter(|d| d.attached)
            .map(|d| d.info.clone())
            .collect();
        debug!("Scripted enumeration found {} devices", listed.len());
        Ok(listed)
    }

    fn read_state(
        &mut self,
        handle: DeviceHandle,
        timeout: Duration,
    ) -> Result<DeviceInputState, BackendError> {
        let inner = self.devices.lock();
        match inner.devices.get(handle.0) {
            Some(device) if device.attached && device.stalled => {
                Err(BackendError::Timeout { handle, timeout })
            }
            Some(device) if device.attached => Ok(device.state.clone()),
            _ => Err(BackendError::Disconnected(handle)),
        }
    }
}
