//! Controller subsystem for physical device input
//!
//! Implements the sampling side of the pipeline:
//!
//! 1. [`device`] - Device identity, shape and per-tick input sample
//! 2. [`backend`] - Device layer boundary (enumerate, read with timeout)
//! 3. [`gilrs_backend`] - Production backend on gilrs
//! 4. [`poller`] - Fixed-rate polling thread and its lifecycle handle
//!
//! # Architecture
//!
//! ```text
//! DeviceBackend ──► DevicePoller ──► SnapshotBatch (one per tick) ──► remap engine
//!                   (own thread)
//! ```

pub mod backend;
pub mod device;
pub mod gilrs_backend;
pub mod poller;

pub use backend::{BackendError, DeviceBackend, ScriptedBackend, ScriptedDevices};
pub use device::{
    AxisKind, DeviceHandle, DeviceInputState, HatDirection, PhysicalDeviceInfo, PhysicalDeviceRef,
};
pub use gilrs_backend::GilrsBackend;
pub use poller::{
    DevicePoller, DeviceSnapshot, PollerError, PollerHandle, PollerSettings, SnapshotBatch,
};
