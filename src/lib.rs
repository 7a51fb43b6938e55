//! joyremap: remaps HOTAS and joystick input onto virtual joystick slots.
//!
//! ```text
//! DeviceBackend ──► DevicePoller (thread) ──► SnapshotBatch ──► RemapEngine (task) ──► OutputSink
//!                                                                   ▲
//!                                                   ProfileStore (Arc<MappingProfile> swap)
//! ```

pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod mapping;
pub mod output;
pub mod persistence;
pub mod report;
