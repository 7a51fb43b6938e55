//! Error definitions for the mapping module

use thiserror::Error;

/// Error types of profile validation, resolution and the remap engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    /// A mapping targets a virtual slot no device assignment owns
    #[error("Virtual device {0} is not assigned to any physical device")]
    UnassignedSlot(u32),

    /// A button mapping writes an axis or vice versa
    #[error("Output target kind does not match mapping kind: {0}")]
    TargetKindMismatch(String),

    /// Curve parameters out of range
    #[error("Invalid curve: {0}")]
    InvalidCurve(String),

    /// Profile structure violates an invariant
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    /// Engine task failed or panicked
    #[error("Task error: {0}")]
    TaskError(String),
}
