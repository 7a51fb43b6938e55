//! Turns device snapshots into virtual joystick output.
//!
//! The profile (`profile`) says which physical device feeds which virtual
//! slot and which controls get reshaped. Per tick the resolver (`resolver`)
//! runs axis inputs through their curve (`curve`) and button inputs through
//! their mode state machine (`button_mode`). The engine (`engine`) drives the
//! resolver from the poller's batch stream and feeds an output sink; the
//! store (`store`) swaps profiles in between ticks.

pub mod button_mode;
pub mod curve;
pub mod engine;
pub mod error;
pub mod profile;
pub mod resolver;
pub mod store;

// Re-exports for easier access
pub use button_mode::{ButtonMode, ButtonStateMachine};
pub use curve::{AxisCurve, CurveKind};
pub use engine::{EngineHandle, EngineStats, RemapEngine, RemapEngineState};
pub use error::MappingError;
pub use profile::{
    AxisMapping, ButtonMapping, DeviceAssignment, InputControl, InputSource, MappingProfile,
    OutputKind, OutputTarget,
};
pub use resolver::{MappingResolver, ResolvedFrame, ResolvedOutput};
pub use store::ProfileStore;
