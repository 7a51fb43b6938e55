//! Mapping profile data model
//!
//! A profile binds physical devices to virtual joystick slots and lists the
//! button and axis mapping entries applied on top of that binding. Profiles
//! are plain values: they are replaced wholesale, never edited in place
//! while the engine runs (see [`crate::mapping::store`]).

use crate::controller::device::{match_identity, HatDirection, PhysicalDeviceRef};
use crate::mapping::button_mode::ButtonMode;
use crate::mapping::curve::AxisCurve;
use crate::mapping::error::MappingError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Which control of a device an input refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InputControl {
    Axis { index: usize },
    Button { index: usize },
    Hat { index: usize, direction: HatDirection },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSource {
    pub device: PhysicalDeviceRef,
    pub control: InputControl,
}

impl InputSource {
    pub fn axis(device: PhysicalDeviceRef, index: usize) -> Self {
        Self {
            device,
            control: InputControl::Axis { index },
        }
    }

    pub fn button(device: PhysicalDeviceRef, index: usize) -> Self {
        Self {
            device,
            control: InputControl::Button { index },
        }
    }

    pub fn hat(device: PhysicalDeviceRef, index: usize, direction: HatDirection) -> Self {
        Self {
            device,
            control: InputControl::Hat { index, direction },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputKind {
    VJoyButton,
    VJoyAxis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputTarget {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    /// Virtual slot id, starting at 1
    pub vjoy_device: u32,
    pub index: u32,
}

impl OutputTarget {
    pub fn button(vjoy_device: u32, index: u32) -> Self {
        Self {
            kind: OutputKind::VJoyButton,
            vjoy_device,
            index,
        }
    }

    pub fn axis(vjoy_device: u32, index: u32) -> Self {
        Self {
            kind: OutputKind::VJoyAxis,
            vjoy_device,
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonMapping {
    pub name: String,
    pub inputs: Vec<InputSource>,
    pub output: OutputTarget,
    #[serde(default)]
    pub mode: ButtonMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMapping {
    pub name: String,
    pub inputs: Vec<InputSource>,
    pub output: OutputTarget,
    #[serde(default)]
    pub curve: AxisCurve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub physical_device: PhysicalDeviceRef,
    pub vjoy_device: u32,
    /// Opaque to the engine; carried for the external device-hiding layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_map_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MappingProfile {
    #[serde(default)]
    pub device_assignments: Vec<DeviceAssignment>,
    #[serde(default)]
    pub button_mappings: Vec<ButtonMapping>,
    #[serde(default)]
    pub axis_mappings: Vec<AxisMapping>,
}

impl MappingProfile {
    /// Virtual slot assigned to a device identity.
    ///
    /// A GUID match on any assignment beats a `VID:PID` match on an earlier
    /// one. Returns `None` when nothing matches.
    pub fn resolve_slot(&self, guid: &str, vid_pid: &str) -> Option<u32> {
        match_identity(
            self.device_assignments
                .iter()
                .map(|a| (&a.physical_device, a.vjoy_device)),
            guid,
            vid_pid,
        )
    }

    /// Checks every structural invariant.
    pub fn validate(&self) -> Result<(), MappingError> {
        let mut slots = HashSet::new();
        for (idx, assignment) in self.device_assignments.iter().enumerate() {
            if assignment.vjoy_device == 0 {
                return Err(MappingError::InvalidProfile(format!(
                    "assignment {} uses virtual device 0, ids start at 1",
                    idx
                )));
            }
            if !slots.insert(assignment.vjoy_device) {
                return Err(MappingError::InvalidProfile(format!(
                    "virtual device {} assigned more than once",
                    assignment.vjoy_device
                )));
            }
            let identity = &assignment.physical_device;
            if identity.stable_guid.is_empty() && identity.vid_pid.is_empty() {
                return Err(MappingError::InvalidProfile(format!(
                    "assignment {} has neither GUID nor VID:PID",
                    idx
                )));
            }
            let duplicate = self.device_assignments[..idx]
                .iter()
                .any(|earlier| earlier.physical_device.same_device(identity));
            if duplicate {
                return Err(MappingError::InvalidProfile(format!(
                    "device {} assigned more than once",
                    identity
                )));
            }
        }

        for mapping in &self.button_mappings {
            check_inputs(&mapping.name, &mapping.inputs)?;
            if mapping.output.kind != OutputKind::VJoyButton {
                return Err(MappingError::TargetKindMismatch(format!(
                    "button mapping '{}' targets an axis",
                    mapping.name
                )));
            }
        }

        for mapping in &self.axis_mappings {
            check_inputs(&mapping.name, &mapping.inputs)?;
            if mapping.output.kind != OutputKind::VJoyAxis {
                return Err(MappingError::TargetKindMismatch(format!(
                    "axis mapping '{}' targets a button",
                    mapping.name
                )));
            }
            mapping.curve.validate().map_err(|e| match e {
                MappingError::InvalidCurve(reason) => {
                    MappingError::InvalidCurve(format!("axis mapping '{}': {}", mapping.name, reason))
                }
                other => other,
            })?;
        }

        Ok(())
    }
}

fn check_inputs(name: &str, inputs: &[InputSource]) -> Result<(), MappingError> {
    if inputs.is_empty() {
        return Err(MappingError::InvalidProfile(format!(
            "mapping '{}' has no inputs",
            name
        )));
    }
    Ok(())
}
