//! Production backend on top of gilrs
//!
//! gilrs keeps an in-memory copy of every gamepad's state that is updated by
//! draining its event queue, so a read never blocks on device I/O. The event
//! queue is drained once per tick in [`DeviceBackend::refresh`].

use crate::controller::backend::{BackendError, DeviceBackend};
use crate::controller::device::{
    AxisKind, DeviceHandle, DeviceInputState, PhysicalDeviceInfo, PhysicalDeviceRef,
};
use gilrs::{Axis, Button, Gamepad, GamepadId, Gilrs};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

const AXES: [(Axis, AxisKind); 6] = [
    (Axis::LeftStickX, AxisKind::X),
    (Axis::LeftStickY, AxisKind::Y),
    (Axis::LeftZ, AxisKind::Z),
    (Axis::RightStickX, AxisKind::RX),
    (Axis::RightStickY, AxisKind::RY),
    (Axis::RightZ, AxisKind::RZ),
];

const BUTTONS: [Button; 15] = [
    Button::South,
    Button::East,
    Button::North,
    Button::West,
    Button::C,
    Button::Z,
    Button::LeftTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger,
    Button::RightTrigger2,
    Button::Select,
    Button::Start,
    Button::Mode,
    Button::LeftThumb,
    Button::RightThumb,
];

const DPAD: [Button; 4] = [
    Button::DPadUp,
    Button::DPadRight,
    Button::DPadDown,
    Button::DPadLeft,
];

/// Per-device layout discovered at enumeration time
#[derive(Debug, Clone)]
struct Layout {
    id: GamepadId,
    axes: Vec<Axis>,
    buttons: Vec<Button>,
    has_hat: bool,
}

pub struct GilrsBackend {
    gilrs: Gilrs,
    layouts: HashMap<DeviceHandle, Layout>,
}

impl GilrsBackend {
    pub fn new() -> Result<Self, BackendError> {
        info!("Initializing gilrs device layer");
        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(BackendError::InitializationError(e.to_string()));
            }
        };
        Ok(Self {
            gilrs,
            layouts: HashMap::new(),
        })
    }

    /// Factory suitable for [`crate::controller::PollerHandle::start`].
    pub fn boxed() -> Result<Box<dyn DeviceBackend>, BackendError> {
        Ok(Box::new(Self::new()?))
    }

    fn describe(id: GamepadId, gamepad: &Gamepad<'_>) -> (PhysicalDeviceInfo, Layout) {
        let axes: Vec<(Axis, AxisKind)> = AXES
            .iter()
            .copied()
            .filter(|(axis, _)| gamepad.axis_code(*axis).is_some())
            .collect();
        let buttons: Vec<Button> = BUTTONS
            .iter()
            .copied()
            .filter(|button| gamepad.button_code(*button).is_some())
            .collect();
        let has_hat = DPAD.iter().any(|button| gamepad.button_code(*button).is_some());

        let vid_pid = match (gamepad.vendor_id(), gamepad.product_id()) {
            (Some(vid), Some(pid)) => PhysicalDeviceRef::format_vid_pid(vid, pid),
            _ => String::new(),
        };
        let uuid = gamepad.uuid();
        let stable_guid = if uuid.iter().all(|b| *b == 0) {
            String::new()
        } else {
            uuid.iter().map(|b| format!("{:02x}", b)).collect()
        };

        let handle = DeviceHandle(usize::from(id));
        let info = PhysicalDeviceInfo {
            identity: PhysicalDeviceRef::new(gamepad.name(), stable_guid, vid_pid),
            handle,
            axes: axes.iter().map(|(_, kind)| *kind).collect(),
            button_count: buttons.len(),
            hat_count: usize::from(has_hat),
            connected: gamepad.is_connected(),
        };
        let layout = Layout {
            id,
            axes: axes.into_iter().map(|(axis, _)| axis).collect(),
            buttons,
            has_hat,
        };
        (info, layout)
    }
}

/// Collapses the four d-pad buttons into a hat angle.
fn hat_angle(up: bool, right: bool, down: bool, left: bool) -> Option<u16> {
    match (up, right, down, left) {
        (true, false, false, false) => Some(0),
        (true, true, false, false) => Some(45),
        (false, true, false, false) => Some(90),
        (false, true, true, false) => Some(135),
        (false, false, true, false) => Some(180),
        (false, false, true, true) => Some(225),
        (false, false, false, true) => Some(270),
        (true, false, false, true) => Some(315),
        _ => None,
    }
}

impl DeviceBackend for GilrsBackend {
    fn enumerate(&mut self) -> Result<Vec<PhysicalDeviceInfo>, BackendError> {
        self.refresh();
        self.layouts.clear();

        let mut infos = Vec::new();
        for (id, gamepad) in self.gilrs.gamepads() {
            let (info, layout) = Self::describe(id, &gamepad);
            info!(
                "Found device {}: {} axes, {} buttons, {} hats",
                info.identity,
                info.axis_count(),
                info.button_count,
                info.hat_count
            );
            self.layouts.insert(info.handle, layout);
            infos.push(info);
        }
        Ok(infos)
    }

    fn refresh(&mut self) {
        while let Some(event) = self.gilrs.next_event() {
            debug!("gilrs event: {:?}", event.event);
        }
    }

    // Answered from the gilrs state cache pumped in `refresh`; never blocks.
    fn read_state(
        &mut self,
        handle: DeviceHandle,
        _timeout: Duration,
    ) -> Result<DeviceInputState, BackendError> {
        let layout = self
            .layouts
            .get(&handle)
            .ok_or(BackendError::Disconnected(handle))?;
        let gamepad = self
            .gilrs
            .connected_gamepad(layout.id)
            .ok_or(BackendError::Disconnected(handle))?;

        let axes = layout
            .axes
            .iter()
            .map(|axis| gamepad.value(*axis).clamp(-1.0, 1.0))
            .collect();
        let buttons = layout
            .buttons
            .iter()
            .map(|button| gamepad.is_pressed(*button))
            .collect();
        let hats = if layout.has_hat {
            vec![hat_angle(
                gamepad.is_pressed(Button::DPadUp),
                gamepad.is_pressed(Button::DPadRight),
                gamepad.is_pressed(Button::DPadDown),
                gamepad.is_pressed(Button::DPadLeft),
            )]
        } else {
            Vec::new()
        };

        Ok(DeviceInputState {
            axes,
            buttons,
            hats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpad_combinations_map_to_angles() {
        assert_eq!(hat_angle(false, false, false, false), None);
        assert_eq!(hat_angle(true, false, false, false), Some(0));
        assert_eq!(hat_angle(false, true, true, false), Some(135));
        assert_eq!(hat_angle(true, false, false, true), Some(315));
        // Opposing directions cancel out
        assert_eq!(hat_angle(true, false, true, false), None);
    }
}
