//! Per-tick mapping resolution
//!
//! Turns one [`SnapshotBatch`] into one [`ResolvedOutput`] per assigned
//! virtual slot, in three passes over the profile:
//!
//! ```text
//! device assignments ──► pass-through (axis i → axis i, button i → button i, hat i → POV i)
//! axis mappings      ──► largest-magnitude input ──► AxisCurve ──► overwrite target
//! button mappings    ──► OR of inputs ──► ButtonStateMachine ──► overwrite target
//! ```
//!
//! Entries run in profile order, so two entries writing the same target
//! resolve last-writer-wins. A source device that did not answer this tick
//! contributes neutral values (0 / released / centered), never stale ones.

use crate::controller::device::DeviceInputState;
use crate::controller::poller::SnapshotBatch;
use crate::mapping::button_mode::ButtonStateMachine;
use crate::mapping::error::MappingError;
use crate::mapping::profile::{InputControl, InputSource, MappingProfile, OutputKind, OutputTarget};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// An axis used as a button input counts as pressed beyond this deflection
pub const AXIS_PRESS_THRESHOLD: f32 = 0.5;

/// Final state of one virtual slot for one tick
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedOutput {
    pub tick: u64,
    pub slot: u32,
    pub axes: BTreeMap<u32, f32>,
    pub buttons: BTreeMap<u32, bool>,
    /// Hat angle in degrees, `None` when centered
    pub povs: BTreeMap<u32, Option<u16>>,
}

impl ResolvedOutput {
    fn new(tick: u64, slot: u32) -> Self {
        Self {
            tick,
            slot,
            ..Default::default()
        }
    }
}

/// Everything one tick produced.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFrame {
    pub tick: u64,
    /// One entry per device assignment, in assignment order
    pub outputs: Vec<ResolvedOutput>,
    /// Entries skipped for the first time since the profile was applied
    pub skipped: Vec<(String, MappingError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntryKey {
    Axis(usize),
    Button(usize),
}

/// Resolves snapshot batches against the active profile.
///
/// Owns one button state machine per button mapping. Not shared: the engine
/// task is the only caller.
#[derive(Debug)]
pub struct MappingResolver {
    profile: Arc<MappingProfile>,
    button_states: Vec<ButtonStateMachine>,
    reported: HashSet<EntryKey>,
}

impl MappingResolver {
    pub fn new(profile: Arc<MappingProfile>) -> Self {
        let button_states = profile
            .button_mappings
            .iter()
            .map(|m| ButtonStateMachine::new(&m.mode))
            .collect();
        Self {
            profile,
            button_states,
            reported: HashSet::new(),
        }
    }

    pub fn profile(&self) -> &Arc<MappingProfile> {
        &self.profile
    }

    /// Switches to a new profile between ticks.
    ///
    /// A button mapping that is unchanged at the same position keeps its
    /// state machine; every replaced entry starts from its initial state.
    pub fn set_profile(&mut self, profile: Arc<MappingProfile>) {
        let mut kept = 0;
        let button_states = profile
            .button_mappings
            .iter()
            .enumerate()
            .map(|(idx, mapping)| {
                let unchanged = self.profile.button_mappings.get(idx) == Some(mapping);
                match self.button_states.get(idx) {
                    Some(state) if unchanged => {
                        kept += 1;
                        state.clone()
                    }
                    _ => ButtonStateMachine::new(&mapping.mode),
                }
            })
            .collect();

        debug!(
            "Profile swapped: {} button mappings, {} state machines kept",
            profile.button_mappings.len(),
            kept
        );
        self.button_states = button_states;
        self.profile = profile;
        self.reported.clear();
    }

    pub fn resolve(&mut self, batch: &SnapshotBatch, now: Instant) -> ResolvedFrame {
        let profile = Arc::clone(&self.profile);
        let mut outputs: Vec<ResolvedOutput> = Vec::with_capacity(profile.device_assignments.len());
        let mut skipped = Vec::new();

        for assignment in &profile.device_assignments {
            let mut output = ResolvedOutput::new(batch.tick, assignment.vjoy_device);
            let neutral;
            let state = match batch.state_for(&assignment.physical_device) {
                Some(state) => state,
                None => {
                    neutral = batch
                        .device_info(&assignment.physical_device)
                        .map(|info| info.neutral_state())
                        .unwrap_or_default();
                    &neutral
                }
            };
            pass_through(state, &mut output);
            outputs.push(output);
        }

        for (idx, mapping) in profile.axis_mappings.iter().enumerate() {
            let target = match self.check_target(&outputs, &mapping.output, OutputKind::VJoyAxis) {
                Ok(pos) => pos,
                Err(e) => {
                    self.note_skip(EntryKey::Axis(idx), &mapping.name, e, &mut skipped);
                    continue;
                }
            };

            let raw = mapping
                .inputs
                .iter()
                .map(|input| axis_value(batch, input))
                .fold(0.0_f32, |best, v| if v.abs() > best.abs() { v } else { best });
            let value = mapping.curve.apply(raw);
            outputs[target].axes.insert(mapping.output.index, value);
        }

        for (idx, mapping) in profile.button_mappings.iter().enumerate() {
            let target = match self.check_target(&outputs, &mapping.output, OutputKind::VJoyButton) {
                Ok(pos) => pos,
                Err(e) => {
                    self.note_skip(EntryKey::Button(idx), &mapping.name, e, &mut skipped);
                    continue;
                }
            };

            let pressed = mapping.inputs.iter().any(|input| is_pressed(batch, input));
            let value = match self.button_states.get_mut(idx) {
                Some(machine) => machine.update(pressed, now),
                None => pressed,
            };
            outputs[target].buttons.insert(mapping.output.index, value);
        }

        trace!("Tick {} resolved into {} slots", batch.tick, outputs.len());
        ResolvedFrame {
            tick: batch.tick,
            outputs,
            skipped,
        }
    }

    fn check_target(
        &self,
        outputs: &[ResolvedOutput],
        target: &OutputTarget,
        expected: OutputKind,
    ) -> Result<usize, MappingError> {
        if target.kind != expected {
            return Err(MappingError::TargetKindMismatch(format!(
                "expected {:?}, found {:?}",
                expected, target.kind
            )));
        }
        outputs
            .iter()
            .position(|o| o.slot == target.vjoy_device)
            .ok_or(MappingError::UnassignedSlot(target.vjoy_device))
    }

    fn note_skip(
        &mut self,
        key: EntryKey,
        name: &str,
        error: MappingError,
        skipped: &mut Vec<(String, MappingError)>,
    ) {
        if self.reported.insert(key) {
            skipped.push((name.to_string(), error));
        }
    }
}

fn pass_through(state: &DeviceInputState, output: &mut ResolvedOutput) {
    for (idx, value) in state.axes.iter().enumerate() {
        output.axes.insert(idx as u32, *value);
    }
    for (idx, pressed) in state.buttons.iter().enumerate() {
        output.buttons.insert(idx as u32, *pressed);
    }
    for (idx, angle) in state.hats.iter().enumerate() {
        output.povs.insert(idx as u32, *angle);
    }
}

fn axis_value(batch: &SnapshotBatch, input: &InputSource) -> f32 {
    let Some(state) = batch.state_for(&input.device) else {
        return 0.0;
    };
    match input.control {
        InputControl::Axis { index } => state.axis(index).clamp(-1.0, 1.0),
        InputControl::Button { index } => f32::from(u8::from(state.button(index))),
        InputControl::Hat { index, direction } => match state.hat(index) {
            Some(angle) if direction.is_pressed_by(angle) => 1.0,
            _ => 0.0,
        },
    }
}

fn is_pressed(batch: &SnapshotBatch, input: &InputSource) -> bool {
    let Some(state) = batch.state_for(&input.device) else {
        return false;
    };
    match input.control {
        InputControl::Axis { index } => state.axis(index) > AXIS_PRESS_THRESHOLD,
        InputControl::Button { index } => state.button(index),
        InputControl::Hat { index, direction } => state
            .hat(index)
            .is_some_and(|angle| direction.is_pressed_by(angle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::device::{AxisKind, DeviceHandle, HatDirection, PhysicalDeviceInfo, PhysicalDeviceRef};
    use crate::controller::poller::DeviceSnapshot;
    use crate::mapping::button_mode::ButtonMode;
    use crate::mapping::curve::AxisCurve;
    use crate::mapping::profile::{AxisMapping, ButtonMapping, DeviceAssignment};
    use std::time::Duration;

    fn stick() -> PhysicalDeviceRef {
        PhysicalDeviceRef::new("Stick", "stick-guid", "044f:b10a")
    }

    fn throttle() -> PhysicalDeviceRef {
        PhysicalDeviceRef::new("Throttle", "throttle-guid", "044f:b687")
    }

    fn info(identity: PhysicalDeviceRef, connected: bool) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            identity,
            handle: DeviceHandle(0),
            axes: vec![AxisKind::X, AxisKind::Y],
            button_count: 3,
            hat_count: 1,
            connected,
        }
    }

    fn batch(tick: u64, states: Vec<(PhysicalDeviceRef, DeviceInputState)>) -> SnapshotBatch {
        let devices: Vec<PhysicalDeviceInfo> =
            vec![info(stick(), true), info(throttle(), true)];
        SnapshotBatch {
            tick,
            captured_at: Instant::now(),
            devices: Arc::from(devices),
            states: states
                .into_iter()
                .map(|(device, state)| DeviceSnapshot { device, state })
                .collect::<Vec<_>>()
                .into(),
        }
    }

    fn state(axes: &[f32], buttons: &[bool], hat: Option<u16>) -> DeviceInputState {
        DeviceInputState {
            axes: axes.to_vec(),
            buttons: buttons.to_vec(),
            hats: vec![hat],
        }
    }

    fn assigned(device: PhysicalDeviceRef, slot: u32) -> DeviceAssignment {
        DeviceAssignment {
            physical_device: device,
            vjoy_device: slot,
            device_map_override: None,
        }
    }

    #[test]
    fn assigned_device_passes_through_to_its_slot() {
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let frame = resolver.resolve(
            &batch(7, vec![(stick(), state(&[0.25, -0.5], &[false, true, false], Some(90)))]),
            Instant::now(),
        );

        assert_eq!(frame.outputs.len(), 1);
        let out = &frame.outputs[0];
        assert_eq!(out.tick, 7);
        assert_eq!(out.slot, 1);
        assert_eq!(out.axes.get(&1), Some(&-0.5));
        assert_eq!(out.buttons.get(&1), Some(&true));
        assert_eq!(out.povs.get(&0), Some(&Some(90)));
    }

    #[test]
    fn missing_device_yields_neutral_values() {
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            axis_mappings: vec![AxisMapping {
                name: "roll".to_string(),
                inputs: vec![InputSource::axis(throttle(), 0)],
                output: OutputTarget::axis(1, 5),
                curve: AxisCurve::linear(),
            }],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let frame = resolver.resolve(&batch(1, vec![]), Instant::now());

        let out = &frame.outputs[0];
        assert_eq!(out.axes.get(&0), Some(&0.0));
        assert_eq!(out.axes.get(&5), Some(&0.0));
        assert_eq!(out.buttons.get(&2), Some(&false));
        assert_eq!(out.povs.get(&0), Some(&None));
    }

    #[test]
    fn axis_mapping_takes_largest_magnitude_and_applies_curve() {
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            axis_mappings: vec![AxisMapping {
                name: "combined".to_string(),
                inputs: vec![InputSource::axis(stick(), 0), InputSource::axis(throttle(), 1)],
                output: OutputTarget::axis(1, 3),
                curve: AxisCurve::linear().deadzone(0.2),
            }],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let frame = resolver.resolve(
            &batch(
                1,
                vec![
                    (stick(), state(&[0.3, 0.0], &[], None)),
                    (throttle(), state(&[0.0, -0.6], &[], None)),
                ],
            ),
            Instant::now(),
        );

        let value = frame.outputs[0].axes[&3];
        assert!((value + 0.5).abs() < 1e-5);
    }

    #[test]
    fn later_entries_overwrite_earlier_writes() {
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            button_mappings: vec![
                ButtonMapping {
                    name: "first".to_string(),
                    inputs: vec![InputSource::button(stick(), 0)],
                    output: OutputTarget::button(1, 9),
                    mode: ButtonMode::Normal,
                },
                ButtonMapping {
                    name: "second".to_string(),
                    inputs: vec![InputSource::button(stick(), 1)],
                    output: OutputTarget::button(1, 9),
                    mode: ButtonMode::Normal,
                },
            ],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let frame = resolver.resolve(
            &batch(1, vec![(stick(), state(&[0.0, 0.0], &[true, false, false], None))]),
            Instant::now(),
        );
        assert_eq!(frame.outputs[0].buttons.get(&9), Some(&false));
    }

    #[test]
    fn button_inputs_are_or_combined_including_hat_and_axis() {
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            button_mappings: vec![ButtonMapping {
                name: "any".to_string(),
                inputs: vec![
                    InputSource::button(stick(), 0),
                    InputSource::hat(stick(), 0, HatDirection::Right),
                    InputSource::axis(throttle(), 0),
                ],
                output: OutputTarget::button(1, 10),
                mode: ButtonMode::Normal,
            }],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let now = Instant::now();

        let hat_only = batch(1, vec![(stick(), state(&[0.0, 0.0], &[false; 3], Some(45)))]);
        assert!(resolver.resolve(&hat_only, now).outputs[0].buttons[&10]);

        let axis_only = batch(
            2,
            vec![
                (stick(), state(&[0.0, 0.0], &[false; 3], None)),
                (throttle(), state(&[0.8, 0.0], &[], None)),
            ],
        );
        assert!(resolver.resolve(&axis_only, now).outputs[0].buttons[&10]);

        let nothing = batch(3, vec![(stick(), state(&[0.0, 0.0], &[false; 3], Some(180)))]);
        assert!(!resolver.resolve(&nothing, now).outputs[0].buttons[&10]);
    }

    #[test]
    fn unassigned_slot_is_skipped_and_reported_once() {
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            button_mappings: vec![ButtonMapping {
                name: "orphan".to_string(),
                inputs: vec![InputSource::button(stick(), 0)],
                output: OutputTarget::button(4, 0),
                mode: ButtonMode::Normal,
            }],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile.clone()));
        let b = batch(1, vec![(stick(), state(&[0.0, 0.0], &[true, false, false], None))]);

        let first = resolver.resolve(&b, Instant::now());
        assert_eq!(first.skipped.len(), 1);
        assert_eq!(first.skipped[0].1, MappingError::UnassignedSlot(4));
        assert!(resolver.resolve(&b, Instant::now()).skipped.is_empty());

        // Applying a profile re-arms the report
        resolver.set_profile(Arc::new(profile));
        assert_eq!(resolver.resolve(&b, Instant::now()).skipped.len(), 1);
    }

    #[test]
    fn profile_swap_keeps_state_of_unchanged_entries_only() {
        let toggle = |name: &str, button: usize| ButtonMapping {
            name: name.to_string(),
            inputs: vec![InputSource::button(stick(), button)],
            output: OutputTarget::button(1, 20 + button as u32),
            mode: ButtonMode::Toggle,
        };
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            button_mappings: vec![toggle("a", 0), toggle("b", 1)],
            ..Default::default()
        };
        let mut resolver = MappingResolver::new(Arc::new(profile.clone()));
        let t = Instant::now();

        let pressed = batch(1, vec![(stick(), state(&[0.0, 0.0], &[true, true, false], None))]);
        let frame = resolver.resolve(&pressed, t);
        assert!(frame.outputs[0].buttons[&20]);
        assert!(frame.outputs[0].buttons[&21]);

        let mut edited = profile;
        edited.button_mappings[1].name = "b-renamed".to_string();
        resolver.set_profile(Arc::new(edited));

        let released = batch(2, vec![(stick(), state(&[0.0, 0.0], &[false, false, false], None))]);
        let frame = resolver.resolve(&released, t + Duration::from_millis(10));
        assert!(frame.outputs[0].buttons[&20]);
        assert!(!frame.outputs[0].buttons[&21]);
    }

    #[test]
    fn replugged_device_with_new_guid_resolves_by_vid_pid() {
        let saved = PhysicalDeviceRef::new("Stick", "old-guid", "044f:b10a");
        let replugged = PhysicalDeviceRef::new("Stick", "new-guid", "044F:B10A");
        let profile = MappingProfile {
            device_assignments: vec![assigned(saved.clone(), 1)],
            axis_mappings: vec![AxisMapping {
                name: "roll".to_string(),
                inputs: vec![InputSource::axis(saved, 0)],
                output: OutputTarget::axis(1, 5),
                curve: AxisCurve::linear(),
            }],
            ..Default::default()
        };
        assert_eq!(
            profile.resolve_slot(&replugged.stable_guid, &replugged.vid_pid),
            Some(1)
        );

        let b = SnapshotBatch {
            tick: 1,
            captured_at: Instant::now(),
            devices: Arc::from(vec![info(replugged.clone(), true)]),
            states: Arc::from(vec![DeviceSnapshot {
                device: replugged,
                state: state(&[0.8, 0.0], &[false, true, false], Some(270)),
            }]),
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let frame = resolver.resolve(&b, Instant::now());

        let out = &frame.outputs[0];
        assert_eq!(out.axes.get(&0), Some(&0.8));
        assert!((out.axes[&5] - 0.8).abs() < 1e-6);
        assert_eq!(out.buttons.get(&1), Some(&true));
        assert_eq!(out.povs.get(&0), Some(&Some(270)));
    }

    #[test]
    fn listed_guid_is_never_replaced_by_a_twin() {
        let twin = PhysicalDeviceRef::new("Stick", "twin-guid", "044f:b10a");
        let profile = MappingProfile {
            device_assignments: vec![assigned(stick(), 1)],
            ..Default::default()
        };
        // stick() is listed but silent; its twin shares the VID:PID
        let b = SnapshotBatch {
            tick: 1,
            captured_at: Instant::now(),
            devices: Arc::from(vec![info(stick(), false), info(twin.clone(), true)]),
            states: Arc::from(vec![DeviceSnapshot {
                device: twin,
                state: state(&[0.9, 0.9], &[true, true, true], Some(0)),
            }]),
        };
        let mut resolver = MappingResolver::new(Arc::new(profile));
        let frame = resolver.resolve(&b, Instant::now());

        let out = &frame.outputs[0];
        assert_eq!(out.axes.get(&0), Some(&0.0));
        assert_eq!(out.buttons.get(&0), Some(&false));
        assert_eq!(out.povs.get(&0), Some(&None));
    }
}
