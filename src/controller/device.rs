//! Device identity model
//!
//! Describes physical input devices the way the rest of the engine sees them:
//! a stable identity used for matching profile entries against whatever is
//! currently plugged in, an enumeration-time shape description, and the
//! per-tick input sample.
//!
//! ## Identity matching
//!
//! A device is identified by its stable GUID first and its `VID:PID` pair
//! second. Both comparisons ignore ASCII case. An empty GUID (or an empty
//! `VID:PID`) never matches anything, so a profile entry that only knows the
//! `VID:PID` of a device still resolves, while two anonymous devices never
//! alias each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhysicalDeviceRef {
    /// Human readable product name (informational, never used for matching)
    pub name: String,
    /// Stable GUID reported by the device layer, may be empty
    #[serde(default)]
    pub stable_guid: String,
    /// `vvvv:pppp` in hex, may be empty
    #[serde(default)]
    pub vid_pid: String,
}

impl PhysicalDeviceRef {
    pub fn new(name: impl Into<String>, stable_guid: impl Into<String>, vid_pid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stable_guid: stable_guid.into(),
            vid_pid: vid_pid.into(),
        }
    }

    /// Case-insensitive GUID comparison. Empty GUIDs never match.
    pub fn guid_matches(&self, guid: &str) -> bool {
        !self.stable_guid.is_empty() && !guid.is_empty() && self.stable_guid.eq_ignore_ascii_case(guid)
    }

    /// Case-insensitive `VID:PID` comparison. Empty values never match.
    pub fn vid_pid_matches(&self, vid_pid: &str) -> bool {
        !self.vid_pid.is_empty() && !vid_pid.is_empty() && self.vid_pid.eq_ignore_ascii_case(vid_pid)
    }

    /// Whether `other` refers to the same physical device.
    ///
    /// GUIDs decide when both sides carry one; the `VID:PID` pair is only
    /// consulted when at least one side has no GUID.
    pub fn same_device(&self, other: &PhysicalDeviceRef) -> bool {
        if !self.stable_guid.is_empty() && !other.stable_guid.is_empty() {
            return self.guid_matches(&other.stable_guid);
        }
        self.vid_pid_matches(&other.vid_pid)
    }

    /// Formats a vendor/product pair the way profiles store it (`3344:0194`).
    pub fn format_vid_pid(vendor_id: u16, product_id: u16) -> String {
        format!("{:04x}:{:04x}", vendor_id, product_id)
    }
}

impl fmt::Display for PhysicalDeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.stable_guid.is_empty(), self.vid_pid.is_empty()) {
            (false, _) => write!(f, "{} [{}]", self.name, self.stable_guid),
            (true, false) => write!(f, "{} [{}]", self.name, self.vid_pid),
            (true, true) => write!(f, "{}", self.name),
        }
    }
}

/// Resolves an identity against a candidate list.
///
/// Runs two passes: the first candidate whose GUID matches wins; only if no
/// GUID matches is the first `VID:PID` match taken. Returns `None` when
/// neither pass finds anything.
pub fn match_identity<'a, T, I>(candidates: I, guid: &str, vid_pid: &str) -> Option<T>
where
    I: IntoIterator<Item = (&'a PhysicalDeviceRef, T)>,
    I::IntoIter: Clone,
{
    let candidates = candidates.into_iter();
    candidates
        .clone()
        .find(|(identity, _)| identity.guid_matches(guid))
        .or_else(|| {
            candidates
                .clone()
                .find(|(identity, _)| identity.vid_pid_matches(vid_pid))
        })
        .map(|(_, value)| value)
}

/// Finds the candidate that is the same physical device as `wanted`.
///
/// Like [`match_identity`] but stricter on the fallback: the `VID:PID` pair
/// is only consulted when one side has no GUID, so an unplugged stick is
/// never silently replaced by an identical twin that reports its own GUID.
pub fn match_device<'a, T, I>(candidates: I, wanted: &PhysicalDeviceRef) -> Option<T>
where
    I: IntoIterator<Item = (&'a PhysicalDeviceRef, T)>,
    I::IntoIter: Clone,
{
    let candidates = candidates.into_iter();
    candidates
        .clone()
        .find(|(identity, _)| identity.guid_matches(&wanted.stable_guid))
        .or_else(|| {
            candidates
                .clone()
                .find(|(identity, _)| identity.same_device(wanted))
        })
        .map(|(_, value)| value)
}

/// Semantic type of a physical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisKind {
    X,
    Y,
    Z,
    RX,
    RY,
    RZ,
    Slider,
    Unknown,
}

impl AxisKind {
    pub fn label(&self) -> &'static str {
        match self {
            AxisKind::X => "X",
            AxisKind::Y => "Y",
            AxisKind::Z => "Z",
            AxisKind::RX => "RX",
            AxisKind::RY => "RY",
            AxisKind::RZ => "RZ",
            AxisKind::Slider => "SL",
            AxisKind::Unknown => "?",
        }
    }
}

/// Backend-local handle of an enumerated device.
///
/// Only meaningful to the backend that produced it and only until the next
/// full rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

/// Shape of a physical device as seen at enumeration time.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDeviceInfo {
    pub identity: PhysicalDeviceRef,
    pub handle: DeviceHandle,
    /// One entry per axis, in report order
    pub axes: Vec<AxisKind>,
    pub button_count: usize,
    pub hat_count: usize,
    pub connected: bool,
}

impl PhysicalDeviceInfo {
    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    /// A zeroed sample with this device's shape.
    pub fn neutral_state(&self) -> DeviceInputState {
        DeviceInputState {
            axes: vec![0.0; self.axes.len()],
            buttons: vec![false; self.button_count],
            hats: vec![None; self.hat_count],
        }
    }
}

/// Cardinal direction of a POV hat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HatDirection {
    Up,
    Right,
    Down,
    Left,
}

impl HatDirection {
    /// Whether a hat angle (degrees, clockwise from up) presses this
    /// direction. Diagonals press both neighbouring directions.
    pub fn is_pressed_by(&self, angle: u16) -> bool {
        let angle = angle % 360;
        match self {
            HatDirection::Up => angle >= 315 || angle <= 45,
            HatDirection::Right => (45..=135).contains(&angle),
            HatDirection::Down => (135..=225).contains(&angle),
            HatDirection::Left => (225..=315).contains(&angle),
        }
    }
}

/// One poll-tick sample of a single device.
///
/// Axis values are normalized to `[-1, 1]`. Hats carry an angle in degrees
/// or `None` when centered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceInputState {
    pub axes: Vec<f32>,
    pub buttons: Vec<bool>,
    pub hats: Vec<Option<u16>>,
}

impl DeviceInputState {
    pub fn axis(&self, index: usize) -> f32 {
        self.axes.get(index).copied().unwrap_or(0.0)
    }

    pub fn button(&self, index: usize) -> bool {
        self.buttons.get(index).copied().unwrap_or(false)
    }

    pub fn hat(&self, index: usize) -> Option<u16> {
        self.hats.get(index).copied().flatten()
    }

    /// Indices of currently pressed buttons.
    pub fn pressed_buttons(&self) -> impl Iterator<Item = usize> + '_ {
        self.buttons
            .iter()
            .enumerate()
            .filter_map(|(idx, pressed)| pressed.then_some(idx))
    }
}
