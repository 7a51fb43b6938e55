//! # Persistence Module
//!
//! Loads and saves the mapping profile as TOML. The file is a direct
//! serialization of [`MappingProfile`]: saving and loading again reproduces
//! the same profile, including control point order and device map overrides.
//!
//! ## Error Handling Strategy
//! File operations use `color_eyre` with context on every step. A missing
//! profile file is not an error for [`load_or_default`]; an unreadable or
//! unparsable one is.

use crate::mapping::profile::MappingProfile;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CONFIG_DIR: &str = ".config/joyremap";
pub const PROFILE_FILE: &str = "profile.toml";
pub const SETTINGS_FILE: &str = "settings.toml";

pub fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

pub fn config_dir() -> PathBuf {
    get_home_dir().join(CONFIG_DIR)
}

pub fn default_profile_path() -> PathBuf {
    config_dir().join(PROFILE_FILE)
}

pub fn to_toml(profile: &MappingProfile) -> Result<String> {
    toml::to_string_pretty(profile).map_err(|e| eyre!("Failed to serialize profile: {}", e))
}

pub fn from_toml(content: &str) -> Result<MappingProfile> {
    toml::from_str(content).map_err(|e| eyre!("Failed to parse profile: {}", e))
}

pub async fn load_profile(path: &Path) -> Result<MappingProfile> {
    debug!("Loading profile from {}", path.display());
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| eyre!("Failed to read profile file {}: {}", path.display(), e))?;
    let profile = from_toml(&content)?;
    info!(
        "Loaded profile from {}: {} assignments, {} button mappings, {} axis mappings",
        path.display(),
        profile.device_assignments.len(),
        profile.button_mappings.len(),
        profile.axis_mappings.len()
    );
    Ok(profile)
}

/// Loads the profile at `path`, or an empty profile when the file is absent.
pub async fn load_or_default(path: &Path) -> Result<MappingProfile> {
    if !tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if profile file exists: {}", e))?
    {
        info!("No profile at {}, starting with an empty profile", path.display());
        return Ok(MappingProfile::default());
    }
    load_profile(path).await
}

pub async fn save_profile(path: &Path, profile: &MappingProfile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| eyre!("Failed to create profile directory: {}", e))?;
    }

    let content = to_toml(profile)?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| eyre!("Failed to write profile file {}: {}", path.display(), e))?;

    info!("Saved profile to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::device::{HatDirection, PhysicalDeviceRef};
    use crate::mapping::button_mode::ButtonMode;
    use crate::mapping::curve::{AxisCurve, CurveKind};
    use crate::mapping::profile::{
        AxisMapping, ButtonMapping, DeviceAssignment, InputSource, OutputTarget,
    };

    fn full_profile() -> MappingProfile {
        let stick = PhysicalDeviceRef::new("Warthog Stick", "030000004f0400000204000000000000", "044f:0402");
        let throttle = PhysicalDeviceRef::new("Throttle", "", "044f:0404");
        MappingProfile {
            device_assignments: vec![
                DeviceAssignment {
                    physical_device: stick.clone(),
                    vjoy_device: 1,
                    device_map_override: Some("hide:stick".to_string()),
                },
                DeviceAssignment {
                    physical_device: throttle.clone(),
                    vjoy_device: 2,
                    device_map_override: None,
                },
            ],
            button_mappings: vec![
                ButtonMapping {
                    name: "gear".to_string(),
                    inputs: vec![
                        InputSource::button(stick.clone(), 3),
                        InputSource::hat(stick.clone(), 0, HatDirection::Down),
                    ],
                    output: OutputTarget::button(1, 20),
                    mode: ButtonMode::Toggle,
                },
                ButtonMapping {
                    name: "eject".to_string(),
                    inputs: vec![InputSource::button(throttle.clone(), 1)],
                    output: OutputTarget::button(2, 3),
                    mode: ButtonMode::DoublePress { window_ms: 250 },
                },
                ButtonMapping {
                    name: "flaps".to_string(),
                    inputs: vec![InputSource::axis(throttle.clone(), 2)],
                    output: OutputTarget::button(2, 4),
                    mode: ButtonMode::Hold { threshold_ms: 800 },
                },
            ],
            axis_mappings: vec![
                AxisMapping {
                    name: "pitch".to_string(),
                    inputs: vec![InputSource::axis(stick.clone(), 1)],
                    output: OutputTarget::axis(1, 1),
                    curve: AxisCurve {
                        kind: CurveKind::SCurve,
                        curvature: 0.35,
                        deadzone: 0.04,
                        saturation: 0.95,
                        control_points: None,
                    },
                },
                AxisMapping {
                    name: "throttle".to_string(),
                    inputs: vec![InputSource::axis(throttle, 0)],
                    output: OutputTarget::axis(2, 2),
                    curve: AxisCurve::custom(vec![(0.0, 0.0), (0.3, 0.1), (0.7, 0.6), (1.0, 1.0)]),
                },
            ],
        }
    }

    #[test]
    fn profile_round_trips_through_toml() {
        let profile = full_profile();
        let text = to_toml(&profile).expect("serializes");
        let back = from_toml(&text).expect("parses");
        assert_eq!(back, profile);
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let text = r#"
            [[device_assignments]]
            vjoy_device = 1
            [device_assignments.physical_device]
            name = "Stick"
            vid_pid = "3344:0194"

            [[axis_mappings]]
            name = "roll"
            output = { type = "VJoyAxis", vjoy_device = 1, index = 0 }
            [[axis_mappings.inputs]]
            control = { kind = "Axis", index = 0 }
            device = { name = "Stick", vid_pid = "3344:0194" }
        "#;
        let profile = from_toml(text).expect("parses");
        assert_eq!(profile.device_assignments[0].physical_device.stable_guid, "");
        assert_eq!(profile.axis_mappings[0].curve, AxisCurve::linear());
        assert!(profile.button_mappings.is_empty());
        assert!(profile.validate().is_ok());
    }

    #[tokio::test]
    async fn save_then_load_is_lossless() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join(PROFILE_FILE);
        let profile = full_profile();

        save_profile(&path, &profile).await.expect("saved");
        let loaded = load_profile(&path).await.expect("loaded");
        assert_eq!(loaded, profile);

        save_profile(&path, &loaded).await.expect("saved again");
        assert_eq!(load_profile(&path).await.expect("loaded again"), profile);
    }

    #[tokio::test]
    async fn missing_file_loads_default_but_broken_file_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(PROFILE_FILE);
        assert_eq!(
            load_or_default(&path).await.expect("default"),
            MappingProfile::default()
        );

        tokio::fs::write(&path, "device_assignments = 7").await.expect("write");
        assert!(load_or_default(&path).await.is_err());
    }
}
