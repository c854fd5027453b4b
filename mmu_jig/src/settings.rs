use anyhow::{Context, Result};
use mmu_link::Config;
use serde::Deserialize;
use std::{fs, path::Path};

/// Behaviour of the emulated MMU
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Major, minor, revision and build reported during the handshake
    pub firmware: [u16; 4],
    /// Progress reports before a command finishes
    pub progress_steps: u8,
    /// Error every load command reports until a button press clears it
    pub load_error: Option<u16>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            firmware: [3, 0, 3, 700],
            progress_steps: 3,
            load_error: Some(0x8087),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub link: Config,
    pub device: DeviceSettings,
    /// Give up if the scripted session has not completed by then
    pub session_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            link: Config::default(),
            device: DeviceSettings::default(),
            session_timeout_ms: 60_000,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("Could not parse settings in {}", path.display()))?;
        settings
            .link
            .validate()
            .context("Invalid link configuration")?;
        Ok(settings)
    }
}
