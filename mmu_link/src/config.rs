//! Link tunables
//!
//! Everything the protocol logic treats as a constant lives in [`Config`]. The defaults describe an
//! MMU running firmware 3.0.3 on the usual 115200 baud link.

use crate::registers::MAX_POLL_REGISTERS;
use core::fmt;
use heapless::Vec;

/// Upper bound of register writes performed when the link comes up
pub const MAX_SETUP_WRITES: usize = 4;

/// Firmware version the MMU must report during the handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct SupportedVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
    /// `None` accepts any build number
    #[cfg_attr(feature = "serde", serde(default))]
    pub build: Option<u16>,
}

impl SupportedVersion {
    /// Checks one handshake stage: 0 major, 1 minor, 2 revision, 3 build
    pub(crate) fn accepts(&self, stage: usize, value: u32) -> bool {
        let expected = match stage {
            0 => self.major,
            1 => self.minor,
            2 => self.revision,
            _ => match self.build {
                Some(build) => build,
                None => return value <= u32::from(u16::MAX),
            },
        };
        value == u32::from(expected)
    }
}

impl Default for SupportedVersion {
    fn default() -> Self {
        Self {
            major: 3,
            minor: 0,
            revision: 3,
            build: None,
        }
    }
}

/// A register write sent at the end of the handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct SetupWrite {
    pub address: u8,
    pub value: u16,
}

/// What to do when the MMU keeps reporting an error for the command in flight
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub enum ErrorEscalation {
    /// Keep the command outstanding until the device finishes it or the caller resolves the error
    #[default]
    KeepWaiting,
    /// Give up on the command after this many consecutive error reports
    AbandonAfter(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigError {
    TooManyRegisters,
    TooManySetupWrites,
    /// Requires `heart_beat_period < link_layer_timeout <= data_layer_timeout`
    InvalidTimeouts,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyRegisters => {
                write!(f, "more than {MAX_POLL_REGISTERS} registers in a poll list")
            }
            Self::TooManySetupWrites => write!(f, "more than {MAX_SETUP_WRITES} setup writes"),
            Self::InvalidTimeouts => write!(
                f,
                "heartbeat must be below the link timeout, which must not exceed the data timeout"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub supported_version: SupportedVersion,
    /// Silence tolerated while a response is outstanding
    pub link_layer_timeout_ms: u32,
    /// Interval between idle queries
    pub heart_beat_period_ms: u32,
    /// Silence tolerated at any time before the link is re-established
    pub data_layer_timeout_ms: u32,
    /// 8-bit registers, polled first
    pub poll_narrow: Vec<u8, MAX_POLL_REGISTERS>,
    /// 16-bit registers, polled after the narrow ones
    pub poll_wide: Vec<u8, MAX_POLL_REGISTERS>,
    pub setup_writes: Vec<SetupWrite, MAX_SETUP_WRITES>,
    pub command_errors: ErrorEscalation,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heart_beat_period_ms >= self.link_layer_timeout_ms
            || self.link_layer_timeout_ms > self.data_layer_timeout_ms
        {
            return Err(ConfigError::InvalidTimeouts);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut setup_writes = Vec::new();
        // Extra load distance and pulley slow feed rate
        let _ = setup_writes.push(SetupWrite {
            address: 0x0b,
            value: 30,
        });
        let _ = setup_writes.push(SetupWrite {
            address: 0x14,
            value: 20,
        });
        Self {
            supported_version: SupportedVersion::default(),
            link_layer_timeout_ms: 2000,
            heart_beat_period_ms: 1000,
            data_layer_timeout_ms: 6000,
            // FINDA state, selector slot, idler slot
            poll_narrow: Vec::from_slice(&[0x08, 0x1b, 0x1c]).unwrap_or_default(),
            // Error statistics, pulley position
            poll_wide: Vec::from_slice(&[0x04, 0x1a]).unwrap_or_default(),
            setup_writes,
            command_errors: ErrorEscalation::KeepWaiting,
        }
    }
}

/// Builds a validated [`Config`]
///
/// Starts from the defaults; every setter replaces one part of the configuration.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
    error: Option<ConfigError>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    pub fn supported_version(mut self, version: SupportedVersion) -> Self {
        self.config.supported_version = version;
        self
    }

    /// Sets the link-layer timeout, heartbeat period and data-layer timeout in milliseconds
    pub fn timeouts(mut self, link_layer: u32, heart_beat: u32, data_layer: u32) -> Self {
        self.config.link_layer_timeout_ms = link_layer;
        self.config.heart_beat_period_ms = heart_beat;
        self.config.data_layer_timeout_ms = data_layer;
        self
    }

    pub fn poll_narrow(mut self, addresses: &[u8]) -> Self {
        match Vec::from_slice(addresses) {
            Ok(v) => self.config.poll_narrow = v,
            Err(()) => self.fail(ConfigError::TooManyRegisters),
        }
        self
    }

    pub fn poll_wide(mut self, addresses: &[u8]) -> Self {
        match Vec::from_slice(addresses) {
            Ok(v) => self.config.poll_wide = v,
            Err(()) => self.fail(ConfigError::TooManyRegisters),
        }
        self
    }

    /// Replaces the register writes sent when the link comes up, in order
    pub fn setup_writes(mut self, writes: &[(u8, u16)]) -> Self {
        let mut out = Vec::new();
        for &(address, value) in writes {
            if out.push(SetupWrite { address, value }).is_err() {
                self.fail(ConfigError::TooManySetupWrites);
                return self;
            }
        }
        self.config.setup_writes = out;
        self
    }

    pub fn command_errors(mut self, policy: ErrorEscalation) -> Self {
        self.config.command_errors = policy;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        Ok(self.config)
    }

    fn fail(&mut self, error: ConfigError) {
        self.error.get_or_insert(error);
    }
}
