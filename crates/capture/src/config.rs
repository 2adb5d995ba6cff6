//! Capture configuration management

use anyhow::{Context, Result, anyhow};
use driver::{DeviceSelection, OpenOptions, RetryPolicy, StreamConfig};
use protocol::{AlignmentMode, DEFAULT_BLOCK_SIZE, DEFAULT_TRANSFER_TIMEOUT_MS, DEFAULT_TRANSFERS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Position among matching devices; overrides `selection`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Device to use when several match ("first" or "last")
    #[serde(default)]
    pub selection: DeviceSelection,
    /// Intel-HEX image for unprogrammed devices (`~` is expanded)
    #[serde(default = "DeviceSettings::default_firmware_path")]
    pub firmware_path: String,
    /// Wait for re-enumeration after flashing
    #[serde(default = "DeviceSettings::default_flash_settle_ms")]
    pub flash_settle_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            index: None,
            selection: DeviceSelection::default(),
            firmware_path: Self::default_firmware_path(),
            flash_settle_ms: Self::default_flash_settle_ms(),
        }
    }
}

impl DeviceSettings {
    fn default_firmware_path() -> String {
        driver::DEFAULT_FIRMWARE_PATH.to_string()
    }

    fn default_flash_settle_ms() -> u64 {
        2000
    }

    /// Effective selection policy
    pub fn selection(&self) -> DeviceSelection {
        match self.index {
            Some(n) => DeviceSelection::Index(n),
            None => self.selection,
        }
    }

    /// Firmware path with `~` expanded
    pub fn firmware_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.firmware_path).as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Concurrent bulk transfers
    #[serde(default = "StreamSettings::default_transfers")]
    pub transfers: usize,
    /// Bytes per transfer
    #[serde(default = "StreamSettings::default_block_size")]
    pub block_size: usize,
    #[serde(default = "StreamSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Resubmit transfers that complete with an error instead of retiring them
    #[serde(default = "StreamSettings::default_resubmit_on_error")]
    pub resubmit_on_error: bool,
    #[serde(default = "StreamSettings::default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Frame alignment policy ("per_read" or "latched")
    #[serde(default)]
    pub alignment: AlignmentMode,
    /// Give up on the start command after this long
    #[serde(default = "StreamSettings::default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            transfers: Self::default_transfers(),
            block_size: Self::default_block_size(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            resubmit_on_error: Self::default_resubmit_on_error(),
            cancel_grace_ms: Self::default_cancel_grace_ms(),
            alignment: AlignmentMode::default(),
            start_timeout_ms: Self::default_start_timeout_ms(),
        }
    }
}

impl StreamSettings {
    fn default_transfers() -> usize {
        DEFAULT_TRANSFERS
    }

    fn default_block_size() -> usize {
        DEFAULT_BLOCK_SIZE
    }

    fn default_transfer_timeout_ms() -> u64 {
        DEFAULT_TRANSFER_TIMEOUT_MS
    }

    fn default_resubmit_on_error() -> bool {
        true
    }

    fn default_cancel_grace_ms() -> u64 {
        1
    }

    fn default_start_timeout_ms() -> u64 {
        2000
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Complex samples per packet
    #[serde(default = "CaptureSettings::default_samples_per_packet")]
    pub samples_per_packet: usize,
    /// Packets to capture (0 = until interrupted)
    #[serde(default)]
    pub packets: u64,
    /// Output file; stdout when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            samples_per_packet: Self::default_samples_per_packet(),
            packets: 0,
            output: None,
        }
    }
}

impl CaptureSettings {
    fn default_samples_per_packet() -> usize {
        2048
    }
}

impl CaptureConfig {
    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gn3s/capture.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CaptureConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("gn3s").join("capture.toml")
        } else {
            PathBuf::from(".config/gn3s/capture.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        let stream = self.open_options().stream;
        stream.validate()?;

        let samples = self.capture.samples_per_packet;
        if samples == 0 {
            return Err(anyhow!("samples_per_packet must be greater than 0"));
        }
        // A packet must fit in the ring with one byte to spare
        if 2 * samples >= stream.capacity() {
            return Err(anyhow!(
                "samples_per_packet {} does not fit in a {}-byte ring",
                samples,
                stream.capacity()
            ));
        }

        Ok(())
    }

    /// Driver options described by this configuration
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            selection: self.device.selection(),
            firmware_path: self.device.firmware_path(),
            flash_settle: Duration::from_millis(self.device.flash_settle_ms),
            stream: StreamConfig {
                transfers: self.stream.transfers,
                block_size: self.stream.block_size,
                transfer_timeout: Duration::from_millis(self.stream.transfer_timeout_ms),
                resubmit_on_error: self.stream.resubmit_on_error,
                cancel_grace: Duration::from_millis(self.stream.cancel_grace_ms),
                ..StreamConfig::default()
            },
            alignment: self.stream.alignment,
            retry: RetryPolicy {
                timeout: Duration::from_millis(self.stream.start_timeout_ms),
                ..RetryPolicy::default()
            },
        }
    }
}
