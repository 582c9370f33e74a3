//! Acquisition configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `MOSAIC_DAQ_`, nested keys separated by `__`
//!
//! Every section has defaults, so a partial file is enough to get going. Semantic
//! checks live in [`AcquisitionConfig::validate`] and run before any hardware is touched.
//!
//! # Example
//! ```no_run
//! use mosaic_daq::config::AcquisitionConfig;
//!
//! let config = AcquisitionConfig::load_from("config/acquisition.toml")?;
//! config.validate()?;
//! println!("Microscope: {}", config.application.microscope_name);
//! # Ok::<(), mosaic_daq::error::AcqError>(())
//! ```

use crate::acquisition::channels::ChannelPlan;
use crate::error::{AcqError, AppResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level acquisition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Hardware autofocus settle loop
    pub autofocus: AutofocusConfig,
    /// Software (through-focus) autofocus
    pub software_autofocus: SoftwareAutofocusConfig,
    /// Z-stack capture
    pub zstack: ZStackConfig,
    /// Piezo / compensation stage reset
    pub stage_reset: StageResetConfig,
    /// Camera and triggering
    pub camera: CameraConfig,
    /// Channels to image
    pub channels: ChannelPlan,
    /// Persistence worker
    pub storage: StorageConfig,
    /// Remote control polling
    pub remote: RemoteConfig,
    /// Mosaic tile layout recorded in session metadata
    pub mosaic: MosaicConfig,
    /// Remaining-time estimate
    pub estimate: EstimateConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Name of the microscope, written into session metadata and notifications
    pub microscope_name: String,
    /// Experiment label written into session metadata
    pub meta_experiment_name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Mosaic DAQ".to_string(),
            microscope_name: "microscope".to_string(),
            meta_experiment_name: "mosaic".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Hardware autofocus settle loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    /// Delay after a stage move before polling the device
    #[serde(with = "humantime_serde")]
    pub settle_wait: Duration,
    /// Interval between busy polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Polls before giving up on settling and proceeding anyway
    pub max_polls: u32,
    /// Optional second settle pass with its own initial wait
    #[serde(with = "humantime_serde")]
    pub second_wait: Option<Duration>,
    /// Turn hardware autofocus off while capturing and back on afterwards
    pub toggle_during_capture: bool,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            settle_wait: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            max_polls: 50,
            second_wait: None,
            toggle_during_capture: false,
        }
    }
}

/// Software autofocus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareAutofocusConfig {
    /// Z distance between through-focus planes (µm)
    pub step_size: f64,
    /// Planes captured when autofocusing during an acquisition (odd)
    pub acquisition_planes: usize,
    /// Planes captured for interactive (non-acquisition) autofocus (odd)
    pub interactive_planes: usize,
    /// Exposure used for the focus stack (ms)
    pub exposure_ms: f64,
    /// Channel the focus stack is imaged in
    pub map_channel: String,
    /// Wait after changing the autofocus offset before reading it back
    #[serde(with = "humantime_serde")]
    pub offset_settle: Duration,
}

impl Default for SoftwareAutofocusConfig {
    fn default() -> Self {
        Self {
            step_size: 2.0,
            acquisition_planes: 5,
            interactive_planes: 9,
            exposure_ms: 10.0,
            map_channel: String::new(),
            offset_settle: Duration::from_millis(200),
        }
    }
}

/// Z-stack settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZStackConfig {
    /// Capture a stack instead of a single plane
    pub enabled: bool,
    /// Distance between planes (µm)
    pub step: f64,
    /// Number of planes
    pub count: usize,
    /// Force software triggering whenever the stack is enabled
    pub force_software_trigger: bool,
}

impl Default for ZStackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            step: 0.5,
            count: 1,
            force_software_trigger: false,
        }
    }
}

/// Piezo / compensation stage reset settings, passed through to the hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageResetConfig {
    /// Reset before each activated section and after each frame
    pub enabled: bool,
    /// Stage that compensates the reset
    pub compensation_stage: String,
    /// Stage that is reset
    pub reset_stage: String,
    /// Lower travel threshold triggering a reset
    pub min_threshold: f64,
    /// Upper travel threshold triggering a reset
    pub max_threshold: f64,
    /// Position the reset stage returns to
    pub reset_position: f64,
    /// Invert the direction of the compensation move
    pub invert_compensation: bool,
}

impl Default for StageResetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            compensation_stage: String::new(),
            reset_stage: String::new(),
            min_threshold: 20.0,
            max_threshold: 80.0,
            reset_position: 50.0,
            invert_compensation: false,
        }
    }
}

/// Camera and triggering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Try to program a hardware channel sequence at run start
    pub hardware_trigger: bool,
    /// Binning used during the run
    pub acquisition_binning: u32,
    /// Binning restored when the run ends
    pub default_binning: u32,
    /// Capture an adaptive focus control image per frame
    pub take_afc_image: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            hardware_trigger: false,
            acquisition_binning: 1,
            default_binning: 2,
            take_afc_image: false,
        }
    }
}

/// Persistence worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Binning factor of the published preview thumbnails
    pub thumbnail_bin: u32,
    /// Consecutive write failures after which the worker stops itself
    pub max_consecutive_failures: u32,
    /// Abort the run (after the current frame) on any persistence fault
    pub abort_on_fault: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            thumbnail_bin: 2,
            max_consecutive_failures: 3,
            abort_on_fault: true,
        }
    }
}

/// Remote control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Poll interval of the pause hold loop
    #[serde(with = "humantime_serde")]
    pub pause_poll_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            pause_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Mosaic layout written into session metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Tiles along x
    pub mx: u32,
    /// Tiles along y
    pub my: u32,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self { mx: 1, my: 1 }
    }
}

/// Remaining-time estimate parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    /// Assumed stage move + settle time per frame
    #[serde(with = "humantime_serde")]
    pub stage_step: Duration,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            stage_step: Duration::from_millis(200),
        }
    }
}

impl AcquisitionConfig {
    /// Load configuration from a specific file path plus `MOSAIC_DAQ_` environment variables
    ///
    /// Example override: `MOSAIC_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MOSAIC_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overlay)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.autofocus.max_polls == 0 {
            return Err(invalid("autofocus.max_polls must be at least 1"));
        }

        let af = &self.software_autofocus;
        for (name, planes) in [
            ("acquisition_planes", af.acquisition_planes),
            ("interactive_planes", af.interactive_planes),
        ] {
            if planes < 3 || planes % 2 == 0 {
                return Err(invalid(format!(
                    "software_autofocus.{name} must be odd and at least 3, got {planes}"
                )));
            }
        }
        if !(af.step_size > 0.0) {
            return Err(invalid("software_autofocus.step_size must be positive"));
        }

        if self.zstack.enabled && self.zstack.count == 0 {
            return Err(invalid("zstack.count must be at least 1"));
        }

        if self.storage.thumbnail_bin == 0 {
            return Err(invalid("storage.thumbnail_bin must be at least 1"));
        }
        if self.storage.max_consecutive_failures == 0 {
            return Err(invalid("storage.max_consecutive_failures must be at least 1"));
        }

        self.validate_channels()
    }

    fn validate_channels(&self) -> AppResult<()> {
        let plan = &self.channels;
        if plan.used_count() == 0 {
            return Err(invalid("channel plan has no used channels"));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for channel in &plan.channels {
            if !ids.insert(channel.id.as_str()) {
                return Err(invalid(format!("Duplicate channel id: {}", channel.id)));
            }
            if !names.insert(channel.protocol_name.as_str()) {
                return Err(invalid(format!(
                    "Duplicate protocol name: {}",
                    channel.protocol_name
                )));
            }
            if !(channel.exposure_ms > 0.0) {
                return Err(invalid(format!(
                    "Channel '{}' exposure must be positive",
                    channel.id
                )));
            }
        }

        if plan.channel(&plan.focus_score_channel).is_none() {
            return Err(invalid(format!(
                "focus_score_channel '{}' is not in the channel plan",
                plan.focus_score_channel
            )));
        }

        let map_channel = &self.software_autofocus.map_channel;
        if !map_channel.is_empty() && plan.channel(map_channel).is_none() {
            return Err(invalid(format!(
                "software_autofocus.map_channel '{map_channel}' is not in the channel plan"
            )));
        }

        Ok(())
    }

    /// Number of z-planes captured per frame
    pub fn z_planes(&self) -> usize {
        if self.zstack.enabled {
            self.zstack.count
        } else {
            1
        }
    }
}

fn invalid(message: impl Into<String>) -> AcqError {
    AcqError::Configuration(message.into())
}
