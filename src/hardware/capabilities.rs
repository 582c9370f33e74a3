//! Microscope Capabilities
//!
//! The acquisition engine never talks to a driver directly. It consumes a
//! microscope through small capability traits, one per concern:
//!
//! - `XyStage` - lateral stage motion and piezo reset
//! - `FocusDrive` - z position
//! - `HardwareAutofocus` - continuous focus lock and its offset
//! - `ChannelControl` / `ExposureControl` - filter/illumination preset and exposure
//! - `ImageCapture` - software-triggered snaps and sensor geometry
//! - `HardwareSequencer` - camera/stage sequences programmed once and pulled in a loop
//! - `AdaptiveFocus` - auxiliary AFC images
//!
//! `Microscope` bundles all of them for trait objects and is implemented
//! automatically for any type that implements every capability.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Calls block until the device has accepted the command. Any `Err` is a
//! hardware fault; the orchestrator never retries it.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn snap_at<M>(scope: &M, x: f64, y: f64) -> Result<Frame>
//! where
//!     M: XyStage + ImageCapture
//! {
//!     scope.move_stage(x, y).await?;
//!     scope.snap_image().await
//! }
//! ```

use crate::config::StageResetConfig;
use crate::data::frame::Frame;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: Lateral Stage Motion
///
/// # Contract
/// - `move_stage` returns once the stage has been commanded; settling is the
///   caller's concern
/// - `get_xy` reports the position the stage believes it is at
#[async_trait]
pub trait XyStage: Send + Sync {
    /// Move to an absolute stage position
    async fn move_stage(&self, x: f64, y: f64) -> Result<()>;

    /// Current stage position
    async fn get_xy(&self) -> Result<(f64, f64)>;

    /// Re-center a piezo stage and compensate with the coarse stage
    ///
    /// # Default Implementation
    /// Does nothing, for stages without a piezo.
    async fn reset_piezo(&self, _config: &StageResetConfig) -> Result<()> {
        Ok(())
    }
}

/// Capability: Focus Drive
#[async_trait]
pub trait FocusDrive: Send + Sync {
    /// Move the focus drive to an absolute z
    async fn set_z(&self, z: f64) -> Result<()>;

    /// Current focus position
    async fn get_z(&self) -> Result<f64>;
}

/// Capability: Hardware Autofocus
///
/// Continuous focus devices (e.g. reflection-based focus locks) that hold a
/// configurable offset from a reference surface.
///
/// # Contract
/// - `get_hardware_autofocus_state` is true only while the lock is held
/// - `is_hardware_autofocus_done` is false while the device is still busy
///   converging after a move
#[async_trait]
pub trait HardwareAutofocus: Send + Sync {
    /// Whether the microscope has a hardware autofocus device at all
    ///
    /// # Default Implementation
    /// Returns true.
    fn has_hardware_autofocus(&self) -> bool {
        true
    }

    /// Enable or disable the focus lock
    ///
    /// # Arguments
    /// * `enabled` - Turn continuous focus on or off
    /// * `hold` - Keep the current offset when switching on
    async fn set_hardware_autofocus_state(&self, enabled: bool, hold: bool) -> Result<()>;

    /// Whether the lock is currently held
    async fn get_hardware_autofocus_state(&self) -> Result<bool>;

    /// Whether the device has finished converging
    async fn is_hardware_autofocus_done(&self) -> Result<bool>;

    /// Current focus offset
    async fn get_autofocus_offset(&self) -> Result<f64>;

    /// Set the focus offset the lock holds
    async fn set_autofocus_offset(&self, offset: f64) -> Result<()>;
}

/// Capability: Channel Selection
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Switch filters/illumination to the named channel preset
    async fn set_channel(&self, channel: &str) -> Result<()>;
}

/// Capability: Exposure Time Control
///
/// # Contract
/// - Exposure is in milliseconds
/// - Exposure applies to the next acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set exposure time
    async fn set_exposure(&self, exposure_ms: f64) -> Result<()>;

    /// Get current exposure setting
    async fn get_exposure(&self) -> Result<f64>;
}

/// Capability: Software-Triggered Image Capture
#[async_trait]
pub trait ImageCapture: Send + Sync {
    /// Expose and read out one image
    async fn snap_image(&self) -> Result<Frame>;

    /// Sensor size (width, height) in pixels at the current binning
    async fn get_sensor_size(&self) -> Result<(u32, u32)>;

    /// Pixel size in micrometers at the sample
    async fn get_pixel_size(&self) -> Result<f64>;

    /// Set camera binning
    async fn set_binning(&self, binning: u32) -> Result<()>;
}

/// Capability: Hardware-Triggered Sequences
///
/// # Contract
/// - `setup_hardware_triggering` returns `Ok(false)` when the hardware cannot
///   run the requested sequence; the caller falls back to software triggering
/// - After `start_hardware_sequence`, one `get_image` call per programmed
///   channel returns the images in channel order
#[async_trait]
pub trait HardwareSequencer: Send + Sync {
    /// Program the channel/exposure sequence
    async fn setup_hardware_triggering(
        &self,
        channels: &[String],
        exposures_ms: &[f64],
    ) -> Result<bool>;

    /// Run the programmed sequence once
    async fn start_hardware_sequence(&self) -> Result<()>;

    /// Pull the next image of the running sequence
    async fn get_image(&self) -> Result<Frame>;

    /// Leave hardware triggering mode
    async fn stop_hardware_triggering(&self) -> Result<()>;
}

/// Capability: Adaptive Focus Control Imager
#[async_trait]
pub trait AdaptiveFocus: Send + Sync {
    /// Whether an AFC imager is fitted
    ///
    /// # Default Implementation
    /// Returns false.
    fn has_afc_imager(&self) -> bool {
        false
    }

    /// Capture one AFC image
    async fn get_afc_image(&self) -> Result<Frame>;

    /// Engage or release AFC hold
    async fn set_afc_hold(&self, hold: bool) -> Result<()>;
}

// =============================================================================
// Combined Traits (for trait objects)
// =============================================================================

/// Everything the acquisition engine needs from a microscope
///
/// This trait exists solely to enable `Arc<dyn Microscope>`. Implement the
/// individual capabilities and get this automatically via blanket impl.
pub trait Microscope:
    XyStage
    + FocusDrive
    + HardwareAutofocus
    + ChannelControl
    + ExposureControl
    + ImageCapture
    + HardwareSequencer
    + AdaptiveFocus
{
}

/// Blanket implementation - any type implementing every capability is a Microscope
impl<T> Microscope for T where
    T: XyStage
        + FocusDrive
        + HardwareAutofocus
        + ChannelControl
        + ExposureControl
        + ImageCapture
        + HardwareSequencer
        + AdaptiveFocus
{
}
