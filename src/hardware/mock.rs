//! Mock Microscope
//!
//! Simulated microscope for tests and the `--simulate` CLI path.
//! All waits use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! Every command is appended to a call log so tests can assert exactly which
//! hardware operations happened and in what order.
//!
//! # Focus model
//!
//! The sample is a checkerboard whose contrast falls off as
//! `exp(-((z - best_z) / depth)^2)`. The hardware autofocus offset is the
//! focus position itself, so setting the offset moves z.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::config::StageResetConfig;
use crate::data::frame::Frame;
use crate::hardware::capabilities::{
    AdaptiveFocus, ChannelControl, ExposureControl, FocusDrive, HardwareAutofocus,
    HardwareSequencer, ImageCapture, XyStage,
};

/// One recorded hardware command.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// `move_stage`
    MoveStage(f64, f64),
    /// `set_z`
    SetZ(f64),
    /// `reset_piezo`
    ResetPiezo,
    /// `set_channel`
    SetChannel(String),
    /// `set_exposure`
    SetExposure(f64),
    /// `snap_image`
    Snap,
    /// `set_binning`
    SetBinning(u32),
    /// `set_hardware_autofocus_state`
    SetAutofocus {
        /// Requested state
        enabled: bool,
        /// Hold flag
        hold: bool,
    },
    /// `set_autofocus_offset`
    SetAutofocusOffset(f64),
    /// `setup_hardware_triggering`
    SetupTriggering(Vec<String>),
    /// `start_hardware_sequence`
    StartSequence,
    /// `get_image`
    GetImage,
    /// `stop_hardware_triggering`
    StopTriggering,
    /// `get_afc_image`
    AfcImage,
    /// `set_afc_hold`
    SetAfcHold(bool),
}

impl MockCall {
    /// Stage or focus motion.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            MockCall::MoveStage(..)
                | MockCall::SetZ(_)
                | MockCall::ResetPiezo
                | MockCall::SetAutofocusOffset(_)
        )
    }

    /// Image readout.
    pub fn is_capture(&self) -> bool {
        matches!(self, MockCall::Snap | MockCall::GetImage)
    }
}

/// Behaviour knobs for [`MockMicroscope`].
#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Sensor size at binning 1
    pub sensor: (u32, u32),
    /// Pixel size at binning 1 (µm)
    pub pixel_size: f64,
    /// A hardware autofocus device is fitted
    pub hardware_autofocus: bool,
    /// An AFC imager is fitted
    pub afc_imager: bool,
    /// Hardware triggering setup succeeds
    pub hardware_trigger: bool,
    /// Focus lock held at start
    pub locked: bool,
    /// Lock is lost once this many stage moves have happened
    pub lose_lock_after_moves: Option<usize>,
    /// Busy polls before the autofocus reports done
    pub autofocus_done_after_polls: u32,
    /// Snaps fail once this many images have been read out
    pub fail_after_snaps: Option<usize>,
    /// Best focus position of the sample
    pub best_z: f64,
    /// Focus depth of the contrast fall-off
    pub focus_depth: f64,
    /// Simulated command latency
    pub latency: Duration,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            sensor: (64, 64),
            pixel_size: 0.65,
            hardware_autofocus: true,
            afc_imager: false,
            hardware_trigger: false,
            locked: true,
            lose_lock_after_moves: None,
            autofocus_done_after_polls: 0,
            fail_after_snaps: None,
            best_z: 0.0,
            focus_depth: 3.0,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    xy: (f64, f64),
    z: f64,
    channel: String,
    exposure_ms: f64,
    binning: u32,
    autofocus_enabled: bool,
    busy_polls: u32,
    moves: usize,
    images: usize,
    sequence: Vec<String>,
    sequence_cursor: usize,
    calls: Vec<MockCall>,
}

/// Simulated microscope implementing every capability.
///
/// # Example
///
/// ```
/// use mosaic_daq::hardware::capabilities::{ImageCapture, XyStage};
/// use mosaic_daq::hardware::{MockMicroscope, MockSettings};
///
/// # tokio_test::block_on(async {
/// let scope = MockMicroscope::new(MockSettings { best_z: 2.0, ..Default::default() });
/// scope.move_stage(10.0, 20.0).await?;
/// let frame = scope.snap_image().await?;
/// assert_eq!(frame.pixels().len(), 64 * 64);
/// assert_eq!(scope.image_count().await, 1);
/// # Ok::<(), anyhow::Error>(())
/// # }).unwrap();
/// ```
pub struct MockMicroscope {
    settings: MockSettings,
    state: RwLock<MockState>,
}

impl MockMicroscope {
    /// Create a mock with the given behaviour
    pub fn new(settings: MockSettings) -> Self {
        let state = MockState {
            binning: 1,
            autofocus_enabled: settings.hardware_autofocus && settings.locked,
            exposure_ms: 10.0,
            ..MockState::default()
        };
        Self {
            settings,
            state: RwLock::new(state),
        }
    }

    /// Behaviour settings
    pub fn settings(&self) -> &MockSettings {
        &self.settings
    }

    /// All commands received so far
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of stage/focus motion commands received
    pub async fn motion_count(&self) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.is_motion())
            .count()
    }

    /// Number of images read out
    pub async fn image_count(&self) -> usize {
        self.state.read().await.images
    }

    async fn record(&self, call: MockCall) {
        if !self.settings.latency.is_zero() {
            sleep(self.settings.latency).await;
        }
        debug!(?call, "MockMicroscope");
        self.state.write().await.calls.push(call);
    }

    fn lock_held(&self, state: &MockState) -> bool {
        if !self.settings.hardware_autofocus || !self.settings.locked || !state.autofocus_enabled
        {
            return false;
        }
        self.settings
            .lose_lock_after_moves
            .map_or(true, |limit| state.moves < limit)
    }

    /// Render the sample at the current focus.
    async fn render(&self) -> Result<Frame> {
        let mut state = self.state.write().await;
        if let Some(limit) = self.settings.fail_after_snaps {
            if state.images >= limit {
                bail!("MockMicroscope: camera readout failed");
            }
        }
        state.images += 1;

        let binning = state.binning.max(1);
        let width = (self.settings.sensor.0 / binning).max(1);
        let height = (self.settings.sensor.1 / binning).max(1);
        let defocus = (state.z - self.settings.best_z) / self.settings.focus_depth;
        let contrast = 1000.0 * (-(defocus * defocus)).exp();

        let mut pixels = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let bright = ((x / 4) + (y / 4)) % 2 == 0;
                let value = if bright { 200.0 + contrast } else { 200.0 };
                pixels.push(value.round() as u16);
            }
        }
        Frame::from_u16(width, height, pixels)
    }
}

impl Default for MockMicroscope {
    fn default() -> Self {
        Self::new(MockSettings::default())
    }
}

#[async_trait]
impl XyStage for MockMicroscope {
    async fn move_stage(&self, x: f64, y: f64) -> Result<()> {
        self.record(MockCall::MoveStage(x, y)).await;
        let mut state = self.state.write().await;
        state.xy = (x, y);
        state.moves += 1;
        state.busy_polls = 0;
        Ok(())
    }

    async fn get_xy(&self) -> Result<(f64, f64)> {
        Ok(self.state.read().await.xy)
    }

    async fn reset_piezo(&self, _config: &StageResetConfig) -> Result<()> {
        self.record(MockCall::ResetPiezo).await;
        Ok(())
    }
}

#[async_trait]
impl FocusDrive for MockMicroscope {
    async fn set_z(&self, z: f64) -> Result<()> {
        self.record(MockCall::SetZ(z)).await;
        self.state.write().await.z = z;
        Ok(())
    }

    async fn get_z(&self) -> Result<f64> {
        Ok(self.state.read().await.z)
    }
}

#[async_trait]
impl HardwareAutofocus for MockMicroscope {
    fn has_hardware_autofocus(&self) -> bool {
        self.settings.hardware_autofocus
    }

    async fn set_hardware_autofocus_state(&self, enabled: bool, hold: bool) -> Result<()> {
        if !self.settings.hardware_autofocus {
            bail!("MockMicroscope: no hardware autofocus fitted");
        }
        self.record(MockCall::SetAutofocus { enabled, hold }).await;
        self.state.write().await.autofocus_enabled = enabled;
        Ok(())
    }

    async fn get_hardware_autofocus_state(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(self.lock_held(&state))
    }

    async fn is_hardware_autofocus_done(&self) -> Result<bool> {
        let mut state = self.state.write().await;
        state.busy_polls += 1;
        Ok(state.busy_polls > self.settings.autofocus_done_after_polls)
    }

    async fn get_autofocus_offset(&self) -> Result<f64> {
        Ok(self.state.read().await.z)
    }

    async fn set_autofocus_offset(&self, offset: f64) -> Result<()> {
        self.record(MockCall::SetAutofocusOffset(offset)).await;
        self.state.write().await.z = offset;
        Ok(())
    }
}

#[async_trait]
impl ChannelControl for MockMicroscope {
    async fn set_channel(&self, channel: &str) -> Result<()> {
        self.record(MockCall::SetChannel(channel.to_string())).await;
        self.state.write().await.channel = channel.to_string();
        Ok(())
    }
}

#[async_trait]
impl ExposureControl for MockMicroscope {
    async fn set_exposure(&self, exposure_ms: f64) -> Result<()> {
        if exposure_ms <= 0.0 {
            return Err(anyhow!("MockMicroscope: Exposure must be positive"));
        }
        self.record(MockCall::SetExposure(exposure_ms)).await;
        self.state.write().await.exposure_ms = exposure_ms;
        Ok(())
    }

    async fn get_exposure(&self) -> Result<f64> {
        Ok(self.state.read().await.exposure_ms)
    }
}

#[async_trait]
impl ImageCapture for MockMicroscope {
    async fn snap_image(&self) -> Result<Frame> {
        self.record(MockCall::Snap).await;
        self.render().await
    }

    async fn get_sensor_size(&self) -> Result<(u32, u32)> {
        let binning = self.state.read().await.binning.max(1);
        Ok((
            self.settings.sensor.0 / binning,
            self.settings.sensor.1 / binning,
        ))
    }

    async fn get_pixel_size(&self) -> Result<f64> {
        let binning = self.state.read().await.binning.max(1);
        Ok(self.settings.pixel_size * f64::from(binning))
    }

    async fn set_binning(&self, binning: u32) -> Result<()> {
        if binning == 0 {
            bail!("MockMicroscope: binning must be at least 1");
        }
        self.record(MockCall::SetBinning(binning)).await;
        self.state.write().await.binning = binning;
        Ok(())
    }
}

#[async_trait]
impl HardwareSequencer for MockMicroscope {
    async fn setup_hardware_triggering(
        &self,
        channels: &[String],
        _exposures_ms: &[f64],
    ) -> Result<bool> {
        self.record(MockCall::SetupTriggering(channels.to_vec())).await;
        if !self.settings.hardware_trigger {
            return Ok(false);
        }
        self.state.write().await.sequence = channels.to_vec();
        Ok(true)
    }

    async fn start_hardware_sequence(&self) -> Result<()> {
        self.record(MockCall::StartSequence).await;
        let mut state = self.state.write().await;
        if state.sequence.is_empty() {
            bail!("MockMicroscope: no hardware sequence programmed");
        }
        state.sequence_cursor = 0;
        Ok(())
    }

    async fn get_image(&self) -> Result<Frame> {
        self.record(MockCall::GetImage).await;
        {
            let mut state = self.state.write().await;
            if state.sequence_cursor >= state.sequence.len() {
                bail!("MockMicroscope: sequence exhausted");
            }
            state.channel = state.sequence[state.sequence_cursor].clone();
            state.sequence_cursor += 1;
        }
        self.render().await
    }

    async fn stop_hardware_triggering(&self) -> Result<()> {
        self.record(MockCall::StopTriggering).await;
        self.state.write().await.sequence.clear();
        Ok(())
    }
}

#[async_trait]
impl AdaptiveFocus for MockMicroscope {
    fn has_afc_imager(&self) -> bool {
        self.settings.afc_imager
    }

    async fn get_afc_image(&self) -> Result<Frame> {
        if !self.settings.afc_imager {
            bail!("MockMicroscope: no AFC imager fitted");
        }
        self.record(MockCall::AfcImage).await;
        let (width, height) = self.settings.sensor;
        Ok(Frame::zeros((width / 4).max(1), (height / 4).max(1)))
    }

    async fn set_afc_hold(&self, hold: bool) -> Result<()> {
        self.record(MockCall::SetAfcHold(hold)).await;
        Ok(())
    }
}
