//! Capture strategy, decided once per run.

use crate::config::AcquisitionConfig;
use std::fmt;

/// How images are pulled from the camera during a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Channel sequence is programmed into the hardware and images are pulled in a loop
    HardwareTriggered,
    /// Exposure, channel and z are set explicitly before every snap
    SoftwareTriggered,
}

impl CaptureStrategy {
    /// Pick the strategy from the triggering setup result and the run configuration.
    pub fn decide(trigger_setup_ok: bool, config: &AcquisitionConfig) -> Self {
        let chromatic = config.channels.requires_chromatic_correction();
        let zstack_forces_software =
            config.zstack.enabled && config.zstack.force_software_trigger;

        if trigger_setup_ok && !chromatic && !zstack_forces_software {
            CaptureStrategy::HardwareTriggered
        } else {
            CaptureStrategy::SoftwareTriggered
        }
    }

    /// True for the hardware-triggered strategy.
    pub fn is_hardware(self) -> bool {
        self == CaptureStrategy::HardwareTriggered
    }
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureStrategy::HardwareTriggered => f.write_str("hardware-triggered"),
            CaptureStrategy::SoftwareTriggered => f.write_str("software-triggered"),
        }
    }
}

/// Whether hardware autofocus keeps holding focus through the capture.
///
/// Z-stacks and per-channel z offsets need explicit z moves, so focus is only
/// held when neither is in use.
pub fn holds_focus(config: &AcquisitionConfig) -> bool {
    !(config.zstack.enabled || config.channels.requires_chromatic_correction())
}
