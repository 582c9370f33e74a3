//! Channel plan: which channels are imaged, in what order, with which exposure.

use serde::{Deserialize, Serialize};

/// One imaging channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSetting {
    /// Channel identifier understood by the microscope (filter/illumination preset)
    pub id: String,
    /// Whether the channel is imaged during a run
    #[serde(default = "default_used")]
    pub used: bool,
    /// Protocol name, used for the output subdirectory and file prefix
    pub protocol_name: String,
    /// Exposure time in milliseconds
    pub exposure_ms: f64,
    /// Chromatic z correction applied on top of the current z-plane (µm)
    #[serde(default)]
    pub z_offset: f64,
}

fn default_used() -> bool {
    true
}

impl ChannelSetting {
    /// Create a used channel with no z offset.
    pub fn new(id: impl Into<String>, protocol_name: impl Into<String>, exposure_ms: f64) -> Self {
        Self {
            id: id.into(),
            used: true,
            protocol_name: protocol_name.into(),
            exposure_ms,
            z_offset: 0.0,
        }
    }

    /// Set the chromatic z offset.
    pub fn with_z_offset(mut self, z_offset: f64) -> Self {
        self.z_offset = z_offset;
        self
    }

    /// Mark the channel as unused.
    pub fn unused(mut self) -> Self {
        self.used = false;
        self
    }
}

/// Ordered set of channels with one focus-scoring channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPlan {
    /// Channels in acquisition order
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelSetting>,
    /// Channel whose captures get a focus score record
    #[serde(default)]
    pub focus_score_channel: String,
}

impl ChannelPlan {
    /// Build a plan from channels; the first channel scores focus until changed.
    pub fn new(channels: Vec<ChannelSetting>) -> Self {
        let focus_score_channel = channels.first().map(|c| c.id.clone()).unwrap_or_default();
        Self {
            channels,
            focus_score_channel,
        }
    }

    /// Designate the focus-scoring channel.
    pub fn with_focus_score_channel(mut self, id: impl Into<String>) -> Self {
        self.focus_score_channel = id.into();
        self
    }

    /// Look up a channel by id.
    pub fn channel(&self, id: &str) -> Option<&ChannelSetting> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Used channels in acquisition order.
    pub fn used(&self) -> impl Iterator<Item = &ChannelSetting> {
        self.channels.iter().filter(|c| c.used)
    }

    /// Number of used channels.
    pub fn used_count(&self) -> usize {
        self.used().count()
    }

    /// Position (within [`ChannelPlan::used`]) of the last used channel.
    ///
    /// Computed once per run so the terminal flag never depends on loop identity.
    pub fn last_used_index(&self) -> Option<usize> {
        self.used_count().checked_sub(1)
    }

    /// Ids of used channels, in order.
    pub fn used_ids(&self) -> Vec<String> {
        self.used().map(|c| c.id.clone()).collect()
    }

    /// Exposures of used channels, in order (ms).
    pub fn used_exposures(&self) -> Vec<f64> {
        self.used().map(|c| c.exposure_ms).collect()
    }

    /// Sum of used exposures (ms).
    pub fn total_exposure_ms(&self) -> f64 {
        self.used().map(|c| c.exposure_ms).sum()
    }

    /// Any used channel needs its own z position.
    pub fn requires_chromatic_correction(&self) -> bool {
        self.used().any(|c| c.z_offset != 0.0)
    }

    /// Whether captures in this channel get a focus score.
    pub fn scores_focus(&self, id: &str) -> bool {
        self.focus_score_channel == id
    }
}
