//! Two-level position hierarchy: sections, each optionally owning a frame list.
//!
//! The nesting limit is carried by the types: a [`Section`] holds a
//! [`SectionLayout`], and a [`FramePosition`] has no children.

use crate::error::{AcqError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// A sub-position inside a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePosition {
    /// Stage x
    pub x: f64,
    /// Stage y
    pub y: f64,
    /// Imaged when true
    #[serde(default = "default_true")]
    pub activated: bool,
    /// Run software autofocus before capturing this frame
    #[serde(default)]
    pub autofocus_trigger: bool,
    /// Use this frame to seed focus when entering the section
    #[serde(default)]
    pub initial_trigger: bool,
}

fn default_true() -> bool {
    true
}

impl FramePosition {
    /// Activated frame without triggers.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            activated: true,
            autofocus_trigger: false,
            initial_trigger: false,
        }
    }

    /// Run software autofocus before capture.
    pub fn with_autofocus(mut self) -> Self {
        self.autofocus_trigger = true;
        self
    }

    /// Seed the section focus from this frame.
    pub fn as_initial(mut self) -> Self {
        self.initial_trigger = true;
        self
    }

    /// Skip this frame.
    pub fn deactivated(mut self) -> Self {
        self.activated = false;
        self
    }
}

/// What a section contains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionLayout {
    /// The section is imaged at its own coordinate
    #[default]
    Single,
    /// The section is imaged at each of its frames
    Framed {
        /// Frames in acquisition order
        frames: Vec<FramePosition>,
    },
}

/// A top-level imaging position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Stage x
    pub x: f64,
    /// Stage y
    pub y: f64,
    /// Imaged when true
    #[serde(default = "default_true")]
    pub activated: bool,
    /// Frame list, if any
    #[serde(default)]
    pub layout: SectionLayout,
}

impl Section {
    /// Activated section imaged at its own coordinate.
    pub fn single(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            activated: true,
            layout: SectionLayout::Single,
        }
    }

    /// Activated section with a frame list.
    pub fn framed(x: f64, y: f64, frames: Vec<FramePosition>) -> Self {
        Self {
            x,
            y,
            activated: true,
            layout: SectionLayout::Framed { frames },
        }
    }

    /// Skip this section.
    pub fn deactivated(mut self) -> Self {
        self.activated = false;
        self
    }

    /// Frames, if the section has a frame list.
    pub fn frames(&self) -> Option<&[FramePosition]> {
        match &self.layout {
            SectionLayout::Single => None,
            SectionLayout::Framed { frames } => Some(frames),
        }
    }

    /// Frame indices this section occupies in progress accounting.
    pub fn frame_slots(&self) -> usize {
        self.frames().map_or(1, <[FramePosition]>::len)
    }

    /// Frames that produce captures.
    pub fn activated_frames(&self) -> usize {
        self.frames()
            .map_or(1, |frames| frames.iter().filter(|f| f.activated).count())
    }

    /// First frame (in scan order) marked as the focus seed.
    pub fn initial_frame(&self) -> Option<(usize, &FramePosition)> {
        self.frames()?
            .iter()
            .enumerate()
            .find(|(_, frame)| frame.initial_trigger)
    }
}

/// Ordered list of sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionList {
    /// Sections in acquisition order
    pub sections: Vec<Section>,
}

impl PositionList {
    /// Wrap a list of sections.
    pub fn new(sections: Vec<Section>) -> Self {
        Self { sections }
    }

    /// Read a position list saved as JSON.
    pub fn load_json<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let list: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            AcqError::Configuration(format!("{}: invalid position list: {e}", path.display()))
        })?;
        debug!(path = %path.display(), sections = list.len(), "Position list loaded");
        Ok(list)
    }

    /// Number of sections (activated or not).
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// True when there are no sections.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Check the hierarchy before any hardware is touched.
    pub fn validate(&self) -> AppResult<()> {
        if self.sections.is_empty() {
            return Err(AcqError::Configuration("position list is empty".into()));
        }

        for (index, section) in self.sections.iter().enumerate() {
            let Some(frames) = section.frames() else {
                continue;
            };
            if frames.is_empty() {
                return Err(AcqError::Configuration(format!(
                    "section {index} has an empty frame list"
                )));
            }
            let seeds = frames.iter().filter(|f| f.initial_trigger).count();
            if seeds > 1 {
                warn!(
                    section = index,
                    seeds, "More than one initial-trigger frame, using the first"
                );
            }
        }

        if self.activated_captures() == 0 {
            return Err(AcqError::Configuration(
                "position list has no activated positions".into(),
            ));
        }

        Ok(())
    }

    /// Frame slots of all activated sections (progress denominator).
    pub fn total_frames(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.activated)
            .map(Section::frame_slots)
            .sum()
    }

    /// Positions that will actually be imaged.
    pub fn activated_captures(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.activated)
            .map(Section::activated_frames)
            .sum()
    }

    /// Index of the section closest to a stage coordinate.
    pub fn nearest_section(&self, x: f64, y: f64) -> Option<usize> {
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| (i, (s.x - x).powi(2) + (s.y - y).powi(2)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Sections to visit when walking back from `from` towards section 0.
    ///
    /// The walk stops before the first section that is not activated.
    pub fn path_to_start(&self, from: usize) -> Vec<usize> {
        if from >= self.sections.len() {
            return Vec::new();
        }
        let mut path = vec![from];
        for index in (0..from).rev() {
            if !self.sections[index].activated {
                break;
            }
            path.push(index);
        }
        path
    }
}
