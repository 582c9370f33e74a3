//! Messages crossing the orchestrator / persistence boundary.
//!
//! Capture tokens flow one way into the persistence worker, fault messages
//! flow back. Both queues are unbounded FIFOs.

use crate::data::frame::Frame;
use std::fmt;
use std::path::PathBuf;

/// Identity of one capture within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureKey {
    /// Section index
    pub section: usize,
    /// Frame index within the section (0 for sections without frames)
    pub frame: usize,
    /// Z-plane index
    pub z_index: usize,
    /// Channel identifier
    pub channel: String,
}

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S{:04}/F{:04}/Z{:02}/{}",
            self.section, self.frame, self.z_index, self.channel
        )
    }
}

/// One captured image and everything needed to persist it.
///
/// Built by the orchestrator and consumed exactly once by the worker.
#[derive(Debug, Clone)]
pub struct CaptureToken {
    /// Section index
    pub section: usize,
    /// Frame index
    pub frame: usize,
    /// Z-plane index
    pub z_index: usize,
    /// Channel identifier
    pub channel: String,
    /// Protocol name (file prefix)
    pub protocol_name: String,
    /// Directory the files are written into
    pub output_dir: PathBuf,
    /// Raw camera image
    pub image: Frame,
    /// Stage x at capture time
    pub x: f64,
    /// Stage y at capture time
    pub y: f64,
    /// Focus z at capture time
    pub z: f64,
    /// Exposure used for this capture (ms)
    pub exposure_ms: f64,
    /// Last capture of the section's last frame
    pub is_terminal: bool,
    /// Compute a focus score for this capture
    pub calc_focus: bool,
    /// Adaptive focus control image, if one was taken
    pub afc_image: Option<Frame>,
}

impl CaptureToken {
    /// Key identifying this capture.
    pub fn key(&self) -> CaptureKey {
        CaptureKey {
            section: self.section,
            frame: self.frame,
            z_index: self.z_index,
            channel: self.channel.clone(),
        }
    }
}

/// Item on the capture queue.
#[derive(Debug)]
pub enum QueueItem {
    /// A capture to persist
    Capture(Box<CaptureToken>),
    /// Always the last item; ends the worker loop
    Stop,
}

impl QueueItem {
    /// Wrap a token.
    pub fn capture(token: CaptureToken) -> Self {
        QueueItem::Capture(Box::new(token))
    }

    /// True for the stop sentinel.
    pub fn is_stop(&self) -> bool {
        matches!(self, QueueItem::Stop)
    }
}

/// Step of the persistence sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Image encode or write
    ImageWrite,
    /// Per-capture text metadata
    Metadata,
    /// Focus score record
    FocusScore,
    /// Adaptive focus control record
    AfcRecord,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::ImageWrite => "image write",
            FaultKind::Metadata => "metadata write",
            FaultKind::FocusScore => "focus score",
            FaultKind::AfcRecord => "AFC record",
        };
        f.write_str(name)
    }
}

/// How bad a fault is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FaultSeverity {
    /// A single capture failed; the worker keeps consuming
    Error,
    /// The worker gave up after repeated failures and has stopped
    Fatal,
}

/// Fault reported by the persistence worker.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultMessage {
    /// Failed step
    pub kind: FaultKind,
    /// Severity
    pub severity: FaultSeverity,
    /// Error text
    pub detail: String,
    /// Capture being written when the fault happened
    pub key: Option<CaptureKey>,
}

impl FaultMessage {
    /// Failure of a single capture.
    pub fn error(kind: FaultKind, detail: impl Into<String>, key: Option<CaptureKey>) -> Self {
        Self {
            kind,
            severity: FaultSeverity::Error,
            detail: detail.into(),
            key,
        }
    }

    /// Escalate to fatal.
    pub fn fatal(mut self) -> Self {
        self.severity = FaultSeverity::Fatal;
        self
    }

    /// True when the worker has stopped.
    pub fn is_fatal(&self) -> bool {
        self.severity == FaultSeverity::Fatal
    }
}

impl fmt::Display for FaultMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.kind)?;
        if let Some(key) = &self.key {
            write!(f, " for {key}")?;
        }
        write!(f, ": {}", self.detail)
    }
}
