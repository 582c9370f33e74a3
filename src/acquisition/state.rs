//! Run phases, the published run state snapshot, and the final run report.

use crate::acquisition::token::FaultMessage;
use crate::error::AcqError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Phase of the acquisition state machine.
///
/// ```text
/// Idle -> MovingToStart -> PerSection -> PerFrame -> PerZPlane -> PerChannel -> Done
///              |               |            |            |            |
///              +---------------+------------+------------+------------+--> Aborted
///
/// Paused is entered at frame boundaries and returns to PerFrame.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// No run in progress
    #[default]
    Idle,
    /// Walking the stage back to the first section
    MovingToStart,
    /// Entering a section
    PerSection,
    /// Moving to and settling on a frame
    PerFrame,
    /// Setting up a z-plane
    PerZPlane,
    /// Capturing channels
    PerChannel,
    /// Holding position until resumed
    Paused,
    /// Finished normally
    Done,
    /// Stopped early
    Aborted,
}

impl RunPhase {
    /// Phases during which hardware is being driven for a run.
    pub fn is_acquiring(self) -> bool {
        !matches!(self, RunPhase::Idle | RunPhase::Done | RunPhase::Aborted)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::MovingToStart => "moving to start",
            RunPhase::PerSection => "section",
            RunPhase::PerFrame => "frame",
            RunPhase::PerZPlane => "z-plane",
            RunPhase::PerChannel => "channel",
            RunPhase::Paused => "paused",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Snapshot of the run, written only by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    /// Run identifier, set at run start
    pub run_id: Option<Uuid>,
    /// Wall-clock start of the run
    pub started_at: Option<DateTime<Utc>>,
    /// Current phase
    pub phase: RunPhase,
    /// Section being acquired
    pub section_index: usize,
    /// Frame being acquired
    pub frame_index: usize,
    /// Hardware is being driven for a run
    pub is_acquiring: bool,
    /// Holding in the pause loop
    pub paused: bool,
    /// The run was aborted
    pub aborted: bool,
    /// Frame slots finished so far
    pub frames_completed: usize,
    /// Frame slots in the run
    pub total_frames: usize,
    /// Estimated time per frame slot (stage step plus used exposures)
    #[serde(with = "humantime_serde")]
    pub frame_time: Duration,
}

impl RunState {
    /// Frame slots not yet finished.
    ///
    /// Outside a run this is the size of the last planned run.
    pub fn remaining_frames(&self) -> usize {
        if self.is_acquiring {
            self.total_frames.saturating_sub(self.frames_completed)
        } else {
            self.total_frames
        }
    }

    /// Estimated time to finish the remaining frames.
    pub fn remaining_time(&self) -> Duration {
        self.frame_time
            .saturating_mul(u32::try_from(self.remaining_frames()).unwrap_or(u32::MAX))
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// Abort requested through the remote channel
    RemoteRequest,
    /// Hardware autofocus lost its lock
    LostAutofocusLock {
        /// Section where the loss was detected
        section: usize,
        /// Frame, when detected between frames
        frame: Option<usize>,
    },
    /// A microscope call failed
    Hardware(String),
    /// The persistence worker reported a fault
    Persistence(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::RemoteRequest => f.write_str("abort requested"),
            AbortReason::LostAutofocusLock { section, frame } => match frame {
                Some(frame) => write!(f, "lost autofocus lock at section {section}, frame {frame}"),
                None => write!(f, "lost autofocus lock at section {section}"),
            },
            AbortReason::Hardware(detail) => write!(f, "hardware fault: {detail}"),
            AbortReason::Persistence(detail) => write!(f, "persistence fault: {detail}"),
        }
    }
}

impl From<&AcqError> for AbortReason {
    fn from(err: &AcqError) -> Self {
        match err {
            AcqError::LostAutofocusLock { section, frame } => AbortReason::LostAutofocusLock {
                section: *section,
                frame: *frame,
            },
            AcqError::Persistence(detail) => AbortReason::Persistence(detail.clone()),
            AcqError::Hardware(detail) => AbortReason::Hardware(detail.clone()),
            other => AbortReason::Hardware(other.to_string()),
        }
    }
}

impl From<AcqError> for AbortReason {
    fn from(err: AcqError) -> Self {
        AbortReason::from(&err)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every activated position was imaged
    Completed,
    /// The run stopped early
    Aborted(AbortReason),
}

impl RunOutcome {
    /// True for a normal finish.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Summary handed back when a run ends.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end, after the worker drained
    pub finished_at: DateTime<Utc>,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Last section reached, for manual resume
    pub last_section: usize,
    /// Last frame reached, for manual resume
    pub last_frame: usize,
    /// Capture tokens handed to the worker
    pub tokens_issued: usize,
    /// Faults reported by the worker during the run
    pub faults: Vec<FaultMessage>,
    /// Software autofocus attempts that produced no usable offset
    pub autofocus_failures: usize,
}

impl RunReport {
    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Error equivalent of an abort caused by a fault, if any.
    pub fn fault(&self) -> Option<AcqError> {
        match &self.outcome {
            RunOutcome::Completed | RunOutcome::Aborted(AbortReason::RemoteRequest) => None,
            RunOutcome::Aborted(AbortReason::LostAutofocusLock { section, frame }) => {
                Some(AcqError::LostAutofocusLock {
                    section: *section,
                    frame: *frame,
                })
            }
            RunOutcome::Aborted(AbortReason::Hardware(detail)) => {
                Some(AcqError::Hardware(detail.clone()))
            }
            RunOutcome::Aborted(AbortReason::Persistence(detail)) => {
                Some(AcqError::Persistence(detail.clone()))
            }
        }
    }
}
