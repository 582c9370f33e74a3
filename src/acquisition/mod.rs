//! Mosaic acquisition engine.
//!
//! The orchestrator walks sections, frames, z-planes and channels, driving a
//! [`Microscope`](crate::hardware::Microscope) and handing every captured
//! image to the persistence worker as a [`CaptureToken`].

pub mod autofocus;
pub mod channels;
pub mod orchestrator;
pub mod persistence;
pub mod position;
pub mod state;
pub mod strategy;
pub mod token;
pub mod zplan;

pub use autofocus::{AutofocusController, FocusResult};
pub use channels::{ChannelPlan, ChannelSetting};
pub use orchestrator::AcquisitionOrchestrator;
pub use persistence::{CaptureStore, DiskStore, PersistenceHandle, PersistenceWorker};
pub use position::{FramePosition, PositionList, Section, SectionLayout};
pub use state::{AbortReason, RunOutcome, RunPhase, RunReport, RunState};
pub use strategy::CaptureStrategy;
pub use token::{CaptureKey, CaptureToken, FaultKind, FaultMessage, FaultSeverity, QueueItem};
pub use zplan::ZPlan;
