//! # Mosaic DAQ
//!
//! Automated mosaic acquisition for serial-section microscopy. A run walks a
//! two-level position tree (sections, each optionally holding frames), keeps
//! focus with hardware and software autofocus, captures every used channel
//! at every z-plane, and hands images to a persistence worker that writes
//! them to disk on its own thread.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the run itself. Position tree, channel plan, z-plan,
//!   capture tokens, autofocus, the persistence worker and the
//!   `AcquisitionOrchestrator` state machine.
//! - **`config`**: Figment-based `AcquisitionConfig` (TOML file plus
//!   `MOSAIC_DAQ_` environment overrides) and its validation.
//! - **`data`**: `Frame` camera buffers and preview thumbnails.
//! - **`error`**: the `AcqError` taxonomy shared by every module.
//! - **`hardware`**: capability traits the microscope is driven through, and
//!   a simulated microscope.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`remote`**: pause/resume/abort, progress events and previews for
//!   callers outside the run.
//! - **`service`**: serves queued start requests one run at a time.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod remote;
pub mod service;

pub use acquisition::{AcquisitionOrchestrator, PositionList, RunOutcome, RunReport};
pub use config::AcquisitionConfig;
pub use error::{AcqError, AppResult};
