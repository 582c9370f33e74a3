//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `AcqError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! classify the failures that can happen during a mosaic acquisition.
//!
//! ## Error Hierarchy
//!
//! - **`Hardware`** / **`LostAutofocusLock`**: the microscope is unreachable or the
//!   hardware autofocus stopped holding focus. Always run-aborting.
//! - **`AutofocusConvergence`**: the software autofocus fit failed. Non-fatal, the
//!   previous focus offset is kept.
//! - **`Persistence`**: a write in the persistence worker failed. Reported
//!   asynchronously on the fault channel.
//! - **`Configuration`** / **`Config`**: bad settings or an unusable position list.
//!   Raised before any hardware motion.
//! - **`Io`**: wraps `std::io::Error` for directory and metadata setup.
//!
//! By using `#[from]`, `AcqError` can be created from underlying error types,
//! which keeps the `?` operator usable throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AcqError>;

/// Primary error type for acquisition runs.
#[derive(Error, Debug)]
pub enum AcqError {
    /// A microscope call failed (device unreachable, command rejected).
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Hardware autofocus reported that it no longer holds focus.
    #[error("Lost hardware autofocus lock at section {section}{}", frame_suffix(.frame))]
    LostAutofocusLock {
        /// Section index at which the loss was detected
        section: usize,
        /// Frame index, when detected between frames
        frame: Option<usize>,
    },

    /// Software autofocus produced no usable offset.
    #[error("Autofocus did not converge: {0}")]
    AutofocusConvergence(String),

    /// Writing a capture to disk failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration or position list failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence worker thread could not be joined.
    #[error("Persistence worker failed to shut down: {0}")]
    WorkerJoin(String),
}

fn frame_suffix(frame: &Option<usize>) -> String {
    frame.map(|f| format!(", frame {f}")).unwrap_or_default()
}

impl AcqError {
    /// Whether this error must stop the run (as opposed to being logged and absorbed).
    pub fn is_run_aborting(&self) -> bool {
        !matches!(self, AcqError::AutofocusConvergence(_))
    }

    /// Whether this error is a hardware fault (including lock loss).
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            AcqError::Hardware(_) | AcqError::LostAutofocusLock { .. }
        )
    }

    /// Wrap a hardware failure with the operation that produced it.
    pub fn hardware(operation: &str, err: impl std::fmt::Display) -> Self {
        AcqError::Hardware(format!("{operation}: {err}"))
    }
}

/// Attach the failing operation to a capability call result.
///
/// ```rust,ignore
/// scope.move_stage(x, y).await.hw("move_stage")?;
/// ```
pub trait HardwareContext<T> {
    /// Convert a device error into [`AcqError::Hardware`].
    fn hw(self, operation: &str) -> AppResult<T>;
}

impl<T> HardwareContext<T> for anyhow::Result<T> {
    fn hw(self, operation: &str) -> AppResult<T> {
        self.map_err(|e| AcqError::hardware(operation, format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autofocus_convergence_is_not_aborting() {
        let err = AcqError::AutofocusConvergence("only 2 samples".into());
        assert!(!err.is_run_aborting());
        assert!(!err.is_hardware_fault());
    }

    #[test]
    fn lost_lock_is_hardware_fault() {
        let err = AcqError::LostAutofocusLock {
            section: 3,
            frame: Some(7),
        };
        assert!(err.is_run_aborting());
        assert!(err.is_hardware_fault());
        assert_eq!(
            err.to_string(),
            "Lost hardware autofocus lock at section 3, frame 7"
        );
    }

    #[test]
    fn lost_lock_message_without_frame() {
        let err = AcqError::LostAutofocusLock {
            section: 0,
            frame: None,
        };
        assert_eq!(err.to_string(), "Lost hardware autofocus lock at section 0");
    }

    #[test]
    fn hardware_helper_includes_operation() {
        let err = AcqError::hardware("move_stage", "timeout");
        assert_eq!(err.to_string(), "Hardware error: move_stage: timeout");
    }

    #[test]
    fn hardware_context_wraps_anyhow() {
        let result: anyhow::Result<()> = Err(anyhow::anyhow!("stage unreachable"));
        let err = result.hw("move_stage").unwrap_err();
        assert!(err.is_hardware_fault());
        assert_eq!(err.to_string(), "Hardware error: move_stage: stage unreachable");
    }
}
