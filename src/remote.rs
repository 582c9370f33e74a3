//! Remote control channel between outside callers and the orchestrator.
//!
//! [`channel`] returns the two ends:
//!
//! - [`RemoteControl`] (cloneable, caller side): request pause/resume/abort,
//!   start acquisitions, read the run state snapshot, and subscribe to
//!   progress events and preview thumbnails.
//! - [`RemoteLink`] (orchestrator side): polls the pause/abort request and is
//!   the single writer of the [`RunState`] snapshot.
//!
//! Nothing here ever blocks the orchestrator. Requests are read with a
//! non-blocking borrow of a `watch` channel; events go out on `broadcast`
//! channels where having no subscribers is not an error.

use crate::acquisition::persistence::Preview;
use crate::acquisition::state::RunState;
use crate::error::{AcqError, AppResult};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;
const PREVIEW_CAPACITY: usize = 16;

/// Pause/abort request as last written by a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRequest {
    /// Hold at the next frame boundary
    pub pause: bool,
    /// Stop at the next frame boundary
    pub abort: bool,
}

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Informational
    Normal,
    /// Needs operator attention
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => f.write_str("normal"),
            Priority::High => f.write_str("high"),
        }
    }
}

/// Event pushed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteEvent {
    /// A frame has been finished
    Progress {
        /// Section index
        section: usize,
        /// Frame index
        frame: usize,
        /// Human-readable progress line
        message: String,
    },
    /// Something the operator should know about
    Notification {
        /// Priority
        priority: Priority,
        /// Message text
        message: String,
    },
}

/// Request to start an acquisition into `output_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Run output directory
    pub output_dir: PathBuf,
}

/// Create a connected caller/orchestrator pair.
pub fn channel() -> (RemoteControl, RemoteLink) {
    let (control_tx, control_rx) = watch::channel(ControlRequest::default());
    let (state_tx, state_rx) = watch::channel(RunState::default());
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (previews, _) = broadcast::channel(PREVIEW_CAPACITY);
    let (start_tx, start_rx) = mpsc::unbounded_channel();
    let control_tx = Arc::new(control_tx);

    let control = RemoteControl {
        control: Arc::clone(&control_tx),
        state: state_rx,
        events: events.clone(),
        previews: previews.clone(),
        starts: start_tx,
    };
    let link = RemoteLink {
        control_tx,
        control_rx,
        state: state_tx,
        events,
        previews,
        starts: Some(start_rx),
    };
    (control, link)
}

/// Caller side of the remote channel.
#[derive(Clone)]
pub struct RemoteControl {
    control: Arc<watch::Sender<ControlRequest>>,
    state: watch::Receiver<RunState>,
    events: broadcast::Sender<RemoteEvent>,
    previews: broadcast::Sender<Preview>,
    starts: mpsc::UnboundedSender<StartRequest>,
}

impl RemoteControl {
    /// Ask the orchestrator to hold at the next frame boundary.
    pub fn pause(&self) {
        debug!("Remote pause requested");
        self.control.send_modify(|req| req.pause = true);
    }

    /// Release a pause.
    pub fn resume(&self) {
        debug!("Remote resume requested");
        self.control.send_modify(|req| req.pause = false);
    }

    /// Ask the orchestrator to stop at the next frame boundary.
    pub fn abort(&self) {
        debug!("Remote abort requested");
        self.control.send_modify(|req| req.abort = true);
    }

    /// Queue an acquisition into `output_dir`.
    pub fn start_acquisition(&self, output_dir: impl Into<PathBuf>) -> AppResult<()> {
        self.starts
            .send(StartRequest {
                output_dir: output_dir.into(),
            })
            .map_err(|_| AcqError::Configuration("acquisition service is not running".into()))
    }

    /// Current run state snapshot.
    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Frames left in the current (or last planned) run.
    pub fn remaining_frames(&self) -> usize {
        self.state.borrow().remaining_frames()
    }

    /// Estimated time to finish the current (or last planned) run.
    pub fn remaining_time(&self) -> Duration {
        self.state.borrow().remaining_time()
    }

    /// Receiver that wakes on every state change.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Subscribe to progress and notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    /// Subscribe to preview thumbnails.
    pub fn subscribe_previews(&self) -> broadcast::Receiver<Preview> {
        self.previews.subscribe()
    }
}

/// Orchestrator side of the remote channel.
pub struct RemoteLink {
    control_tx: Arc<watch::Sender<ControlRequest>>,
    control_rx: watch::Receiver<ControlRequest>,
    state: watch::Sender<RunState>,
    events: broadcast::Sender<RemoteEvent>,
    previews: broadcast::Sender<Preview>,
    starts: Option<mpsc::UnboundedReceiver<StartRequest>>,
}

impl RemoteLink {
    /// Latest pause/abort request.
    pub fn request(&self) -> ControlRequest {
        *self.control_rx.borrow()
    }

    /// A pause is requested.
    pub fn is_paused(&self) -> bool {
        self.request().pause
    }

    /// An abort is requested.
    pub fn abort_requested(&self) -> bool {
        self.request().abort
    }

    /// Forget a stale abort from a previous run. A pending pause is kept.
    pub fn clear_abort(&self) {
        self.control_tx.send_modify(|req| req.abort = false);
    }

    /// Current published state.
    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Modify and republish the run state.
    pub fn update_state(&self, update: impl FnOnce(&mut RunState)) {
        self.state.send_modify(update);
    }

    /// Push a progress event.
    pub fn progress(&self, section: usize, frame: usize, message: impl Into<String>) {
        let _ = self.events.send(RemoteEvent::Progress {
            section,
            frame,
            message: message.into(),
        });
    }

    /// Push a notification.
    pub fn notify(&self, priority: Priority, message: impl Into<String>) {
        let _ = self.events.send(RemoteEvent::Notification {
            priority,
            message: message.into(),
        });
    }

    /// Sender the persistence worker publishes previews on.
    pub fn preview_sender(&self) -> broadcast::Sender<Preview> {
        self.previews.clone()
    }

    /// Take the start request queue; only the first call gets it.
    pub fn take_start_requests(&mut self) -> Option<mpsc::UnboundedReceiver<StartRequest>> {
        self.starts.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_resume_abort_round_trip() {
        let (control, link) = channel();
        assert!(!link.is_paused());

        control.pause();
        assert!(link.is_paused());
        control.resume();
        assert!(!link.is_paused());

        control.pause();
        control.abort();
        assert!(link.abort_requested());

        link.clear_abort();
        assert!(!link.abort_requested());
        assert!(link.is_paused());
    }

    #[test]
    fn state_updates_are_visible_to_every_clone() {
        let (control, link) = channel();
        let other = control.clone();
        link.update_state(|s| {
            s.total_frames = 12;
            s.frames_completed = 5;
            s.is_acquiring = true;
            s.frame_time = Duration::from_millis(100);
        });

        assert_eq!(control.remaining_frames(), 7);
        assert_eq!(other.remaining_time(), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let (control, link) = channel();
        let mut events = control.subscribe_events();

        link.progress(1, 2, "section 1 frame 2");
        link.notify(Priority::High, "lost focus");

        assert!(matches!(
            events.recv().await.unwrap(),
            RemoteEvent::Progress { section: 1, frame: 2, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RemoteEvent::Notification { priority: Priority::High, .. }
        ));
    }

    #[test]
    fn events_without_subscribers_are_dropped() {
        let (_control, link) = channel();
        link.notify(Priority::Normal, "nobody listening");
    }

    #[tokio::test]
    async fn start_requests_are_queued_in_order() {
        let (control, mut link) = channel();
        let mut starts = link.take_start_requests().unwrap();
        assert!(link.take_start_requests().is_none());

        control.start_acquisition("/data/run1").unwrap();
        control.start_acquisition("/data/run2").unwrap();

        assert_eq!(starts.recv().await.unwrap().output_dir, PathBuf::from("/data/run1"));
        assert_eq!(starts.recv().await.unwrap().output_dir, PathBuf::from("/data/run2"));

        drop(control);
        assert!(starts.recv().await.is_none());
    }
}
