//! Pause, resume, abort and progress reporting through the remote channel.

mod common;

use common::{config, orchestrator, small_scope, RecordingStore};
use mosaic_daq::acquisition::{AbortReason, PositionList, RunOutcome, RunPhase, Section};
use mosaic_daq::hardware::MockSettings;
use mosaic_daq::remote::{Priority, RemoteEvent};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn three_sections() -> PositionList {
    PositionList::new(vec![
        Section::single(0.0, 0.0),
        Section::single(100.0, 0.0),
        Section::single(200.0, 0.0),
    ])
}

#[tokio::test]
async fn pause_holds_hardware_until_resumed() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings::default());
    let (control, orchestrator) = orchestrator(scope.clone(), config(), &store);
    let mut state = control.watch_state();

    control.pause();
    let run = tokio::spawn(async move { orchestrator.run(&three_sections(), dir.path()).await });

    timeout(Duration::from_secs(5), state.wait_for(|s| s.paused))
        .await
        .expect("run never paused")
        .unwrap();
    let paused = control.state();
    assert_eq!(paused.phase, RunPhase::Paused);
    assert_eq!(paused.frames_completed, 1);
    assert_eq!(control.remaining_frames(), 2);

    let motions = scope.motion_count().await;
    let images = scope.image_count().await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(scope.motion_count().await, motions);
    assert_eq!(scope.image_count().await, images);

    control.resume();
    let report = timeout(Duration::from_secs(5), run)
        .await
        .expect("run never finished")
        .unwrap()
        .unwrap();

    assert!(report.outcome.is_completed());
    let keys: HashSet<_> = store.captures().into_iter().map(|r| r.key).collect();
    assert_eq!(keys.len(), 6);
    assert_eq!(store.captures().len(), 6);
}

#[tokio::test]
async fn abort_while_paused_stops_at_frame_boundary() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let (control, orchestrator) = orchestrator(small_scope(MockSettings::default()), config(), &store);
    let mut state = control.watch_state();
    let mut events = control.subscribe_events();

    control.pause();
    let run = tokio::spawn(async move { orchestrator.run(&three_sections(), dir.path()).await });
    timeout(Duration::from_secs(5), state.wait_for(|s| s.paused))
        .await
        .expect("run never paused")
        .unwrap();

    control.abort();
    let report = timeout(Duration::from_secs(5), run)
        .await
        .expect("run never finished")
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted(AbortReason::RemoteRequest));
    assert!(report.fault().is_none());
    assert_eq!(report.tokens_issued, 2);
    assert_eq!(store.captures().len(), 2);

    let end = control.state();
    assert!(end.aborted);
    assert!(!end.is_acquiring);
    assert_eq!(end.phase, RunPhase::Aborted);

    let mut messages = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RemoteEvent::Notification { message, .. } = event {
            messages.push(message);
        }
    }
    assert!(messages.contains(&"Paused on section 0, frame 0".to_string()));
    assert!(messages.contains(&"Imaging stopped prematurely on section 0, frame 0".to_string()));
}

#[tokio::test]
async fn abort_request_is_cleared_by_the_next_run() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let (control, orchestrator) = orchestrator(small_scope(MockSettings::default()), config(), &store);

    control.abort();
    let report = orchestrator.run(&three_sections(), dir.path()).await.unwrap();

    assert!(report.outcome.is_completed());
    assert_eq!(report.tokens_issued, 6);
}

#[tokio::test]
async fn progress_events_and_previews_follow_the_run() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let (control, orchestrator) = orchestrator(small_scope(MockSettings::default()), config(), &store);
    let mut events = control.subscribe_events();
    let mut previews = control.subscribe_previews();

    let positions = three_sections();
    orchestrator.plan(&positions);
    assert_eq!(control.remaining_frames(), 3);
    assert_eq!(control.remaining_time(), Duration::from_millis(3 * 260));

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();
    assert!(report.outcome.is_completed());

    let mut progress = Vec::new();
    let mut notifications = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            RemoteEvent::Progress { section, frame, .. } => progress.push((section, frame)),
            RemoteEvent::Notification { priority, message } => {
                notifications.push((priority, message))
            }
        }
    }
    assert_eq!(progress, vec![(0, 0), (1, 0), (2, 0)]);
    assert_eq!(
        notifications,
        vec![(Priority::Normal, "Done imaging!".to_string())]
    );

    let mut thumbnails = Vec::new();
    while let Ok(preview) = previews.try_recv() {
        thumbnails.push(preview);
    }
    assert_eq!(thumbnails.len(), 6);
    assert_eq!(thumbnails.iter().filter(|p| p.terminal).count(), 3);

    let end = control.state();
    assert_eq!(end.phase, RunPhase::Done);
    assert_eq!(end.frames_completed, 3);
    assert_eq!(control.remaining_frames(), 3);
}
