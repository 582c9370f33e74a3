//! End-to-end orchestrator runs against the simulated microscope.

mod common;

use common::{config, orchestrator, small_scope, Entry, RecordingStore};
use mosaic_daq::acquisition::{
    AbortReason, ChannelPlan, ChannelSetting, FramePosition, PositionList, RunOutcome, Section,
};
use mosaic_daq::error::AcqError;
use mosaic_daq::hardware::{MockCall, MockSettings};
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

fn ribbon_with_frames() -> PositionList {
    PositionList::new(vec![
        Section::framed(
            0.0,
            0.0,
            vec![
                FramePosition::new(0.0, 0.0),
                FramePosition::new(10.0, 0.0).deactivated(),
                FramePosition::new(20.0, 0.0),
            ],
        ),
        Section::single(500.0, 0.0).deactivated(),
        Section::framed(
            1000.0,
            0.0,
            vec![
                FramePosition::new(1000.0, 0.0),
                FramePosition::new(1010.0, 0.0),
            ],
        ),
        Section::single(1500.0, 0.0),
    ])
}

#[tokio::test]
async fn every_activated_capture_yields_one_token_and_stop_is_last() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let mut cfg = config();
    cfg.zstack.enabled = true;
    cfg.zstack.count = 3;
    cfg.zstack.step = 0.5;
    let positions = ribbon_with_frames();
    let (_control, orchestrator) = orchestrator(small_scope(MockSettings::default()), cfg, &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    // 5 activated frames x 2 channels x 3 planes
    assert!(report.outcome.is_completed());
    assert_eq!(report.tokens_issued, 30);
    let entries = store.entries();
    assert_eq!(entries.len(), 31);
    assert_eq!(entries.last(), Some(&Entry::Stop));
    assert_eq!(store.stops(), 1);

    let keys: HashSet<_> = store.captures().into_iter().map(|r| r.key).collect();
    assert_eq!(keys.len(), 30);
    assert!(keys.iter().all(|k| k.section != 1 && !(k.section == 0 && k.frame == 1)));
}

#[tokio::test]
async fn two_sections_three_frames_with_initial_trigger() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let section = |x: f64| {
        Section::framed(
            x,
            0.0,
            vec![
                FramePosition::new(x, 0.0),
                FramePosition::new(x + 10.0, 0.0),
                FramePosition::new(x + 20.0, 0.0).as_initial(),
            ],
        )
    };
    let positions = PositionList::new(vec![section(0.0), section(1000.0)]);
    let scope = small_scope(MockSettings::default());
    let (_control, orchestrator) = orchestrator(scope.clone(), config(), &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(report.outcome.is_completed());
    assert_eq!(report.tokens_issued, 12);
    let entries = store.entries();
    assert_eq!(entries.len(), 13);
    assert_eq!(entries[12], Entry::Stop);

    let captures = store.captures();
    let order: Vec<_> = captures
        .iter()
        .map(|r| (r.key.section, r.key.frame, r.key.channel.as_str()))
        .collect();
    let mut expected = Vec::new();
    for s in 0..2 {
        for f in 0..3 {
            expected.push((s, f, "DAPI"));
            expected.push((s, f, "GFP"));
        }
    }
    assert_eq!(order, expected);

    // Last token of each section carries the terminal flag, the 12th included.
    let terminal: Vec<_> = captures
        .iter()
        .enumerate()
        .filter(|(_, r)| r.terminal)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminal, vec![5, 11]);

    // Focus is seeded on frame 2 before frame 0 of each section is imaged.
    let moves: Vec<_> = scope
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            MockCall::MoveStage(x, _) => Some(x),
            _ => None,
        })
        .collect();
    assert_eq!(
        moves,
        vec![0.0, 20.0, 0.0, 10.0, 20.0, 1020.0, 1000.0, 1010.0, 1020.0]
    );
}

#[tokio::test]
async fn frameless_sections_end_with_a_terminal_token() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let positions = PositionList::new(vec![
        Section::single(0.0, 0.0),
        Section::single(100.0, 0.0),
    ]);
    let (_control, orchestrator) = orchestrator(small_scope(MockSettings::default()), config(), &store);

    orchestrator.run(&positions, dir.path()).await.unwrap();

    let terminal: Vec<_> = store
        .captures()
        .into_iter()
        .filter(|r| r.terminal)
        .map(|r| (r.key.section, r.key.channel))
        .collect();
    assert_eq!(
        terminal,
        vec![(0, "GFP".to_string()), (1, "GFP".to_string())]
    );
}

#[tokio::test]
async fn focus_score_flag_follows_focus_channel() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let positions = PositionList::new(vec![Section::single(0.0, 0.0)]);
    let (_control, orchestrator) = orchestrator(small_scope(MockSettings::default()), config(), &store);

    orchestrator.run(&positions, dir.path()).await.unwrap();

    let flags: Vec<_> = store
        .captures()
        .into_iter()
        .map(|r| (r.key.channel, r.calc_focus))
        .collect();
    assert_eq!(flags, vec![("DAPI".to_string(), true), ("GFP".to_string(), false)]);
}

#[tokio::test]
async fn unlocked_autofocus_at_start_produces_no_tokens() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings {
        locked: false,
        ..MockSettings::default()
    });
    let (_control, orchestrator) = orchestrator(scope.clone(), config(), &store);

    let report = orchestrator
        .run(&ribbon_with_frames(), dir.path())
        .await
        .unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::Aborted(AbortReason::LostAutofocusLock { section: 0, frame: None })
    ));
    assert!(report.fault().unwrap().is_hardware_fault());
    assert_eq!(report.tokens_issued, 0);
    assert_eq!(store.entries(), vec![Entry::Stop]);
    assert_eq!(scope.image_count().await, 0);
    assert_eq!(scope.calls().await.last(), Some(&MockCall::SetBinning(2)));
}

#[tokio::test]
async fn lock_lost_between_sections_aborts() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    // One move to reach the start, one per section after that.
    let scope = small_scope(MockSettings {
        lose_lock_after_moves: Some(3),
        ..MockSettings::default()
    });
    let positions = PositionList::new(vec![
        Section::single(0.0, 0.0),
        Section::single(100.0, 0.0),
        Section::single(200.0, 0.0),
    ]);
    let (_control, orchestrator) = orchestrator(scope, config(), &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Aborted(AbortReason::LostAutofocusLock {
            section: 2,
            frame: None
        })
    );
    assert_eq!(report.last_section, 2);
    assert_eq!(report.tokens_issued, 4);
    assert_eq!(store.captures().len(), 4);
    assert_eq!(store.entries().last(), Some(&Entry::Stop));
}

#[tokio::test]
async fn camera_failure_aborts_after_issued_tokens_are_written() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings {
        fail_after_snaps: Some(3),
        ..MockSettings::default()
    });
    let positions = PositionList::new(vec![
        Section::single(0.0, 0.0),
        Section::single(100.0, 0.0),
    ]);
    let (_control, orchestrator) = orchestrator(scope.clone(), config(), &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Aborted(AbortReason::Hardware(_))));
    assert_eq!(report.tokens_issued, 3);
    assert_eq!(store.captures().len(), 3);
    assert_eq!(store.entries().last(), Some(&Entry::Stop));
    assert_eq!(scope.calls().await.last(), Some(&MockCall::SetBinning(2)));
}

#[tokio::test]
async fn persistence_fault_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new().failing_when(|_| true);
    // Slow hardware so the first fault is back before the run ends.
    let scope = small_scope(MockSettings {
        latency: Duration::from_millis(5),
        ..MockSettings::default()
    });
    let positions = PositionList::new(
        (0..5)
            .map(|i| Section::single(f64::from(i) * 100.0, 0.0))
            .collect(),
    );
    let (_control, orchestrator) = orchestrator(scope, config(), &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Aborted(AbortReason::Persistence(_))));
    assert!(!report.faults.is_empty());
    assert!(matches!(report.fault(), Some(AcqError::Persistence(_))));
    assert!(store.captures().is_empty());
}

#[tokio::test]
async fn repeated_failures_escalate_even_when_faults_do_not_abort() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new().failing_when(|_| true);
    let mut cfg = config();
    cfg.storage.abort_on_fault = false;
    cfg.storage.max_consecutive_failures = 2;
    let positions = PositionList::new(
        (0..4)
            .map(|i| Section::single(f64::from(i) * 100.0, 0.0))
            .collect(),
    );
    let (_control, orchestrator) = orchestrator(small_scope(MockSettings::default()), cfg, &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Aborted(AbortReason::Persistence(_))));
    assert!(report.faults.iter().any(|f| f.is_fatal()));
}

#[tokio::test]
async fn isolated_write_failure_is_reported_and_run_continues() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new().failing_when(|k| k.section == 0 && k.channel == "GFP");
    let mut cfg = config();
    cfg.storage.abort_on_fault = false;
    let positions = PositionList::new(vec![
        Section::single(0.0, 0.0),
        Section::single(100.0, 0.0),
    ]);
    let (_control, orchestrator) = orchestrator(small_scope(MockSettings::default()), cfg, &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(report.outcome.is_completed());
    assert_eq!(report.faults.len(), 1);
    assert!(!report.faults[0].is_fatal());
    assert_eq!(store.captures().len(), 3);
    assert_eq!(store.entries().last(), Some(&Entry::Stop));
}

#[tokio::test]
async fn configuration_faults_precede_hardware() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings::default());

    let cases = vec![
        (config(), PositionList::default()),
        (config(), PositionList::new(vec![Section::framed(0.0, 0.0, vec![])])),
        (
            config(),
            PositionList::new(vec![Section::single(0.0, 0.0).deactivated()]),
        ),
        (
            {
                let mut cfg = config();
                cfg.channels = ChannelPlan::new(vec![ChannelSetting::new("DAPI", "DAPI_1", 20.0)
                    .unused()])
                .with_focus_score_channel("DAPI");
                cfg
            },
            PositionList::new(vec![Section::single(0.0, 0.0)]),
        ),
    ];

    for (cfg, positions) in cases {
        let (_control, orchestrator) = orchestrator(scope.clone(), cfg, &store);
        let err = orchestrator.run(&positions, dir.path()).await.unwrap_err();
        assert!(matches!(err, AcqError::Configuration(_)), "{err}");
    }
    assert!(scope.calls().await.is_empty());
    assert!(store.entries().is_empty());
}

#[tokio::test]
async fn hardware_triggered_run_pulls_images_from_sequence() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings {
        hardware_trigger: true,
        ..MockSettings::default()
    });
    let mut cfg = config();
    cfg.camera.hardware_trigger = true;
    let positions = PositionList::new(vec![
        Section::single(0.0, 0.0),
        Section::single(100.0, 0.0),
    ]);
    let (_control, orchestrator) = orchestrator(scope.clone(), cfg, &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(report.outcome.is_completed());
    assert_eq!(store.captures().len(), 4);
    let calls = scope.calls().await;
    let count = |call: &MockCall| calls.iter().filter(|c| *c == call).count();
    assert_eq!(count(&MockCall::StartSequence), 2);
    assert_eq!(count(&MockCall::GetImage), 4);
    assert_eq!(count(&MockCall::Snap), 0);
    assert_eq!(
        calls.last(),
        Some(&MockCall::StopTriggering),
        "triggering is disabled on release"
    );
}

#[tokio::test]
async fn channel_z_offsets_force_software_triggering() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings {
        hardware_trigger: true,
        ..MockSettings::default()
    });
    let mut cfg = config();
    cfg.camera.hardware_trigger = true;
    cfg.channels = ChannelPlan::new(vec![
        ChannelSetting::new("DAPI", "DAPI_1", 20.0),
        ChannelSetting::new("GFP", "GFP_1", 40.0).with_z_offset(1.5),
    ])
    .with_focus_score_channel("DAPI");
    let positions = PositionList::new(vec![Section::single(0.0, 0.0)]);
    let (_control, orchestrator) = orchestrator(scope.clone(), cfg, &store);

    orchestrator.run(&positions, dir.path()).await.unwrap();

    let calls = scope.calls().await;
    assert!(!calls.contains(&MockCall::StartSequence));
    assert_eq!(calls.iter().filter(|c| **c == MockCall::Snap).count(), 2);

    let captures = store.captures();
    assert!((captures[1].z - captures[0].z - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn afc_image_rides_on_last_channel_of_each_plane() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings {
        afc_imager: true,
        ..MockSettings::default()
    });
    let mut cfg = config();
    cfg.camera.take_afc_image = true;
    cfg.zstack.enabled = true;
    cfg.zstack.count = 2;
    let positions = PositionList::new(vec![Section::single(0.0, 0.0)]);
    let (_control, orchestrator) = orchestrator(scope.clone(), cfg, &store);

    orchestrator.run(&positions, dir.path()).await.unwrap();

    let afc: Vec<_> = store
        .captures()
        .into_iter()
        .map(|r| (r.key.z_index, r.key.channel, r.has_afc))
        .collect();
    assert_eq!(
        afc,
        vec![
            (0, "DAPI".to_string(), false),
            (0, "GFP".to_string(), true),
            (1, "DAPI".to_string(), false),
            (1, "GFP".to_string(), true),
        ]
    );
    assert!(scope.calls().await.contains(&MockCall::SetAfcHold(true)));
}

#[tokio::test]
async fn autofocus_trigger_moves_focus_to_the_sample() {
    let dir = TempDir::new().unwrap();
    let store = RecordingStore::new();
    let scope = small_scope(MockSettings {
        best_z: 1.0,
        ..MockSettings::default()
    });
    let positions = PositionList::new(vec![Section::framed(
        0.0,
        0.0,
        vec![FramePosition::new(0.0, 0.0).with_autofocus()],
    )]);
    let (_control, orchestrator) = orchestrator(scope.clone(), config(), &store);

    let report = orchestrator.run(&positions, dir.path()).await.unwrap();

    assert!(report.outcome.is_completed());
    assert_eq!(report.autofocus_failures, 0);
    let step = orchestrator.config().software_autofocus.step_size;
    let captures = store.captures();
    assert!((captures[0].z - 1.0).abs() <= step, "z = {}", captures[0].z);
    assert!(scope
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, MockCall::SetAutofocusOffset(_))));
}
