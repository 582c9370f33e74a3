//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use mosaic_daq::acquisition::{
    AcquisitionOrchestrator, CaptureKey, CaptureStore, CaptureToken, ChannelPlan, ChannelSetting,
};
use mosaic_daq::config::AcquisitionConfig;
use mosaic_daq::data::Frame;
use mosaic_daq::error::{AcqError, AppResult};
use mosaic_daq::hardware::{MockMicroscope, MockSettings};
use mosaic_daq::remote::{self, RemoteControl};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the recording store saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Capture(Recorded),
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub key: CaptureKey,
    pub terminal: bool,
    pub calc_focus: bool,
    pub has_afc: bool,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// In-memory store that logs every capture and the shutdown call.
#[derive(Clone, Default)]
pub struct RecordingStore {
    log: Arc<Mutex<Vec<Entry>>>,
    fail: Arc<Mutex<Option<Box<dyn Fn(&CaptureKey) -> bool + Send>>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `write_image` for every key matching `predicate`.
    pub fn failing_when(self, predicate: impl Fn(&CaptureKey) -> bool + Send + 'static) -> Self {
        *self.fail.lock().unwrap() = Some(Box::new(predicate));
        self
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.log.lock().unwrap().clone()
    }

    pub fn captures(&self) -> Vec<Recorded> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Capture(r) => Some(r),
                Entry::Stop => None,
            })
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.entries().iter().filter(|e| **e == Entry::Stop).count()
    }
}

impl CaptureStore for RecordingStore {
    fn write_image(&mut self, token: &CaptureToken) -> AppResult<()> {
        let key = token.key();
        if let Some(fail) = self.fail.lock().unwrap().as_ref() {
            if fail(&key) {
                return Err(AcqError::Persistence(format!("{key}: disk full")));
            }
        }
        self.log.lock().unwrap().push(Entry::Capture(Recorded {
            key,
            terminal: token.is_terminal,
            calc_focus: token.calc_focus,
            has_afc: token.afc_image.is_some(),
            x: token.x,
            y: token.y,
            z: token.z,
        }));
        Ok(())
    }

    fn write_metadata(&mut self, _token: &CaptureToken) -> AppResult<()> {
        Ok(())
    }

    fn write_focus_score(&mut self, _token: &CaptureToken) -> AppResult<()> {
        Ok(())
    }

    fn write_afc(&mut self, _token: &CaptureToken, _afc_image: &Frame) -> AppResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> AppResult<()> {
        self.log.lock().unwrap().push(Entry::Stop);
        Ok(())
    }
}

/// Two channels, DAPI scored for focus, all waits shortened.
pub fn config() -> AcquisitionConfig {
    let mut config = AcquisitionConfig {
        channels: ChannelPlan::new(vec![
            ChannelSetting::new("DAPI", "DAPI_1", 20.0),
            ChannelSetting::new("GFP", "GFP_1", 40.0),
        ])
        .with_focus_score_channel("DAPI"),
        ..AcquisitionConfig::default()
    };
    config.autofocus.settle_wait = Duration::ZERO;
    config.autofocus.poll_interval = Duration::from_millis(1);
    config.software_autofocus.offset_settle = Duration::ZERO;
    config.remote.pause_poll_interval = Duration::from_millis(5);
    config
}

pub fn small_scope(settings: MockSettings) -> Arc<MockMicroscope> {
    Arc::new(MockMicroscope::new(MockSettings {
        sensor: (16, 16),
        ..settings
    }))
}

/// Orchestrator writing into `store`, plus the caller end of its remote channel.
pub fn orchestrator(
    scope: Arc<MockMicroscope>,
    config: AcquisitionConfig,
    store: &RecordingStore,
) -> (RemoteControl, AcquisitionOrchestrator) {
    let (control, link) = remote::channel();
    let store = store.clone();
    let orchestrator = AcquisitionOrchestrator::new(scope, config, link)
        .with_store_factory(move |_| Box::new(store.clone()));
    (control, orchestrator)
}
