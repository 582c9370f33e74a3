//! Acquisition orchestrator: the state machine that walks the position tree.
//!
//! One run is a single sequential control flow over the microscope. Captures
//! are handed to a [`PersistenceWorker`] on its own thread; faults come back
//! on a channel that is drained, never awaited, at frame boundaries.
//!
//! # Run sequence
//!
//! ```text
//! validate config + positions            (no hardware touched yet)
//! acquisition binning, output dirs, session metadata, spawn worker
//! MovingToStart: step back to the first section
//! decide capture strategy, check autofocus lock
//! for each activated section:
//!     lock check, piezo reset, seed focus on the initial frame
//!     for each frame:
//!         lock check
//!         move, autofocus, settle, z-planes x channels -> CaptureTokens
//!         piezo reset, drain faults, progress, pause hold, abort check
//! Stop sentinel, wait for the worker, final fault drain
//! restore binning, disable triggering, publish final state
//! ```
//!
//! Hardware errors always end the run. Software autofocus that fails to
//! converge is counted in the report and otherwise ignored.

use crate::acquisition::autofocus::AutofocusController;
use crate::acquisition::channels::ChannelSetting;
use crate::acquisition::persistence::{
    prepare_output_dirs, write_session_metadata, CaptureStore, DiskStore, PersistenceHandle,
    PersistenceWorker, SessionInfo, StopCause,
};
use crate::acquisition::position::PositionList;
use crate::acquisition::state::{AbortReason, RunOutcome, RunPhase, RunReport, RunState};
use crate::acquisition::strategy::{holds_focus, CaptureStrategy};
use crate::acquisition::token::{CaptureToken, FaultMessage};
use crate::acquisition::zplan::ZPlan;
use crate::config::AcquisitionConfig;
use crate::data::frame::Frame;
use crate::error::{AppResult, HardwareContext};
use crate::hardware::Microscope;
use crate::remote::{Priority, RemoteLink};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Builds the capture store for a run from the camera pixel size.
pub type StoreFactory = Arc<dyn Fn(f64) -> Box<dyn CaptureStore> + Send + Sync>;

/// Mutable bookkeeping for one run.
struct RunContext {
    output_dir: PathBuf,
    strategy: CaptureStrategy,
    hold_focus: bool,
    worker: PersistenceHandle,
    faults_rx: mpsc::UnboundedReceiver<FaultMessage>,
    faults: Vec<FaultMessage>,
    section: usize,
    frame: usize,
    frames_completed: usize,
    total_frames: usize,
    autofocus_failures: usize,
}

/// Position of a capture inside the run.
#[derive(Debug, Clone, Copy)]
struct FrameTarget {
    section: usize,
    frame: usize,
    x: f64,
    y: f64,
    autofocus: bool,
    terminal: bool,
}

/// Drives one microscope through mosaic acquisitions.
///
/// # Example
///
/// ```rust,ignore
/// let (control, link) = mosaic_daq::remote::channel();
/// let orchestrator = AcquisitionOrchestrator::new(scope, config, link);
/// let report = orchestrator.run(&positions, Path::new("/data/ribbon_07")).await?;
/// println!("{} tokens, outcome {:?}", report.tokens_issued, report.outcome);
/// ```
pub struct AcquisitionOrchestrator {
    scope: Arc<dyn Microscope>,
    config: AcquisitionConfig,
    autofocus: AutofocusController,
    link: RemoteLink,
    store_factory: StoreFactory,
}

impl AcquisitionOrchestrator {
    /// Create an orchestrator that writes captures with [`DiskStore`].
    pub fn new(scope: Arc<dyn Microscope>, config: AcquisitionConfig, link: RemoteLink) -> Self {
        let autofocus = AutofocusController::new(
            config.autofocus.clone(),
            config.software_autofocus.clone(),
        );
        Self {
            scope,
            config,
            autofocus,
            link,
            store_factory: Arc::new(|pixel_size: f64| {
                Box::new(DiskStore::new(pixel_size)) as Box<dyn CaptureStore>
            }),
        }
    }

    /// Replace the capture store used for subsequent runs.
    pub fn with_store_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(f64) -> Box<dyn CaptureStore> + Send + Sync + 'static,
    {
        self.store_factory = Arc::new(factory);
        self
    }

    /// Run configuration.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Orchestrator end of the remote channel.
    pub fn link(&self) -> &RemoteLink {
        &self.link
    }

    /// Mutable access, used to take the start request queue.
    pub fn link_mut(&mut self) -> &mut RemoteLink {
        &mut self.link
    }

    /// Estimated time per frame slot: stage step plus the used exposures.
    pub fn frame_time(&self) -> Duration {
        let exposure_ms = self.config.channels.total_exposure_ms();
        self.config.estimate.stage_step + Duration::from_secs_f64((exposure_ms / 1000.0).max(0.0))
    }

    /// Publish the size and duration of a planned run without starting it.
    pub fn plan(&self, positions: &PositionList) {
        let total_frames = positions.total_frames();
        let frame_time = self.frame_time();
        self.link.update_state(|s| {
            s.total_frames = total_frames;
            s.frame_time = frame_time;
        });
    }

    /// Acquire every activated position into `output_dir`.
    ///
    /// Returns `Err` only when the run could not start: invalid configuration
    /// or positions (before any hardware call), or a failure while preparing
    /// output and the persistence worker. Once the worker is running every
    /// outcome, including aborts, is described by the returned [`RunReport`].
    pub async fn run(&self, positions: &PositionList, output_dir: &Path) -> AppResult<RunReport> {
        self.config.validate()?;
        positions.validate()?;
        self.link.clear_abort();

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total_frames = positions.total_frames();
        let frame_time = self.frame_time();
        info!(
            %run_id,
            sections = positions.len(),
            total_frames,
            captures = positions.activated_captures()
                * self.config.channels.used_count()
                * self.config.z_planes(),
            output_dir = %output_dir.display(),
            "Starting acquisition"
        );
        self.link.update_state(|s| {
            *s = RunState {
                run_id: Some(run_id),
                started_at: Some(started_at),
                phase: RunPhase::MovingToStart,
                is_acquiring: true,
                total_frames,
                frame_time,
                ..RunState::default()
            };
        });

        let (worker, faults_rx) = match self.prepare(output_dir).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(error = %err, "Acquisition setup failed");
                self.release_hardware().await;
                self.publish_end(false, 0, 0);
                return Err(err);
            }
        };

        let mut ctx = RunContext {
            output_dir: output_dir.to_path_buf(),
            strategy: CaptureStrategy::SoftwareTriggered,
            hold_focus: holds_focus(&self.config),
            worker,
            faults_rx,
            faults: Vec::new(),
            section: 0,
            frame: 0,
            frames_completed: 0,
            total_frames,
            autofocus_failures: 0,
        };

        let acquired = self.acquire(positions, &mut ctx).await;
        let tokens_issued = ctx.worker.submitted();

        let mut outcome = match acquired {
            Ok(()) => RunOutcome::Completed,
            Err(reason) => RunOutcome::Aborted(reason),
        };

        match ctx.worker.finish().await {
            Ok(summary) => {
                debug!(?summary, "Persistence worker joined");
                if summary.stopped_by == StopCause::Escalated && outcome.is_completed() {
                    outcome = RunOutcome::Aborted(AbortReason::Persistence(
                        "persistence worker stopped after repeated failures".into(),
                    ));
                }
            }
            Err(err) => {
                error!(error = %err, "Persistence worker did not shut down cleanly");
                if outcome.is_completed() {
                    outcome = RunOutcome::Aborted(AbortReason::Persistence(err.to_string()));
                }
            }
        }
        while let Ok(fault) = ctx.faults_rx.try_recv() {
            warn!(%fault, "Persistence fault reported after the last frame");
            self.link.notify(Priority::High, fault.to_string());
            ctx.faults.push(fault);
        }

        self.release_hardware().await;

        match &outcome {
            RunOutcome::Completed => {
                info!(tokens_issued, "Acquisition complete");
                self.link.notify(Priority::Normal, "Done imaging!");
            }
            RunOutcome::Aborted(reason) => {
                warn!(
                    %reason,
                    section = ctx.section,
                    frame = ctx.frame,
                    tokens_issued,
                    "Acquisition stopped early"
                );
                self.link.notify(
                    Priority::Normal,
                    format!(
                        "Imaging stopped prematurely on section {}, frame {}",
                        ctx.section, ctx.frame
                    ),
                );
            }
        }
        self.publish_end(outcome.is_completed(), ctx.section, ctx.frame);

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            last_section: ctx.section,
            last_frame: ctx.frame,
            tokens_issued,
            faults: ctx.faults,
            autofocus_failures: ctx.autofocus_failures,
        })
    }

    async fn prepare(
        &self,
        output_dir: &Path,
    ) -> AppResult<(PersistenceHandle, mpsc::UnboundedReceiver<FaultMessage>)> {
        let camera = &self.config.camera;
        self.scope
            .set_binning(camera.acquisition_binning)
            .await
            .hw("set_binning")?;

        std::fs::create_dir_all(output_dir)?;
        prepare_output_dirs(output_dir, &self.config.channels)?;
        let sensor = self.scope.get_sensor_size().await.hw("get_sensor_size")?;
        let pixel_size = self.scope.get_pixel_size().await.hw("get_pixel_size")?;
        let path = write_session_metadata(
            output_dir,
            &SessionInfo {
                sensor,
                pixel_size,
                channels: &self.config.channels,
                mosaic: &self.config.mosaic,
                meta_experiment_name: &self.config.application.meta_experiment_name,
                microscope_name: &self.config.application.microscope_name,
            },
        )?;
        debug!(path = %path.display(), "Session metadata written");

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let store = (self.store_factory)(pixel_size);
        let worker = PersistenceWorker::new(store, &self.config.storage, faults_tx)
            .with_previews(self.link.preview_sender())
            .spawn()?;
        Ok((worker, faults_rx))
    }

    async fn acquire(
        &self,
        positions: &PositionList,
        ctx: &mut RunContext,
    ) -> Result<(), AbortReason> {
        let Some(first) = positions.sections.iter().position(|s| s.activated) else {
            return Ok(());
        };
        ctx.section = first;

        self.move_safe_to_start(positions).await?;
        ctx.strategy = self.decide_strategy().await?;
        info!(strategy = %ctx.strategy, hold_focus = ctx.hold_focus, "Capture strategy selected");
        self.check_lock(first, None, "on way to first position").await?;

        for (i, section) in positions.sections.iter().enumerate() {
            if !section.activated {
                continue;
            }
            ctx.section = i;
            ctx.frame = 0;
            self.set_position(RunPhase::PerSection, i, 0);
            self.check_lock(i, None, "between sections").await?;
            self.reset_piezo().await?;

            let Some(frames) = section.frames() else {
                let target = FrameTarget {
                    section: i,
                    frame: 0,
                    x: section.x,
                    y: section.y,
                    autofocus: false,
                    terminal: true,
                };
                self.acquire_frame(ctx, target).await?;
                self.finish_frame(ctx, i, 0).await?;
                continue;
            };

            if let Some((index, seed)) = section.initial_frame() {
                debug!(section = i, frame = index, "Seeding focus on initial frame");
                self.scope.move_stage(seed.x, seed.y).await.hw("move_stage")?;
                self.software_autofocus(ctx).await?;
            }

            let last_active = frames.iter().rposition(|f| f.activated);
            for (j, frame) in frames.iter().enumerate() {
                ctx.frame = j;
                self.set_position(RunPhase::PerFrame, i, j);
                self.check_lock(i, Some(j), "between frames").await?;
                if frame.activated {
                    let target = FrameTarget {
                        section: i,
                        frame: j,
                        x: frame.x,
                        y: frame.y,
                        autofocus: frame.autofocus_trigger,
                        terminal: last_active == Some(j),
                    };
                    self.acquire_frame(ctx, target).await?;
                }
                self.finish_frame(ctx, i, j).await?;
            }
        }
        Ok(())
    }

    /// Walk back from the section nearest the stage towards the start,
    /// one section at a time, until the previous section is not activated.
    async fn move_safe_to_start(&self, positions: &PositionList) -> Result<(), AbortReason> {
        self.link.update_state(|s| s.phase = RunPhase::MovingToStart);
        let (x, y) = self.scope.get_xy().await.hw("get_xy")?;
        let Some(nearest) = positions.nearest_section(x, y) else {
            return Ok(());
        };
        if self.scope.has_hardware_autofocus() {
            self.scope
                .set_hardware_autofocus_state(true, false)
                .await
                .hw("set_hardware_autofocus_state")?;
        }
        for index in positions.path_to_start(nearest) {
            self.reset_piezo().await?;
            let section = &positions.sections[index];
            debug!(section = index, "Stepping towards start");
            self.scope
                .move_stage(section.x, section.y)
                .await
                .hw("move_stage")?;
        }
        Ok(())
    }

    async fn decide_strategy(&self) -> Result<CaptureStrategy, AbortReason> {
        let armed = if self.config.camera.hardware_trigger {
            self.arm_triggering().await?
        } else {
            false
        };
        Ok(CaptureStrategy::decide(armed, &self.config))
    }

    async fn arm_triggering(&self) -> Result<bool, AbortReason> {
        let channels = &self.config.channels;
        let armed = self
            .scope
            .setup_hardware_triggering(&channels.used_ids(), &channels.used_exposures())
            .await
            .hw("setup_hardware_triggering")?;
        if !armed {
            warn!("Hardware triggering setup failed, using software triggering");
        }
        Ok(armed)
    }

    async fn check_lock(
        &self,
        section: usize,
        frame: Option<usize>,
        context: &str,
    ) -> Result<(), AbortReason> {
        if !self.scope.has_hardware_autofocus() {
            return Ok(());
        }
        let locked = self
            .scope
            .get_hardware_autofocus_state()
            .await
            .hw("get_hardware_autofocus_state")?;
        if locked {
            return Ok(());
        }
        let message = format!("Lost autofocus {context}");
        error!(section, ?frame, "{message}");
        self.link.notify(Priority::High, message);
        Err(AbortReason::LostAutofocusLock { section, frame })
    }

    async fn reset_piezo(&self) -> Result<(), AbortReason> {
        if self.config.stage_reset.enabled {
            self.scope
                .reset_piezo(&self.config.stage_reset)
                .await
                .hw("reset_piezo")?;
        }
        Ok(())
    }

    /// Software autofocus at the current stage position.
    ///
    /// Hardware triggering is suspended around the focus stack and re-armed
    /// afterwards. A convergence failure only bumps the failure counter.
    async fn software_autofocus(&self, ctx: &mut RunContext) -> Result<(), AbortReason> {
        if ctx.strategy.is_hardware() {
            self.scope
                .stop_hardware_triggering()
                .await
                .hw("stop_hardware_triggering")?;
        }
        let planes = self.config.software_autofocus.acquisition_planes;
        let result = self
            .autofocus
            .software_autofocus(&*self.scope, &self.config.channels, planes)
            .await;
        if ctx.strategy.is_hardware() && !self.arm_triggering().await? {
            return Err(AbortReason::Hardware(
                "hardware triggering could not be re-armed after autofocus".into(),
            ));
        }

        match result {
            Ok(focus) => {
                debug!(best_offset = focus.best_offset, "Focus updated");
                Ok(())
            }
            Err(err) if !err.is_run_aborting() => {
                ctx.autofocus_failures += 1;
                warn!(
                    error = %err,
                    section = ctx.section,
                    frame = ctx.frame,
                    "Keeping previous focus"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Move to a frame, focus, and capture every z-plane and used channel.
    async fn acquire_frame(
        &self,
        ctx: &mut RunContext,
        target: FrameTarget,
    ) -> Result<(), AbortReason> {
        let scope = &*self.scope;
        let has_af = scope.has_hardware_autofocus();

        if !ctx.hold_focus && has_af {
            scope
                .set_hardware_autofocus_state(true, false)
                .await
                .hw("set_hardware_autofocus_state")?;
        }
        scope.move_stage(target.x, target.y).await.hw("move_stage")?;
        if target.autofocus {
            self.software_autofocus(ctx).await?;
        }
        let (stage_x, stage_y) = scope.get_xy().await.hw("get_xy")?;

        if has_af {
            self.autofocus.settle_hardware(scope).await?;
            if !ctx.hold_focus {
                scope
                    .set_hardware_autofocus_state(false, false)
                    .await
                    .hw("set_hardware_autofocus_state")?;
            }
        } else if !target.autofocus {
            self.software_autofocus(ctx).await?;
        }

        let afc_image = if self.config.camera.take_afc_image && scope.has_afc_imager() {
            let image = scope.get_afc_image().await.hw("get_afc_image")?;
            scope.set_afc_hold(true).await.hw("set_afc_hold")?;
            Some(image)
        } else {
            None
        };

        let current_z = scope.get_z().await.hw("get_z")?;
        let planes = ZPlan::from_config(current_z, &self.config.zstack);
        let toggle = self.config.autofocus.toggle_during_capture && has_af;
        if toggle {
            scope
                .set_hardware_autofocus_state(false, false)
                .await
                .hw("set_hardware_autofocus_state")?;
        }

        self.capture_planes(
            ctx,
            target,
            (stage_x, stage_y),
            current_z,
            &planes,
            afc_image.as_ref(),
        )
        .await?;

        if toggle {
            scope
                .set_hardware_autofocus_state(true, true)
                .await
                .hw("set_hardware_autofocus_state")?;
        }
        if !ctx.hold_focus {
            scope.set_z(current_z).await.hw("set_z")?;
            if has_af {
                scope
                    .set_hardware_autofocus_state(true, false)
                    .await
                    .hw("set_hardware_autofocus_state")?;
            }
        }
        Ok(())
    }

    async fn capture_planes(
        &self,
        ctx: &mut RunContext,
        target: FrameTarget,
        stage: (f64, f64),
        current_z: f64,
        planes: &ZPlan,
        afc_image: Option<&Frame>,
    ) -> Result<(), AbortReason> {
        let scope = &*self.scope;
        let channels: Vec<&ChannelSetting> = self.config.channels.used().collect();
        let Some(last_channel) = channels.len().checked_sub(1) else {
            return Ok(());
        };
        let positions = planes.positions();
        let last_plane = positions.len().saturating_sub(1);
        let mut present_z = current_z;

        for (z_index, &plane_z) in positions.iter().enumerate() {
            self.link.update_state(|s| s.phase = RunPhase::PerZPlane);
            if ctx.strategy.is_hardware() {
                if !ctx.hold_focus && plane_z != present_z {
                    scope.set_z(plane_z).await.hw("set_z")?;
                    present_z = plane_z;
                }
                scope
                    .start_hardware_sequence()
                    .await
                    .hw("start_hardware_sequence")?;
            }

            for (c, channel) in channels.iter().enumerate() {
                self.link.update_state(|s| s.phase = RunPhase::PerChannel);
                let image = if ctx.strategy.is_hardware() {
                    scope.get_image().await.hw("get_image")?
                } else {
                    if !ctx.hold_focus {
                        let z = plane_z + channel.z_offset;
                        if z != present_z {
                            scope.set_z(z).await.hw("set_z")?;
                            present_z = z;
                        }
                    }
                    scope
                        .set_exposure(channel.exposure_ms)
                        .await
                        .hw("set_exposure")?;
                    scope.set_channel(&channel.id).await.hw("set_channel")?;
                    scope.snap_image().await.hw("snap_image")?
                };

                let is_last_channel = c == last_channel;
                let token = CaptureToken {
                    section: target.section,
                    frame: target.frame,
                    z_index,
                    channel: channel.id.clone(),
                    protocol_name: channel.protocol_name.clone(),
                    output_dir: ctx.output_dir.join(&channel.protocol_name),
                    image,
                    x: stage.0,
                    y: stage.1,
                    z: present_z,
                    exposure_ms: channel.exposure_ms,
                    is_terminal: target.terminal && is_last_channel && z_index == last_plane,
                    calc_focus: self.config.channels.scores_focus(&channel.id),
                    afc_image: if is_last_channel {
                        afc_image.cloned()
                    } else {
                        None
                    },
                };
                ctx.worker.submit(token)?;
            }
        }
        Ok(())
    }

    /// Frame boundary: piezo reset, fault drain, progress, pause and abort.
    async fn finish_frame(
        &self,
        ctx: &mut RunContext,
        section: usize,
        frame: usize,
    ) -> Result<(), AbortReason> {
        self.reset_piezo().await?;
        self.drain_faults(ctx)?;

        ctx.frames_completed += 1;
        let completed = ctx.frames_completed;
        self.link.update_state(|s| {
            s.frames_completed = completed;
            s.section_index = section;
            s.frame_index = frame;
        });
        self.link.progress(
            section,
            frame,
            format!(
                "section {section}, frame {frame} ({completed}/{} frames)",
                ctx.total_frames
            ),
        );

        self.hold_while_paused(section, frame).await;
        if self.link.abort_requested() {
            info!(section, frame, "Abort requested");
            return Err(AbortReason::RemoteRequest);
        }
        Ok(())
    }

    fn drain_faults(&self, ctx: &mut RunContext) -> Result<(), AbortReason> {
        let mut abort = None;
        while let Ok(fault) = ctx.faults_rx.try_recv() {
            warn!(%fault, "Persistence fault reported");
            self.link.notify(Priority::High, fault.to_string());
            if abort.is_none() && (fault.is_fatal() || self.config.storage.abort_on_fault) {
                abort = Some(AbortReason::Persistence(fault.to_string()));
            }
            ctx.faults.push(fault);
        }
        abort.map_or(Ok(()), Err)
    }

    /// Hold without touching hardware until resumed or aborted.
    async fn hold_while_paused(&self, section: usize, frame: usize) {
        if !self.link.is_paused() {
            return;
        }
        info!(section, frame, "Acquisition paused");
        self.link.update_state(|s| {
            s.phase = RunPhase::Paused;
            s.paused = true;
        });
        self.link.notify(
            Priority::Normal,
            format!("Paused on section {section}, frame {frame}"),
        );
        while self.link.is_paused() && !self.link.abort_requested() {
            sleep(self.config.remote.pause_poll_interval).await;
        }
        self.link.update_state(|s| {
            s.phase = RunPhase::PerFrame;
            s.paused = false;
        });
        info!(section, frame, "Acquisition resumed");
    }

    /// Return the microscope to its idle configuration. Failures are logged.
    async fn release_hardware(&self) {
        let camera = &self.config.camera;
        if let Err(e) = self.scope.set_binning(camera.default_binning).await {
            warn!(error = %e, "Failed to restore default binning");
        }
        if camera.hardware_trigger {
            if let Err(e) = self.scope.stop_hardware_triggering().await {
                warn!(error = %e, "Failed to disable hardware triggering");
            }
        }
    }

    fn set_position(&self, phase: RunPhase, section: usize, frame: usize) {
        self.link.update_state(|s| {
            s.phase = phase;
            s.section_index = section;
            s.frame_index = frame;
        });
    }

    fn publish_end(&self, completed: bool, section: usize, frame: usize) {
        self.link.update_state(|s| {
            s.phase = if completed {
                RunPhase::Done
            } else {
                RunPhase::Aborted
            };
            s.is_acquiring = false;
            s.paused = false;
            s.aborted = !completed;
            s.section_index = section;
            s.frame_index = frame;
        });
    }
}
