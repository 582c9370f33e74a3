//! Acquisition service: serves start requests one run at a time.
//!
//! Callers queue runs with [`RemoteControl::start_acquisition`]; the service
//! runs them in FIFO order against a shared position list and exits once
//! every [`RemoteControl`] clone has been dropped.
//!
//! [`RemoteControl::start_acquisition`]: crate::remote::RemoteControl::start_acquisition
//! [`RemoteControl`]: crate::remote::RemoteControl

use crate::acquisition::orchestrator::AcquisitionOrchestrator;
use crate::acquisition::position::PositionList;
use crate::acquisition::state::RunReport;
use crate::error::{AcqError, AppResult};
use crate::remote::{Priority, StartRequest};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Owns an orchestrator and the start request queue.
pub struct AcquisitionService {
    orchestrator: AcquisitionOrchestrator,
    positions: PositionList,
    starts: mpsc::UnboundedReceiver<StartRequest>,
}

impl AcquisitionService {
    /// Take the start queue from the orchestrator's remote link.
    ///
    /// Fails if another service already took it.
    pub fn new(
        mut orchestrator: AcquisitionOrchestrator,
        positions: PositionList,
    ) -> AppResult<Self> {
        let starts = orchestrator.link_mut().take_start_requests().ok_or_else(|| {
            AcqError::Configuration("start requests are already being served".into())
        })?;
        orchestrator.plan(&positions);
        Ok(Self {
            orchestrator,
            positions,
            starts,
        })
    }

    /// Orchestrator driven by this service.
    pub fn orchestrator(&self) -> &AcquisitionOrchestrator {
        &self.orchestrator
    }

    /// Replace the position list used by later runs.
    pub fn set_positions(&mut self, positions: PositionList) {
        self.orchestrator.plan(&positions);
        self.positions = positions;
    }

    /// Serve the next start request.
    ///
    /// Returns `None` when every caller is gone. A run that could not start
    /// is reported to the caller and yields `Some(Err(..))`.
    pub async fn next_run(&mut self) -> Option<AppResult<RunReport>> {
        let request = self.starts.recv().await?;
        info!(output_dir = %request.output_dir.display(), "Start request received");
        let result = self
            .orchestrator
            .run(&self.positions, &request.output_dir)
            .await;
        if let Err(err) = &result {
            error!(error = %err, "Acquisition could not start");
            self.orchestrator
                .link()
                .notify(Priority::High, format!("Acquisition could not start: {err}"));
        }
        Some(result)
    }

    /// Serve start requests until every caller is gone; returns the reports
    /// of the runs that started.
    pub async fn serve(mut self) -> Vec<RunReport> {
        let mut reports = Vec::new();
        while let Some(result) = self.next_run().await {
            if let Ok(report) = result {
                reports.push(report);
            }
        }
        info!(runs = reports.len(), "Acquisition service stopped");
        reports
    }
}
