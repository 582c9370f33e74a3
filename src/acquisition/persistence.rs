//! Persistence worker: writes captures to disk off the hardware loop.
//!
//! The worker owns a [`CaptureStore`] and runs on its own named OS thread.
//! It consumes [`QueueItem`]s in FIFO order until it receives
//! [`QueueItem::Stop`]. A failed write is reported on the fault channel and
//! the loop moves on to the next token; after `max_consecutive_failures`
//! failures in a row the worker reports a fatal fault and stops consuming.
//!
//! # Output layout
//!
//! ```text
//! <outdir>/session_metadata.txt
//! <outdir>/<prot>/<prot>_S0000_F0000_Z00.tif
//! <outdir>/<prot>/<prot>_S0000_F0000_Z00_metadata.txt
//! <outdir>/<prot>/<prot>_S0000_F0000_Z00_focus.csv      (focus channel only)
//! <outdir>/<prot>/<prot>_S0000_F0000_Z00_afc.json       (when an AFC image was taken)
//! ```

use crate::acquisition::channels::ChannelPlan;
use crate::acquisition::token::{CaptureKey, CaptureToken, FaultKind, FaultMessage, QueueItem};
use crate::config::{MosaicConfig, StorageConfig};
use crate::data::frame::{Frame, Thumbnail};
use crate::error::{AcqError, AppResult};
use image::codecs::tiff::TiffEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// File stem shared by every artifact of one capture.
pub fn capture_stem(protocol_name: &str, section: usize, frame: usize, z_index: usize) -> String {
    format!("{protocol_name}_S{section:04}_F{frame:04}_Z{z_index:02}")
}

fn artifact_path(token: &CaptureToken, suffix: &str) -> PathBuf {
    let stem = capture_stem(&token.protocol_name, token.section, token.frame, token.z_index);
    token.output_dir.join(format!("{stem}{suffix}"))
}

/// Path of the image file for a token.
pub fn image_path(token: &CaptureToken) -> PathBuf {
    artifact_path(token, ".tif")
}

/// Destination for persisted captures.
///
/// Runs on the worker thread, so implementations may block.
pub trait CaptureStore: Send + 'static {
    /// Write the image.
    fn write_image(&mut self, token: &CaptureToken) -> AppResult<()>;

    /// Write the per-capture text metadata.
    fn write_metadata(&mut self, token: &CaptureToken) -> AppResult<()>;

    /// Compute and write the focus score record.
    fn write_focus_score(&mut self, token: &CaptureToken) -> AppResult<()>;

    /// Write the adaptive focus control record.
    fn write_afc(&mut self, token: &CaptureToken, afc_image: &Frame) -> AppResult<()>;

    /// Called once when the stop sentinel arrives.
    fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

impl<S: CaptureStore + ?Sized> CaptureStore for Box<S> {
    fn write_image(&mut self, token: &CaptureToken) -> AppResult<()> {
        (**self).write_image(token)
    }

    fn write_metadata(&mut self, token: &CaptureToken) -> AppResult<()> {
        (**self).write_metadata(token)
    }

    fn write_focus_score(&mut self, token: &CaptureToken) -> AppResult<()> {
        (**self).write_focus_score(token)
    }

    fn write_afc(&mut self, token: &CaptureToken, afc_image: &Frame) -> AppResult<()> {
        (**self).write_afc(token, afc_image)
    }

    fn shutdown(&mut self) -> AppResult<()> {
        (**self).shutdown()
    }
}

/// Writes TIFF images and text/CSV/JSON side files.
#[derive(Debug, Clone)]
pub struct DiskStore {
    pixel_size: f64,
}

impl DiskStore {
    /// Create a store; `pixel_size` is written as the metadata scale.
    pub fn new(pixel_size: f64) -> Self {
        Self { pixel_size }
    }
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> AcqError {
    AcqError::Persistence(format!("{}: {err}", path.display()))
}

#[derive(Debug, Serialize)]
struct FocusScoreRecord<'a> {
    score_mean: f64,
    score_median: f64,
    score_std: f64,
    ch: &'a str,
    xpos: f64,
    ypos: f64,
    slice_index: usize,
    frame_index: usize,
    prot_name: &'a str,
}

#[derive(Debug, Serialize)]
struct AfcRecord {
    afc_image: Vec<Vec<u16>>,
    xpos: f64,
    ypos: f64,
    slice_index: usize,
    frame_index: usize,
}

/// Mean, median and standard deviation of the absolute Laplacian.
pub fn focus_score(image: &Frame) -> (f64, f64, f64) {
    let mut values: Vec<f64> = image.laplacian().iter().map(|v| v.abs()).collect();
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    let median = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    };
    (mean, median, std)
}

impl CaptureStore for DiskStore {
    fn write_image(&mut self, token: &CaptureToken) -> AppResult<()> {
        let path = image_path(token);
        let file = File::create(&path).map_err(|e| persistence_error(&path, e))?;
        let writer = BufWriter::new(file);

        let image = &token.image;
        TiffEncoder::new(writer)
            .write_image(
                &image.to_ne_bytes(),
                image.width,
                image.height,
                ExtendedColorType::L16,
            )
            .map_err(|e| persistence_error(&path, e))?;

        debug!(
            path = ?path,
            dimensions = format!("{}x{}", image.width, image.height),
            "Wrote 16-bit TIFF"
        );
        Ok(())
    }

    fn write_metadata(&mut self, token: &CaptureToken) -> AppResult<()> {
        let path = artifact_path(token, "_metadata.txt");
        let text = format!(
            "Channel\tWidth\tHeight\tMosaicX\tMosaicY\tScaleX\tScaleY\tExposureTime\n\
             {}\t{}\t{}\t1\t1\t{:.6}\t{:.6}\t{:.6}\n\
             XPositions\tYPositions\tFocusPositions\n\
             {}\t{}\t{}\n",
            token.channel,
            token.image.width,
            token.image.height,
            self.pixel_size,
            self.pixel_size,
            token.exposure_ms,
            token.x,
            token.y,
            token.z,
        );
        fs::write(&path, text).map_err(|e| persistence_error(&path, e))
    }

    fn write_focus_score(&mut self, token: &CaptureToken) -> AppResult<()> {
        let path = artifact_path(token, "_focus.csv");
        let (score_mean, score_median, score_std) = focus_score(&token.image);
        let mut writer = csv::Writer::from_path(&path).map_err(|e| persistence_error(&path, e))?;
        writer
            .serialize(FocusScoreRecord {
                score_mean,
                score_median,
                score_std,
                ch: &token.channel,
                xpos: token.x,
                ypos: token.y,
                slice_index: token.section,
                frame_index: token.frame,
                prot_name: &token.protocol_name,
            })
            .map_err(|e| persistence_error(&path, e))?;
        writer.flush().map_err(|e| persistence_error(&path, e))
    }

    fn write_afc(&mut self, token: &CaptureToken, afc_image: &Frame) -> AppResult<()> {
        let path = artifact_path(token, "_afc.json");
        let rows = afc_image
            .pixels()
            .chunks(afc_image.width.max(1) as usize)
            .map(<[u16]>::to_vec)
            .collect();
        let record = AfcRecord {
            afc_image: rows,
            xpos: token.x,
            ypos: token.y,
            slice_index: token.section,
            frame_index: token.frame,
        };
        let file = File::create(&path).map_err(|e| persistence_error(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &record).map_err(|e| persistence_error(&path, e))?;
        writer.flush().map_err(|e| persistence_error(&path, e))
    }
}

/// Session-level facts written once at run start.
#[derive(Debug, Clone)]
pub struct SessionInfo<'a> {
    /// Sensor size (width, height) at acquisition binning
    pub sensor: (u32, u32),
    /// Pixel size (µm)
    pub pixel_size: f64,
    /// Channel plan
    pub channels: &'a ChannelPlan,
    /// Mosaic layout
    pub mosaic: &'a MosaicConfig,
    /// Experiment label
    pub meta_experiment_name: &'a str,
    /// Microscope name
    pub microscope_name: &'a str,
}

/// Write `<outdir>/session_metadata.txt`.
pub fn write_session_metadata(outdir: &Path, info: &SessionInfo<'_>) -> AppResult<PathBuf> {
    let path = outdir.join("session_metadata.txt");
    let mut text = format!(
        "Width\tHeight\t#chan\tMosaicX\tMosaicY\tScaleX\tScaleY\n\
         {}\t{}\t{}\t{}\t{}\t{:.6}\t{:.6}\n\
         Channel\tExposure Times (msec)\tRLPosition\n",
        info.sensor.0,
        info.sensor.1,
        info.channels.used_count(),
        info.mosaic.mx,
        info.mosaic.my,
        info.pixel_size,
        info.pixel_size,
    );
    for channel in info.channels.used() {
        text.push_str(&format!(
            "{}\t{:.6}\t{}\n",
            channel.protocol_name, channel.exposure_ms, channel.id
        ));
    }
    text.push_str(&format!(
        "Meta Experiment name:\t{}\nImaged on:\t{}\n",
        info.meta_experiment_name, info.microscope_name
    ));
    fs::write(&path, text)?;
    Ok(path)
}

/// Create `<outdir>/<prot>` for every used channel; returns the directories.
pub fn prepare_output_dirs(outdir: &Path, channels: &ChannelPlan) -> AppResult<Vec<PathBuf>> {
    channels
        .used()
        .map(|channel| {
            let dir = outdir.join(&channel.protocol_name);
            fs::create_dir_all(&dir)?;
            Ok(dir)
        })
        .collect()
}

/// Preview published after an image has been written.
#[derive(Debug, Clone)]
pub struct Preview {
    /// Capture the preview belongs to
    pub key: CaptureKey,
    /// Downsampled image
    pub thumbnail: Arc<Thumbnail>,
    /// The capture was the last of its section
    pub terminal: bool,
}

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Stop sentinel received
    Sentinel,
    /// Too many consecutive failures
    Escalated,
    /// Every sender was dropped without a sentinel
    Disconnected,
}

/// Counters returned when the worker exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Captures fully written
    pub written: usize,
    /// Captures with a failed step
    pub failed: usize,
    /// Why the loop ended
    pub stopped_by: StopCause,
}

/// Consumer side of the capture queue.
pub struct PersistenceWorker<S: CaptureStore> {
    store: S,
    faults: mpsc::UnboundedSender<FaultMessage>,
    previews: Option<broadcast::Sender<Preview>>,
    thumbnail_bin: u32,
    max_consecutive_failures: u32,
}

impl<S: CaptureStore> PersistenceWorker<S> {
    /// Create a worker reporting faults on `faults`.
    pub fn new(
        store: S,
        config: &StorageConfig,
        faults: mpsc::UnboundedSender<FaultMessage>,
    ) -> Self {
        Self {
            store,
            faults,
            previews: None,
            thumbnail_bin: config.thumbnail_bin,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }

    /// Publish a thumbnail of every written image.
    pub fn with_previews(mut self, previews: broadcast::Sender<Preview>) -> Self {
        self.previews = Some(previews);
        self
    }

    /// Blocking consumer loop.
    pub fn run(mut self, mut queue: mpsc::UnboundedReceiver<QueueItem>) -> WorkerSummary {
        let mut written = 0;
        let mut failed = 0;
        let mut consecutive = 0;

        let stopped_by = loop {
            let token = match queue.blocking_recv() {
                Some(QueueItem::Capture(token)) => token,
                Some(QueueItem::Stop) => {
                    if let Err(e) = self.store.shutdown() {
                        warn!(error = %e, "Capture store shutdown failed");
                    }
                    break StopCause::Sentinel;
                }
                None => break StopCause::Disconnected,
            };

            match self.persist(&token) {
                Ok(()) => {
                    written += 1;
                    consecutive = 0;
                    if token.is_terminal {
                        info!(section = token.section, "Last capture of section written");
                    }
                }
                Err((kind, err)) => {
                    failed += 1;
                    consecutive += 1;
                    let mut fault = FaultMessage::error(kind, err.to_string(), Some(token.key()));
                    error!(fault = %fault, consecutive, "Persistence fault");

                    let escalate = consecutive >= self.max_consecutive_failures;
                    if escalate {
                        fault = fault.fatal();
                    }
                    // The orchestrator may already have stopped listening.
                    let _ = self.faults.send(fault);
                    if escalate {
                        error!(
                            failures = consecutive,
                            "Persistence worker giving up after repeated failures"
                        );
                        break StopCause::Escalated;
                    }
                }
            }
        };

        info!(written, failed, ?stopped_by, "Persistence worker stopped");
        WorkerSummary {
            written,
            failed,
            stopped_by,
        }
    }

    fn persist(&mut self, token: &CaptureToken) -> Result<(), (FaultKind, AcqError)> {
        self.store
            .write_image(token)
            .map_err(|e| (FaultKind::ImageWrite, e))?;
        self.publish(token);
        self.store
            .write_metadata(token)
            .map_err(|e| (FaultKind::Metadata, e))?;
        if token.calc_focus {
            self.store
                .write_focus_score(token)
                .map_err(|e| (FaultKind::FocusScore, e))?;
        }
        if let Some(afc_image) = &token.afc_image {
            self.store
                .write_afc(token, afc_image)
                .map_err(|e| (FaultKind::AfcRecord, e))?;
        }
        Ok(())
    }

    fn publish(&self, token: &CaptureToken) {
        let Some(previews) = &self.previews else {
            return;
        };
        let preview = Preview {
            key: token.key(),
            thumbnail: Arc::new(token.image.thumbnail(self.thumbnail_bin)),
            terminal: token.is_terminal,
        };
        // No subscribers is fine.
        let _ = previews.send(preview);
    }

    /// Start the worker on its own thread.
    pub fn spawn(self) -> AppResult<PersistenceHandle> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("persistence".into())
            .spawn(move || {
                let summary = self.run(queue_rx);
                let _ = done_tx.send(summary);
            })?;

        Ok(PersistenceHandle {
            queue: queue_tx,
            done: done_rx,
            submitted: 0,
        })
    }
}

/// Producer side of a running worker.
pub struct PersistenceHandle {
    queue: mpsc::UnboundedSender<QueueItem>,
    done: oneshot::Receiver<WorkerSummary>,
    submitted: usize,
}

impl PersistenceHandle {
    /// Enqueue a capture.
    ///
    /// Fails only when the worker has already exited.
    pub fn submit(&mut self, token: CaptureToken) -> AppResult<()> {
        self.queue
            .send(QueueItem::capture(token))
            .map_err(|_| AcqError::Persistence("persistence worker has stopped".into()))?;
        self.submitted += 1;
        Ok(())
    }

    /// Tokens accepted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Enqueue the stop sentinel and wait for the worker to drain and exit.
    pub async fn finish(self) -> AppResult<WorkerSummary> {
        if self.queue.send(QueueItem::Stop).is_err() {
            debug!("Persistence worker already stopped");
        }
        drop(self.queue);
        self.done
            .await
            .map_err(|_| AcqError::WorkerJoin("persistence thread panicked".into()))
    }
}
