//! Hardware autofocus settling and software (through-focus) autofocus.
//!
//! Failing to settle quickly is never an error: the loop gives up after a
//! bounded number of polls and the caller proceeds. Software autofocus
//! either returns a fitted best-focus offset or an
//! [`AcqError::AutofocusConvergence`] the caller absorbs.

use crate::acquisition::channels::ChannelPlan;
use crate::config::{AutofocusConfig, SoftwareAutofocusConfig};
use crate::data::frame::Frame;
use crate::error::{AcqError, AppResult, HardwareContext};
use crate::hardware::Microscope;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Outcome of a successful software autofocus.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusResult {
    /// Fitted best-focus offset that was applied
    pub best_offset: f64,
    /// Samples that survived filtering
    pub samples_used: usize,
}

/// Parameters of `base + amp * exp(-((x - center) / width)^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    /// Peak height above the base
    pub amp: f64,
    /// Base level
    pub base: f64,
    /// Peak position
    pub center: f64,
    /// Width
    pub width: f64,
}

impl GaussianFit {
    fn from_params(p: [f64; 4]) -> Self {
        Self {
            amp: p[0],
            base: p[1],
            center: p[2],
            width: p[3],
        }
    }

    /// Model value at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.center) / self.width;
        self.base + self.amp * (-(u * u)).exp()
    }
}

/// Runs hardware settle loops and the software autofocus routine.
#[derive(Debug, Clone)]
pub struct AutofocusController {
    hardware: AutofocusConfig,
    software: SoftwareAutofocusConfig,
}

impl AutofocusController {
    /// Create a controller from the autofocus settings
    pub fn new(hardware: AutofocusConfig, software: SoftwareAutofocusConfig) -> Self {
        Self { hardware, software }
    }

    /// Software autofocus settings
    pub fn software_config(&self) -> &SoftwareAutofocusConfig {
        &self.software
    }

    /// Wait for the hardware autofocus to finish converging after a move.
    ///
    /// Returns `Ok(false)` when a pass ran out of polls; that is logged and
    /// otherwise ignored. Only device errors are returned as `Err`.
    pub async fn settle_hardware(&self, scope: &dyn Microscope) -> AppResult<bool> {
        let mut settled = self.settle_pass(scope, self.hardware.settle_wait).await?;
        if let Some(second_wait) = self.hardware.second_wait {
            settled = self.settle_pass(scope, second_wait).await? && settled;
        }
        Ok(settled)
    }

    async fn settle_pass(&self, scope: &dyn Microscope, wait: Duration) -> AppResult<bool> {
        sleep(wait).await;
        for poll in 0..self.hardware.max_polls {
            let done = scope.is_hardware_autofocus_done().await.hw("is_hardware_autofocus_done")?;
            if done {
                debug!(polls = poll + 1, "Hardware autofocus settled");
                return Ok(true);
            }
            sleep(self.hardware.poll_interval).await;
        }
        warn!(
            max_polls = self.hardware.max_polls,
            "Hardware autofocus did not settle, proceeding anyway"
        );
        Ok(false)
    }

    /// Capture a through-focus stack around the current focus, fit the
    /// sharpness curve and move focus to the fitted peak.
    ///
    /// On a convergence failure focus is returned to where it started and
    /// the hardware autofocus is switched back on.
    pub async fn software_autofocus(
        &self,
        scope: &dyn Microscope,
        channels: &ChannelPlan,
        planes: usize,
    ) -> AppResult<FocusResult> {
        let has_af = scope.has_hardware_autofocus();
        let channel = self.map_channel(channels);

        if has_af {
            scope
                .set_hardware_autofocus_state(false, false)
                .await
                .hw("set_hardware_autofocus_state")?;
        }
        scope.set_exposure(self.software.exposure_ms).await.hw("set_exposure")?;
        if let Some(channel) = &channel {
            scope.set_channel(channel).await.hw("set_channel")?;
        }

        let current_z = scope.get_z().await.hw("get_z")?;
        let furthest = self.software.step_size * (planes.saturating_sub(1)) as f64 / 2.0;

        let mut offsets = Vec::with_capacity(planes);
        let mut scores = Vec::with_capacity(planes);
        for i in 0..planes {
            let z = current_z - furthest + i as f64 * self.software.step_size;
            scope.set_z(z).await.hw("set_z")?;
            let image = scope.snap_image().await.hw("snap_image")?;
            let offset = if has_af {
                sleep(self.software.offset_settle).await;
                scope.get_autofocus_offset().await.hw("get_autofocus_offset")?
            } else {
                z
            };
            offsets.push(offset);
            scores.push(sharpness(&image));
        }
        debug!(?offsets, ?scores, "Through-focus stack captured");

        let fitted = select_samples(&offsets, &normalize_scores(&scores), has_af)
            .and_then(|(x, y)| fit_gaussian(&x, &y).map(|fit| (fit, x.len())));

        let result = match fitted {
            Ok((fit, samples_used)) => {
                info!(best_offset = fit.center, samples_used, "Software autofocus converged");
                self.apply_offset(scope, fit.center).await?;
                Ok(FocusResult {
                    best_offset: fit.center,
                    samples_used,
                })
            }
            Err(err) => {
                warn!(error = %err, "Software autofocus failed, keeping previous focus");
                scope.set_z(current_z).await.hw("set_z")?;
                Err(err)
            }
        };

        if has_af {
            scope
                .set_hardware_autofocus_state(true, false)
                .await
                .hw("set_hardware_autofocus_state")?;
        }
        if let Some(setting) = channel.as_deref().and_then(|id| channels.channel(id)) {
            scope.set_exposure(setting.exposure_ms).await.hw("set_exposure")?;
        }

        result
    }

    async fn apply_offset(&self, scope: &dyn Microscope, offset: f64) -> AppResult<()> {
        if scope.has_hardware_autofocus() {
            scope.set_autofocus_offset(offset).await.hw("set_autofocus_offset")?;
            sleep(self.software.offset_settle).await;
        } else {
            scope.set_z(offset).await.hw("set_z")?;
        }
        Ok(())
    }

    /// Channel the focus stack is imaged in.
    fn map_channel(&self, channels: &ChannelPlan) -> Option<String> {
        if !self.software.map_channel.is_empty() {
            return Some(self.software.map_channel.clone());
        }
        if channels.channel(&channels.focus_score_channel).is_some() {
            return Some(channels.focus_score_channel.clone());
        }
        channels.used().next().map(|c| c.id.clone())
    }
}

/// Edge energy of an image: mean squared Laplacian.
pub fn sharpness(image: &Frame) -> f64 {
    let lap = image.laplacian();
    if lap.is_empty() {
        return 0.0;
    }
    lap.mapv(|v| v * v).mean().unwrap_or(0.0)
}

/// Center scores on their median and scale them to a unit peak deviation.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let med = median(scores);
    let scale = scores
        .iter()
        .map(|s| (s - med).abs())
        .fold(0.0_f64, f64::max);
    if scale > 0.0 {
        scores.iter().map(|s| (s - med) / scale).collect()
    } else {
        vec![0.0; scores.len()]
    }
}

/// Drop samples whose offset does not increase towards the next one.
///
/// With `drop_zero` a zero offset is dropped too: that is what hardware
/// autofocus devices report when they have no measurement. Plain z positions
/// must be passed with `drop_zero` off, since z = 0 is a real plane.
pub fn select_samples(
    offsets: &[f64],
    scores: &[f64],
    drop_zero: bool,
) -> AppResult<(Vec<f64>, Vec<f64>)> {
    let mut x = Vec::with_capacity(offsets.len());
    let mut y = Vec::with_capacity(offsets.len());
    for (i, (&offset, &score)) in offsets.iter().zip(scores).enumerate() {
        let rejected = offsets
            .get(i + 1)
            .is_some_and(|&next| offset >= next || (drop_zero && offset == 0.0));
        if !rejected {
            x.push(offset);
            y.push(score);
        }
    }
    if x.len() < 3 {
        return Err(AcqError::AutofocusConvergence(format!(
            "only {} valid samples after filtering",
            x.len()
        )));
    }
    Ok((x, y))
}

const MAX_ITERATIONS: usize = 200;
const TOLERANCE: f64 = 1e-12;

/// Least-squares Gaussian fit (Levenberg-Marquardt).
pub fn fit_gaussian(x: &[f64], y: &[f64]) -> AppResult<GaussianFit> {
    if x.len() != y.len() || x.len() < 3 {
        return Err(AcqError::AutofocusConvergence(
            "not enough samples to fit".into(),
        ));
    }

    let (lo, hi) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let peak = y
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i);
    let x_span = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        - x.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(hi > lo) || !(x_span > 0.0) {
        return Err(AcqError::AutofocusConvergence(
            "score curve is flat".into(),
        ));
    }

    let mut p = [hi - lo, lo, x[peak], x_span / 2.0];
    let mut cost = sum_squares(x, y, p);
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(x, y, p);
        let mut a = jtj;
        for (k, row) in a.iter_mut().enumerate() {
            row[k] += lambda * jtj[k][k].max(1e-12);
        }
        let Some(delta) = solve4(a, jtr) else {
            lambda *= 10.0;
            continue;
        };

        let trial = [
            p[0] + delta[0],
            p[1] + delta[1],
            p[2] + delta[2],
            p[3] + delta[3],
        ];
        let trial_cost = sum_squares(x, y, trial);
        if trial_cost.is_finite() && trial_cost < cost {
            let improvement = cost - trial_cost;
            p = trial;
            cost = trial_cost;
            lambda = (lambda / 10.0).max(1e-12);
            if improvement <= TOLERANCE * (1.0 + cost) {
                return finish(p);
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                // No step reduces the cost any more: at a minimum.
                return finish(p);
            }
        }
    }

    Err(AcqError::AutofocusConvergence(format!(
        "fit did not converge in {MAX_ITERATIONS} iterations"
    )))
}

fn finish(p: [f64; 4]) -> AppResult<GaussianFit> {
    let fit = GaussianFit::from_params(p);
    if !p.iter().all(|v| v.is_finite()) || fit.width == 0.0 {
        return Err(AcqError::AutofocusConvergence(
            "fit produced non-finite parameters".into(),
        ));
    }
    if fit.amp <= 0.0 {
        return Err(AcqError::AutofocusConvergence(
            "fitted curve has no peak".into(),
        ));
    }
    Ok(fit)
}

fn sum_squares(x: &[f64], y: &[f64], p: [f64; 4]) -> f64 {
    let fit = GaussianFit::from_params(p);
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| (yi - fit.eval(xi)).powi(2))
        .sum()
}

/// `J^T J` and `J^T r` for the residuals `r = y - f(x)`.
fn normal_equations(x: &[f64], y: &[f64], p: [f64; 4]) -> ([[f64; 4]; 4], [f64; 4]) {
    let [amp, base, center, width] = p;
    let mut jtj = [[0.0; 4]; 4];
    let mut jtr = [0.0; 4];
    for (&xi, &yi) in x.iter().zip(y) {
        let u = (xi - center) / width;
        let e = (-(u * u)).exp();
        let r = yi - (base + amp * e);
        let j = [e, 1.0, amp * e * 2.0 * u / width, amp * e * 2.0 * u * u / width];
        for a in 0..4 {
            jtr[a] += j[a] * r;
            for b in 0..4 {
                jtj[a][b] += j[a] * j[b];
            }
        }
    }
    (jtj, jtr)
}

/// Gaussian elimination with partial pivoting.
fn solve4(mut a: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..4 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut out = [0.0; 4];
    for row in (0..4).rev() {
        let tail: f64 = (row + 1..4).map(|k| a[row][k] * out[k]).sum();
        out[row] = (b[row] - tail) / a[row][row];
    }
    out.iter().all(|v| v.is_finite()).then_some(out)
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::channels::ChannelSetting;
    use crate::hardware::capabilities::{FocusDrive, HardwareAutofocus};
    use crate::hardware::{MockCall, MockMicroscope, MockSettings};

    fn fast_hardware() -> AutofocusConfig {
        AutofocusConfig {
            settle_wait: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            max_polls: 5,
            second_wait: None,
            toggle_during_capture: false,
        }
    }

    fn fast_software() -> SoftwareAutofocusConfig {
        SoftwareAutofocusConfig {
            step_size: 2.0,
            acquisition_planes: 5,
            interactive_planes: 9,
            exposure_ms: 5.0,
            map_channel: String::new(),
            offset_settle: Duration::from_millis(1),
        }
    }

    fn plan() -> ChannelPlan {
        ChannelPlan::new(vec![ChannelSetting::new("DAPI", "DAPI_1", 40.0)])
    }

    #[test]
    fn fits_synthetic_peak() {
        let truth = GaussianFit {
            amp: 3.0,
            base: 0.5,
            center: 1.3,
            width: 2.5,
        };
        let x: Vec<f64> = (-4..=4).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|&v| truth.eval(v)).collect();
        let fit = fit_gaussian(&x, &y).unwrap();
        assert!((fit.center - 1.3).abs() < 1e-3, "center {}", fit.center);
    }

    #[test]
    fn fit_of_flat_curve_fails() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0; 4];
        assert!(matches!(
            fit_gaussian(&x, &y),
            Err(AcqError::AutofocusConvergence(_))
        ));
    }

    #[test]
    fn filter_drops_non_increasing_and_zero_offsets() {
        let offsets = [1.0, 3.0, 2.0, 0.0, 5.0, 6.0];
        let scores = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let (x, y) = select_samples(&offsets, &scores, true).unwrap();
        assert_eq!(x, vec![1.0, 5.0, 6.0]);
        assert_eq!(y, vec![0.1, 0.5, 0.6]);
    }

    #[test]
    fn zero_is_kept_for_plain_z_positions() {
        let offsets = [-2.0, 0.0, 2.0];
        let scores = [0.1, 0.9, 0.2];
        assert!(select_samples(&offsets, &scores, true).is_err());
        let (x, _) = select_samples(&offsets, &scores, false).unwrap();
        assert_eq!(x, vec![-2.0, 0.0, 2.0]);
    }

    #[test]
    fn too_few_samples_is_convergence_failure() {
        let offsets = [3.0, 2.0, 1.0, 4.0];
        let err = select_samples(&offsets, &[0.0; 4], false).unwrap_err();
        assert!(matches!(err, AcqError::AutofocusConvergence(_)));
        assert!(!err.is_run_aborting());
    }

    #[test]
    fn normalized_scores_peak_at_unit_deviation() {
        // Median 2, largest deviation 3.
        let scores = normalize_scores(&[1.0, 2.0, 5.0]);
        assert_eq!(scores, vec![-1.0 / 3.0, 0.0, 1.0]);
        assert_eq!(scores.iter().fold(0.0_f64, |m, s| m.max(s.abs())), 1.0);
        assert_eq!(normalize_scores(&[2.0, 2.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn software_autofocus_finds_peak_within_one_step() {
        let scope = MockMicroscope::new(MockSettings {
            best_z: 1.3,
            ..MockSettings::default()
        });
        let controller = AutofocusController::new(fast_hardware(), fast_software());

        let result = controller
            .software_autofocus(&scope, &plan(), 5)
            .await
            .unwrap();

        assert!((result.best_offset - 1.3).abs() <= 2.0);
        assert!(scope
            .calls()
            .await
            .contains(&MockCall::SetAutofocusOffset(result.best_offset)));
        assert!(scope.get_hardware_autofocus_state().await.unwrap());
    }

    #[tokio::test]
    async fn software_autofocus_without_hardware_device_moves_z() {
        let scope = MockMicroscope::new(MockSettings {
            hardware_autofocus: false,
            best_z: -0.7,
            ..MockSettings::default()
        });
        let controller = AutofocusController::new(fast_hardware(), fast_software());

        let result = controller
            .software_autofocus(&scope, &plan(), 5)
            .await
            .unwrap();

        assert!((scope.get_z().await.unwrap() - result.best_offset).abs() < 1e-12);
        assert!((result.best_offset + 0.7).abs() <= 2.0);
    }

    #[tokio::test]
    async fn three_plane_stack_centred_on_zero_converges_without_hardware_device() {
        let scope = MockMicroscope::new(MockSettings {
            hardware_autofocus: false,
            best_z: 0.5,
            ..MockSettings::default()
        });
        let controller = AutofocusController::new(fast_hardware(), fast_software());

        let result = controller
            .software_autofocus(&scope, &plan(), 3)
            .await
            .unwrap();

        assert_eq!(result.samples_used, 3);
        assert!((result.best_offset - 0.5).abs() <= 2.0);
        assert!((scope.get_z().await.unwrap() - result.best_offset).abs() < 1e-12);
    }

    #[tokio::test]
    async fn failed_autofocus_restores_focus() {
        // Far from best focus every plane is equally blurred.
        let scope = MockMicroscope::new(MockSettings {
            best_z: 500.0,
            ..MockSettings::default()
        });
        scope.set_z(10.0).await.unwrap();
        let controller = AutofocusController::new(fast_hardware(), fast_software());

        let err = controller
            .software_autofocus(&scope, &plan(), 5)
            .await
            .unwrap_err();

        assert!(matches!(err, AcqError::AutofocusConvergence(_)));
        assert_eq!(scope.get_z().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn settle_gives_up_after_max_polls() {
        let scope = MockMicroscope::new(MockSettings {
            autofocus_done_after_polls: 1000,
            ..MockSettings::default()
        });
        let controller = AutofocusController::new(fast_hardware(), fast_software());
        assert!(!controller.settle_hardware(&scope).await.unwrap());
    }

    #[tokio::test]
    async fn settle_with_second_pass() {
        let scope = MockMicroscope::new(MockSettings {
            autofocus_done_after_polls: 2,
            ..MockSettings::default()
        });
        let mut hardware = fast_hardware();
        hardware.second_wait = Some(Duration::from_millis(1));
        let controller = AutofocusController::new(hardware, fast_software());
        assert!(controller.settle_hardware(&scope).await.unwrap());
    }
}
