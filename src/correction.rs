// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, CanonicalErrorCode, aborted_error,
                      failed_precondition_error};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::astro_util::{pointing_deltas_arcsec, Coordinate};
use crate::camera::CameraUnit;
use crate::hardware::ExposureSettings;
use crate::mount::MountUnit;
use crate::poller::interruptible_sleep;
use crate::solver_client::{PlateSolution, SharedImage, SolveImage,
                           SolveOutcome, SolveParams, SolverClient,
                           DEFAULT_SHM_KEY};

/// Default plate scale of the imaging train at binning 1, arcsec/pixel.
pub const PIXEL_SCALE_AT_BIN1: f64 = 0.2612;

#[derive(Copy, Clone, Debug)]
pub struct SolvingTolerance {
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

impl SolvingTolerance {
    pub fn new(ra_arcsec: f64, dec_arcsec: f64) -> Self {
        SolvingTolerance { ra_arcsec, dec_arcsec }
    }
}

/// One applied (or final) correction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectionRecord {
    /// RFC 3339 UTC.
    pub time: String,
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

impl CorrectionRecord {
    fn now(ra_arcsec: f64, dec_arcsec: f64) -> Self {
        CorrectionRecord {
            time: Utc::now().to_rfc3339(),
            ra_arcsec,
            dec_arcsec,
        }
    }
}

/// Append-only record of a correction phase, persisted as corrections.json
/// in the phase's folder. `sequence` holds the corrections that were sent
/// to the mount; `last_delta` holds the final measured delta that satisfied
/// the tolerance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectionHistory {
    pub phase: String,
    pub target_ra: f64,
    pub target_dec: f64,
    pub tolerance_ra: f64,
    pub tolerance_dec: f64,
    pub last_delta: Option<CorrectionRecord>,
    pub sequence: Vec<CorrectionRecord>,
}

impl CorrectionHistory {
    pub fn new(phase: &str, target: &Coordinate, tolerance: &SolvingTolerance)
               -> Self {
        CorrectionHistory {
            phase: phase.to_string(),
            target_ra: target.ra,
            target_dec: target.dec,
            tolerance_ra: tolerance.ra_arcsec,
            tolerance_dec: tolerance.dec_arcsec,
            last_delta: None,
            sequence: Vec::new(),
        }
    }

    pub fn record(&mut self, ra_arcsec: f64, dec_arcsec: f64) {
        self.sequence.push(CorrectionRecord::now(ra_arcsec, dec_arcsec));
    }

    pub fn record_last(&mut self, ra_arcsec: f64, dec_arcsec: f64) {
        self.last_delta = Some(CorrectionRecord::now(ra_arcsec, dec_arcsec));
    }

    /// Writes corrections.json into `folder`, creating it if needed.
    pub fn save(&self, folder: &Path) -> Result<PathBuf, CanonicalError> {
        fs::create_dir_all(folder).map_err(|e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", folder, e)))?;
        let path = folder.join("corrections.json");
        let json = serde_json::to_string_pretty(self).map_err(
            |e| failed_precondition_error(
                &format!("Cannot encode corrections: {:?}", e)))?;
        fs::write(&path, json).map_err(|e| failed_precondition_error(
            &format!("Cannot write {:?}: {:?}", path, e)))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        let json = fs::read_to_string(path).map_err(
            |e| failed_precondition_error(
                &format!("Cannot read {:?}: {:?}", path, e)))?;
        serde_json::from_str(&json).map_err(|e| failed_precondition_error(
            &format!("Cannot parse {:?}: {:?}", path, e)))
    }
}

#[derive(Clone, Debug)]
pub struct CorrectionParams {
    /// Phase label recorded in the history, e.g. "sky", "spec", "guiding".
    pub phase: String,
    pub target: Coordinate,
    pub exposure: ExposureSettings,
    pub tolerance: SolvingTolerance,
    pub max_tries: u32,
    pub pixel_scale_at_bin1: f64,
    pub solve_timeout: Duration,
    pub solve_poll_period: Duration,

    /// Hold time after the mount stops reporting motion for an offset.
    pub mount_settle: Duration,
    pub slew_wait_grain: Duration,
    pub shm_key: String,

    /// Where to persist corrections.json. None skips persistence.
    pub output_folder: Option<PathBuf>,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        CorrectionParams {
            phase: "sky".to_string(),
            target: Coordinate::new(0.0, 0.0),
            exposure: ExposureSettings::new(Duration::from_secs(3), 1),
            tolerance: SolvingTolerance::new(1.0, 1.0),
            max_tries: 3,
            pixel_scale_at_bin1: PIXEL_SCALE_AT_BIN1,
            solve_timeout: Duration::from_secs(50),
            solve_poll_period: Duration::from_millis(250),
            mount_settle: Duration::from_secs(5),
            slew_wait_grain: Duration::from_millis(500),
            shm_key: DEFAULT_SHM_KEY.to_string(),
            output_folder: None,
        }
    }
}

/// Result of one solve_and_correct call.
#[derive(Debug)]
pub struct CorrectionOutcome {
    pub converged: bool,
    pub cancelled: bool,

    /// Set when the solver connection was lost; the remaining tries were
    /// abandoned.
    pub fatal: Option<CanonicalError>,
    pub tries_used: u32,

    /// One entry per failed try, for the caller's aggregated error report.
    pub failures: Vec<String>,
    pub history: CorrectionHistory,
    pub last_solution: Option<PlateSolution>,
}

impl CorrectionOutcome {
    /// Human-oriented one-line summary for the session report.
    pub fn summary(&self) -> String {
        if self.converged {
            format!("converged in {} tries", self.tries_used)
        } else if self.cancelled {
            "cancelled".to_string()
        } else if let Some(e) = &self.fatal {
            format!("solver connection lost: {}", e.message)
        } else {
            format!("no convergence after {} tries", self.tries_used)
        }
    }
}

// Errors that mean the solver channel itself is gone, as opposed to a
// solve that merely failed.
fn is_connection_error(e: &CanonicalError) -> bool {
    e.code == CanonicalErrorCode::Unavailable ||
        e.code == CanonicalErrorCode::FailedPrecondition
}

/// The closed-loop pointing corrector: expose, plate solve, compare the
/// solved center to the target, offset the mount, repeat until within
/// tolerance or out of tries.
pub struct CorrectionEngine {
    camera: Arc<CameraUnit>,
    mount: Arc<MountUnit>,
    solver: SolverClient,
    last_solution: Option<PlateSolution>,
}

impl CorrectionEngine {
    pub fn new(camera: Arc<CameraUnit>, mount: Arc<MountUnit>,
               solver_addr: &str) -> Self {
        CorrectionEngine {
            camera,
            mount,
            solver: SolverClient::new(solver_addr),
            last_solution: None,
        }
    }

    /// The most recent successful plate solution, from any phase.
    pub fn last_solution(&self) -> Option<&PlateSolution> {
        self.last_solution.as_ref()
    }

    pub fn solve_and_correct(&mut self, params: &CorrectionParams,
                             cancelled: &dyn Fn() -> bool)
                             -> CorrectionOutcome {
        let mut history =
            CorrectionHistory::new(&params.phase, &params.target,
                                   &params.tolerance);
        let mut converged = false;
        let mut was_cancelled = false;
        let mut fatal = None;
        let mut tries_used = 0;
        let mut failures = Vec::new();
        info!("{}: correcting towards {} (tolerance ra {:.1}\" dec {:.1}\")",
              params.phase, params.target,
              params.tolerance.ra_arcsec, params.tolerance.dec_arcsec);

        if let Err(e) = self.solver.connect() {
            warn!("{}: cannot reach solver: {:?}", params.phase, e);
            return self.finish(params, CorrectionOutcome {
                converged, cancelled: was_cancelled, fatal: Some(e),
                tries_used, failures, history,
                last_solution: self.last_solution.clone(),
            });
        }

        for try_index in 0..params.max_tries {
            if cancelled() {
                was_cancelled = true;
                break;
            }
            tries_used = try_index + 1;

            let frame = match self.camera.expose(&params.exposure, cancelled) {
                Ok(frame) => frame,
                Err(e) if e.code == CanonicalErrorCode::Aborted => {
                    was_cancelled = true;
                    break;
                }
                Err(e) => {
                    failures.push(format!(
                        "try {}: exposure failed: {}", try_index + 1, e.message));
                    continue;
                }
            };

            // Hand the pixels to the solver via shared memory. The segment
            // must outlive the solve.
            let mut segment = match SharedImage::create(
                &params.shm_key, frame.width, frame.height) {
                Ok(segment) => segment,
                Err(e) => {
                    failures.push(format!(
                        "try {}: shared image failed: {}",
                        try_index + 1, e.message));
                    continue;
                }
            };
            if let Err(e) = segment.write_frame(&frame) {
                failures.push(format!(
                    "try {}: shared image failed: {}", try_index + 1, e.message));
                continue;
            }

            let solve_params = SolveParams {
                arcsec_per_pixel:
                    params.pixel_scale_at_bin1 * frame.binning as f64,
                position_guess: Some(params.target),
                ..Default::default()
            };
            let image = SolveImage::Shm {
                key: segment.key().to_string(),
                width: segment.width(),
                height: segment.height(),
            };
            if let Err(e) = self.solver.begin_solve(&image, &solve_params) {
                if is_connection_error(&e) {
                    fatal = Some(e);
                    break;
                }
                failures.push(format!(
                    "try {}: begin_solve failed: {}", try_index + 1, e.message));
                continue;
            }

            let solve = match self.poll_until_terminal(params, cancelled) {
                Ok(solve) => solve,
                Err(e) if e.code == CanonicalErrorCode::Aborted => {
                    was_cancelled = true;
                    break;
                }
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };

            let solution = match solve.into_solution() {
                Ok(solution) => solution,
                Err(e) => {
                    info!("{}: try {}: {}", params.phase, try_index + 1, e.message);
                    failures.push(format!("try {}: {}", try_index + 1, e.message));
                    continue;
                }
            };
            self.last_solution = Some(solution.clone());

            let (delta_ra, delta_dec) =
                pointing_deltas_arcsec(&params.target, &solution.center());
            info!("{}: try {}: solved {} ({} stars, rms {:.2}\"), \
                   delta ra {:.2}\" dec {:.2}\"",
                  params.phase, try_index + 1, solution.center(),
                  solution.num_matched_stars, solution.match_rms_error_arcsec,
                  delta_ra, delta_dec);

            if delta_ra.abs() <= params.tolerance.ra_arcsec &&
                delta_dec.abs() <= params.tolerance.dec_arcsec {
                history.record_last(delta_ra, delta_dec);
                converged = true;
                break;
            }

            history.record(delta_ra, delta_dec);
            match self.mount.offset_and_settle(
                delta_ra, delta_dec, params.slew_wait_grain,
                params.mount_settle, cancelled) {
                Ok(()) => (),
                Err(e) if e.code == CanonicalErrorCode::Aborted => {
                    was_cancelled = true;
                    break;
                }
                Err(e) => {
                    failures.push(format!(
                        "try {}: mount offset failed: {}",
                        try_index + 1, e.message));
                }
            }
        }

        self.finish(params, CorrectionOutcome {
            converged, cancelled: was_cancelled, fatal, tries_used, failures,
            history, last_solution: self.last_solution.clone(),
        })
    }

    // Persists the history and logs the result.
    fn finish(&self, params: &CorrectionParams, outcome: CorrectionOutcome)
              -> CorrectionOutcome {
        if let Some(folder) = &params.output_folder {
            match outcome.history.save(folder) {
                Ok(path) => info!("{}: saved {:?}", params.phase, path),
                Err(e) => warn!("{}: could not persist corrections: {:?}",
                                params.phase, e),
            }
        }
        info!("{}: {}", params.phase, outcome.summary());
        outcome
    }

    // Polls the solver until a terminal outcome. Synthesizes an Error
    // outcome (with a message starting "timeout") after the configured
    // window, cancelling the solver's session first. Err(aborted) on
    // cancellation, other Err when the connection is lost.
    fn poll_until_terminal(&mut self, params: &CorrectionParams,
                           cancelled: &dyn Fn() -> bool)
                           -> Result<SolveOutcome, CanonicalError> {
        let start = Instant::now();
        loop {
            if cancelled() {
                let _ = self.solver.cancel_solve();
                return Err(aborted_error("Cancelled while waiting for solver"));
            }
            let status = self.solver.solve_status()?;
            if let Some(outcome) = status.outcome() {
                return Ok(outcome);
            }
            if start.elapsed() > params.solve_timeout {
                warn!("{}: solver did not finish within {:.0}s, cancelling",
                      params.phase, params.solve_timeout.as_secs_f64());
                let _ = self.solver.cancel_solve();
                return Ok(SolveOutcome::Error(format!(
                    "timeout after {:.0}s waiting for solver",
                    params.solve_timeout.as_secs_f64())));
            }
            if !interruptible_sleep(params.solve_poll_period, cancelled) {
                let _ = self.solver.cancel_solve();
                return Err(aborted_error("Cancelled while waiting for solver"));
            }
        }
    }
}

// mod tests.
