// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use canonical_error::{CanonicalError, CanonicalErrorCode, aborted_error,
                      failed_precondition_error};
use log::{error, info, warn};
use serde::Serialize;

use crate::astro_util::Coordinate;
use crate::camera::CameraUnit;
use crate::correction::{CorrectionEngine, CorrectionParams,
                        PIXEL_SCALE_AT_BIN1, SolvingTolerance};
use crate::guiding::{GuideParams, Guider};
use crate::hardware::ExposureSettings;
use crate::mount::MountUnit;
use crate::paths::PathMaker;
use crate::poller::interruptible_sleep;
use crate::solver_client::DEFAULT_SHM_KEY;
use crate::stage::StageUnit;

#[derive(Clone, Debug)]
pub struct AcquireParams {
    pub target: Coordinate,
    pub exposure: ExposureSettings,
    pub tolerance: SolvingTolerance,
    pub max_tries: u32,

    /// Stage position exposing the wide field camera path.
    pub stage_sky_position: f64,

    /// Stage position centering the spectrograph fiber.
    pub stage_spec_position: f64,

    pub motion_poll: Duration,

    /// Hold time after the stage and mount stop reporting motion; pointing
    /// reads "not slewing" slightly before it is mechanically settled.
    pub post_motion_settle: Duration,

    pub pixel_scale_at_bin1: f64,
    pub solve_timeout: Duration,
    pub solve_poll_period: Duration,
    pub mount_settle: Duration,
    pub slew_wait_grain: Duration,
    pub shm_key: String,

    /// Root of the on-disk session layout. None skips persistence.
    pub output_root: Option<PathBuf>,

    /// Guide session to hand off to once both solving phases converge.
    /// None ends the sequence after the "spec" phase.
    pub guide: Option<GuideParams>,
}

impl Default for AcquireParams {
    fn default() -> Self {
        AcquireParams {
            target: Coordinate::new(0.0, 0.0),
            exposure: ExposureSettings::new(Duration::from_secs(3), 1),
            tolerance: SolvingTolerance::new(1.0, 1.0),
            max_tries: 3,
            stage_sky_position: 0.0,
            stage_spec_position: 0.0,
            motion_poll: Duration::from_secs(1),
            post_motion_settle: Duration::from_secs(10),
            pixel_scale_at_bin1: PIXEL_SCALE_AT_BIN1,
            solve_timeout: Duration::from_secs(50),
            solve_poll_period: Duration::from_millis(250),
            mount_settle: Duration::from_secs(5),
            slew_wait_grain: Duration::from_millis(500),
            shm_key: DEFAULT_SHM_KEY.to_string(),
            output_root: None,
            guide: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AcquireOutcome {
    pub succeeded: bool,
    pub cancelled: bool,

    /// Phases that ran to completion, in order.
    pub phases_completed: Vec<String>,
    pub errors: Vec<String>,

    /// Session folder holding the per-phase corrections.
    pub folder: Option<PathBuf>,

    /// Whether a guide session was started as the final phase.
    pub guiding: bool,
}

struct AcquirerState {
    stop_request: bool,
    worker_thread: Option<thread::JoinHandle<()>>,
    acquiring: bool,
    last_outcome: Option<AcquireOutcome>,
}

/// Sequences target acquisition: position the stage and mount for the wide
/// field, converge the pointing by plate solving, re-position the stage to
/// the spectrograph fiber, converge again, then hand off to guiding. A
/// failed phase stops the sequence.
pub struct Acquirer {
    state: Arc<Mutex<AcquirerState>>,
    camera: Arc<CameraUnit>,
    mount: Arc<MountUnit>,
    stage: Arc<StageUnit>,
    engine: Arc<Mutex<CorrectionEngine>>,
    guider: Arc<Guider>,
}

impl Acquirer {
    pub fn new(camera: Arc<CameraUnit>, mount: Arc<MountUnit>,
               stage: Arc<StageUnit>, engine: Arc<Mutex<CorrectionEngine>>,
               guider: Arc<Guider>) -> Self {
        Acquirer {
            state: Arc::new(Mutex::new(AcquirerState {
                stop_request: false,
                worker_thread: None,
                acquiring: false,
                last_outcome: None,
            })),
            camera,
            mount,
            stage,
            engine,
            guider,
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.state.lock().unwrap().acquiring
    }

    pub fn last_outcome(&self) -> Option<AcquireOutcome> {
        self.state.lock().unwrap().last_outcome.clone()
    }

    pub fn start(&self, params: AcquireParams) -> Result<(), CanonicalError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.acquiring {
                return Err(failed_precondition_error("Already acquiring"));
            }
            state.acquiring = true;
            state.stop_request = false;
        }
        if let Err(e) = self.start_worker(params) {
            self.state.lock().unwrap().acquiring = false;
            return Err(e);
        }
        Ok(())
    }

    fn start_worker(&self, params: AcquireParams)
                    -> Result<(), CanonicalError> {
        if !self.mount.is_operational() {
            return Err(failed_precondition_error("Mount is not operational"));
        }
        if !self.camera.is_connected() {
            return Err(failed_precondition_error("Camera is not connected"));
        }
        if !self.stage.is_connected() {
            return Err(failed_precondition_error("Stage is not connected"));
        }

        let state = self.state.clone();
        let mount = self.mount.clone();
        let stage = self.stage.clone();
        let engine = self.engine.clone();
        let guider = self.guider.clone();
        let handle = thread::spawn(move || {
            let stop_state = state.clone();
            let stop = move || stop_state.lock().unwrap().stop_request;
            let outcome = run_phases(&mount, &stage, &engine, &guider,
                                     &params, &stop);
            info!("acquisition: {}", summarize(&outcome));
            let mut state = state.lock().unwrap();
            state.last_outcome = Some(outcome);
            state.acquiring = false;
        });
        self.state.lock().unwrap().worker_thread = Some(handle);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), CanonicalError> {
        let handle = {
            let mut state = self.state.lock().unwrap();
            if !state.acquiring {
                return Err(failed_precondition_error("Not acquiring"));
            }
            state.stop_request = true;
            state.worker_thread.take()
        };
        if let Some(handle) = handle {
            handle.join().unwrap();
        }
        info!("Acquisition stopped");
        Ok(())
    }
}

impl Drop for Acquirer {
    fn drop(&mut self) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.stop_request = true;
            state.worker_thread.take()
        };
        if let Some(handle) = handle {
            handle.join().unwrap();
        }
    }
}

fn summarize(outcome: &AcquireOutcome) -> String {
    if outcome.succeeded {
        format!("completed [{}]", outcome.phases_completed.join(", "))
    } else if outcome.cancelled {
        "cancelled".to_string()
    } else {
        format!("stopped after [{}]: {}",
                outcome.phases_completed.join(", "),
                outcome.errors.join("; "))
    }
}

fn run_phases(mount: &Arc<MountUnit>, stage: &Arc<StageUnit>,
              engine: &Arc<Mutex<CorrectionEngine>>, guider: &Arc<Guider>,
              params: &AcquireParams, stop: &dyn Fn() -> bool)
              -> AcquireOutcome {
    let mut outcome = AcquireOutcome {
        succeeded: false,
        cancelled: false,
        phases_completed: Vec::new(),
        errors: Vec::new(),
        folder: None,
        guiding: false,
    };
    if let Some(root) = &params.output_root {
        match PathMaker::new(root).acquisition_folder(&params.target) {
            Ok(folder) => outcome.folder = Some(folder),
            Err(e) => warn!("acquisition: no session folder: {:?}", e),
        }
    }

    info!("acquisition: positioning for the sky solve");
    if !position_phase("positioning(sky)", mount, stage,
                       params.stage_sky_position, Some(&params.target),
                       params, &mut outcome, stop) {
        return outcome;
    }
    if !solve_phase("sky", engine, params, &mut outcome, stop) {
        return outcome;
    }

    // The mount stays where the sky corrections put it; only the stage
    // moves to the fiber.
    info!("acquisition: positioning for the spec solve");
    if !position_phase("positioning(spec)", mount, stage,
                       params.stage_spec_position, None,
                       params, &mut outcome, stop) {
        return outcome;
    }
    if !solve_phase("spec", engine, params, &mut outcome, stop) {
        return outcome;
    }

    if let Some(mut guide_params) = params.guide.clone() {
        guide_params.target = Some(params.target);
        if let Some(folder) = &outcome.folder {
            guide_params.output_folder = Some(folder.join("guiding"));
        }
        info!("acquisition: handing off to guiding");
        match guider.start(guide_params) {
            Ok(()) => {
                outcome.guiding = true;
                outcome.phases_completed.push("guiding".to_string());
            }
            Err(e) => {
                outcome.errors.push(
                    format!("cannot start guiding: {}", e.message));
                return outcome;
            }
        }
    }
    outcome.succeeded = true;
    outcome
}

// Issues the stage and mount moves together, waits for both to stop at the
// polling grain, then settles. Extends the outcome; false stops the
// sequence.
fn position_phase(label: &str, mount: &Arc<MountUnit>, stage: &Arc<StageUnit>,
                  stage_position: f64, slew_target: Option<&Coordinate>,
                  params: &AcquireParams, outcome: &mut AcquireOutcome,
                  stop: &dyn Fn() -> bool) -> bool {
    match position(mount, stage, stage_position, slew_target, params, stop) {
        Ok(()) => {
            outcome.phases_completed.push(label.to_string());
            true
        }
        Err(e) if e.code == CanonicalErrorCode::Aborted => {
            outcome.cancelled = true;
            false
        }
        Err(e) => {
            outcome.errors.push(format!("{} failed: {}", label, e.message));
            false
        }
    }
}

fn position(mount: &Arc<MountUnit>, stage: &Arc<StageUnit>,
            stage_position: f64, slew_target: Option<&Coordinate>,
            params: &AcquireParams, stop: &dyn Fn() -> bool)
            -> Result<(), CanonicalError> {
    stage.move_to(stage_position)?;
    if let Some(target) = slew_target {
        if !mount.status().is_tracking {
            mount.set_tracking(true)?;
        }
        mount.slew_to(target)?;
        mount.wait_slew_complete(stop, params.motion_poll, None)?;
    }
    stage.wait_motion_complete(stop, params.motion_poll)?;
    info!("acquisition: letting the mechanics settle");
    if !interruptible_sleep(params.post_motion_settle, stop) {
        return Err(aborted_error("Acquisition stopped"));
    }
    Ok(())
}

// Runs one solving phase to convergence. Extends the outcome; false stops
// the sequence.
fn solve_phase(phase: &str, engine: &Arc<Mutex<CorrectionEngine>>,
               params: &AcquireParams, outcome: &mut AcquireOutcome,
               stop: &dyn Fn() -> bool) -> bool {
    info!("acquisition: starting the {} solve", phase);
    let correction_params = CorrectionParams {
        phase: phase.to_string(),
        target: params.target,
        exposure: params.exposure.clone(),
        tolerance: params.tolerance,
        max_tries: params.max_tries,
        pixel_scale_at_bin1: params.pixel_scale_at_bin1,
        solve_timeout: params.solve_timeout,
        solve_poll_period: params.solve_poll_period,
        mount_settle: params.mount_settle,
        slew_wait_grain: params.slew_wait_grain,
        shm_key: params.shm_key.clone(),
        output_folder: outcome.folder.as_ref().map(|f| f.join(phase)),
    };
    let correction = engine.lock().unwrap()
        .solve_and_correct(&correction_params, stop);
    if correction.cancelled {
        outcome.cancelled = true;
        return false;
    }
    if let Some(e) = &correction.fatal {
        error!("acquisition: {} solve lost the solver: {:?}", phase, e);
        outcome.errors.push(
            format!("{} solve: solver unreachable: {}", phase, e.message));
        return false;
    }
    if !correction.converged {
        outcome.errors.push(format!(
            "{} solve did not converge within {} tries",
            phase, correction.tries_used));
        outcome.errors.extend(correction.failures);
        return false;
    }
    outcome.phases_completed.push(format!("solving({})", phase));
    true
}

// mod tests.
