// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, CanonicalErrorCode, aborted_error,
                      deadline_exceeded_error, failed_precondition_error,
                      internal_error, invalid_argument_error};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::astro_util::Coordinate;
use crate::camera::CameraUnit;
use crate::focuser::FocuserUnit;
use crate::hardware::ExposureSettings;
use crate::mount::MountUnit;
use crate::poller::interruptible_sleep;
use crate::solver_client::{FocusAnalysisResult, SolverClient};
use crate::stage::StageUnit;

/// Last accepted focus position, persisted across runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnownFocus {
    pub position: i32,
    /// RFC 3339 UTC of the run that produced it.
    pub time: String,
}

pub fn load_known_focus(path: &Path) -> Option<i32> {
    let json = fs::read_to_string(path).ok()?;
    let known: KnownFocus = serde_json::from_str(&json).ok()?;
    Some(known.position)
}

fn save_known_focus(path: &Path, position: i32)
                    -> Result<(), CanonicalError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", parent, e)))?;
    }
    let known = KnownFocus { position, time: Utc::now().to_rfc3339() };
    let json = serde_json::to_string_pretty(&known).map_err(
        |e| failed_precondition_error(
            &format!("Cannot encode known focus: {:?}", e)))?;
    fs::write(path, json).map_err(|e| failed_precondition_error(
        &format!("Cannot write {:?}: {:?}", path, e)))
}

#[derive(Clone, Debug)]
pub struct AutofocusParams {
    pub exposure: ExposureSettings,

    /// Sweep center. None uses the persisted known focus position, falling
    /// back to the focuser's current position.
    pub start_position: Option<i32>,
    pub ticks_per_step: i32,

    /// Number of sweep positions; must be odd so the sweep is centered.
    pub num_images: u32,

    /// A solution is accepted only if its tolerance (focuser ticks) is at
    /// most this.
    pub max_tolerance: f64,

    /// How many sweeps to attempt before giving up.
    pub max_tries: u32,

    /// Move the spectrograph stage here before the sweep.
    pub stage_sky_position: Option<f64>,

    /// Slew here before the sweep. None focuses at the current pointing.
    pub target: Option<Coordinate>,
    pub wait_grain: Duration,
    pub analysis_start_timeout: Duration,
    pub analysis_finish_timeout: Duration,
    pub analysis_poll_period: Duration,

    /// Where the sweep images are written.
    pub output_folder: PathBuf,

    /// Where the known focus position is persisted. None skips persistence.
    pub known_focus_path: Option<PathBuf>,
}

impl Default for AutofocusParams {
    fn default() -> Self {
        AutofocusParams {
            exposure: ExposureSettings::new(Duration::from_secs(5), 1),
            start_position: None,
            ticks_per_step: 50,
            num_images: 5,
            max_tolerance: 50.0,
            max_tries: 3,
            stage_sky_position: None,
            target: None,
            wait_grain: Duration::from_millis(500),
            analysis_start_timeout: Duration::from_secs(60),
            analysis_finish_timeout: Duration::from_secs(60),
            analysis_poll_period: Duration::from_millis(500),
            output_folder: PathBuf::from("autofocus"),
            known_focus_path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FocusOutcome {
    pub succeeded: bool,
    pub cancelled: bool,
    pub best_position: Option<i32>,
    pub tolerance: Option<f64>,
    pub errors: Vec<String>,
    pub files: Vec<PathBuf>,
}

struct AutofocuserState {
    stop_request: bool,
    worker_thread: Option<thread::JoinHandle<()>>,
    running: bool,
    last_outcome: Option<FocusOutcome>,
}

/// Runs a focus sweep: steps the focuser across a range centered on the
/// starting position, exposing at each stop, then submits the images for
/// V-curve analysis and moves the focuser to the fitted best position.
pub struct Autofocuser {
    state: Arc<Mutex<AutofocuserState>>,
    camera: Arc<CameraUnit>,
    mount: Arc<MountUnit>,
    focuser: Arc<FocuserUnit>,
    stage: Arc<StageUnit>,
    solver_addr: String,
}

impl Autofocuser {
    pub fn new(camera: Arc<CameraUnit>, mount: Arc<MountUnit>,
               focuser: Arc<FocuserUnit>, stage: Arc<StageUnit>,
               solver_addr: &str) -> Self {
        Autofocuser {
            state: Arc::new(Mutex::new(AutofocuserState {
                stop_request: false,
                worker_thread: None,
                running: false,
                last_outcome: None,
            })),
            camera,
            mount,
            focuser,
            stage,
            solver_addr: solver_addr.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn last_outcome(&self) -> Option<FocusOutcome> {
        self.state.lock().unwrap().last_outcome.clone()
    }

    pub fn start(&self, params: AutofocusParams)
                 -> Result<(), CanonicalError> {
        if params.num_images % 2 != 1 {
            return Err(invalid_argument_error(
                &format!("num_images must be odd, got {}", params.num_images)));
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(failed_precondition_error("Already autofocusing"));
            }
            state.running = true;
            state.stop_request = false;
        }
        if let Err(e) = self.start_worker(params) {
            self.state.lock().unwrap().running = false;
            return Err(e);
        }
        Ok(())
    }

    fn start_worker(&self, params: AutofocusParams)
                    -> Result<(), CanonicalError> {
        if !self.camera.is_connected() {
            return Err(failed_precondition_error("Camera is not connected"));
        }
        if !self.focuser.is_connected() {
            return Err(failed_precondition_error("Focuser is not connected"));
        }
        if params.stage_sky_position.is_some() && !self.stage.is_connected() {
            return Err(failed_precondition_error("Stage is not connected"));
        }
        if params.target.is_some() && !self.mount.is_operational() {
            return Err(failed_precondition_error("Mount is not operational"));
        }

        let state = self.state.clone();
        let camera = self.camera.clone();
        let mount = self.mount.clone();
        let focuser = self.focuser.clone();
        let stage = self.stage.clone();
        let solver_addr = self.solver_addr.clone();
        let handle = thread::spawn(move || {
            let stop_state = state.clone();
            let stop = move || stop_state.lock().unwrap().stop_request;
            let outcome = run_focus_sweep(&camera, &mount, &focuser, &stage,
                                          &solver_addr, &params, &stop);
            info!("autofocus: {}", summarize(&outcome));
            let mut state = state.lock().unwrap();
            state.last_outcome = Some(outcome);
            state.running = false;
        });
        self.state.lock().unwrap().worker_thread = Some(handle);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), CanonicalError> {
        let handle = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return Err(failed_precondition_error("Not autofocusing"));
            }
            state.stop_request = true;
            state.worker_thread.take()
        };
        if let Some(handle) = handle {
            handle.join().unwrap();
        }
        Ok(())
    }
}

impl Drop for Autofocuser {
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

fn summarize(outcome: &FocusOutcome) -> String {
    if outcome.succeeded {
        format!("best position {} (tolerance {:.1})",
                outcome.best_position.unwrap_or(0),
                outcome.tolerance.unwrap_or(0.0))
    } else if outcome.cancelled {
        "cancelled".to_string()
    } else {
        format!("failed: {}", outcome.errors.join("; "))
    }
}

fn run_focus_sweep(camera: &Arc<CameraUnit>, mount: &Arc<MountUnit>,
                   focuser: &Arc<FocuserUnit>, stage: &Arc<StageUnit>,
                   solver_addr: &str, params: &AutofocusParams,
                   stop: &dyn Fn() -> bool) -> FocusOutcome {
    let mut outcome = FocusOutcome {
        succeeded: false,
        cancelled: false,
        best_position: None,
        tolerance: None,
        errors: Vec::new(),
        files: Vec::new(),
    };
    let restore_position = focuser.position();

    match position_for_sweep(mount, stage, params, stop) {
        Ok(()) => (),
        Err(e) if e.code == CanonicalErrorCode::Aborted => {
            outcome.cancelled = true;
            return outcome;
        }
        Err(e) => {
            outcome.errors.push(format!("positioning failed: {}", e.message));
            return outcome;
        }
    }

    let center = params.start_position
        .or_else(|| params.known_focus_path.as_deref()
                 .and_then(load_known_focus))
        .unwrap_or(restore_position);
    let first = center
        - (params.num_images as i32 / 2) * params.ticks_per_step;

    for attempt in 1..=params.max_tries {
        if stop() {
            outcome.cancelled = true;
            return outcome;
        }
        info!("autofocus: attempt {}/{}, sweeping {} positions from {} by \
               {} ticks",
              attempt, params.max_tries, params.num_images, first,
              params.ticks_per_step);
        let mut files = Vec::new();
        let result = take_sweep_images(camera, focuser, params, first,
                                       &mut files, stop)
            .and_then(|()| analyze(solver_addr, &files, params, stop));
        outcome.files = files;
        let result = match result {
            Ok(result) => result,
            Err(e) if e.code == CanonicalErrorCode::Aborted => {
                outcome.cancelled = true;
                return outcome;
            }
            Err(e) => {
                outcome.errors.push(
                    format!("attempt {}: {}", attempt, e.message));
                continue;
            }
        };

        if !result.has_solution {
            outcome.errors.push(
                format!("attempt {}: no focus solution", attempt));
            continue;
        }
        if result.tolerance > params.max_tolerance {
            outcome.errors.push(format!(
                "attempt {}: solution tolerance {:.1} exceeds maximum {:.1}",
                attempt, result.tolerance, params.max_tolerance));
            continue;
        }

        let best = result.best_focus_position.round() as i32;
        info!("autofocus: solution at {} with tolerance {:.1}, star \
               diameter {:.1} px, moving focuser",
              best, result.tolerance, result.best_star_diameter);
        match focuser.move_to_and_wait(best, params.wait_grain, stop) {
            Ok(()) => (),
            Err(e) if e.code == CanonicalErrorCode::Aborted => {
                outcome.cancelled = true;
                return outcome;
            }
            Err(e) => {
                outcome.errors.push(format!("cannot move to best focus: {}",
                                            e.message));
                return outcome;
            }
        }
        if let Some(path) = &params.known_focus_path {
            if let Err(e) = save_known_focus(path, best) {
                warn!("autofocus: could not persist known focus: {:?}", e);
            }
        }
        outcome.succeeded = true;
        outcome.best_position = Some(best);
        outcome.tolerance = Some(result.tolerance);
        return outcome;
    }

    restore(focuser, restore_position, params, stop);
    outcome
}

// Stage to the sky position and mount to the target, tracking on.
fn position_for_sweep(mount: &Arc<MountUnit>, stage: &Arc<StageUnit>,
                      params: &AutofocusParams, stop: &dyn Fn() -> bool)
                      -> Result<(), CanonicalError> {
    if let Some(sky) = params.stage_sky_position {
        stage.move_to_and_wait(sky, params.wait_grain, stop)?;
    }
    if let Some(target) = &params.target {
        if !mount.status().is_tracking {
            mount.set_tracking(true)?;
        }
        mount.slew_to(target)?;
        mount.wait_slew_complete(stop, params.wait_grain, None)?;
    }
    Ok(())
}

fn take_sweep_images(camera: &Arc<CameraUnit>, focuser: &Arc<FocuserUnit>,
                     params: &AutofocusParams, first_position: i32,
                     files: &mut Vec<PathBuf>, stop: &dyn Fn() -> bool)
                     -> Result<(), CanonicalError> {
    fs::create_dir_all(&params.output_folder).map_err(
        |e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", params.output_folder, e)))?;
    for i in 0..params.num_images {
        if stop() {
            return Err(aborted_error("Autofocus stopped"));
        }
        let position = first_position + i as i32 * params.ticks_per_step;
        focuser.move_to_and_wait(position, params.wait_grain, stop)?;

        info!("autofocus: exposure {}/{} at position {}",
              i + 1, params.num_images, position);
        let path = params.output_folder.join(
            format!("FOCUS{:05}.png", position));
        let mut exposure = params.exposure.clone();
        exposure.destination = Some(path.clone());
        exposure.save_image = true;
        camera.expose(&exposure, stop)?;
        files.push(path);
    }
    Ok(())
}

// Submits the sweep images and polls the analysis to completion. The
// analysis must be seen running within the start timeout and must finish
// within the finish timeout of first being seen running.
fn analyze(solver_addr: &str, files: &[PathBuf], params: &AutofocusParams,
           stop: &dyn Fn() -> bool)
           -> Result<FocusAnalysisResult, CanonicalError> {
    let mut client = SolverClient::new(solver_addr);
    client.analyze_focus(files)?;

    let submitted = Instant::now();
    let mut running_since: Option<Instant> = None;
    loop {
        if stop() {
            return Err(aborted_error("Autofocus stopped"));
        }
        let status = client.focus_status()?;
        if let Some(message) = status.error_message {
            return Err(internal_error(&message));
        }
        if let Some(result) = status.analysis_result {
            return Ok(result);
        }
        match running_since {
            None => {
                if status.is_running {
                    running_since = Some(Instant::now());
                } else if submitted.elapsed() > params.analysis_start_timeout {
                    return Err(deadline_exceeded_error(&format!(
                        "focus analysis did not start within {:.0}s",
                        params.analysis_start_timeout.as_secs_f64())));
                }
            }
            Some(since) => {
                if since.elapsed() > params.analysis_finish_timeout {
                    return Err(deadline_exceeded_error(&format!(
                        "focus analysis did not finish within {:.0}s",
                        params.analysis_finish_timeout.as_secs_f64())));
                }
            }
        }
        if !interruptible_sleep(params.analysis_poll_period, stop) {
            return Err(aborted_error("Autofocus stopped"));
        }
    }
}

// Best effort return to the pre-sweep position after a failed run.
fn restore(focuser: &Arc<FocuserUnit>, position: i32,
           params: &AutofocusParams, stop: &dyn Fn() -> bool) {
    info!("autofocus: returning focuser to {}", position);
    if let Err(e) = focuser.move_to_and_wait(position, params.wait_grain,
                                             stop) {
        warn!("autofocus: could not restore focuser position: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Simulator, SimulatorConfig};
    use crate::solver_sim::{SolverSimConfig, SolverSimulator};

    struct Fixture {
        sim: Simulator,
        camera: Arc<CameraUnit>,
        mount: Arc<MountUnit>,
        focuser: Arc<FocuserUnit>,
        stage: Arc<StageUnit>,
    }

    fn fixture(config: SimulatorConfig) -> Fixture {
        let sim = Simulator::new(config);
        let camera = Arc::new(CameraUnit::new(
            Box::new(sim.camera()), Duration::from_millis(10)));
        let mount = Arc::new(MountUnit::new(
            Box::new(sim.mount()), Duration::from_millis(10)));
        let focuser = Arc::new(FocuserUnit::new(
            Box::new(sim.focuser()), Duration::from_millis(10)));
        let stage = Arc::new(StageUnit::new(
            Box::new(sim.stage()), Duration::from_millis(10)));
        for _ in 0..100 {
            if camera.is_connected() && mount.is_operational() &&
                focuser.is_connected() && stage.is_connected() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(camera.is_connected() && mount.is_operational() &&
                focuser.is_connected() && stage.is_connected());
        Fixture { sim, camera, mount, focuser, stage }
    }

    fn fast_params(test: &str) -> (AutofocusParams, PathBuf) {
        let folder = std::env::temp_dir().join(
            format!("kestrel_focus_{}_{}", test, std::process::id()));
        let _ = fs::remove_dir_all(&folder);
        let params = AutofocusParams {
            exposure: ExposureSettings::new(Duration::from_millis(20), 1),
            wait_grain: Duration::from_millis(10),
            analysis_start_timeout: Duration::from_secs(5),
            analysis_finish_timeout: Duration::from_secs(5),
            analysis_poll_period: Duration::from_millis(10),
            output_folder: folder.join("images"),
            known_focus_path: Some(folder.join("known_focus.json")),
            ..Default::default()
        };
        (params, folder)
    }

    fn focuser_of(fixture: &Fixture, solver_addr: &str) -> Autofocuser {
        Autofocuser::new(fixture.camera.clone(), fixture.mount.clone(),
                         fixture.focuser.clone(), fixture.stage.clone(),
                         solver_addr)
    }

    fn wait_done(autofocuser: &Autofocuser) -> FocusOutcome {
        for _ in 0..500 {
            if !autofocuser.is_running() {
                return autofocuser.last_outcome().unwrap();
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("autofocus did not finish");
    }

    #[test]
    fn test_sweep_finds_and_persists_best_focus() {
        let solver = SolverSimulator::start(SolverSimConfig {
            focus_latency: Duration::from_millis(30),
            ..Default::default()
        }).unwrap();
        solver.push_focus_result(FocusAnalysisResult {
            has_solution: true,
            best_focus_position: 6120.0,
            best_star_diameter: 2.8,
            tolerance: 15.0,
            vcurve_a: 0.01,
            vcurve_b: -1.0,
            vcurve_c: 30.0,
            focus_samples: Vec::new(),
        });
        let fixture = fixture(SimulatorConfig::default());
        let autofocuser = focuser_of(&fixture, &solver.addr());
        let (mut params, folder) = fast_params("best");
        params.start_position = Some(5800);
        params.stage_sky_position = Some(10.0);

        autofocuser.start(params).unwrap();
        let outcome = wait_done(&autofocuser);
        assert!(outcome.succeeded, "errors: {:?}", outcome.errors);
        assert_eq!(outcome.best_position, Some(6120));

        // Sweep of 5 images centered on 5800, 50 ticks apart.
        let names: Vec<String> = outcome.files.iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names,
                   vec!["FOCUS05700.png", "FOCUS05750.png", "FOCUS05800.png",
                        "FOCUS05850.png", "FOCUS05900.png"]);
        for file in &outcome.files {
            assert!(file.exists());
        }
        assert_eq!(solver.last_focus_files().len(), 5);

        assert_eq!(fixture.sim.focuser_position(), 6120);
        assert_eq!(
            load_known_focus(&folder.join("known_focus.json")), Some(6120));
        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn test_no_solution_exhausts_tries_and_restores_position() {
        let solver = SolverSimulator::start(SolverSimConfig {
            focus_latency: Duration::from_millis(30),
            ..Default::default()
        }).unwrap();
        // Empty focus script: every simulated analysis has no solution.
        let fixture = fixture(SimulatorConfig::default());
        let before = fixture.sim.focuser_position();
        let autofocuser = focuser_of(&fixture, &solver.addr());
        let (params, folder) = fast_params("nosolution");

        autofocuser.start(params).unwrap();
        let outcome = wait_done(&autofocuser);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.errors.len(), 3);
        assert!(outcome.errors.iter().all(|e| e.contains("no focus solution")),
                "errors: {:?}", outcome.errors);
        assert_eq!(fixture.sim.focuser_position(), before);
        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn test_retry_after_failed_sweep() {
        let solver = SolverSimulator::start(SolverSimConfig {
            focus_latency: Duration::from_millis(30),
            ..Default::default()
        }).unwrap();
        solver.push_focus_result(FocusAnalysisResult {
            has_solution: false,
            best_focus_position: 0.0,
            best_star_diameter: 0.0,
            tolerance: 0.0,
            vcurve_a: 0.0,
            vcurve_b: 0.0,
            vcurve_c: 0.0,
            focus_samples: Vec::new(),
        });
        solver.push_focus_result(FocusAnalysisResult {
            has_solution: true,
            best_focus_position: 6080.0,
            best_star_diameter: 2.4,
            tolerance: 10.0,
            vcurve_a: 0.01,
            vcurve_b: -1.0,
            vcurve_c: 30.0,
            focus_samples: Vec::new(),
        });
        let fixture = fixture(SimulatorConfig::default());
        let autofocuser = focuser_of(&fixture, &solver.addr());
        let (params, folder) = fast_params("retry");

        autofocuser.start(params).unwrap();
        let outcome = wait_done(&autofocuser);
        assert!(outcome.succeeded, "errors: {:?}", outcome.errors);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.best_position, Some(6080));
        assert_eq!(fixture.sim.focuser_position(), 6080);
        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn test_loose_solution_rejected() {
        let solver = SolverSimulator::start(SolverSimConfig {
            focus_latency: Duration::from_millis(30),
            ..Default::default()
        }).unwrap();
        solver.push_focus_result(FocusAnalysisResult {
            has_solution: true,
            best_focus_position: 6050.0,
            best_star_diameter: 5.5,
            tolerance: 80.0,
            vcurve_a: 0.01,
            vcurve_b: -1.0,
            vcurve_c: 30.0,
            focus_samples: Vec::new(),
        });
        let fixture = fixture(SimulatorConfig::default());
        let before = fixture.sim.focuser_position();
        let autofocuser = focuser_of(&fixture, &solver.addr());
        let (mut params, folder) = fast_params("loose");
        params.max_tolerance = 50.0;
        params.max_tries = 1;

        autofocuser.start(params).unwrap();
        let outcome = wait_done(&autofocuser);
        assert!(!outcome.succeeded);
        assert!(outcome.errors.iter().any(|e| e.contains("tolerance")),
                "errors: {:?}", outcome.errors);
        assert_eq!(fixture.sim.focuser_position(), before);
        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn test_even_image_count_rejected() {
        let fixture = fixture(SimulatorConfig::default());
        let autofocuser = focuser_of(&fixture, "127.0.0.1:1");
        let (mut params, folder) = fast_params("even");
        params.num_images = 4;
        let err = autofocuser.start(params).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
        let _ = fs::remove_dir_all(&folder);
    }

    #[test]
    fn test_stop_cancels_sweep() {
        let fixture = fixture(SimulatorConfig::default());
        let autofocuser = focuser_of(&fixture, "127.0.0.1:1");
        let (mut params, folder) = fast_params("cancel");
        params.exposure = ExposureSettings::new(Duration::from_secs(10), 1);

        autofocuser.start(params).unwrap();
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        autofocuser.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        let outcome = autofocuser.last_outcome().unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.succeeded);
        let _ = fs::remove_dir_all(&folder);
    }
}  // mod tests.
