// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, CanonicalErrorCode,
                      failed_precondition_error};
use log::{debug, error, info, warn};

use crate::astro_util::Coordinate;
use crate::camera::CameraUnit;
use crate::correction::{CorrectionEngine, CorrectionHistory, CorrectionParams,
                        PIXEL_SCALE_AT_BIN1, SolvingTolerance};
use crate::guide_stats::{GuideQuality, GuideStats};
use crate::hardware::ExposureSettings;
use crate::image_shift::measure_shift;
use crate::mount::MountUnit;
use crate::poller::interruptible_sleep;
use crate::solver_client::DEFAULT_SHM_KEY;

/// How each guide cycle measures the pointing drift.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum GuideMode {
    /// Plate solve each frame and compare to the target.
    Solving,

    /// Phase correlation against a reference frame captured at guide start.
    /// Needs the camera's rotation angle on the sky, normally taken from the
    /// most recent plate solution.
    FrameShift { rotation_angle_degs: f64 },
}

#[derive(Clone, Debug)]
pub struct GuideParams {
    pub mode: GuideMode,

    /// None guides at the mount position sampled when guiding starts.
    pub target: Option<Coordinate>,
    pub exposure: ExposureSettings,
    pub cadence: Duration,

    /// Solving mode: convergence tolerance per cycle.
    pub tolerance: SolvingTolerance,
    pub max_tries: u32,

    /// Frame shift mode: corrections smaller than these are not sent to
    /// the mount.
    pub min_ra_correction_arcsec: f64,
    pub min_dec_correction_arcsec: f64,

    pub pixel_scale_at_bin1: f64,
    pub solve_timeout: Duration,
    pub solve_poll_period: Duration,
    pub mount_settle: Duration,
    pub slew_wait_grain: Duration,
    pub shm_key: String,

    /// Where the accumulated corrections.json is written when guiding ends.
    pub output_folder: Option<PathBuf>,
}

impl Default for GuideParams {
    fn default() -> Self {
        GuideParams {
            mode: GuideMode::Solving,
            target: None,
            exposure: ExposureSettings::new(Duration::from_secs(3), 1),
            cadence: Duration::from_secs(30),
            tolerance: SolvingTolerance::new(0.3, 0.3),
            max_tries: 3,
            min_ra_correction_arcsec: 0.3,
            min_dec_correction_arcsec: 0.3,
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

/// Converts a measured pixel shift of the scene into the mount correction,
/// arcsec, that cancels it. The camera is rotated `rotation_angle_degs` on
/// the sky, so the pixel axes are de-rotated before scaling.
pub fn pixel_shift_to_sky_arcsec(dx: f64, dy: f64, arcsec_per_pixel: f64,
                                 rotation_angle_degs: f64) -> (f64, f64) {
    let (sin_t, cos_t) = rotation_angle_degs.to_radians().sin_cos();
    (arcsec_per_pixel * (cos_t * dx + sin_t * dy),
     arcsec_per_pixel * (-sin_t * dx + cos_t * dy))
}

struct GuiderState {
    stop_request: bool,
    worker_thread: Option<thread::JoinHandle<()>>,
    guiding: bool,
    stats: GuideStats,
}

/// Periodically measures the pointing drift and nudges the mount back onto
/// target. One guide session at a time; the worker runs until stop() or a
/// fatal error.
pub struct Guider {
    state: Arc<Mutex<GuiderState>>,
    camera: Arc<CameraUnit>,
    mount: Arc<MountUnit>,
    engine: Arc<Mutex<CorrectionEngine>>,
}

impl Guider {
    pub fn new(camera: Arc<CameraUnit>, mount: Arc<MountUnit>,
               engine: Arc<Mutex<CorrectionEngine>>) -> Self {
        Guider {
            state: Arc::new(Mutex::new(GuiderState {
                stop_request: false,
                worker_thread: None,
                guiding: false,
                stats: GuideStats::new(),
            })),
            camera,
            mount,
            engine,
        }
    }

    pub fn is_guiding(&self) -> bool {
        self.state.lock().unwrap().guiding
    }

    pub fn quality(&self) -> GuideQuality {
        self.state.lock().unwrap().stats.quality()
    }

    pub fn start(&self, params: GuideParams) -> Result<(), CanonicalError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.guiding {
                return Err(failed_precondition_error("Already guiding"));
            }
            state.guiding = true;
            state.stop_request = false;
            state.stats = GuideStats::new();
        }
        if let Err(e) = self.start_worker(params) {
            self.state.lock().unwrap().guiding = false;
            return Err(e);
        }
        Ok(())
    }

    fn start_worker(&self, params: GuideParams)
                    -> Result<(), CanonicalError> {
        if !self.mount.is_operational() {
            return Err(failed_precondition_error("Mount is not operational"));
        }
        if !self.camera.is_connected() {
            return Err(failed_precondition_error("Camera is not connected"));
        }
        let target = match params.target {
            Some(target) => target,
            None => {
                let here = self.mount.position();
                info!("Guiding at current position {}", here);
                here
            }
        };

        // Tracking must be on while guiding; the prior state is restored
        // when the guide loop ends.
        let was_tracking = self.mount.status().is_tracking;
        if !was_tracking {
            self.mount.set_tracking(true)?;
            info!("Started mount tracking for guiding");
        }

        let state = self.state.clone();
        let camera = self.camera.clone();
        let mount = self.mount.clone();
        let engine = self.engine.clone();
        let handle = thread::spawn(move || {
            run_guide_loop(state, camera, mount, engine,
                           params, target, was_tracking);
        });
        self.state.lock().unwrap().worker_thread = Some(handle);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), CanonicalError> {
        let handle = {
            let mut state = self.state.lock().unwrap();
            if !state.guiding {
                return Err(failed_precondition_error("Not guiding"));
            }
            state.stop_request = true;
            state.worker_thread.take()
        };
        if let Some(handle) = handle {
            handle.join().unwrap();
        }
        info!("Guiding stopped");
        Ok(())
    }
}

impl Drop for Guider {
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

fn run_guide_loop(state: Arc<Mutex<GuiderState>>, camera: Arc<CameraUnit>,
                  mount: Arc<MountUnit>, engine: Arc<Mutex<CorrectionEngine>>,
                  params: GuideParams, target: Coordinate,
                  was_tracking: bool) {
    let stop_state = state.clone();
    let stop = move || stop_state.lock().unwrap().stop_request;

    let mut history =
        CorrectionHistory::new("guiding", &target, &params.tolerance);
    match params.mode {
        GuideMode::Solving => {
            guide_by_solving(&state, &engine, &params, &target,
                             &mut history, &stop);
        }
        GuideMode::FrameShift { rotation_angle_degs } => {
            guide_by_frame_shift(&state, &camera, &mount, &params,
                                 rotation_angle_degs, &mut history, &stop);
        }
    }

    if let Some(folder) = &params.output_folder {
        match history.save(folder) {
            Ok(path) => info!("guiding: saved {:?}", path),
            Err(e) => warn!("guiding: could not persist corrections: {:?}", e),
        }
    }
    if !was_tracking {
        if let Err(e) = mount.set_tracking(false) {
            warn!("Could not restore mount tracking state: {:?}", e);
        } else {
            info!("Stopped mount tracking after guiding");
        }
    }
    state.lock().unwrap().guiding = false;
}

fn guide_by_solving(state: &Arc<Mutex<GuiderState>>,
                    engine: &Arc<Mutex<CorrectionEngine>>,
                    params: &GuideParams, target: &Coordinate,
                    history: &mut CorrectionHistory,
                    stop: &dyn Fn() -> bool) {
    let correction_params = CorrectionParams {
        phase: "guiding".to_string(),
        target: *target,
        exposure: params.exposure.clone(),
        tolerance: params.tolerance,
        max_tries: params.max_tries,
        pixel_scale_at_bin1: params.pixel_scale_at_bin1,
        solve_timeout: params.solve_timeout,
        solve_poll_period: params.solve_poll_period,
        mount_settle: params.mount_settle,
        slew_wait_grain: params.slew_wait_grain,
        shm_key: params.shm_key.clone(),
        output_folder: None,  // Accumulated here, saved at guide end.
    };
    loop {
        if stop() {
            break;
        }
        let cycle_start = Instant::now();
        let outcome = engine.lock().unwrap()
            .solve_and_correct(&correction_params, stop);

        // The first measured delta of the cycle is the drift since the
        // previous cycle.
        let measured = outcome.history.sequence.first().cloned()
            .or_else(|| outcome.history.last_delta.clone());
        {
            let mut state = state.lock().unwrap();
            match &measured {
                Some(record) =>
                    state.stats.add_cycle(record.ra_arcsec, record.dec_arcsec),
                None => state.stats.add_failed_cycle(),
            }
        }
        history.sequence.extend(outcome.history.sequence);
        if outcome.history.last_delta.is_some() {
            history.last_delta = outcome.history.last_delta;
        }

        if outcome.cancelled {
            break;
        }
        if let Some(e) = outcome.fatal {
            error!("guiding: aborting, solver unreachable: {:?}", e);
            break;
        }
        if !pace_cycle(cycle_start, params.cadence, stop) {
            break;
        }
    }
}

fn guide_by_frame_shift(state: &Arc<Mutex<GuiderState>>,
                        camera: &Arc<CameraUnit>, mount: &Arc<MountUnit>,
                        params: &GuideParams, rotation_angle_degs: f64,
                        history: &mut CorrectionHistory,
                        stop: &dyn Fn() -> bool) {
    info!("guiding: capturing reference frame");
    let reference = match camera.expose(&params.exposure, stop) {
        Ok(frame) => frame,
        Err(e) => {
            if e.code != CanonicalErrorCode::Aborted {
                error!("guiding: cannot capture reference frame: {:?}", e);
            }
            return;
        }
    };
    let arcsec_per_pixel =
        params.pixel_scale_at_bin1 * params.exposure.binning as f64;

    loop {
        if stop() {
            break;
        }
        let cycle_start = Instant::now();
        let frame = match camera.expose(&params.exposure, stop) {
            Ok(frame) => frame,
            Err(e) if e.code == CanonicalErrorCode::Aborted => break,
            Err(e) => {
                warn!("guiding: exposure failed: {:?}", e);
                state.lock().unwrap().stats.add_failed_cycle();
                if !pace_cycle(cycle_start, params.cadence, stop) {
                    break;
                }
                continue;
            }
        };

        match measure_shift(&reference, &frame) {
            Ok(shift) => {
                let (corr_ra, corr_dec) = pixel_shift_to_sky_arcsec(
                    shift.dx, shift.dy, arcsec_per_pixel, rotation_angle_degs);
                debug!("guiding: shift ({:.2}, {:.2})px -> correction \
                        ra {:.2}\" dec {:.2}\"",
                       shift.dx, shift.dy, corr_ra, corr_dec);
                state.lock().unwrap().stats.add_cycle(corr_ra, corr_dec);

                let apply_ra = if corr_ra.abs() >=
                    params.min_ra_correction_arcsec { corr_ra } else { 0.0 };
                let apply_dec = if corr_dec.abs() >=
                    params.min_dec_correction_arcsec { corr_dec } else { 0.0 };
                if apply_ra != 0.0 || apply_dec != 0.0 {
                    history.record(apply_ra, apply_dec);
                    match mount.offset_and_settle(
                        apply_ra, apply_dec, params.slew_wait_grain,
                        params.mount_settle, stop) {
                        Ok(()) => (),
                        Err(e) if e.code == CanonicalErrorCode::Aborted =>
                            break,
                        Err(e) =>
                            warn!("guiding: mount offset failed: {:?}", e),
                    }
                } else {
                    debug!("guiding: correction below threshold, skipped");
                }
            }
            Err(e) => {
                warn!("guiding: shift measurement failed: {:?}", e);
                state.lock().unwrap().stats.add_failed_cycle();
            }
        }
        if !pace_cycle(cycle_start, params.cadence, stop) {
            break;
        }
    }
}

// Sleeps out the remainder of the cadence. A cycle that overran starts the
// next one immediately rather than queueing up. Returns false when stopped.
fn pace_cycle(cycle_start: Instant, cadence: Duration,
              stop: &dyn Fn() -> bool) -> bool {
    let elapsed = cycle_start.elapsed();
    if elapsed >= cadence {
        info!("guide cycle took {:.1}s, cadence is {:.1}s; not sleeping",
              elapsed.as_secs_f64(), cadence.as_secs_f64());
        return !stop();
    }
    interruptible_sleep(cadence - elapsed, stop)
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::fs;
    use super::*;
    use crate::astro_util::angular_separation_arcsec;
    use crate::hardware::MountDriver;
    use crate::simulator::{Simulator, SimulatorConfig};
    use crate::solver_sim::{ScriptedSolve, SolverSimConfig, SolverSimulator};

    fn unit_fixture(config: SimulatorConfig, solver_addr: &str)
                    -> (Simulator, Arc<CameraUnit>, Arc<MountUnit>, Guider) {
        let sim = Simulator::new(config);
        let camera = Arc::new(CameraUnit::new(
            Box::new(sim.camera()), Duration::from_millis(10)));
        let mount = Arc::new(MountUnit::new(
            Box::new(sim.mount()), Duration::from_millis(10)));
        for _ in 0..100 {
            if camera.is_connected() && mount.is_operational() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(camera.is_connected() && mount.is_operational());
        let engine = Arc::new(Mutex::new(CorrectionEngine::new(
            camera.clone(), mount.clone(), solver_addr)));
        let guider = Guider::new(camera.clone(), mount.clone(), engine);
        (sim, camera, mount, guider)
    }

    fn fast_guide_params(test: &str) -> GuideParams {
        GuideParams {
            exposure: ExposureSettings::new(Duration::from_millis(20), 1),
            cadence: Duration::from_millis(150),
            solve_timeout: Duration::from_secs(5),
            solve_poll_period: Duration::from_millis(10),
            mount_settle: Duration::from_millis(5),
            slew_wait_grain: Duration::from_millis(10),
            shm_key: format!("kestrel_guide_{}_{}", test, std::process::id()),
            ..Default::default()
        }
    }

    #[test]
    fn test_pixel_shift_to_sky() {
        // Camera aligned with the sky.
        let (ra, dec) = pixel_shift_to_sky_arcsec(2.0, -3.0, 0.25, 0.0);
        assert_abs_diff_eq!(ra, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(dec, -0.75, epsilon = 1e-9);

        // Camera rotated 90 degrees: pixel x is sky y.
        let (ra, dec) = pixel_shift_to_sky_arcsec(2.0, 0.0, 0.25, 90.0);
        assert_abs_diff_eq!(ra, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dec, -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_frame_shift_guiding_holds_pointing() {
        let config = SimulatorConfig {
            drift_rate: (3.0, -2.0),
            rotation_angle_degs: 15.0,
            offset_settle: Duration::from_millis(5),
            ..Default::default()
        };
        let rotation = config.rotation_angle_degs;
        let (sim, _camera, _mount, guider) =
            unit_fixture(config, "127.0.0.1:1");

        let mut params = fast_guide_params("frameshift");
        params.mode = GuideMode::FrameShift { rotation_angle_degs: rotation };
        params.cadence = Duration::from_millis(100);
        params.min_ra_correction_arcsec = 0.2;
        params.min_dec_correction_arcsec = 0.2;
        guider.start(params).unwrap();
        thread::sleep(Duration::from_millis(150));
        let held_position = sim.true_boresight();

        thread::sleep(Duration::from_millis(2500));
        guider.stop().unwrap();

        // Unguided, the boresight would have drifted ~9 arcsec.
        let residual = angular_separation_arcsec(
            &held_position, &sim.true_boresight());
        assert!(residual < 3.0, "residual {:.2} arcsec", residual);
        let quality = guider.quality();
        assert!(quality.cycles >= 5, "only {} cycles", quality.cycles);
        assert_eq!(quality.failed_cycles, 0);
    }

    #[test]
    fn test_solving_mode_corrects_and_persists() {
        let solver = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(10),
            ..Default::default()
        }).unwrap();
        // First cycle: 4 arcsec RA drift, corrected then confirmed. Later
        // cycles converge immediately via the default zero-delta outcome.
        solver.push_solve(ScriptedSolve::Deltas {
            ra_arcsec: 4.0, dec_arcsec: 0.0 });
        let config = SimulatorConfig {
            offset_settle: Duration::from_millis(5),
            ..Default::default()
        };
        let (sim, _camera, mount, guider) =
            unit_fixture(config, &solver.addr());
        let initial = sim.mount_position();
        assert!(!mount.status().is_tracking);

        let folder = std::env::temp_dir().join(
            format!("kestrel_guide_persist_{}", std::process::id()));
        let _ = fs::remove_dir_all(&folder);
        let mut params = fast_guide_params("solving");
        params.mode = GuideMode::Solving;
        params.output_folder = Some(folder.clone());
        guider.start(params).unwrap();
        assert!(guider.is_guiding());
        thread::sleep(Duration::from_millis(100));
        // Tracking was turned on for the session.
        assert!(mount.status().is_tracking);

        thread::sleep(Duration::from_millis(600));
        guider.stop().unwrap();
        assert!(!guider.is_guiding());
        // Restored to the pre-guiding tracking state.
        let mut driver = sim.mount();
        assert!(!driver.status().unwrap().is_tracking);

        let quality = guider.quality();
        assert!(quality.cycles >= 3, "only {} cycles", quality.cycles);

        // The scripted 4 arcsec correction reached the mount.
        let moved = sim.mount_position();
        let on_sky_ra = (moved.ra - initial.ra)
            * initial.dec.to_radians().cos() * 3600.0;
        assert_abs_diff_eq!(on_sky_ra, 4.0, epsilon = 0.5);

        let loaded =
            CorrectionHistory::load(&folder.join("corrections.json")).unwrap();
        assert_eq!(loaded.phase, "guiding");
        assert_eq!(loaded.sequence.len(), 1);
        fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn test_start_rejects_overlapping_session() {
        let solver = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(10),
            ..Default::default()
        }).unwrap();
        let (_sim, _camera, _mount, guider) = unit_fixture(
            SimulatorConfig::default(), &solver.addr());

        guider.start(fast_guide_params("overlap")).unwrap();
        let err = guider.start(fast_guide_params("overlap")).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);
        guider.stop().unwrap();
    }

    #[test]
    fn test_stop_without_session_errors() {
        let (_sim, _camera, _mount, guider) = unit_fixture(
            SimulatorConfig::default(), "127.0.0.1:1");
        let err = guider.stop().unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);
    }
}  // mod tests.
