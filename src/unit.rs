// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::Utc;
use log::info;
use serde::Serialize;

use crate::activity::{ActivityFlag, ActivitySet};
use crate::acquisition::{AcquireOutcome, AcquireParams, Acquirer};
use crate::autofocus::{AutofocusParams, Autofocuser, FocusOutcome};
use crate::camera::CameraUnit;
use crate::correction::{CorrectionEngine, CorrectionParams};
use crate::covers::CoversUnit;
use crate::focuser::FocuserUnit;
use crate::guide_stats::GuideQuality;
use crate::guiding::{GuideParams, Guider};
use crate::hardware::{CameraStatus, CoverState, CoversStatus, FocuserStatus,
                      MountStatus, StageStatus};
use crate::mount::MountUnit;
use crate::poller::wait_until;
use crate::stage::StageUnit;

/// Tries budget for the one-shot solve, where an operator is waiting for
/// the correction to land.
pub const ONE_SHOT_SOLVE_TRIES: u32 = 10;

#[derive(Copy, Clone, PartialEq, Debug)]
#[repr(u32)]
pub enum UnitActivity {
    StartingUp = 0x01,
    ShuttingDown = 0x02,
}

impl ActivityFlag for UnitActivity {
    const ALL: &'static [Self] =
        &[UnitActivity::StartingUp, UnitActivity::ShuttingDown];
    fn bit(self) -> u32 {
        self as u32
    }
}

#[derive(Clone, Debug)]
pub struct UnitParams {
    /// Polling grain for the startup and shutdown waits.
    pub wait_grain: Duration,
    pub connect_timeout: Duration,
    pub home_timeout: Duration,
}

impl Default for UnitParams {
    fn default() -> Self {
        UnitParams {
            wait_grain: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(30),
            home_timeout: Duration::from_secs(120),
        }
    }
}

/// Snapshot of the whole unit, serialized for the status command.
#[derive(Clone, Debug, Serialize)]
pub struct UnitStatus {
    /// RFC 3339 UTC of the snapshot.
    pub time: String,

    pub connected: bool,
    pub operational: bool,
    pub why_not_operational: Vec<String>,

    /// Unit-level activity names plus the live session names.
    pub activities: Vec<String>,
    pub acquiring: bool,
    pub guiding: bool,
    pub autofocusing: bool,
    pub correcting: bool,
    pub busy: bool,

    pub mount: MountStatus,
    pub mount_activities: Vec<String>,
    pub camera: CameraStatus,
    pub camera_activities: Vec<String>,
    pub focuser: FocuserStatus,
    pub focuser_activities: Vec<String>,
    pub stage: StageStatus,
    pub stage_activities: Vec<String>,
    pub covers: CoversStatus,
    pub covers_activities: Vec<String>,

    /// Present while a guide session is running.
    pub guide_quality: Option<GuideQuality>,
    pub last_acquisition: Option<AcquireOutcome>,
    pub last_autofocus: Option<FocusOutcome>,
}

/// Result envelope for the unit commands: whether the command was accepted
/// or ran to completion, its errors, and a fresh status snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct OpResponse {
    pub succeeded: bool,
    pub errors: Vec<String>,
    pub status: UnitStatus,
}

struct UnitState {
    correcting: bool,
}

/// Owns the devices and the session workers, and serializes the commands
/// that drive them. One session (acquiring, guiding, autofocusing, or a
/// one-shot correction) runs at a time; a second start is rejected without
/// disturbing the running session.
pub struct Unit {
    camera: Arc<CameraUnit>,
    mount: Arc<MountUnit>,
    focuser: Arc<FocuserUnit>,
    stage: Arc<StageUnit>,
    covers: Arc<CoversUnit>,
    engine: Arc<Mutex<CorrectionEngine>>,
    guider: Arc<Guider>,
    acquirer: Acquirer,
    autofocuser: Autofocuser,
    activities: Mutex<ActivitySet<UnitActivity>>,

    // Guards session starts: held across the busy check and the component
    // start so two commands cannot both see an idle unit.
    state: Mutex<UnitState>,
    params: UnitParams,
}

impl Unit {
    pub fn new(camera: Arc<CameraUnit>, mount: Arc<MountUnit>,
               focuser: Arc<FocuserUnit>, stage: Arc<StageUnit>,
               covers: Arc<CoversUnit>, solver_addr: &str,
               params: UnitParams) -> Self {
        let engine = Arc::new(Mutex::new(CorrectionEngine::new(
            camera.clone(), mount.clone(), solver_addr)));
        let guider = Arc::new(Guider::new(camera.clone(), mount.clone(),
                                          engine.clone()));
        let acquirer = Acquirer::new(camera.clone(), mount.clone(),
                                     stage.clone(), engine.clone(),
                                     guider.clone());
        let autofocuser = Autofocuser::new(camera.clone(), mount.clone(),
                                           focuser.clone(), stage.clone(),
                                           solver_addr);
        Unit {
            camera,
            mount,
            focuser,
            stage,
            covers,
            engine,
            guider,
            acquirer,
            autofocuser,
            activities: Mutex::new(ActivitySet::<UnitActivity>::new("unit")),
            state: Mutex::new(UnitState { correcting: false }),
            params,
        }
    }

    pub fn connected(&self) -> bool {
        self.camera.is_connected() && self.mount.status().connected &&
            self.focuser.is_connected() && self.stage.is_connected() &&
            self.covers.is_connected()
    }

    pub fn operational(&self) -> bool {
        self.why_not_operational().is_empty()
    }

    pub fn why_not_operational(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.camera.is_connected() {
            reasons.push("camera is not connected".to_string());
        }
        let mount = self.mount.status();
        if !mount.connected {
            reasons.push("mount is not connected".to_string());
        } else if !mount.axis0_enabled || !mount.axis1_enabled {
            reasons.push("mount axes are not enabled".to_string());
        }
        if !self.focuser.is_connected() {
            reasons.push("focuser is not connected".to_string());
        }
        if !self.stage.is_connected() {
            reasons.push("stage is not connected".to_string());
        }
        if !self.covers.is_connected() {
            reasons.push("covers are not connected".to_string());
        }
        reasons
    }

    pub fn status(&self) -> UnitStatus {
        let acquiring = self.acquirer.is_acquiring();
        let guiding = self.guider.is_guiding();
        let autofocusing = self.autofocuser.is_running();
        let correcting = self.state.lock().unwrap().correcting;
        let mut activities = self.activities.lock().unwrap().active_names();
        if acquiring {
            activities.push("Acquiring".to_string());
        }
        if guiding {
            activities.push("Guiding".to_string());
        }
        if autofocusing {
            activities.push("Autofocusing".to_string());
        }
        if correcting {
            activities.push("Correcting".to_string());
        }
        let why_not_operational = self.why_not_operational();
        UnitStatus {
            time: Utc::now().to_rfc3339(),
            connected: self.connected(),
            operational: why_not_operational.is_empty(),
            why_not_operational,
            activities,
            acquiring,
            guiding,
            autofocusing,
            correcting,
            busy: acquiring || guiding || autofocusing || correcting,
            mount: self.mount.status(),
            mount_activities: self.mount.active_names(),
            camera: self.camera.status(),
            camera_activities: self.camera.active_names(),
            focuser: self.focuser.status(),
            focuser_activities: self.focuser.active_names(),
            stage: self.stage.status(),
            stage_activities: self.stage.active_names(),
            covers: self.covers.status(),
            covers_activities: self.covers.active_names(),
            guide_quality: if guiding {
                Some(self.guider.quality())
            } else {
                None
            },
            last_acquisition: self.acquirer.last_outcome(),
            last_autofocus: self.autofocuser.last_outcome(),
        }
    }

    // What the unit is occupied with, None when idle. Callers hold the
    // state lock so the answer stays true across a follow-on start.
    fn busy_reason(&self, state: &UnitState) -> Option<String> {
        let activities = self.activities.lock().unwrap();
        if activities.is_active(UnitActivity::StartingUp) {
            return Some("starting up".to_string());
        }
        if activities.is_active(UnitActivity::ShuttingDown) {
            return Some("shutting down".to_string());
        }
        drop(activities);
        if self.acquirer.is_acquiring() {
            return Some("acquiring".to_string());
        }
        if self.guider.is_guiding() {
            return Some("guiding".to_string());
        }
        if self.autofocuser.is_running() {
            return Some("autofocusing".to_string());
        }
        if state.correcting {
            return Some("correcting".to_string());
        }
        None
    }

    fn respond(&self, result: Result<(), CanonicalError>) -> OpResponse {
        match result {
            Ok(()) => OpResponse {
                succeeded: true,
                errors: Vec::new(),
                status: self.status(),
            },
            Err(e) => self.failure(&e.message),
        }
    }

    fn failure(&self, message: &str) -> OpResponse {
        OpResponse {
            succeeded: false,
            errors: vec![message.to_string()],
            status: self.status(),
        }
    }

    /// Brings the unit to its operational state: waits for the pollers to
    /// connect every device, optionally homes the mount, and opens the
    /// covers. Runs in the caller's thread; `cancelled` aborts the waits.
    pub fn startup(&self, home_mount: bool, cancelled: &dyn Fn() -> bool)
                   -> OpResponse {
        let rejection = {
            let state = self.state.lock().unwrap();
            match self.busy_reason(&state) {
                Some(reason) => Some(reason),
                None => {
                    self.activities.lock().unwrap()
                        .start(UnitActivity::StartingUp);
                    None
                }
            }
        };
        if let Some(reason) = rejection {
            return self.failure(
                &format!("Cannot start up: unit is {}", reason));
        }
        let result = self.run_startup(home_mount, cancelled);
        self.activities.lock().unwrap().end(UnitActivity::StartingUp);
        self.respond(result)
    }

    fn run_startup(&self, home_mount: bool, cancelled: &dyn Fn() -> bool)
                   -> Result<(), CanonicalError> {
        info!("unit: starting up");
        self.wait_all_connected(cancelled)?;
        // The covers and the homing proceed together; both are observed to
        // completion by the device pollers.
        let open_covers = self.covers.status().state != CoverState::Open;
        if open_covers {
            self.covers.open()?;
        }
        if home_mount {
            self.mount.find_home()?;
            self.mount.wait_slew_complete(cancelled, self.params.wait_grain,
                                          Some(self.params.home_timeout))?;
        }
        if open_covers {
            self.covers.wait_for_state(CoverState::Open,
                                       self.params.wait_grain, cancelled)?;
        }
        info!("unit: ready");
        Ok(())
    }

    fn wait_all_connected(&self, cancelled: &dyn Fn() -> bool)
                          -> Result<(), CanonicalError> {
        wait_until("all devices to connect",
                   || Ok(self.connected()),
                   cancelled, self.params.wait_grain,
                   Some(self.params.connect_timeout))
    }

    /// Returns the unit to its idle state: ends any running session, quiets
    /// the mount, and closes the covers.
    pub fn shutdown(&self, cancelled: &dyn Fn() -> bool) -> OpResponse {
        let rejected = {
            let _state = self.state.lock().unwrap();
            let mut activities = self.activities.lock().unwrap();
            if activities.is_any_active(&[UnitActivity::StartingUp,
                                          UnitActivity::ShuttingDown]) {
                true
            } else {
                activities.start(UnitActivity::ShuttingDown);
                false
            }
        };
        if rejected {
            return self.failure(
                "Cannot shut down: startup or shutdown is in progress");
        }
        let result = self.run_shutdown(cancelled);
        self.activities.lock().unwrap().end(UnitActivity::ShuttingDown);
        self.respond(result)
    }

    fn run_shutdown(&self, cancelled: &dyn Fn() -> bool)
                    -> Result<(), CanonicalError> {
        info!("unit: shutting down");
        // Sessions end before the hardware is told to stop. An acquisition
        // that has handed off to guiding shows up in the guider stop.
        if self.acquirer.is_acquiring() {
            let _ = self.acquirer.stop();
        }
        if self.guider.is_guiding() {
            let _ = self.guider.stop();
        }
        if self.autofocuser.is_running() {
            let _ = self.autofocuser.stop();
        }
        let mount = self.mount.status();
        if mount.connected {
            if mount.is_tracking {
                self.mount.set_tracking(false)?;
            }
            self.mount.stop_motion()?;
        }
        if self.covers.is_connected() &&
            self.covers.status().state != CoverState::Closed {
            self.covers.close()?;
            self.covers.wait_for_state(CoverState::Closed,
                                       self.params.wait_grain, cancelled)?;
        }
        info!("unit: shutdown complete");
        Ok(())
    }

    pub fn acquire(&self, params: AcquireParams) -> OpResponse {
        let result = {
            let state = self.state.lock().unwrap();
            match self.busy_reason(&state) {
                Some(reason) => Err(failed_precondition_error(
                    &format!("Cannot acquire: unit is {}", reason))),
                None => self.acquirer.start(params),
            }
        };
        self.respond(result)
    }

    pub fn stop_acquisition(&self) -> OpResponse {
        self.respond(self.acquirer.stop())
    }

    pub fn start_guiding(&self, params: GuideParams) -> OpResponse {
        let result = {
            let state = self.state.lock().unwrap();
            match self.busy_reason(&state) {
                Some(reason) => Err(failed_precondition_error(
                    &format!("Cannot guide: unit is {}", reason))),
                None => self.guider.start(params),
            }
        };
        self.respond(result)
    }

    pub fn stop_guiding(&self) -> OpResponse {
        self.respond(self.guider.stop())
    }

    pub fn start_autofocus(&self, params: AutofocusParams) -> OpResponse {
        let result = {
            let state = self.state.lock().unwrap();
            match self.busy_reason(&state) {
                Some(reason) => Err(failed_precondition_error(
                    &format!("Cannot autofocus: unit is {}", reason))),
                None => self.autofocuser.start(params),
            }
        };
        self.respond(result)
    }

    pub fn stop_autofocus(&self) -> OpResponse {
        self.respond(self.autofocuser.stop())
    }

    /// Runs a single solve_and_correct cycle in the caller's thread. The
    /// given `max_tries` is replaced with the one-shot budget.
    pub fn solve_and_correct(&self, params: &CorrectionParams,
                             cancelled: &dyn Fn() -> bool) -> OpResponse {
        let rejection = {
            let mut state = self.state.lock().unwrap();
            match self.busy_reason(&state) {
                Some(reason) => Some(reason),
                None => {
                    state.correcting = true;
                    None
                }
            }
        };
        if let Some(reason) = rejection {
            return self.failure(&format!("Cannot solve: unit is {}", reason));
        }
        let mut one_shot = params.clone();
        one_shot.max_tries = ONE_SHOT_SOLVE_TRIES;
        let outcome = self.engine.lock().unwrap()
            .solve_and_correct(&one_shot, cancelled);
        self.state.lock().unwrap().correcting = false;
        let mut errors = Vec::new();
        if !outcome.converged {
            errors.push(format!("solve and correct: {}", outcome.summary()));
            errors.extend(outcome.failures);
        }
        OpResponse {
            succeeded: outcome.converged,
            errors,
            status: self.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::thread;
    use super::*;
    use crate::astro_util::Coordinate;
    use crate::hardware::ExposureSettings;
    use crate::simulator::{Simulator, SimulatorConfig};
    use crate::solver_sim::{ScriptedSolve, SolverSimConfig, SolverSimulator};

    struct Fixture {
        mount: Arc<MountUnit>,
        covers: Arc<CoversUnit>,
        unit: Unit,
    }

    fn fixture(solver_addr: &str) -> Fixture {
        let sim = Simulator::new(SimulatorConfig::default());
        let camera = Arc::new(CameraUnit::new(
            Box::new(sim.camera()), Duration::from_millis(10)));
        let mount = Arc::new(MountUnit::new(
            Box::new(sim.mount()), Duration::from_millis(10)));
        let focuser = Arc::new(FocuserUnit::new(
            Box::new(sim.focuser()), Duration::from_millis(10)));
        let stage = Arc::new(StageUnit::new(
            Box::new(sim.stage()), Duration::from_millis(10)));
        let covers = Arc::new(CoversUnit::new(
            Box::new(sim.covers()), Duration::from_millis(10)));
        let unit = Unit::new(camera, mount.clone(), focuser, stage,
                             covers.clone(), solver_addr,
                             UnitParams {
                                 wait_grain: Duration::from_millis(10),
                                 connect_timeout: Duration::from_secs(5),
                                 home_timeout: Duration::from_secs(5),
                             });
        Fixture { mount, covers, unit }
    }

    fn wait_ready(unit: &Unit) {
        for _ in 0..100 {
            if unit.operational() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("Unit never became operational");
    }

    fn fast_guide_params(test: &str) -> GuideParams {
        GuideParams {
            exposure: ExposureSettings::new(Duration::from_millis(20), 1),
            cadence: Duration::from_millis(100),
            solve_poll_period: Duration::from_millis(10),
            mount_settle: Duration::from_millis(20),
            slew_wait_grain: Duration::from_millis(10),
            shm_key: format!("kestrel_unit_{}_{}",
                             test, std::process::id()),
            ..Default::default()
        }
    }

    #[test]
    fn test_startup_homes_mount_and_opens_covers() {
        let solver = SolverSimulator::start(
            SolverSimConfig::default()).unwrap();
        let fixture = fixture(&solver.addr());
        wait_ready(&fixture.unit);
        // Leave the mount off home so the homing leg has work to do.
        fixture.mount.slew_to(&Coordinate::new(200.0, 20.0)).unwrap();
        fixture.mount.wait_slew_complete(
            &|| false, Duration::from_millis(10),
            Some(Duration::from_secs(2))).unwrap();

        let response = fixture.unit.startup(true, &|| false);
        assert!(response.succeeded, "errors: {:?}", response.errors);
        assert!(response.status.operational,
                "not operational: {:?}", response.status.why_not_operational);
        assert!(response.status.activities.is_empty());
        assert_eq!(fixture.covers.status().state, CoverState::Open);
        // Homing returned the mount to its power-on position.
        let home = fixture.mount.position();
        assert_abs_diff_eq!(home.ra, 180.0, epsilon = 0.001);
        assert_abs_diff_eq!(home.dec, 45.0, epsilon = 0.001);
    }

    #[test]
    fn test_shutdown_closes_covers_and_stops_tracking() {
        let solver = SolverSimulator::start(
            SolverSimConfig::default()).unwrap();
        let fixture = fixture(&solver.addr());
        assert!(fixture.unit.startup(false, &|| false).succeeded);
        fixture.mount.set_tracking(true).unwrap();
        thread::sleep(Duration::from_millis(50));

        let response = fixture.unit.shutdown(&|| false);
        assert!(response.succeeded, "errors: {:?}", response.errors);
        assert_eq!(fixture.covers.status().state, CoverState::Closed);
        assert!(!fixture.mount.status().is_tracking);
    }

    #[test]
    fn test_shutdown_stops_active_guide_session() {
        let solver = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(10),
            ..Default::default()
        }).unwrap();
        let fixture = fixture(&solver.addr());
        assert!(fixture.unit.startup(false, &|| false).succeeded);

        let response =
            fixture.unit.start_guiding(fast_guide_params("shutguide"));
        assert!(response.succeeded, "errors: {:?}", response.errors);
        assert!(response.status.guiding);
        assert!(response.status.busy);

        let response = fixture.unit.shutdown(&|| false);
        assert!(response.succeeded, "errors: {:?}", response.errors);
        assert!(!response.status.guiding);
        assert_eq!(fixture.covers.status().state, CoverState::Closed);
    }

    #[test]
    fn test_second_session_rejected_while_acquiring() {
        let solver = SolverSimulator::start(
            SolverSimConfig::default()).unwrap();
        let fixture = fixture(&solver.addr());
        assert!(fixture.unit.startup(false, &|| false).succeeded);

        // A long exposure keeps the acquisition busy for the duration of
        // the test.
        let response = fixture.unit.acquire(AcquireParams {
            target: Coordinate::new(180.0, 45.0),
            exposure: ExposureSettings::new(Duration::from_secs(10), 1),
            motion_poll: Duration::from_millis(10),
            post_motion_settle: Duration::from_millis(40),
            shm_key: format!("kestrel_unit_overlap_{}", std::process::id()),
            ..Default::default()
        });
        assert!(response.succeeded, "errors: {:?}", response.errors);
        assert!(response.status.acquiring);
        assert!(response.status.activities.iter().any(|a| a == "Acquiring"));

        let rejected = fixture.unit.start_guiding(GuideParams::default());
        assert!(!rejected.succeeded);
        assert!(rejected.errors[0].contains("acquiring"),
                "errors: {:?}", rejected.errors);
        let rejected = fixture.unit.startup(false, &|| false);
        assert!(!rejected.succeeded);
        // The running session was not disturbed.
        assert!(fixture.unit.status().acquiring);

        let stopped = fixture.unit.stop_acquisition();
        assert!(stopped.succeeded, "errors: {:?}", stopped.errors);
        assert!(stopped.status.last_acquisition.unwrap().cancelled);
        assert!(!fixture.unit.status().busy);
    }

    #[test]
    fn test_one_shot_solve_and_correct() {
        let solver = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(10),
            ..Default::default()
        }).unwrap();
        solver.push_solve(ScriptedSolve::Deltas {
            ra_arcsec: 3.0, dec_arcsec: 0.0 });
        let fixture = fixture(&solver.addr());
        assert!(fixture.unit.startup(false, &|| false).succeeded);

        let params = CorrectionParams {
            target: fixture.mount.position(),
            exposure: ExposureSettings::new(Duration::from_millis(20), 1),
            solve_poll_period: Duration::from_millis(10),
            mount_settle: Duration::from_millis(20),
            slew_wait_grain: Duration::from_millis(10),
            shm_key: format!("kestrel_unit_solve_{}", std::process::id()),
            ..Default::default()
        };
        let response = fixture.unit.solve_and_correct(&params, &|| false);
        assert!(response.succeeded, "errors: {:?}", response.errors);
        assert!(!response.status.correcting);
    }

    #[test]
    fn test_status_snapshot_serializes() {
        let solver = SolverSimulator::start(
            SolverSimConfig::default()).unwrap();
        let fixture = fixture(&solver.addr());
        wait_ready(&fixture.unit);

        let status = fixture.unit.status();
        assert!(status.connected);
        assert!(status.operational,
                "not operational: {:?}", status.why_not_operational);
        assert!(!status.busy);
        assert!(status.activities.is_empty());
        let json = serde_json::to_string_pretty(&status).unwrap();
        assert!(json.contains("\"mount\""));
        assert!(json.contains("\"covers\""));
    }

    #[test]
    fn test_stop_without_session_reports_error() {
        let solver = SolverSimulator::start(
            SolverSimConfig::default()).unwrap();
        let fixture = fixture(&solver.addr());
        wait_ready(&fixture.unit);

        let response = fixture.unit.stop_guiding();
        assert!(!response.succeeded);
        assert!(response.errors[0].contains("Not guiding"));
        assert!(!fixture.unit.stop_acquisition().succeeded);
        assert!(!fixture.unit.stop_autofocus().succeeded);
    }
}  // mod tests.
