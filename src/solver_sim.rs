// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, unavailable_error};
use log::{debug, info, warn};
use serde_json::json;

use crate::astro_util::{ARCSEC_PER_DEG, Coordinate};
use crate::solver_client::{FocusAnalysisResult, PlateSolution, SharedImage};

/// What the simulated solver should report for one platesolve request.
#[derive(Clone, Debug)]
pub enum ScriptedSolve {
    /// Succeed, with the solved center displaced from the request's position
    /// guess by the given on-sky amounts. The convergence loop then measures
    /// exactly these deltas.
    Deltas { ra_arcsec: f64, dec_arcsec: f64 },
    NoMatch,
    Error(String),
    /// Never finish; only a cancel (or new request) clears it.
    Hang,
}

pub struct SolverSimConfig {
    /// How long a platesolve "runs" before its outcome is reported.
    pub solve_latency: Duration,

    /// How long a focus analysis "runs".
    pub focus_latency: Duration,

    /// Outcome used when the solve script is empty.
    pub default_outcome: ScriptedSolve,

    /// Solved center when a request carries no position guess.
    pub fallback_center: Coordinate,

    pub rotation_angle_degs: f64,
}

impl Default for SolverSimConfig {
    fn default() -> Self {
        SolverSimConfig {
            solve_latency: Duration::from_millis(30),
            focus_latency: Duration::from_millis(30),
            default_outcome: ScriptedSolve::Deltas {
                ra_arcsec: 0.0, dec_arcsec: 0.0 },
            fallback_center: Coordinate::new(180.0, 45.0),
            rotation_angle_degs: 0.0,
        }
    }
}

struct SolveSession {
    outcome: ScriptedSolve,
    started: Instant,
    ready_at: Instant,
    guess: Option<Coordinate>,
    arcsec_per_pixel: f64,
}

struct FocusSession {
    result: FocusAnalysisResult,
    ready_at: Instant,
}

struct SimState {
    config: SolverSimConfig,
    stop_request: bool,
    worker_thread: Option<thread::JoinHandle<()>>,

    solve_script: VecDeque<ScriptedSolve>,
    focus_script: VecDeque<FocusAnalysisResult>,
    solve_session: Option<SolveSession>,
    focus_session: Option<FocusSession>,

    /// Method name of every request received, in order.
    request_log: Vec<String>,

    /// Sum of the pixels of the most recent shared memory image.
    last_shm_pixel_sum: Option<u64>,
    last_focus_files: Vec<String>,
}

/// A stand-in for the external plate solver process: listens on a loopback
/// port, speaks the solver's framed JSON protocol, and answers according to
/// a script. Used by tests and by the server's simulate mode.
pub struct SolverSimulator {
    addr: String,
    state: Arc<Mutex<SimState>>,
}

impl Drop for SolverSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SolverSimulator {
    pub fn start(config: SolverSimConfig) -> Result<Self, CanonicalError> {
        let listener = TcpListener::bind("127.0.0.1:0").map_err(
            |e| unavailable_error(
                &format!("Cannot bind solver simulator: {:?}", e)))?;
        listener.set_nonblocking(true).map_err(
            |e| unavailable_error(
                &format!("Cannot configure solver simulator: {:?}", e)))?;
        let addr = listener.local_addr().map_err(
            |e| unavailable_error(
                &format!("Cannot configure solver simulator: {:?}", e)))?
            .to_string();
        let state = Arc::new(Mutex::new(SimState {
            config,
            stop_request: false,
            worker_thread: None,
            solve_script: VecDeque::new(),
            focus_script: VecDeque::new(),
            solve_session: None,
            focus_session: None,
            request_log: Vec::new(),
            last_shm_pixel_sum: None,
            last_focus_files: Vec::new(),
        }));
        let worker_state = state.clone();
        state.lock().unwrap().worker_thread = Some(thread::spawn(move || {
            Self::worker(listener, worker_state);
        }));
        info!("Solver simulator listening at {}", addr);
        Ok(SolverSimulator { addr, state })
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    pub fn stop(&mut self) {
        let mut locked_state = self.state.lock().unwrap();
        if locked_state.worker_thread.is_none() {
            return;
        }
        locked_state.stop_request = true;
        let worker = locked_state.worker_thread.take().unwrap();
        drop(locked_state);
        let _ = worker.join();
    }

    /// Queues the outcome for the next platesolve request.
    pub fn push_solve(&self, outcome: ScriptedSolve) {
        self.state.lock().unwrap().solve_script.push_back(outcome);
    }

    /// Queues the result for the next focus analysis request.
    pub fn push_focus_result(&self, result: FocusAnalysisResult) {
        self.state.lock().unwrap().focus_script.push_back(result);
    }

    pub fn request_methods(&self) -> Vec<String> {
        self.state.lock().unwrap().request_log.clone()
    }

    pub fn last_shm_pixel_sum(&self) -> Option<u64> {
        self.state.lock().unwrap().last_shm_pixel_sum
    }

    pub fn last_focus_files(&self) -> Vec<String> {
        self.state.lock().unwrap().last_focus_files.clone()
    }

    fn worker(listener: TcpListener, state: Arc<Mutex<SimState>>) {
        loop {
            if state.lock().unwrap().stop_request {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Solver simulator: connection from {}", peer);
                    Self::serve_connection(stream, &state);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    warn!("Solver simulator accept failed: {:?}", e);
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    // Serves framed requests on one connection until EOF or stop.
    fn serve_connection(mut stream: TcpStream, state: &Arc<Mutex<SimState>>) {
        if stream.set_read_timeout(Some(Duration::from_millis(100))).is_err() {
            return;
        }
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if state.lock().unwrap().stop_request {
                return;
            }
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                let request: Vec<u8> = buffer.drain(..pos + 4).collect();
                let response = Self::handle_request(&request[..pos], state);
                let mut payload = response.to_string().into_bytes();
                payload.extend_from_slice(b"\r\n\r\n");
                if stream.write_all(&payload).is_err() {
                    return;
                }
                continue;
            }
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock ||
                    e.kind() == ErrorKind::TimedOut => (),
                Err(_) => return,
            }
        }
    }

    fn handle_request(request: &[u8], state: &Arc<Mutex<SimState>>)
                      -> serde_json::Value {
        let parsed: serde_json::Value = match serde_json::from_slice(request) {
            Ok(v) => v,
            Err(e) => return json!({"error": format!("bad request: {}", e)}),
        };
        let method = match parsed["method"].as_str() {
            Some(m) => m.to_string(),
            None => return json!({"error": "request has no method"}),
        };
        let params = parsed["params"].clone();

        let mut locked_state = state.lock().unwrap();
        locked_state.request_log.push(method.clone());
        match method.as_str() {
            "begin_platesolve" => Self::begin_platesolve(&params, &mut locked_state),
            "platesolve_status" => Self::platesolve_status(&mut locked_state),
            "platesolve_cancel" => {
                locked_state.solve_session = None;
                json!({"result": {}})
            }
            "analyze_focus" => Self::analyze_focus(&params, &mut locked_state),
            "analyze_focus_status" => Self::analyze_focus_status(&mut locked_state),
            _ => json!({"error": format!("unknown method {}", method)}),
        }
    }

    fn begin_platesolve(params: &serde_json::Value, state: &mut SimState)
                        -> serde_json::Value {
        if let Some(session) = &state.solve_session {
            let in_progress = Instant::now() < session.ready_at ||
                matches!(session.outcome, ScriptedSolve::Hang);
            if in_progress {
                return json!({"error": "platesolve already running"});
            }
        }
        let arcsec_per_pixel = match params["arcsec_per_pixel"].as_f64() {
            Some(s) => s,
            None => return json!({"error": "missing arcsec_per_pixel"}),
        };
        if let Some(shm) = params.get("shm_image") {
            let key = shm["shm_key"].as_str().unwrap_or_default().to_string();
            let width = shm["width_pixels"].as_u64().unwrap_or(0) as usize;
            let height = shm["height_pixels"].as_u64().unwrap_or(0) as usize;
            match SharedImage::open(&key, width, height) {
                Ok(segment) => {
                    let sum = segment.read_pixels().iter()
                        .map(|&p| p as u64).sum();
                    state.last_shm_pixel_sum = Some(sum);
                }
                Err(e) => {
                    return json!({"error":
                                  format!("cannot open shm image: {:?}", e)});
                }
            }
        } else if params.get("image_file_path").is_none() {
            return json!({"error": "request has neither file nor shm image"});
        }
        let guess = match (params["ra_guess_j2000_rads"].as_f64(),
                           params["dec_guess_j2000_rads"].as_f64()) {
            (Some(ra), Some(dec)) =>
                Some(Coordinate::new(ra.to_degrees(), dec.to_degrees())),
            _ => None,
        };
        let outcome = state.solve_script.pop_front()
            .unwrap_or_else(|| state.config.default_outcome.clone());
        let now = Instant::now();
        state.solve_session = Some(SolveSession {
            outcome,
            started: now,
            ready_at: now + state.config.solve_latency,
            guess,
            arcsec_per_pixel,
        });
        json!({"result": {}})
    }

    fn platesolve_status(state: &mut SimState) -> serde_json::Value {
        let session = match &state.solve_session {
            None => return json!({"result": {"state": "ready"}}),
            Some(s) => s,
        };
        let running_time = session.started.elapsed().as_secs_f64();
        let in_progress = Instant::now() < session.ready_at ||
            matches!(session.outcome, ScriptedSolve::Hang);
        if in_progress {
            return json!({"result": {
                "state": "matching",
                "last_log_message": "matching stars",
                "num_extracted_stars": 64,
                "running_time_seconds": running_time,
            }});
        }
        match &session.outcome {
            ScriptedSolve::Deltas { ra_arcsec, dec_arcsec } => {
                let center = session.guess.unwrap_or(state.config.fallback_center);
                // Place the solved center so that target minus solved equals
                // the scripted deltas.
                let solved_dec = center.dec - dec_arcsec / ARCSEC_PER_DEG;
                let mean_dec = 0.5 * (center.dec + solved_dec);
                let cos_dec = mean_dec.to_radians().cos().max(1e-6);
                let solved_ra =
                    center.ra - ra_arcsec / (ARCSEC_PER_DEG * cos_dec);
                let solution = PlateSolution {
                    num_matched_stars: 25,
                    match_rms_error_arcsec: 0.4,
                    match_rms_error_pixels: 1.3,
                    center_ra_j2000_rads: solved_ra.to_radians(),
                    center_dec_j2000_rads: solved_dec.to_radians(),
                    matched_arcsec_per_pixel: session.arcsec_per_pixel,
                    rotation_angle_degs: state.config.rotation_angle_degs,
                };
                json!({"result": {
                    "state": "found_match",
                    "num_extracted_stars": 64,
                    "running_time_seconds": running_time,
                    "solution": serde_json::to_value(solution).unwrap_or_default(),
                }})
            }
            ScriptedSolve::NoMatch => json!({"result": {
                "state": "no_match",
                "num_extracted_stars": 9,
                "running_time_seconds": running_time,
            }}),
            ScriptedSolve::Error(message) => json!({"result": {
                "state": "error",
                "error_message": message,
                "running_time_seconds": running_time,
            }}),
            ScriptedSolve::Hang => unreachable!(),
        }
    }

    fn analyze_focus(params: &serde_json::Value, state: &mut SimState)
                     -> serde_json::Value {
        if let Some(session) = &state.focus_session {
            if Instant::now() < session.ready_at {
                return json!({"error": "focus analysis already running"});
            }
        }
        let files: Vec<String> = match params["files"].as_array() {
            Some(array) => array.iter()
                .filter_map(|f| f.as_str().map(|s| s.to_string()))
                .collect(),
            None => return json!({"error": "missing files"}),
        };
        state.last_focus_files = files;
        let result = state.focus_script.pop_front().unwrap_or(
            FocusAnalysisResult {
                has_solution: false,
                best_focus_position: 0.0,
                best_star_diameter: 0.0,
                tolerance: 0.0,
                vcurve_a: 0.0,
                vcurve_b: 0.0,
                vcurve_c: 0.0,
                focus_samples: vec![],
            });
        state.focus_session = Some(FocusSession {
            result,
            ready_at: Instant::now() + state.config.focus_latency,
        });
        json!({"result": {}})
    }

    fn analyze_focus_status(state: &mut SimState) -> serde_json::Value {
        match &state.focus_session {
            None => json!({"result": {"is_running": false}}),
            Some(session) => {
                if Instant::now() < session.ready_at {
                    json!({"result": {
                        "is_running": true,
                        "last_log_message": "fitting vcurve",
                    }})
                } else {
                    json!({"result": {
                        "is_running": false,
                        "last_log_message": "analysis complete",
                        "analysis_result":
                            serde_json::to_value(&session.result)
                                .unwrap_or_default(),
                    }})
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;
    use std::time::SystemTime;
    use super::*;
    use crate::astro_util::pointing_deltas_arcsec;
    use crate::hardware::ImageFrame;
    use crate::solver_client::{SolveImage, SolveOutcome, SolveParams,
                               SolverClient};

    fn poll_outcome(client: &mut SolverClient) -> SolveOutcome {
        loop {
            let status = client.solve_status().unwrap();
            if let Some(outcome) = status.outcome() {
                return outcome;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_scripted_deltas_recovered_by_client() {
        let sim = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(10),
            rotation_angle_degs: 15.0,
            ..Default::default()
        }).unwrap();
        sim.push_solve(ScriptedSolve::Deltas {
            ra_arcsec: 5.0, dec_arcsec: -3.0 });

        let target = Coordinate::new(200.0, 60.0);
        let mut client = SolverClient::new(&sim.addr());
        client.begin_solve(
            &SolveImage::File(PathBuf::from("/tmp/unused.png")),
            &SolveParams {
                arcsec_per_pixel: 0.52,
                position_guess: Some(target),
                ..Default::default()
            }).unwrap();
        match poll_outcome(&mut client) {
            SolveOutcome::FoundMatch(solution) => {
                let (delta_ra, delta_dec) =
                    pointing_deltas_arcsec(&target, &solution.center());
                assert_abs_diff_eq!(delta_ra, 5.0, epsilon = 0.001);
                assert_abs_diff_eq!(delta_dec, -3.0, epsilon = 0.001);
                assert_abs_diff_eq!(solution.rotation_angle_degs, 15.0);
                assert_abs_diff_eq!(solution.matched_arcsec_per_pixel, 0.52);
            }
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_no_match_and_error_outcomes() {
        let sim = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(5),
            ..Default::default()
        }).unwrap();
        sim.push_solve(ScriptedSolve::NoMatch);
        sim.push_solve(ScriptedSolve::Error("bad image".to_string()));

        let mut client = SolverClient::new(&sim.addr());
        let image = SolveImage::File(PathBuf::from("/tmp/unused.png"));
        let params = SolveParams { arcsec_per_pixel: 1.0, ..Default::default() };

        client.begin_solve(&image, &params).unwrap();
        assert!(matches!(poll_outcome(&mut client), SolveOutcome::NoMatch));

        client.begin_solve(&image, &params).unwrap();
        match poll_outcome(&mut client) {
            SolveOutcome::Error(message) => assert_eq!(message, "bad image"),
            other => panic!("Unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_busy_rejection_and_cancel() {
        let sim = SolverSimulator::start(SolverSimConfig::default()).unwrap();
        sim.push_solve(ScriptedSolve::Hang);

        let mut client = SolverClient::new(&sim.addr());
        let image = SolveImage::File(PathBuf::from("/tmp/unused.png"));
        let params = SolveParams { arcsec_per_pixel: 1.0, ..Default::default() };
        client.begin_solve(&image, &params).unwrap();
        // A second begin while the first runs is rejected.
        assert!(client.begin_solve(&image, &params).is_err());

        client.cancel_solve().unwrap();
        let status = client.solve_status().unwrap();
        assert_eq!(status.state, "ready");
        assert_eq!(sim.request_methods(),
                   vec!["begin_platesolve", "begin_platesolve",
                        "platesolve_cancel", "platesolve_status"]);
    }

    #[test]
    fn test_shm_image_reaches_solver() {
        let sim = SolverSimulator::start(SolverSimConfig {
            solve_latency: Duration::from_millis(5),
            ..Default::default()
        }).unwrap();
        let key = format!("kestrel_test_sim_shm_{}", std::process::id());
        let frame = ImageFrame {
            data: vec![7u16; 16],
            width: 4,
            height: 4,
            binning: 1,
            exposure_duration: Duration::from_secs(1),
            capture_time: SystemTime::now(),
        };
        let mut segment = SharedImage::create(&key, 4, 4).unwrap();
        segment.write_frame(&frame).unwrap();

        let mut client = SolverClient::new(&sim.addr());
        client.begin_solve(
            &SolveImage::Shm { key: key.clone(), width: 4, height: 4 },
            &SolveParams { arcsec_per_pixel: 1.0, ..Default::default() })
            .unwrap();
        assert!(matches!(poll_outcome(&mut client),
                         SolveOutcome::FoundMatch(_)));
        assert_eq!(sim.last_shm_pixel_sum(), Some(7 * 16));
    }

    #[test]
    fn test_focus_analysis_script() {
        let sim = SolverSimulator::start(SolverSimConfig {
            focus_latency: Duration::from_millis(10),
            ..Default::default()
        }).unwrap();
        sim.push_focus_result(FocusAnalysisResult {
            has_solution: true,
            best_focus_position: 6100.0,
            best_star_diameter: 2.6,
            tolerance: 20.0,
            vcurve_a: 0.002,
            vcurve_b: -24.0,
            vcurve_c: 75000.0,
            focus_samples: vec![],
        });

        let mut client = SolverClient::new(&sim.addr());
        let files = vec![PathBuf::from("/data/FOCUS06000.png"),
                         PathBuf::from("/data/FOCUS06200.png")];
        client.analyze_focus(&files).unwrap();
        assert!(client.focus_status().unwrap().is_running);
        thread::sleep(Duration::from_millis(20));
        let status = client.focus_status().unwrap();
        assert!(!status.is_running);
        let result = status.analysis_result.unwrap();
        assert!(result.has_solution);
        assert_abs_diff_eq!(result.best_focus_position, 6100.0);
        assert_eq!(sim.last_focus_files(),
                   vec!["/data/FOCUS06000.png", "/data/FOCUS06200.png"]);
    }
}  // mod tests.
