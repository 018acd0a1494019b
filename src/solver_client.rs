// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::cmp::min;
use std::ffi::c_void;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error,
                      internal_error, invalid_argument_error,
                      not_found_error, unavailable_error};
use log::{debug, info, warn};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::astro_util::Coordinate;
use crate::hardware::ImageFrame;

pub const DEFAULT_SOLVER_PORT: u16 = 9897;

/// Shared memory key used for solver image handoff when the caller does not
/// supply one.
pub const DEFAULT_SHM_KEY: &str = "PlateSolving_Image";

// Connect retry schedule.
const CONNECT_BUDGET: Duration = Duration::from_secs(5);
const CONNECT_INITIAL_DELAY: Duration = Duration::from_millis(50);
const CONNECT_MAX_DELAY: Duration = Duration::from_millis(1600);

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// A successful plate solve, as reported by the solver process. Angles are
/// J2000 radians on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlateSolution {
    pub num_matched_stars: i32,
    pub match_rms_error_arcsec: f64,
    pub match_rms_error_pixels: f64,
    pub center_ra_j2000_rads: f64,
    pub center_dec_j2000_rads: f64,
    pub matched_arcsec_per_pixel: f64,
    pub rotation_angle_degs: f64,
}

impl PlateSolution {
    /// The solved boresight in degrees.
    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.center_ra_j2000_rads.to_degrees(),
                        self.center_dec_j2000_rads.to_degrees())
    }
}

/// One `platesolve_status` response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SolveStatus {
    /// One of: ready, loading, extracting, matching, found_match, no_match,
    /// error.
    pub state: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub last_log_message: Option<String>,
    #[serde(default)]
    pub num_extracted_stars: Option<i32>,
    #[serde(default)]
    pub running_time_seconds: Option<f64>,
    #[serde(default)]
    pub solution: Option<PlateSolution>,
}

/// Terminal classification of a solve attempt.
#[derive(Clone, Debug)]
pub enum SolveOutcome {
    FoundMatch(PlateSolution),
    NoMatch,
    Error(String),
}

impl SolveOutcome {
    /// The solution, with unsolved outcomes mapped to canonical errors.
    pub fn into_solution(self) -> Result<PlateSolution, CanonicalError> {
        match self {
            SolveOutcome::FoundMatch(solution) => Ok(solution),
            SolveOutcome::NoMatch => Err(not_found_error("No solver match")),
            SolveOutcome::Error(message) => Err(internal_error(&message)),
        }
    }
}

impl SolveStatus {
    /// None while the solve is still running.
    pub fn outcome(&self) -> Option<SolveOutcome> {
        match self.state.as_str() {
            "found_match" => match &self.solution {
                Some(solution) => Some(SolveOutcome::FoundMatch(solution.clone())),
                None => Some(SolveOutcome::Error(
                    "found_match status carried no solution".to_string())),
            },
            "no_match" => Some(SolveOutcome::NoMatch),
            "error" => Some(SolveOutcome::Error(
                self.error_message.clone()
                    .unwrap_or_else(|| "unknown solver error".to_string()))),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FocusSample {
    pub is_valid: bool,
    pub focus_position: f64,
    pub num_stars: i32,
    pub star_rms_diameter_pixels: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FocusAnalysisResult {
    pub has_solution: bool,
    pub best_focus_position: f64,

    /// Expected RMS star diameter at the best focus position, in pixels.
    pub best_star_diameter: f64,

    /// Uncertainty of `best_focus_position`, in focuser ticks.
    pub tolerance: f64,
    pub vcurve_a: f64,
    pub vcurve_b: f64,
    pub vcurve_c: f64,
    pub focus_samples: Vec<FocusSample>,
}

/// One `analyze_focus_status` response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FocusStatus {
    pub is_running: bool,
    #[serde(default)]
    pub last_log_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub analysis_result: Option<FocusAnalysisResult>,
}

/// How the image reaches the solver process.
#[derive(Clone, Debug)]
pub enum SolveImage {
    /// Solver loads the file itself.
    File(PathBuf),
    /// Pixels are already in the named shared memory segment.
    Shm { key: String, width: usize, height: usize },
}

#[derive(Clone, Debug)]
pub struct SolveParams {
    pub arcsec_per_pixel: f64,

    /// J2000 degrees. Narrows the solver's search when present.
    pub position_guess: Option<Coordinate>,

    pub enable_all_sky_match: bool,
    pub enable_local_quad_match: bool,
    pub enable_local_triangle_match: bool,
}

impl Default for SolveParams {
    fn default() -> Self {
        SolveParams {
            arcsec_per_pixel: 1.0,
            position_guess: None,
            enable_all_sky_match: true,
            enable_local_quad_match: true,
            enable_local_triangle_match: true,
        }
    }
}

/// Line-oriented JSON client for the plate solver process. Each request is
/// a JSON object terminated by a blank line (CRLF CRLF); the response uses
/// the same framing, with either a `result` or an `error` member.
pub struct SolverClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl SolverClient {
    pub fn new(addr: &str) -> Self {
        SolverClient { addr: addr.to_string(), stream: None }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connects to the solver, retrying with exponential backoff for up to
    /// five seconds. No-op when already connected.
    pub fn connect(&mut self) -> Result<(), CanonicalError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let start = Instant::now();
        let mut delay = CONNECT_INITIAL_DELAY;
        loop {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(|e| unavailable_error(
                        &format!("Solver connection setup failed: {:?}", e)))?;
                    stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(
                        |e| unavailable_error(
                            &format!("Solver connection setup failed: {:?}", e)))?;
                    stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(
                        |e| unavailable_error(
                            &format!("Solver connection setup failed: {:?}", e)))?;
                    info!("Connected to solver at {}", self.addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    if start.elapsed() > CONNECT_BUDGET {
                        return Err(unavailable_error(
                            &format!("Cannot connect to solver at {}: {:?}",
                                     self.addr, e)));
                    }
                    debug!("Solver connect to {} failed ({:?}), retrying in {:?}",
                           self.addr, e, delay);
                    thread::sleep(delay);
                    delay = min(delay * 2, CONNECT_MAX_DELAY);
                }
            }
        }
    }

    pub fn begin_solve(&mut self, image: &SolveImage, params: &SolveParams)
                       -> Result<(), CanonicalError> {
        let mut request = json!({
            "arcsec_per_pixel": params.arcsec_per_pixel,
            "enable_all_sky_match": params.enable_all_sky_match,
            "enable_local_quad_match": params.enable_local_quad_match,
            "enable_local_triangle_match": params.enable_local_triangle_match,
        });
        match image {
            SolveImage::File(path) => {
                request["image_file_path"] = json!(path.to_string_lossy());
            }
            SolveImage::Shm { key, width, height } => {
                request["shm_image"] = json!({
                    "shm_key": key,
                    "width_pixels": width,
                    "height_pixels": height,
                });
            }
        }
        if let Some(guess) = &params.position_guess {
            request["ra_guess_j2000_rads"] = json!(guess.ra.to_radians());
            request["dec_guess_j2000_rads"] = json!(guess.dec.to_radians());
        }
        self.call("begin_platesolve", request)?;
        Ok(())
    }

    pub fn solve_status(&mut self) -> Result<SolveStatus, CanonicalError> {
        let result = self.call("platesolve_status", json!({}))?;
        serde_json::from_value(result).map_err(|e| internal_error(
            &format!("Malformed platesolve_status response: {:?}", e)))
    }

    pub fn cancel_solve(&mut self) -> Result<(), CanonicalError> {
        self.call("platesolve_cancel", json!({}))?;
        Ok(())
    }

    /// Submits focus sweep images for V-curve analysis. The solver reads
    /// the files from disk, so the paths must be visible to it.
    pub fn analyze_focus(&mut self, files: &[PathBuf])
                         -> Result<(), CanonicalError> {
        let files: Vec<String> =
            files.iter().map(|f| f.to_string_lossy().into_owned()).collect();
        self.call("analyze_focus", json!({"files": files}))?;
        Ok(())
    }

    pub fn focus_status(&mut self) -> Result<FocusStatus, CanonicalError> {
        let result = self.call("analyze_focus_status", json!({}))?;
        serde_json::from_value(result).map_err(|e| internal_error(
            &format!("Malformed analyze_focus_status response: {:?}", e)))
    }

    fn call(&mut self, method: &str, params: serde_json::Value)
            -> Result<serde_json::Value, CanonicalError> {
        self.connect()?;
        let request = json!({"method": method, "params": params});
        let mut payload = serde_json::to_vec(&request).map_err(
            |e| internal_error(&format!("Cannot encode request: {:?}", e)))?;
        payload.extend_from_slice(b"\r\n\r\n");

        let stream = self.stream.as_mut().unwrap();
        if let Err(e) = stream.write_all(&payload) {
            self.stream = None;
            return Err(unavailable_error(
                &format!("Solver connection lost during {}: {:?}", method, e)));
        }
        let response = match Self::read_response(stream) {
            Ok(r) => r,
            Err(e) => {
                self.stream = None;
                return Err(unavailable_error(
                    &format!("Solver connection lost during {}: {:?}",
                             method, e)));
            }
        };
        let value: serde_json::Value = serde_json::from_slice(&response)
            .map_err(|e| internal_error(
                &format!("Malformed solver response to {}: {:?}", method, e)))?;
        if let Some(error) = value.get("error") {
            let message = error.as_str().map(|s| s.to_string())
                .unwrap_or_else(|| error.to_string());
            warn!("Solver rejected {}: {}", method, message);
            return Err(internal_error(
                &format!("Solver error for {}: {}", method, message)));
        }
        value.get("result").cloned().ok_or_else(|| internal_error(
            &format!("Solver response to {} has neither result nor error",
                     method)))
    }

    // Reads bytes until the CRLF CRLF delimiter; returns the bytes before it.
    fn read_response(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "solver closed the connection"));
            }
            buffer.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                buffer.truncate(pos);
                return Ok(buffer);
            }
        }
    }
}

/// A named POSIX shared memory segment holding one 16 bit grayscale image,
/// row major, for zero-copy handoff to the solver process. The creator owns
/// the segment and unlinks it on drop.
pub struct SharedImage {
    key: String,
    ptr: NonNull<c_void>,
    len: usize,
    width: usize,
    height: usize,
    owner: bool,
}

// The mapping is plain memory private to this struct.
unsafe impl Send for SharedImage {}

impl SharedImage {
    /// Creates (or reuses) the segment and maps it read/write.
    pub fn create(key: &str, width: usize, height: usize)
                  -> Result<Self, CanonicalError> {
        Self::map(key, width, height, true)
    }

    /// Maps an existing segment read-only.
    pub fn open(key: &str, width: usize, height: usize)
                -> Result<Self, CanonicalError> {
        Self::map(key, width, height, false)
    }

    fn map(key: &str, width: usize, height: usize, owner: bool)
           -> Result<Self, CanonicalError> {
        let len = width * height * std::mem::size_of::<u16>();
        let nz_len = NonZeroUsize::new(len).ok_or_else(
            || invalid_argument_error("Zero-sized shared image"))?;
        let path = format!("/{}", key);
        let (oflag, prot) = if owner {
            (OFlag::O_CREAT | OFlag::O_RDWR,
             ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        } else {
            (OFlag::O_RDONLY, ProtFlags::PROT_READ)
        };
        let fd = shm_open(path.as_str(), oflag, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| failed_precondition_error(
                &format!("shm_open({}) failed: {}", path, e)))?;
        if owner {
            ftruncate(&fd, len as i64).map_err(|e| failed_precondition_error(
                &format!("ftruncate({}) failed: {}", path, e)))?;
        }
        let ptr = unsafe {
            mmap(None, nz_len, prot, MapFlags::MAP_SHARED, &fd, 0)
        }.map_err(|e| failed_precondition_error(
            &format!("mmap({}) failed: {}", path, e)))?;
        Ok(SharedImage { key: key.to_string(), ptr, len, width, height, owner })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }

    /// Copies the frame's pixels into the segment. The frame must match the
    /// segment's geometry.
    pub fn write_frame(&mut self, frame: &ImageFrame)
                       -> Result<(), CanonicalError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(invalid_argument_error(
                &format!("Frame is {}x{}, segment is {}x{}",
                         frame.width, frame.height, self.width, self.height)));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                frame.data.as_ptr(),
                self.ptr.as_ptr() as *mut u16,
                self.width * self.height);
        }
        Ok(())
    }

    /// Copies the segment's pixels out.
    pub fn read_pixels(&self) -> Vec<u16> {
        let mut pixels = vec![0u16; self.width * self.height];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr() as *const u16,
                pixels.as_mut_ptr(),
                pixels.len());
        }
        pixels
    }
}

impl Drop for SharedImage {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
        if self.owner {
            let path = format!("/{}", self.key);
            if let Err(e) = shm_unlink(path.as_str()) {
                warn!("shm_unlink({}) failed: {}", path, e);
            }
        }
    }
}

/// Removes a leftover segment, e.g. from a crashed predecessor. Missing
/// segment is not an error.
pub fn remove_shared_image(key: &str) {
    let path = format!("/{}", key);
    let _ = shm_unlink(path.as_str());
}

// mod tests.
