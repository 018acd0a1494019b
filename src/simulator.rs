// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use canonical_error::{CanonicalError, failed_precondition_error,
                      unavailable_error};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::astro_util::{ARCSEC_PER_DEG, Coordinate, normalize_delta_degs};
use crate::hardware::{CameraDriver, CameraStatus, CoverState, CoversDriver,
                      CoversStatus, ExposureSettings, FocuserDriver,
                      FocuserStatus, ImageFrame, MountDriver, MountStatus,
                      StageDriver, StageStatus};

/// Simulated observatory: a star field, a mount whose reported pointing
/// differs from the sky by a drifting error, and the other unit devices.
/// All five drivers share one state object, so an offset applied through
/// the mount driver moves the stars in subsequent camera frames.
pub struct SimulatorConfig {
    pub initial_mount_position: Coordinate,

    /// Where the synthetic stars are placed. None uses the initial mount
    /// position.
    pub star_field_center: Option<Coordinate>,
    pub num_stars: usize,
    pub star_seed: u64,

    pub pixel_scale_at_bin1: f64,
    pub image_width: usize,
    pub image_height: usize,
    pub rotation_angle_degs: f64,

    /// On-sky arcsec by which the true boresight differs from the mount's
    /// reported position at construction time.
    pub initial_pointing_error: (f64, f64),

    /// Arcsec/second added to the pointing error as time passes.
    pub drift_rate: (f64, f64),

    pub slew_duration: Duration,

    /// How long the mount reports is_slewing after an offset.
    pub offset_settle: Duration,

    /// Focuser, stage, and cover motion time.
    pub move_duration: Duration,

    pub axes_enabled_at_start: bool,

    /// Each driver connect() fails this many times before succeeding.
    pub connect_failures: u32,

    pub best_focus_position: i32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            initial_mount_position: Coordinate::new(180.0, 45.0),
            star_field_center: None,
            num_stars: 25,
            star_seed: 7,
            pixel_scale_at_bin1: 0.2612,
            image_width: 256,
            image_height: 256,
            rotation_angle_degs: 0.0,
            initial_pointing_error: (0.0, 0.0),
            drift_rate: (0.0, 0.0),
            slew_duration: Duration::from_millis(50),
            offset_settle: Duration::from_millis(20),
            move_duration: Duration::from_millis(30),
            axes_enabled_at_start: true,
            connect_failures: 0,
            best_focus_position: 6000,
        }
    }
}

struct SimStar {
    ra: f64,
    dec: f64,
    amplitude: f64,
}

struct SimShared {
    config: SimulatorConfig,
    stars: Vec<SimStar>,
    error_epoch: Instant,
    connect_failures_remaining: u32,

    // Mount.
    mount_connected: bool,
    mount_ra: f64,
    mount_dec: f64,
    is_slewing: bool,
    is_tracking: bool,
    axis0_enabled: bool,
    axis1_enabled: bool,
    slew_target: Coordinate,
    slew_end: Instant,

    // Camera. `exposure` is the in-progress exposure and when it completes.
    camera_connected: bool,
    exposure: Option<(ExposureSettings, Instant)>,

    // Focuser.
    focuser_connected: bool,
    focuser_position: i32,
    focuser_moving: bool,
    focuser_target: i32,
    focuser_move_end: Instant,

    // Stage.
    stage_connected: bool,
    stage_position: f64,
    stage_moving: bool,
    stage_target: f64,
    stage_move_end: Instant,

    // Covers.
    covers_connected: bool,
    cover_state: CoverState,
    cover_target: CoverState,
    cover_move_end: Instant,
}

impl SimShared {
    // Completes any motion whose end time has passed. Called at the top of
    // every driver entry point.
    fn advance(&mut self) {
        let now = Instant::now();
        if self.is_slewing && now >= self.slew_end {
            self.mount_ra = self.slew_target.ra;
            self.mount_dec = self.slew_target.dec;
            self.is_slewing = false;
        }
        if self.focuser_moving && now >= self.focuser_move_end {
            self.focuser_position = self.focuser_target;
            self.focuser_moving = false;
        }
        if self.stage_moving && now >= self.stage_move_end {
            self.stage_position = self.stage_target;
            self.stage_moving = false;
        }
        if self.cover_state == CoverState::Moving && now >= self.cover_move_end {
            self.cover_state = self.cover_target;
        }
    }

    fn pointing_error_arcsec(&self) -> (f64, f64) {
        let t = self.error_epoch.elapsed().as_secs_f64();
        (self.config.initial_pointing_error.0 + self.config.drift_rate.0 * t,
         self.config.initial_pointing_error.1 + self.config.drift_rate.1 * t)
    }

    fn true_boresight(&self) -> Coordinate {
        let (err_ra, err_dec) = self.pointing_error_arcsec();
        let cos_dec = self.mount_dec.to_radians().cos().max(1e-6);
        Coordinate::new(
            self.mount_ra + err_ra / (ARCSEC_PER_DEG * cos_dec),
            self.mount_dec + err_dec / ARCSEC_PER_DEG)
    }

    fn take_connect_failure(&mut self) -> Result<(), CanonicalError> {
        if self.connect_failures_remaining > 0 {
            self.connect_failures_remaining -= 1;
            return Err(unavailable_error("Simulated connect failure"));
        }
        Ok(())
    }

    fn render(&self, settings: &ExposureSettings) -> ImageFrame {
        let bin = settings.binning.max(1) as usize;
        let full_width = self.config.image_width;
        let full_height = self.config.image_height;
        // Native pre-binning readout window, clamped to the sensor.
        let (roi_x, roi_y, roi_width, roi_height) = match &settings.roi {
            Some(roi) => {
                let x = (roi.x as usize).min(full_width);
                let y = (roi.y as usize).min(full_height);
                (x, y, (roi.width as usize).min(full_width - x),
                 (roi.height as usize).min(full_height - y))
            }
            None => (0, 0, full_width, full_height),
        };
        let width = (roi_width / bin).max(1);
        let height = (roi_height / bin).max(1);
        let boresight = self.true_boresight();
        let cos_dec = boresight.dec.to_radians().cos().max(1e-6);
        let (sin_t, cos_t) =
            self.config.rotation_angle_degs.to_radians().sin_cos();
        let defocus = (self.focuser_position
                       - self.config.best_focus_position).abs() as f64 / 1000.0;
        let sigma = ((1.5 + defocus).min(8.0) / bin as f64).max(0.7);
        let gain_scale = settings.gain.max(0) as f64 / 100.0;

        let mut data = vec![(800.0 * gain_scale) as u16; width * height];
        for star in &self.stars {
            let dx = normalize_delta_degs(star.ra - boresight.ra)
                * cos_dec * ARCSEC_PER_DEG;
            let dy = (star.dec - boresight.dec) * ARCSEC_PER_DEG;
            let native_x = full_width as f64 / 2.0 +
                (cos_t * dx - sin_t * dy) / self.config.pixel_scale_at_bin1;
            let native_y = full_height as f64 / 2.0 +
                (sin_t * dx + cos_t * dy) / self.config.pixel_scale_at_bin1;
            let px = (native_x - roi_x as f64) / bin as f64;
            let py = (native_y - roi_y as f64) / bin as f64;
            let reach = 4.0 * sigma;
            if px < -reach || px >= width as f64 + reach ||
                py < -reach || py >= height as f64 + reach {
                continue;
            }
            let x0 = (px - reach).floor().max(0.0) as usize;
            let x1 = ((px + reach).ceil() as usize).min(width - 1);
            let y0 = (py - reach).floor().max(0.0) as usize;
            let y1 = ((py + reach).ceil() as usize).min(height - 1);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let d2 = (x as f64 - px) * (x as f64 - px) +
                        (y as f64 - py) * (y as f64 - py);
                    let value = gain_scale * star.amplitude *
                        (-d2 / (2.0 * sigma * sigma)).exp();
                    let pixel = &mut data[y * width + x];
                    *pixel = pixel.saturating_add(value as u16);
                }
            }
        }
        ImageFrame {
            data,
            width,
            height,
            binning: settings.binning,
            exposure_duration: settings.exposure_duration,
            capture_time: SystemTime::now(),
        }
    }
}

pub struct Simulator {
    shared: Arc<Mutex<SimShared>>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let field_center =
            config.star_field_center.unwrap_or(config.initial_mount_position);
        let mut rng = StdRng::seed_from_u64(config.star_seed);
        // Scatter stars over 1.5x the field of view so a modest pointing
        // error leaves plenty of stars in frame.
        let half_w = 0.75 * config.image_width as f64 * config.pixel_scale_at_bin1;
        let half_h = 0.75 * config.image_height as f64 * config.pixel_scale_at_bin1;
        let cos_dec = field_center.dec.to_radians().cos().max(1e-6);
        let stars = (0..config.num_stars).map(|_| {
            let dx: f64 = rng.gen_range(-half_w..half_w);
            let dy: f64 = rng.gen_range(-half_h..half_h);
            SimStar {
                ra: field_center.ra + dx / (ARCSEC_PER_DEG * cos_dec),
                dec: field_center.dec + dy / ARCSEC_PER_DEG,
                amplitude: rng.gen_range(8000.0..28000.0),
            }
        }).collect();
        let now = Instant::now();
        let shared = SimShared {
            stars,
            error_epoch: now,
            connect_failures_remaining: config.connect_failures,
            mount_connected: false,
            mount_ra: config.initial_mount_position.ra,
            mount_dec: config.initial_mount_position.dec,
            is_slewing: false,
            is_tracking: false,
            axis0_enabled: config.axes_enabled_at_start,
            axis1_enabled: config.axes_enabled_at_start,
            slew_target: config.initial_mount_position,
            slew_end: now,
            camera_connected: false,
            exposure: None,
            focuser_connected: false,
            focuser_position: config.best_focus_position,
            focuser_moving: false,
            focuser_target: 0,
            focuser_move_end: now,
            stage_connected: false,
            stage_position: 0.0,
            stage_moving: false,
            stage_target: 0.0,
            stage_move_end: now,
            covers_connected: false,
            cover_state: CoverState::Closed,
            cover_target: CoverState::Closed,
            cover_move_end: now,
            config,
        };
        Simulator { shared: Arc::new(Mutex::new(shared)) }
    }

    pub fn mount(&self) -> SimMount {
        SimMount { shared: self.shared.clone() }
    }
    pub fn camera(&self) -> SimCamera {
        SimCamera { shared: self.shared.clone() }
    }
    pub fn focuser(&self) -> SimFocuser {
        SimFocuser { shared: self.shared.clone() }
    }
    pub fn stage(&self) -> SimStage {
        SimStage { shared: self.shared.clone() }
    }
    pub fn covers(&self) -> SimCovers {
        SimCovers { shared: self.shared.clone() }
    }

    /// The position the sky "sees", i.e. where a plate solve of a camera
    /// frame would land.
    pub fn true_boresight(&self) -> Coordinate {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        shared.true_boresight()
    }

    /// The position the mount believes it is at.
    pub fn mount_position(&self) -> Coordinate {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        Coordinate::new(shared.mount_ra, shared.mount_dec)
    }

    pub fn pointing_error_arcsec(&self) -> (f64, f64) {
        self.shared.lock().unwrap().pointing_error_arcsec()
    }

    pub fn focuser_position(&self) -> i32 {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        shared.focuser_position
    }
}

pub struct SimMount {
    shared: Arc<Mutex<SimShared>>,
}

impl MountDriver for SimMount {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.take_connect_failure()?;
        shared.mount_connected = true;
        Ok(())
    }

    fn status(&mut self) -> Result<MountStatus, CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        Ok(MountStatus {
            connected: shared.mount_connected,
            ra: shared.mount_ra,
            dec: shared.mount_dec,
            is_slewing: shared.is_slewing,
            is_tracking: shared.is_tracking,
            axis0_enabled: shared.axis0_enabled,
            axis1_enabled: shared.axis1_enabled,
        })
    }

    fn slew_to(&mut self, target: &Coordinate) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.mount_connected {
            return Err(failed_precondition_error("Mount not connected"));
        }
        if !shared.axis0_enabled || !shared.axis1_enabled {
            return Err(failed_precondition_error("Mount axes not enabled"));
        }
        shared.slew_target = *target;
        shared.slew_end = Instant::now() + shared.config.slew_duration;
        shared.is_slewing = true;
        Ok(())
    }

    fn offset_arcsec(&mut self, delta_ra: f64, delta_dec: f64)
                     -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.mount_connected {
            return Err(failed_precondition_error("Mount not connected"));
        }
        let cos_dec = shared.mount_dec.to_radians().cos().max(1e-6);
        shared.mount_ra += delta_ra / (ARCSEC_PER_DEG * cos_dec);
        shared.mount_dec += delta_dec / ARCSEC_PER_DEG;
        // The mount reports slewing briefly while the offset settles.
        shared.slew_target = Coordinate::new(shared.mount_ra, shared.mount_dec);
        shared.slew_end = Instant::now() + shared.config.offset_settle;
        shared.is_slewing = true;
        Ok(())
    }

    fn set_tracking(&mut self, tracking: bool) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.mount_connected {
            return Err(failed_precondition_error("Mount not connected"));
        }
        shared.is_tracking = tracking;
        Ok(())
    }

    fn find_home(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.mount_connected {
            return Err(failed_precondition_error("Mount not connected"));
        }
        shared.slew_target = shared.config.initial_mount_position;
        shared.slew_end = Instant::now() + shared.config.slew_duration;
        shared.is_slewing = true;
        Ok(())
    }

    fn enable_axes(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.mount_connected {
            return Err(failed_precondition_error("Mount not connected"));
        }
        shared.axis0_enabled = true;
        shared.axis1_enabled = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        shared.is_slewing = false;
        Ok(())
    }
}

pub struct SimCamera {
    shared: Arc<Mutex<SimShared>>,
}

impl CameraDriver for SimCamera {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.take_connect_failure()?;
        shared.camera_connected = true;
        Ok(())
    }

    fn status(&mut self) -> Result<CameraStatus, CanonicalError> {
        let shared = self.shared.lock().unwrap();
        Ok(CameraStatus {
            connected: shared.camera_connected,
            temperature_celsius: -10.0,
            exposure_in_progress: shared.exposure.is_some(),
        })
    }

    fn begin_exposure(&mut self, settings: &ExposureSettings)
                      -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.camera_connected {
            return Err(failed_precondition_error("Camera not connected"));
        }
        if shared.exposure.is_some() {
            return Err(failed_precondition_error("Exposure already in progress"));
        }
        shared.exposure =
            Some((settings.clone(), Instant::now() + settings.exposure_duration));
        Ok(())
    }

    fn exposure_ready(&mut self) -> Result<bool, CanonicalError> {
        let shared = self.shared.lock().unwrap();
        match &shared.exposure {
            None => Err(failed_precondition_error("No exposure in progress")),
            Some((_, end)) => Ok(Instant::now() >= *end),
        }
    }

    fn read_image(&mut self) -> Result<ImageFrame, CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        match shared.exposure.take() {
            None => Err(failed_precondition_error("No exposure in progress")),
            Some((settings, end)) => {
                if Instant::now() < end {
                    shared.exposure = Some((settings, end));
                    return Err(failed_precondition_error("Exposure not finished"));
                }
                Ok(shared.render(&settings))
            }
        }
    }

    fn abort_exposure(&mut self) -> Result<(), CanonicalError> {
        self.shared.lock().unwrap().exposure = None;
        Ok(())
    }
}

pub struct SimFocuser {
    shared: Arc<Mutex<SimShared>>,
}

impl FocuserDriver for SimFocuser {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.take_connect_failure()?;
        shared.focuser_connected = true;
        Ok(())
    }

    fn status(&mut self) -> Result<FocuserStatus, CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        Ok(FocuserStatus {
            connected: shared.focuser_connected,
            position: shared.focuser_position,
            is_moving: shared.focuser_moving,
        })
    }

    fn move_to(&mut self, position: i32) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.focuser_connected {
            return Err(failed_precondition_error("Focuser not connected"));
        }
        shared.focuser_target = position;
        shared.focuser_move_end = Instant::now() + shared.config.move_duration;
        shared.focuser_moving = true;
        Ok(())
    }
}

pub struct SimStage {
    shared: Arc<Mutex<SimShared>>,
}

impl StageDriver for SimStage {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.take_connect_failure()?;
        shared.stage_connected = true;
        Ok(())
    }

    fn status(&mut self) -> Result<StageStatus, CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        Ok(StageStatus {
            connected: shared.stage_connected,
            position: shared.stage_position,
            is_moving: shared.stage_moving,
        })
    }

    fn move_to(&mut self, position: f64) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.stage_connected {
            return Err(failed_precondition_error("Stage not connected"));
        }
        shared.stage_target = position;
        shared.stage_move_end = Instant::now() + shared.config.move_duration;
        shared.stage_moving = true;
        Ok(())
    }
}

pub struct SimCovers {
    shared: Arc<Mutex<SimShared>>,
}

impl CoversDriver for SimCovers {
    fn connect(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.take_connect_failure()?;
        shared.covers_connected = true;
        Ok(())
    }

    fn status(&mut self) -> Result<CoversStatus, CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        Ok(CoversStatus {
            connected: shared.covers_connected,
            state: shared.cover_state,
        })
    }

    fn open(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.covers_connected {
            return Err(failed_precondition_error("Covers not connected"));
        }
        if shared.cover_state != CoverState::Open {
            shared.cover_target = CoverState::Open;
            shared.cover_move_end = Instant::now() + shared.config.move_duration;
            shared.cover_state = CoverState::Moving;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CanonicalError> {
        let mut shared = self.shared.lock().unwrap();
        shared.advance();
        if !shared.covers_connected {
            return Err(failed_precondition_error("Covers not connected"));
        }
        if shared.cover_state != CoverState::Closed {
            shared.cover_target = CoverState::Closed;
            shared.cover_move_end = Instant::now() + shared.config.move_duration;
            shared.cover_state = CoverState::Moving;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::thread::sleep;
    use super::*;
    use crate::astro_util::angular_separation_arcsec;

    fn connected_sim(config: SimulatorConfig) -> Simulator {
        let sim = Simulator::new(config);
        sim.mount().connect().unwrap();
        sim.camera().connect().unwrap();
        sim.focuser().connect().unwrap();
        sim.stage().connect().unwrap();
        sim.covers().connect().unwrap();
        sim
    }

    #[test]
    fn test_slew_completes() {
        let sim = connected_sim(SimulatorConfig {
            slew_duration: Duration::from_millis(30),
            ..Default::default()
        });
        let mut mount = sim.mount();
        let target = Coordinate::new(185.0, 40.0);
        mount.slew_to(&target).unwrap();
        assert!(mount.status().unwrap().is_slewing);
        sleep(Duration::from_millis(50));
        let status = mount.status().unwrap();
        assert!(!status.is_slewing);
        assert_abs_diff_eq!(status.ra, 185.0);
        assert_abs_diff_eq!(status.dec, 40.0);
    }

    #[test]
    fn test_offset_moves_on_sky_amount() {
        let sim = connected_sim(SimulatorConfig {
            initial_mount_position: Coordinate::new(100.0, 60.0),
            offset_settle: Duration::from_millis(5),
            ..Default::default()
        });
        let before = sim.mount_position();
        sim.mount().offset_arcsec(7.5, 0.0).unwrap();
        sleep(Duration::from_millis(10));
        let after = sim.mount_position();
        // 7.5 on-sky arcsec at dec 60 is 15 arcsec of RA angle.
        assert_abs_diff_eq!((after.ra - before.ra) * 3600.0, 15.0,
                            epsilon = 0.01);
        assert_abs_diff_eq!(angular_separation_arcsec(&before, &after), 7.5,
                            epsilon = 0.01);
    }

    #[test]
    fn test_offset_cancels_pointing_error() {
        let sim = connected_sim(SimulatorConfig {
            initial_pointing_error: (5.0, -3.0),
            offset_settle: Duration::from_millis(5),
            ..Default::default()
        });
        let target = sim.mount_position();
        let solved = sim.true_boresight();
        let (delta_ra, delta_dec) =
            crate::astro_util::pointing_deltas_arcsec(&target, &solved);
        sim.mount().offset_arcsec(delta_ra, delta_dec).unwrap();
        sleep(Duration::from_millis(10));
        assert!(angular_separation_arcsec(&sim.true_boresight(), &target) < 0.01);
    }

    #[test]
    fn test_exposure_lifecycle() {
        let sim = connected_sim(SimulatorConfig::default());
        let mut camera = sim.camera();
        let settings =
            ExposureSettings::new(Duration::from_millis(30), 2);
        camera.begin_exposure(&settings).unwrap();
        assert!(!camera.exposure_ready().unwrap());
        assert!(camera.begin_exposure(&settings).is_err());
        sleep(Duration::from_millis(40));
        assert!(camera.exposure_ready().unwrap());
        let frame = camera.read_image().unwrap();
        assert_eq!(frame.width, 128);
        assert_eq!(frame.height, 128);
        assert_eq!(frame.binning, 2);
        // Readout consumed the exposure.
        assert!(camera.read_image().is_err());
        // Stars stand out from the background.
        let (_, peak) = frame.mean_and_peak();
        assert!(peak > 5000);
    }

    #[test]
    fn test_connect_failures_then_success() {
        let sim = Simulator::new(SimulatorConfig {
            connect_failures: 2,
            ..Default::default()
        });
        let mut mount = sim.mount();
        assert!(mount.connect().is_err());
        assert!(mount.connect().is_err());
        mount.connect().unwrap();
        assert!(mount.status().unwrap().connected);
    }

    #[test]
    fn test_covers_open_close() {
        let sim = connected_sim(SimulatorConfig {
            move_duration: Duration::from_millis(20),
            ..Default::default()
        });
        let mut covers = sim.covers();
        assert_eq!(covers.status().unwrap().state, CoverState::Closed);
        covers.open().unwrap();
        assert_eq!(covers.status().unwrap().state, CoverState::Moving);
        sleep(Duration::from_millis(30));
        assert_eq!(covers.status().unwrap().state, CoverState::Open);
    }

    #[test]
    fn test_drift_accrues() {
        let sim = connected_sim(SimulatorConfig {
            drift_rate: (10.0, 0.0),
            ..Default::default()
        });
        let (err_ra_0, _) = sim.pointing_error_arcsec();
        sleep(Duration::from_millis(100));
        let (err_ra_1, _) = sim.pointing_error_arcsec();
        assert!(err_ra_1 - err_ra_0 > 0.5);
    }
}  // mod tests.
