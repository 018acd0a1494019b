// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use canonical_error::{CanonicalError, failed_precondition_error};
use image::{ImageBuffer, Luma};
use serde::Serialize;

use crate::astro_util::Coordinate;

/// Sensor region to read out, in native pre-binning pixels.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Parameters for a single exposure. Immutable once the exposure starts.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureSettings {
    pub exposure_duration: Duration,

    /// 1 for full resolution, 2 for 2x2 pixel binning, etc.
    pub binning: u32,

    /// None reads the full frame.
    pub roi: Option<RegionOfInterest>,

    /// Gain, percent of the camera's range.
    pub gain: i32,

    /// Where the frame is written when `save_image` is set.
    pub destination: Option<PathBuf>,
    pub save_image: bool,
}

impl ExposureSettings {
    pub fn new(exposure_duration: Duration, binning: u32) -> Self {
        ExposureSettings {
            exposure_duration,
            binning,
            roi: None,
            gain: 100,
            destination: None,
            save_image: false,
        }
    }
}

/// A raw image read out of the camera. Pixels are 16 bit grayscale, row
/// major, `width` * `height` entries.
#[derive(Clone)]
pub struct ImageFrame {
    pub data: Vec<u16>,
    pub width: usize,
    pub height: usize,
    pub binning: u32,
    pub exposure_duration: Duration,
    pub capture_time: SystemTime,
}

impl ImageFrame {
    /// Mean and peak pixel value, for log lines.
    pub fn mean_and_peak(&self) -> (f64, u16) {
        if self.data.is_empty() {
            return (0.0, 0);
        }
        let mut sum: u64 = 0;
        let mut peak: u16 = 0;
        for &pixel in &self.data {
            sum += pixel as u64;
            if pixel > peak {
                peak = pixel;
            }
        }
        (sum as f64 / self.data.len() as f64, peak)
    }

    /// Writes the frame as a 16 bit grayscale PNG. The path extension must
    /// be .png.
    pub fn save_png(&self, path: &Path) -> Result<(), CanonicalError> {
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_vec(self.width as u32, self.height as u32,
                                  self.data.clone())
            .ok_or_else(|| failed_precondition_error(
                &format!("Pixel data does not match {}x{}",
                         self.width, self.height)))?;
        buffer.save(path).map_err(|e| failed_precondition_error(
            &format!("Could not write {:?}: {:?}", path, e)))
    }
}

impl std::fmt::Debug for ImageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ImageFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("binning", &self.binning)
            .field("exposure_duration", &self.exposure_duration)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct MountStatus {
    pub connected: bool,

    /// Current boresight position, J2000 degrees. Valid when connected.
    pub ra: f64,
    pub dec: f64,

    pub is_slewing: bool,
    pub is_tracking: bool,
    pub axis0_enabled: bool,
    pub axis1_enabled: bool,
}

#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct CameraStatus {
    pub connected: bool,
    pub temperature_celsius: f64,
    pub exposure_in_progress: bool,
}

#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct FocuserStatus {
    pub connected: bool,

    /// Focuser motor position, in ticks.
    pub position: i32,
    pub is_moving: bool,
}

#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct StageStatus {
    pub connected: bool,
    pub position: f64,
    pub is_moving: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub enum CoverState {
    Open,
    Closed,
    Moving,
    Unknown,
}

#[derive(Copy, Clone, Debug, Serialize)]
pub struct CoversStatus {
    pub connected: bool,
    pub state: CoverState,
}

impl Default for CoversStatus {
    fn default() -> Self {
        CoversStatus { connected: false, state: CoverState::Unknown }
    }
}

/// Telescope mount. Implementations talk to real hardware or to the
/// simulator; calls are synchronous and return promptly, with long motions
/// reported via `is_slewing` in the status.
pub trait MountDriver: Send {
    fn connect(&mut self) -> Result<(), CanonicalError>;

    fn status(&mut self) -> Result<MountStatus, CanonicalError>;

    /// Starts a slew to the given J2000 position.
    fn slew_to(&mut self, target: &Coordinate) -> Result<(), CanonicalError>;

    /// Nudges the pointing by the given on-sky amounts. Positive RA offset
    /// moves the boresight east, positive Dec offset moves it north.
    fn offset_arcsec(&mut self, delta_ra: f64, delta_dec: f64)
                     -> Result<(), CanonicalError>;

    fn set_tracking(&mut self, tracking: bool) -> Result<(), CanonicalError>;

    /// Starts the homing sequence; completion is reported via `is_slewing`.
    fn find_home(&mut self) -> Result<(), CanonicalError>;

    /// Energizes both mount axes.
    fn enable_axes(&mut self) -> Result<(), CanonicalError>;

    /// Halts any in-progress slew.
    fn stop(&mut self) -> Result<(), CanonicalError>;
}

/// Science camera. Exposures are split into begin/ready/read so callers
/// can honor cancellation during long exposures.
pub trait CameraDriver: Send {
    fn connect(&mut self) -> Result<(), CanonicalError>;

    fn status(&mut self) -> Result<CameraStatus, CanonicalError>;

    fn begin_exposure(&mut self, settings: &ExposureSettings)
                      -> Result<(), CanonicalError>;

    /// True once the exposure begun by `begin_exposure` can be read.
    fn exposure_ready(&mut self) -> Result<bool, CanonicalError>;

    /// Reads out the completed exposure. Fails if no exposure is ready.
    fn read_image(&mut self) -> Result<ImageFrame, CanonicalError>;

    fn abort_exposure(&mut self) -> Result<(), CanonicalError>;
}

/// Focus motor.
pub trait FocuserDriver: Send {
    fn connect(&mut self) -> Result<(), CanonicalError>;

    fn status(&mut self) -> Result<FocuserStatus, CanonicalError>;

    /// Starts a move to the given tick position; completion is reported via
    /// `is_moving` in the status.
    fn move_to(&mut self, position: i32) -> Result<(), CanonicalError>;
}

/// Instrument selector stage.
pub trait StageDriver: Send {
    fn connect(&mut self) -> Result<(), CanonicalError>;

    fn status(&mut self) -> Result<StageStatus, CanonicalError>;

    fn move_to(&mut self, position: f64) -> Result<(), CanonicalError>;
}

/// Mirror covers.
pub trait CoversDriver: Send {
    fn connect(&mut self) -> Result<(), CanonicalError>;

    fn status(&mut self) -> Result<CoversStatus, CanonicalError>;

    fn open(&mut self) -> Result<(), CanonicalError>;

    fn close(&mut self) -> Result<(), CanonicalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(width: usize, height: usize, data: Vec<u16>) -> ImageFrame {
        ImageFrame {
            data, width, height,
            binning: 1,
            exposure_duration: Duration::from_secs(1),
            capture_time: SystemTime::now(),
        }
    }

    #[test]
    fn test_mean_and_peak() {
        let frame = test_frame(2, 2, vec![0, 100, 200, 300]);
        let (mean, peak) = frame.mean_and_peak();
        assert_eq!(mean, 150.0);
        assert_eq!(peak, 300);

        let empty = test_frame(0, 0, vec![]);
        assert_eq!(empty.mean_and_peak(), (0.0, 0));
    }

    #[test]
    fn test_save_png_rejects_bad_geometry() {
        let frame = test_frame(3, 2, vec![0; 5]);
        assert!(frame.save_png(Path::new("/tmp/bad_geometry.png")).is_err());
    }

    #[test]
    fn test_save_png_writes_file() {
        let frame = test_frame(4, 3, (0..12).map(|i| i * 1000).collect());
        let path = std::env::temp_dir().join("kestrel_hardware_test.png");
        frame.save_png(&path).unwrap();
        assert!(path.metadata().unwrap().len() > 0);
        let _ = std::fs::remove_file(&path);
    }
}  // mod tests.
