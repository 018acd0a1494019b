// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::CanonicalError;
use log::{debug, info, warn};

use crate::activity::{ActivityFlag, ActivitySet};
use crate::hardware::{CameraDriver, CameraStatus, ExposureSettings,
                      ImageFrame};
use crate::poller::{wait_until, DevicePoller};

// How often an in-progress exposure is checked for completion.
const EXPOSURE_POLL: Duration = Duration::from_millis(50);

// Slack beyond the commanded exposure time before giving up on the camera.
const READOUT_MARGIN: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, PartialEq, Debug)]
#[repr(u32)]
pub enum CameraActivity {
    Exposing = 0x01,
    ReadingOut = 0x02,
    Saving = 0x04,
}

impl ActivityFlag for CameraActivity {
    const ALL: &'static [Self] =
        &[CameraActivity::Exposing, CameraActivity::ReadingOut,
          CameraActivity::Saving];
    fn bit(self) -> u32 {
        self as u32
    }
}

/// Wraps the camera driver with a status poller and a blocking, cancelable
/// expose operation.
pub struct CameraUnit {
    driver: Arc<Mutex<Box<dyn CameraDriver>>>,
    status: Arc<Mutex<CameraStatus>>,
    activities: Arc<Mutex<ActivitySet<CameraActivity>>>,
    _poller: DevicePoller,
}

impl CameraUnit {
    pub fn new(driver: Box<dyn CameraDriver>, poll_period: Duration) -> Self {
        let driver = Arc::new(Mutex::new(driver));
        let status = Arc::new(Mutex::new(CameraStatus::default()));
        let activities =
            Arc::new(Mutex::new(ActivitySet::<CameraActivity>::new("camera")));

        let poll_driver = driver.clone();
        let poll_status = status.clone();
        let poller = DevicePoller::start("camera", poll_period, move || {
            let mut driver = poll_driver.lock().unwrap();
            let fresh = match driver.status() {
                Ok(s) => s,
                Err(e) => {
                    poll_status.lock().unwrap().connected = false;
                    return Err(e);
                }
            };
            let fresh = if !fresh.connected {
                driver.connect()?;
                driver.status()?
            } else {
                fresh
            };
            drop(driver);
            *poll_status.lock().unwrap() = fresh;
            Ok(())
        });
        CameraUnit { driver, status, activities, _poller: poller }
    }

    /// Most recent polled status.
    pub fn status(&self) -> CameraStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    pub fn is_active(&self, activity: CameraActivity) -> bool {
        self.activities.lock().unwrap().is_active(activity)
    }

    pub fn active_names(&self) -> Vec<String> {
        self.activities.lock().unwrap().active_names()
    }

    /// Takes one exposure, blocking until readout. On cancellation the
    /// exposure is aborted and aborted_error is returned.
    pub fn expose(&self, settings: &ExposureSettings,
                  cancelled: &dyn Fn() -> bool)
                  -> Result<ImageFrame, CanonicalError> {
        debug!("camera: {:.3}s exposure at bin {}",
               settings.exposure_duration.as_secs_f64(), settings.binning);
        self.driver.lock().unwrap().begin_exposure(settings)?;
        self.activities.lock().unwrap().start(CameraActivity::Exposing);

        let driver = self.driver.clone();
        let wait = wait_until(
            "exposure to complete",
            || driver.lock().unwrap().exposure_ready(),
            cancelled, EXPOSURE_POLL,
            Some(settings.exposure_duration + READOUT_MARGIN));
        if let Err(e) = wait {
            let _ = self.driver.lock().unwrap().abort_exposure();
            self.activities.lock().unwrap().end(CameraActivity::Exposing);
            return Err(e);
        }
        {
            let mut activities = self.activities.lock().unwrap();
            activities.end(CameraActivity::Exposing);
            activities.start(CameraActivity::ReadingOut);
        }
        let frame = self.driver.lock().unwrap().read_image();
        self.activities.lock().unwrap().end(CameraActivity::ReadingOut);
        let frame = frame?;
        let (mean, peak) = frame.mean_and_peak();
        info!("camera: read {}x{} frame, mean {:.0} peak {}",
              frame.width, frame.height, mean, peak);
        if settings.save_image {
            match &settings.destination {
                Some(path) => {
                    self.activities.lock().unwrap()
                        .start(CameraActivity::Saving);
                    let saved = frame.save_png(path);
                    self.activities.lock().unwrap()
                        .end(CameraActivity::Saving);
                    saved?;
                }
                None => warn!("camera: save_image set with no destination"),
            }
        }
        Ok(frame)
    }
}

// mod tests.
