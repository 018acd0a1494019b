// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error};
use log::info;

use crate::activity::{ActivityFlag, ActivitySet};
use crate::hardware::{CoverState, CoversDriver, CoversStatus};
use crate::poller::{wait_until, DevicePoller};

const MOVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Copy, Clone, PartialEq, Debug)]
#[repr(u32)]
pub enum CoversActivity {
    Opening = 0x01,
    Closing = 0x02,
}

impl ActivityFlag for CoversActivity {
    const ALL: &'static [Self] =
        &[CoversActivity::Opening, CoversActivity::Closing];
    fn bit(self) -> u32 {
        self as u32
    }
}

/// Mirror covers, wrapped with a status poller.
pub struct CoversUnit {
    driver: Arc<Mutex<Box<dyn CoversDriver>>>,
    status: Arc<Mutex<CoversStatus>>,
    activities: Arc<Mutex<ActivitySet<CoversActivity>>>,
    _poller: DevicePoller,
}

impl CoversUnit {
    pub fn new(driver: Box<dyn CoversDriver>, poll_period: Duration) -> Self {
        let driver = Arc::new(Mutex::new(driver));
        let status = Arc::new(Mutex::new(CoversStatus::default()));
        let activities =
            Arc::new(Mutex::new(ActivitySet::<CoversActivity>::new("covers")));

        let poll_driver = driver.clone();
        let poll_status = status.clone();
        let poll_activities = activities.clone();
        let poller = DevicePoller::start("covers", poll_period, move || {
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
            if fresh.state != CoverState::Moving {
                let mut activities = poll_activities.lock().unwrap();
                if activities.is_active(CoversActivity::Opening) {
                    activities.end(CoversActivity::Opening);
                }
                if activities.is_active(CoversActivity::Closing) {
                    activities.end(CoversActivity::Closing);
                }
            }
            Ok(())
        });
        CoversUnit { driver, status, activities, _poller: poller }
    }

    pub fn status(&self) -> CoversStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    pub fn is_active(&self, activity: CoversActivity) -> bool {
        self.activities.lock().unwrap().is_active(activity)
    }

    pub fn active_names(&self) -> Vec<String> {
        self.activities.lock().unwrap().active_names()
    }

    pub fn open(&self) -> Result<(), CanonicalError> {
        if !self.is_connected() {
            return Err(failed_precondition_error("Covers are not connected"));
        }
        info!("covers: opening");
        self.driver.lock().unwrap().open()?;
        self.activities.lock().unwrap().start(CoversActivity::Opening);
        Ok(())
    }

    pub fn close(&self) -> Result<(), CanonicalError> {
        if !self.is_connected() {
            return Err(failed_precondition_error("Covers are not connected"));
        }
        info!("covers: closing");
        self.driver.lock().unwrap().close()?;
        self.activities.lock().unwrap().start(CoversActivity::Closing);
        Ok(())
    }

    /// Waits for the covers to report the given state.
    pub fn wait_for_state(&self, target: CoverState, grain: Duration,
                          cancelled: &dyn Fn() -> bool)
                          -> Result<(), CanonicalError> {
        let driver = self.driver.clone();
        wait_until(&format!("covers to reach {:?}", target),
                   || Ok(driver.lock().unwrap().status()?.state == target),
                   cancelled, grain, Some(MOVE_TIMEOUT))
    }
}

// mod tests.
