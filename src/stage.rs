// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error};
use log::info;

use crate::activity::{ActivityFlag, ActivitySet};
use crate::hardware::{StageDriver, StageStatus};
use crate::poller::{wait_until, DevicePoller};

const MOVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Copy, Clone, PartialEq, Debug)]
#[repr(u32)]
pub enum StageActivity {
    Moving = 0x01,
}

impl ActivityFlag for StageActivity {
    const ALL: &'static [Self] = &[StageActivity::Moving];
    fn bit(self) -> u32 {
        self as u32
    }
}

/// Instrument selector stage, wrapped with a status poller.
pub struct StageUnit {
    driver: Arc<Mutex<Box<dyn StageDriver>>>,
    status: Arc<Mutex<StageStatus>>,
    activities: Arc<Mutex<ActivitySet<StageActivity>>>,
    _poller: DevicePoller,
}

impl StageUnit {
    pub fn new(driver: Box<dyn StageDriver>, poll_period: Duration) -> Self {
        let driver = Arc::new(Mutex::new(driver));
        let status = Arc::new(Mutex::new(StageStatus::default()));
        let activities =
            Arc::new(Mutex::new(ActivitySet::<StageActivity>::new("stage")));

        let poll_driver = driver.clone();
        let poll_status = status.clone();
        let poll_activities = activities.clone();
        let poller = DevicePoller::start("stage", poll_period, move || {
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
            if !fresh.is_moving {
                let mut activities = poll_activities.lock().unwrap();
                if activities.is_active(StageActivity::Moving) {
                    activities.end(StageActivity::Moving);
                }
            }
            Ok(())
        });
        StageUnit { driver, status, activities, _poller: poller }
    }

    pub fn status(&self) -> StageStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    pub fn is_active(&self, activity: StageActivity) -> bool {
        self.activities.lock().unwrap().is_active(activity)
    }

    pub fn active_names(&self) -> Vec<String> {
        self.activities.lock().unwrap().active_names()
    }

    pub fn move_to(&self, position: f64) -> Result<(), CanonicalError> {
        if !self.is_connected() {
            return Err(failed_precondition_error("Stage is not connected"));
        }
        info!("stage: moving to {:.2}", position);
        self.driver.lock().unwrap().move_to(position)?;
        self.activities.lock().unwrap().start(StageActivity::Moving);
        Ok(())
    }

    /// Waits for the stage to report its motion done. Queries the driver
    /// directly; the polled status cell can lag a just-issued command.
    pub fn wait_motion_complete(&self, cancelled: &dyn Fn() -> bool,
                                grain: Duration)
                                -> Result<(), CanonicalError> {
        let driver = self.driver.clone();
        wait_until("stage to stop moving",
                   || Ok(!driver.lock().unwrap().status()?.is_moving),
                   cancelled, grain, Some(MOVE_TIMEOUT))
    }

    pub fn move_to_and_wait(&self, position: f64, grain: Duration,
                            cancelled: &dyn Fn() -> bool)
                            -> Result<(), CanonicalError> {
        self.move_to(position)?;
        self.wait_motion_complete(cancelled, grain)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::thread::sleep;
    use super::*;
    use crate::simulator::{Simulator, SimulatorConfig};

    #[test]
    fn test_move_to_and_wait() {
        let sim = Simulator::new(SimulatorConfig {
            move_duration: Duration::from_millis(30),
            ..Default::default()
        });
        let unit = StageUnit::new(Box::new(sim.stage()),
                                  Duration::from_millis(10));
        for _ in 0..100 {
            if unit.is_connected() {
                break;
            }
            sleep(Duration::from_millis(10));
        }
        unit.move_to_and_wait(125.5, Duration::from_millis(10), &|| false)
            .unwrap();
        assert_abs_diff_eq!(unit.driver.lock().unwrap().status().unwrap()
                            .position, 125.5);
    }
}  // mod tests.
