// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error};
use log::info;

use crate::activity::{ActivityFlag, ActivitySet};
use crate::hardware::{FocuserDriver, FocuserStatus};
use crate::poller::{wait_until, DevicePoller};

// Generous bound on a single focuser travel.
const MOVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Copy, Clone, PartialEq, Debug)]
#[repr(u32)]
pub enum FocuserActivity {
    Moving = 0x01,
}

impl ActivityFlag for FocuserActivity {
    const ALL: &'static [Self] = &[FocuserActivity::Moving];
    fn bit(self) -> u32 {
        self as u32
    }
}

pub struct FocuserUnit {
    driver: Arc<Mutex<Box<dyn FocuserDriver>>>,
    status: Arc<Mutex<FocuserStatus>>,
    activities: Arc<Mutex<ActivitySet<FocuserActivity>>>,
    _poller: DevicePoller,
}

impl FocuserUnit {
    pub fn new(driver: Box<dyn FocuserDriver>, poll_period: Duration) -> Self {
        let driver = Arc::new(Mutex::new(driver));
        let status = Arc::new(Mutex::new(FocuserStatus::default()));
        let activities = Arc::new(Mutex::new(
            ActivitySet::<FocuserActivity>::new("focuser")));

        let poll_driver = driver.clone();
        let poll_status = status.clone();
        let poll_activities = activities.clone();
        let poller = DevicePoller::start("focuser", poll_period, move || {
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
                if activities.is_active(FocuserActivity::Moving) {
                    activities.end(FocuserActivity::Moving);
                }
            }
            Ok(())
        });
        FocuserUnit { driver, status, activities, _poller: poller }
    }

    pub fn status(&self) -> FocuserStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    pub fn is_active(&self, activity: FocuserActivity) -> bool {
        self.activities.lock().unwrap().is_active(activity)
    }

    pub fn active_names(&self) -> Vec<String> {
        self.activities.lock().unwrap().active_names()
    }

    pub fn position(&self) -> i32 {
        self.status().position
    }

    pub fn move_to(&self, position: i32) -> Result<(), CanonicalError> {
        if !self.is_connected() {
            return Err(failed_precondition_error("Focuser is not connected"));
        }
        info!("focuser: moving to {}", position);
        self.driver.lock().unwrap().move_to(position)?;
        self.activities.lock().unwrap().start(FocuserActivity::Moving);
        Ok(())
    }

    /// Blocking move, checking `cancelled` every `grain`.
    pub fn move_to_and_wait(&self, position: i32, grain: Duration,
                            cancelled: &dyn Fn() -> bool)
                            -> Result<(), CanonicalError> {
        self.move_to(position)?;
        let driver = self.driver.clone();
        wait_until("focuser to stop moving",
                   || Ok(!driver.lock().unwrap().status()?.is_moving),
                   cancelled, grain, Some(MOVE_TIMEOUT))
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use super::*;
    use crate::simulator::{Simulator, SimulatorConfig};

    fn wait_connected(unit: &FocuserUnit) {
        for _ in 0..100 {
            if unit.is_connected() {
                return;
            }
            sleep(Duration::from_millis(10));
        }
        panic!("Focuser never connected");
    }

    #[test]
    fn test_move_to_and_wait() {
        let sim = Simulator::new(SimulatorConfig {
            move_duration: Duration::from_millis(30),
            ..Default::default()
        });
        let unit = FocuserUnit::new(Box::new(sim.focuser()),
                                    Duration::from_millis(10));
        wait_connected(&unit);
        unit.move_to_and_wait(7000, Duration::from_millis(10), &|| false)
            .unwrap();
        assert_eq!(sim.focuser_position(), 7000);
        // Poller retires the Moving activity.
        sleep(Duration::from_millis(50));
        assert!(!unit.is_active(FocuserActivity::Moving));
    }

    #[test]
    fn test_cancelled_move_wait() {
        let sim = Simulator::new(SimulatorConfig {
            move_duration: Duration::from_secs(10),
            ..Default::default()
        });
        let unit = FocuserUnit::new(Box::new(sim.focuser()),
                                    Duration::from_millis(10));
        wait_connected(&unit);
        let err = unit.move_to_and_wait(9000, Duration::from_millis(10),
                                        &|| true).unwrap_err();
        assert_eq!(err.code, canonical_error::CanonicalErrorCode::Aborted);
    }
}  // mod tests.
