// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Implemented by each device's activity enum. Variants carry single-bit
/// values so several activities can be in progress on one owner at a time.
pub trait ActivityFlag: Copy + PartialEq + std::fmt::Debug + Send + 'static {
    /// All variants, used to decode a mask into names for status snapshots.
    const ALL: &'static [Self];

    /// The variant's single-bit mask value.
    fn bit(self) -> u32;
}

/// Tracks which activities are in progress on one owner (a device or the
/// unit), with a start timestamp per activity. Each instance gets its own
/// set; an owner's set is only mutated by that owner's poller thread and by
/// command handlers acting on that owner, serialized by the owner's lock.
pub struct ActivitySet<A: ActivityFlag> {
    owner: String,
    mask: u32,
    starts: [Option<Instant>; 32],
    phantom: PhantomData<A>,
}

impl<A: ActivityFlag> ActivitySet<A> {
    pub fn new(owner: &str) -> Self {
        ActivitySet {
            owner: owner.to_string(),
            mask: 0,
            starts: [None; 32],
            phantom: PhantomData,
        }
    }

    /// Marks `activity` as in progress and records its start time. Starting
    /// an activity that is already in progress refreshes the start time.
    pub fn start(&mut self, activity: A) {
        let bit = activity.bit();
        if self.mask & bit != 0 {
            debug!("{}: restarting already-active {:?}", self.owner, activity);
        } else {
            debug!("{}: starting {:?}", self.owner, activity);
        }
        self.mask |= bit;
        self.starts[bit.trailing_zeros() as usize] = Some(Instant::now());
    }

    /// Clears `activity` and returns how long it was in progress. Ending an
    /// activity that is not in progress logs and returns None.
    pub fn end(&mut self, activity: A) -> Option<Duration> {
        let bit = activity.bit();
        if self.mask & bit == 0 {
            warn!("{}: ending inactive activity {:?}", self.owner, activity);
            return None;
        }
        self.mask &= !bit;
        let elapsed =
            self.starts[bit.trailing_zeros() as usize].take().map(|s| s.elapsed());
        if let Some(e) = elapsed {
            debug!("{}: ended {:?} after {:.1}s", self.owner, activity, e.as_secs_f64());
        }
        elapsed
    }

    pub fn is_active(&self, activity: A) -> bool {
        self.mask & activity.bit() != 0
    }

    /// True if any of the given activities is in progress.
    pub fn is_any_active(&self, activities: &[A]) -> bool {
        activities.iter().any(|a| self.is_active(*a))
    }

    pub fn is_idle(&self) -> bool {
        self.mask == 0
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Names of the in-progress activities, for status reporting.
    pub fn active_names(&self) -> Vec<String> {
        A::ALL
            .iter()
            .filter(|a| self.is_active(**a))
            .map(|a| format!("{:?}", a))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Copy, Clone, PartialEq, Debug)]
    #[repr(u32)]
    enum TestActivity {
        Busy = 0x01,
        Cooling = 0x02,
        Homing = 0x04,
    }
    impl ActivityFlag for TestActivity {
        const ALL: &'static [Self] =
            &[TestActivity::Busy, TestActivity::Cooling, TestActivity::Homing];
        fn bit(self) -> u32 {
            self as u32
        }
    }

    #[test]
    fn test_start_end_elapsed() {
        let mut set = ActivitySet::<TestActivity>::new("test");
        assert!(set.is_idle());
        set.start(TestActivity::Busy);
        assert!(set.is_active(TestActivity::Busy));
        assert!(!set.is_active(TestActivity::Cooling));
        thread::sleep(Duration::from_millis(20));
        let elapsed = set.end(TestActivity::Busy).unwrap();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(set.is_idle());
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut set = ActivitySet::<TestActivity>::new("test");
        set.start(TestActivity::Homing);
        assert!(set.end(TestActivity::Homing).is_some());
        // Second end is a no-op, not a panic.
        assert!(set.end(TestActivity::Homing).is_none());
        assert!(!set.is_active(TestActivity::Homing));
    }

    #[test]
    fn test_restart_refreshes_start_time() {
        let mut set = ActivitySet::<TestActivity>::new("test");
        set.start(TestActivity::Busy);
        thread::sleep(Duration::from_millis(50));
        set.start(TestActivity::Busy);
        thread::sleep(Duration::from_millis(10));
        let elapsed = set.end(TestActivity::Busy).unwrap();
        // Elapsed counts from the restart, not the original start.
        assert!(elapsed < Duration::from_millis(45));
    }

    #[test]
    fn test_concurrent_activities_and_mask() {
        let mut set = ActivitySet::<TestActivity>::new("test");
        set.start(TestActivity::Busy);
        set.start(TestActivity::Cooling);
        assert_eq!(set.mask(), 0x03);
        assert!(set.is_any_active(&[TestActivity::Cooling, TestActivity::Homing]));
        assert!(!set.is_any_active(&[TestActivity::Homing]));
        assert_eq!(set.active_names(), vec!["Busy", "Cooling"]);
        set.end(TestActivity::Busy);
        assert!(set.is_active(TestActivity::Cooling));
        assert_eq!(set.mask(), 0x02);
    }
}  // mod tests.
