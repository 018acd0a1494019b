// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::cmp::min;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error};
use log::{debug, info, warn};

// Sleep slice used when waiting with a cancel check. Bounds how long a
// stop request can go unnoticed.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Runs a poll closure at a fixed period on its own thread. A poll failure
/// is logged and counted but never stops the loop; the device stays in the
/// unit with its last known status until polling recovers.
pub struct DevicePoller {
    state: Arc<Mutex<PollerState>>,
}

struct PollerState {
    stop_request: bool,
    worker_thread: Option<thread::JoinHandle<()>>,

    poll_count: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl Drop for DevicePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DevicePoller {
    /// Spawns the worker thread. `poll_fn` is called every `period`,
    /// measured start to start, until `stop()`.
    pub fn start<F>(name: &str, period: Duration, poll_fn: F) -> Self
    where F: FnMut() -> Result<(), CanonicalError> + Send + 'static {
        let state = Arc::new(Mutex::new(PollerState {
            stop_request: false,
            worker_thread: None,
            poll_count: 0,
            consecutive_failures: 0,
            last_error: None,
        }));
        let worker_state = state.clone();
        let worker_name = name.to_string();
        state.lock().unwrap().worker_thread = Some(thread::spawn(move || {
            DevicePoller::worker(worker_name, period, poll_fn, worker_state);
        }));
        DevicePoller { state }
    }

    /// Shuts down the worker thread. Blocks until the in-progress poll (if
    /// any) finishes.
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

    pub fn poll_count(&self) -> u64 {
        self.state.lock().unwrap().poll_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().unwrap().consecutive_failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    fn worker<F>(name: String, period: Duration, mut poll_fn: F,
                 state: Arc<Mutex<PollerState>>)
    where F: FnMut() -> Result<(), CanonicalError> + Send + 'static {
        info!("{}: polling every {:?}", name, period);
        loop {
            if state.lock().unwrap().stop_request {
                break;
            }
            let poll_start = Instant::now();
            match poll_fn() {
                Ok(()) => {
                    let mut locked_state = state.lock().unwrap();
                    locked_state.poll_count += 1;
                    if locked_state.consecutive_failures > 0 {
                        info!("{}: poll recovered after {} failure(s)",
                              name, locked_state.consecutive_failures);
                        locked_state.consecutive_failures = 0;
                        locked_state.last_error = None;
                    }
                }
                Err(e) => {
                    let mut locked_state = state.lock().unwrap();
                    locked_state.poll_count += 1;
                    locked_state.consecutive_failures += 1;
                    // First failure at warn, repeats at debug until recovery.
                    if locked_state.consecutive_failures == 1 {
                        warn!("{}: poll failed: {:?}", name, e);
                    } else {
                        debug!("{}: poll failed ({} consecutive): {:?}",
                               name, locked_state.consecutive_failures, e);
                    }
                    locked_state.last_error = Some(format!("{:?}", e));
                }
            }
            let elapsed = poll_start.elapsed();
            if elapsed < period {
                let cancelled = || state.lock().unwrap().stop_request;
                if !interruptible_sleep(period - elapsed, &cancelled) {
                    break;
                }
            }
        }
        info!("{}: poller stopped", name);
    }
}

/// Sleeps for `total`, in slices, checking `cancelled` between slices.
/// Returns false if the sleep was cut short by cancellation.
pub fn interruptible_sleep(total: Duration, cancelled: &dyn Fn() -> bool)
                           -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(min(remaining, SLEEP_SLICE));
    }
}

/// Re-evaluates `condition` every `grain` until it returns true. `what`
/// names the awaited state for error messages. Returns aborted if
/// `cancelled` becomes true first (checked more often than `grain`),
/// deadline_exceeded if `timeout` elapses first, or the condition's own
/// error if it fails.
pub fn wait_until<F>(what: &str, mut condition: F, cancelled: &dyn Fn() -> bool,
                     grain: Duration, timeout: Option<Duration>)
                     -> Result<(), CanonicalError>
where F: FnMut() -> Result<bool, CanonicalError> {
    let start = Instant::now();
    loop {
        if condition()? {
            return Ok(());
        }
        if cancelled() {
            debug!("Cancelled while waiting for {}", what);
            return Err(aborted_error(
                &format!("Cancelled while waiting for {}", what)));
        }
        if let Some(timeout) = timeout {
            if start.elapsed() > timeout {
                return Err(deadline_exceeded_error(
                    &format!("Timed out after {:.1}s waiting for {}",
                             timeout.as_secs_f64(), what)));
            }
        }
        if !interruptible_sleep(grain, cancelled) {
            return Err(aborted_error(
                &format!("Cancelled while waiting for {}", what)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::CanonicalErrorCode;
    use canonical_error::failed_precondition_error;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn test_poller_polls_and_stops() {
        let count = Arc::new(AtomicU32::new(0));
        let poll_count = count.clone();
        let mut poller = DevicePoller::start(
            "test_device", Duration::from_millis(10),
            move || {
                poll_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::SeqCst) >= 5);
        poller.stop();
        let count_at_stop = count.load(Ordering::SeqCst);
        assert_eq!(poller.poll_count(), count_at_stop as u64);
        thread::sleep(Duration::from_millis(50));
        // No polls after stop.
        assert_eq!(count.load(Ordering::SeqCst), count_at_stop);
    }

    #[test]
    fn test_poller_counts_failures_and_recovers() {
        let count = Arc::new(AtomicU32::new(0));
        let poll_count = count.clone();
        let poller = DevicePoller::start(
            "flaky_device", Duration::from_millis(5),
            move || {
                if poll_count.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(failed_precondition_error("device not ready"))
                } else {
                    Ok(())
                }
            });
        // Wait for the failures to be reported.
        while poller.poll_count() < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(poller.last_error().is_some() ||
                poller.consecutive_failures() == 0);
        // Polling continues past the failures and recovers.
        while poller.poll_count() < 6 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(poller.consecutive_failures(), 0);
        assert!(poller.last_error().is_none());
    }

    #[test]
    fn test_interruptible_sleep() {
        let start = Instant::now();
        assert!(interruptible_sleep(Duration::from_millis(50), &|| false));
        assert!(start.elapsed() >= Duration::from_millis(50));

        let cancelled = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!interruptible_sleep(Duration::from_secs(10),
                                     &|| cancelled.load(Ordering::SeqCst)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_until_condition_becomes_true() {
        let count = AtomicU32::new(0);
        wait_until("count to reach 3",
                   || Ok(count.fetch_add(1, Ordering::SeqCst) >= 3),
                   &|| false,
                   Duration::from_millis(1), None).unwrap();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_wait_until_cancelled() {
        let err = wait_until("nothing",
                             || Ok(false),
                             &|| true,
                             Duration::from_millis(1),
                             None).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::Aborted);
        assert!(err.message.contains("nothing"));
    }

    #[test]
    fn test_wait_until_times_out() {
        let err = wait_until("nothing",
                             || Ok(false),
                             &|| false,
                             Duration::from_millis(1),
                             Some(Duration::from_millis(30))).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::DeadlineExceeded);
    }

    #[test]
    fn test_wait_until_propagates_condition_error() {
        let err = wait_until("doomed",
                             || Err(failed_precondition_error("broke")),
                             &|| false,
                             Duration::from_millis(1), None).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);
    }
}  // mod tests.
