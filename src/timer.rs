//! Repeating timers for automatic snapshots.
//!
//! The manager never sleeps itself; it asks a [`Scheduler`] for a repeating
//! timer and keeps the returned [`TimerHandle`]. Cancelling (or dropping)
//! the handle stops future ticks. A tick that is already running finishes.
//!
//! - [`ThreadScheduler`] ticks on wall-clock time from a background thread.
//! - [`ManualScheduler`] ticks only when [`ManualScheduler::advance`] moves
//!   its virtual clock, which keeps timer tests free of sleeps.

use crate::error::Result;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Callback invoked on every tick.
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Source of repeating timers.
pub trait Scheduler: Send + Sync {
    /// Call `tick` every `interval`, starting one interval from now.
    fn schedule_repeating(&self, interval: Duration, tick: TickFn) -> Result<TimerHandle>;
}

/// Handle to a scheduled timer. Cancels the timer when dropped.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    /// Wakes a sleeping timer thread; `None` for virtual timers.
    stop: Option<Sender<()>>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, stop: Option<Sender<()>>) -> Self {
        Self { cancelled, stop }
    }

    /// Stop future ticks. Idempotent.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs each timer on its own named background thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_repeating(&self, interval: Duration, tick: TickFn) -> Result<TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread_cancelled = Arc::clone(&cancelled);
        thread::Builder::new()
            .name("snapshot-timer".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if thread_cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                        tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(TimerHandle::new(cancelled, Some(stop_tx)))
    }
}

struct ManualTimer {
    interval: Duration,
    next_due: Duration,
    tick: TickFn,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    timers: Vec<ManualTimer>,
}

/// Deterministic scheduler driven by an explicit virtual clock.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of timers that have not been cancelled.
    pub fn active_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move the clock forward by `by`, firing every tick that falls due.
    ///
    /// Ticks run on the calling thread, in due order, without the scheduler
    /// lock held. Returns the number of ticks fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut fired = 0;

        loop {
            let (tick, cancelled) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                state.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));

                let next = state
                    .timers
                    .iter_mut()
                    .filter(|t| t.next_due <= target)
                    .min_by_key(|t| t.next_due);

                match next {
                    Some(timer) => {
                        let due = timer.next_due;
                        timer.next_due += timer.interval;
                        let fire = (Arc::clone(&timer.tick), Arc::clone(&timer.cancelled));
                        state.now = due;
                        fire
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };

            if !cancelled.load(Ordering::SeqCst) {
                tick();
                fired += 1;
            }
        }

        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, interval: Duration, tick: TickFn) -> Result<TimerHandle> {
        // A zero interval would never let `advance` make progress.
        let interval = interval.max(Duration::from_millis(1));
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut state = self.state.lock();
        let next_due = state.now + interval;
        state.timers.push(ManualTimer {
            interval,
            next_due,
            tick,
            cancelled: Arc::clone(&cancelled),
        });

        Ok(TimerHandle::new(cancelled, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, TickFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let tick_count = Arc::clone(&count);
        let tick: TickFn = Arc::new(move || {
            tick_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, tick)
    }

    #[test]
    fn test_manual_fires_per_interval() {
        let scheduler = ManualScheduler::new();
        let (count, tick) = counter();
        let _handle = scheduler
            .schedule_repeating(Duration::from_secs(60), tick)
            .unwrap();

        assert_eq!(scheduler.advance(Duration::from_secs(59)), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 1);
        assert_eq!(scheduler.advance(Duration::from_secs(150)), 2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.now(), Duration::from_secs(210));
    }

    #[test]
    fn test_manual_cancel_and_drop() {
        let scheduler = ManualScheduler::new();
        let (count, tick) = counter();

        let mut handle = scheduler
            .schedule_repeating(Duration::from_secs(10), Arc::clone(&tick))
            .unwrap();
        assert_eq!(scheduler.active_timers(), 1);
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.advance(Duration::from_secs(100)), 0);

        let handle = scheduler
            .schedule_repeating(Duration::from_secs(10), tick)
            .unwrap();
        drop(handle);
        assert_eq!(scheduler.active_timers(), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(100)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_new_timer_counts_from_now() {
        let scheduler = ManualScheduler::new();
        scheduler.advance(Duration::from_secs(25));

        let (count, tick) = counter();
        let _handle = scheduler
            .schedule_repeating(Duration::from_secs(10), tick)
            .unwrap();

        scheduler.advance(Duration::from_secs(9));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_scheduler_ticks_and_stops() {
        let scheduler = ThreadScheduler::new();
        let (count, tick) = counter();

        let mut handle = scheduler
            .schedule_repeating(Duration::from_millis(10), tick)
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::SeqCst) >= 2);

        handle.cancel();
        // Allow an in-flight tick to finish
        thread::sleep(Duration::from_millis(30));
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }
}
