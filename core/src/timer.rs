//! One-shot and repeating timers with second granularity
//!
//! The wheel is advanced once per wall-clock-second boundary by a driver
//! task. Timers due in the same tick fire in insertion order; a repeating
//! timer reschedules itself after firing. Cancellation is by handle, and
//! a timer that has already begun firing completes its callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opaque cancellation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

type Callback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    fires_at: u64,
    /// Repeat interval in seconds; None for one-shot
    interval: Option<u64>,
    /// Insertion sequence, the within-tick fire order
    seq: u64,
    callback: Callback,
}

struct WheelState {
    now: u64,
    timers: HashMap<u64, TimerEntry>,
}

/// The timer wheel. Cheap to clone through `Arc`.
pub struct TimerWheel {
    state: Arc<Mutex<WheelState>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl TimerWheel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(WheelState {
                now: 0,
                timers: HashMap::new(),
            })),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Start the driver task. Call once.
    pub fn start(wheel: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                wheel.advance();
            }
        });
    }

    /// Schedule a one-shot callback after `delay_secs`.
    pub fn schedule<F>(&self, delay_secs: u64, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(delay_secs, None, Box::new(callback))
    }

    /// Schedule a repeating callback every `interval_secs`.
    pub fn schedule_repeating<F>(&self, interval_secs: u64, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(interval_secs, Some(interval_secs), Box::new(callback))
    }

    fn insert(&self, delay_secs: u64, interval: Option<u64>, callback: Callback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().expect("timer wheel poisoned");
        let fires_at = state.now + delay_secs.max(1);
        state.timers.insert(
            id,
            TimerEntry {
                fires_at,
                interval,
                seq,
                callback,
            },
        );
        TimerHandle(id)
    }

    /// Cancel a timer. Returns whether it was still pending.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.state.lock().expect("timer wheel poisoned");
        state.timers.remove(&handle.0).is_some()
    }

    /// Advance the wheel by one second and fire everything due.
    /// Public for tests; the driver task calls this.
    pub fn advance(&self) {
        let mut state = self.state.lock().expect("timer wheel poisoned");
        state.now += 1;
        let now = state.now;

        let mut due: Vec<u64> = state
            .timers
            .iter()
            .filter(|(_, t)| t.fires_at <= now)
            .map(|(&id, _)| id)
            .collect();
        due.sort_by_key(|id| state.timers[id].seq);

        for id in due {
            let mut entry = match state.timers.remove(&id) {
                Some(e) => e,
                None => continue,
            };
            (entry.callback)();
            if let Some(interval) = entry.interval {
                entry.fires_at = now + interval.max(1);
                state.timers.insert(id, entry);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().expect("timer wheel poisoned").timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_one_shot_fires_once() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        wheel.schedule(2, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        wheel.advance();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.advance();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wheel.advance();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.pending(), 0);
    }

    #[test]
    fn test_repeating_reschedules() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        wheel.schedule_repeating(1, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            wheel.advance();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(wheel.pending(), 1);
    }

    #[test]
    fn test_insertion_order_within_tick() {
        let wheel = TimerWheel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let o = Arc::clone(&order);
            wheel.schedule(1, move || o.lock().unwrap().push(i));
        }
        wheel.advance();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cancel() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = wheel.schedule(1, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wheel.cancel(handle));
        assert!(!wheel.cancel(handle));
        wheel.advance();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_delay_rounds_up() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        wheel.schedule(0, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        wheel.advance();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
