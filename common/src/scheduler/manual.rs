// Deterministic loop driven by a virtual clock

use super::{Scheduler, TickCallback, TimerHandle};
use crate::errors::BridgeError;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Smallest interval accepted; shorter intervals are clamped
const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Timer {
    interval: Duration,
    next_due: Duration,
    // None while the callback is running
    callback: Option<TickCallback>,
}

/// Scheduler whose time only moves when [`ManualLoop::advance`] is called.
///
/// Due callbacks run in due-time order, ties broken by registration order.
/// Callbacks may register or cancel timers (including their own) while running.
#[derive(Default)]
pub struct ManualLoop {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    timers: RefCell<BTreeMap<u64, Timer>>,
}

impl ManualLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since the loop was created
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Move the clock forward by `by`, firing every callback that falls due.
    ///
    /// Returns the number of ticks fired. Stops at the first failing tick and
    /// returns its error; the clock then rests at that tick's due time.
    pub fn advance(&self, by: Duration) -> Result<usize, BridgeError> {
        let target = self.now.get() + by;
        let mut fired = 0;

        while let Some((id, due)) = self.next_due(target) {
            self.now.set(due);

            let callback = {
                let mut timers = self.timers.borrow_mut();
                match timers.get_mut(&id) {
                    Some(timer) => {
                        timer.next_due += timer.interval;
                        timer.callback.take()
                    }
                    None => None,
                }
            };
            let Some(mut callback) = callback else {
                continue;
            };

            trace!(timer_id = id, now_ms = due.as_millis() as u64, "Firing tick");
            let result = callback();
            fired += 1;

            if let Some(timer) = self.timers.borrow_mut().get_mut(&id) {
                timer.callback = Some(callback);
            }
            result?;
        }

        self.now.set(target);
        Ok(fired)
    }

    fn next_due(&self, target: Duration) -> Option<(u64, Duration)> {
        self.timers
            .borrow()
            .iter()
            .filter(|(_, timer)| timer.callback.is_some() && timer.next_due <= target)
            .min_by_key(|(id, timer)| (timer.next_due, **id))
            .map(|(id, timer)| (*id, timer.next_due))
    }
}

impl Scheduler for ManualLoop {
    fn schedule_periodic(&self, interval: Duration, callback: TickCallback) -> TimerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let interval = interval.max(MIN_INTERVAL);

        self.timers.borrow_mut().insert(
            id,
            Timer {
                interval,
                next_due: self.now.get() + interval,
                callback: Some(callback),
            },
        );
        debug!(timer_id = id, interval_ms = interval.as_millis() as u64, "Periodic timer registered");
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        // Dropping a callback may drop state that cancels further timers, so release the borrow first
        let removed = self.timers.borrow_mut().remove(&handle.id());
        if removed.is_some() {
            debug!(timer_id = handle.id(), "Periodic timer cancelled");
        }
        drop(removed);
    }
}
