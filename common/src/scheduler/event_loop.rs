// Real-time cooperative loop backed by a tokio LocalSet

use super::{Scheduler, TickCallback, TimerHandle};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Scheduler running every periodic callback as a local task.
///
/// Must be used from within a [`tokio::task::LocalSet`] on a current-thread
/// runtime, so callbacks never run concurrently with each other. The first
/// tick fires one interval after registration.
pub struct TokioLoop {
    next_id: Cell<u64>,
    timers: RefCell<HashMap<u64, AbortHandle>>,
}

impl Default for TokioLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioLoop {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            timers: RefCell::new(HashMap::new()),
        }
    }

    /// Number of registrations that have not been cancelled
    pub fn active_timers(&self) -> usize {
        self.timers.borrow().len()
    }
}

impl Scheduler for TokioLoop {
    fn schedule_periodic(&self, interval: Duration, mut callback: TickCallback) -> TimerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let task = tokio::task::spawn_local(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = callback() {
                    error!(timer_id = id, error = %e, "Periodic callback failed");
                }
            }
        });

        self.timers.borrow_mut().insert(id, task.abort_handle());
        debug!(timer_id = id, interval_ms = interval.as_millis() as u64, "Periodic timer registered");
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.timers.borrow_mut().remove(&handle.id()) {
            task.abort();
            debug!(timer_id = handle.id(), "Periodic timer cancelled");
        }
    }
}

impl Drop for TokioLoop {
    fn drop(&mut self) {
        for (_, task) in self.timers.get_mut().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use tokio::task::LocalSet;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_callback_fires_every_interval() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let scheduler = TokioLoop::new();
                let ticks = Rc::new(Cell::new(0));
                let counter = Rc::clone(&ticks);
                let handle = scheduler.schedule_periodic(
                    Duration::from_millis(100),
                    Box::new(move || {
                        counter.set(counter.get() + 1);
                        Ok(())
                    }),
                );

                tokio::time::sleep(Duration::from_millis(350)).await;
                assert_eq!(ticks.get(), 3);

                scheduler.cancel(handle);
                assert_eq!(scheduler.active_timers(), 0);
                tokio::time::sleep(Duration::from_millis(500)).await;
                assert_eq!(ticks.get(), 3);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failing_callback_keeps_ticking() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let scheduler = TokioLoop::new();
                let ticks = Rc::new(Cell::new(0));
                let counter = Rc::clone(&ticks);
                let _handle = scheduler.schedule_periodic(
                    Duration::from_millis(10),
                    Box::new(move || {
                        counter.set(counter.get() + 1);
                        Err(crate::errors::BridgeError::InvalidBatchSize)
                    }),
                );

                tokio::time::sleep(Duration::from_millis(35)).await;
                assert_eq!(ticks.get(), 3);
            })
            .await;
    }
}
