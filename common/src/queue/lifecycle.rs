// Open/Closed state shared by consumers and producers

use crate::errors::BridgeError;
use crate::scheduler::{Scheduler, TimerHandle};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

/// Tracks whether a component is open and owns its single periodic timer.
///
/// The timer is cancelled exactly once: on close, or on drop if the component
/// was never closed.
pub(crate) struct Lifecycle {
    component: String,
    closed: Cell<bool>,
    timer: RefCell<Option<TimerHandle>>,
    scheduler: Rc<dyn Scheduler>,
}

impl Lifecycle {
    pub(crate) fn new(component: String, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            component,
            closed: Cell::new(false),
            timer: RefCell::new(None),
            scheduler,
        }
    }

    pub(crate) fn component(&self) -> &str {
        &self.component
    }

    /// Store the handle returned when the component registered its tick
    pub(crate) fn attach(&self, handle: TimerHandle) {
        let previous = self.timer.borrow_mut().replace(handle);
        debug_assert!(previous.is_none(), "a component owns a single timer");
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> Result<(), BridgeError> {
        if self.closed.get() {
            return Err(BridgeError::illegal_state(&self.component, operation));
        }
        Ok(())
    }

    /// Move to Closed. Returns true only for the call that performed the transition.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.replace(true)
    }

    /// Cancel the owned timer, if it has not been cancelled yet
    pub(crate) fn release_timer(&self) {
        let handle = self.timer.borrow_mut().take();
        if let Some(handle) = handle {
            debug!(component = %self.component, timer_id = handle.id(), "Releasing timer");
            self.scheduler.cancel(handle);
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            debug!(component = %self.component, timer_id = handle.id(), "Releasing timer of dropped component");
            self.scheduler.cancel(handle);
        }
    }
}
