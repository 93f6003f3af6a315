// Scheduler capability: periodic callbacks on a cooperative, single-threaded loop

pub mod event_loop;
pub mod manual;

use crate::errors::BridgeError;
use std::time::Duration;

pub use event_loop::TokioLoop;
pub use manual::ManualLoop;

/// Callback invoked once per tick. An error is handed to the loop's own error policy.
pub type TickCallback = Box<dyn FnMut() -> Result<(), BridgeError>>;

/// Opaque token identifying one periodic registration.
///
/// Not `Clone`: cancelling consumes the handle, so a timer can be released only once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Create a handle. Intended for [`Scheduler`] implementations.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A loop that runs callbacks periodically, one at a time, to completion
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler {
    /// Run `callback` every `interval` until the returned handle is cancelled
    fn schedule_periodic(&self, interval: Duration, callback: TickCallback) -> TimerHandle;

    /// Stop a periodic registration. Unknown handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

/// Convert a configured interval in (possibly fractional) seconds into a [`Duration`]
pub fn interval_from_secs(seconds: f64) -> Result<Duration, BridgeError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(BridgeError::InvalidInterval(format!(
            "{} seconds is not a positive, finite interval",
            seconds
        )));
    }
    let interval = Duration::try_from_secs_f64(seconds)
        .map_err(|e| BridgeError::InvalidInterval(e.to_string()))?;
    validate_interval(interval)
}

pub(crate) fn validate_interval(interval: Duration) -> Result<Duration, BridgeError> {
    if interval.is_zero() {
        return Err(BridgeError::InvalidInterval(
            "interval must be greater than zero".to_string(),
        ));
    }
    Ok(interval)
}
