//! Event retrieval for the blocking adapters.

use std::time::{Duration, Instant};

use crate::error::{NormError, Result};
use crate::event::Event;
use crate::instance::Instance;

/// Upper bound on one descriptor wait. Closing wakes the wait directly; the
/// slice only bounds how stale a missed wake can get.
pub const WAIT_SLICE: Duration = Duration::from_secs(1);

pub(crate) struct EventPump {
    instance: Instance,
}

impl EventPump {
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }

    /// An already-queued event, without blocking.
    pub fn poll(&self) -> Option<Event> {
        if self.instance.has_next_event(Duration::ZERO) {
            self.instance.next_event(false)
        } else {
            None
        }
    }

    /// Block until an event is available. Fails with [`NormError::Closed`] once
    /// `closed` reports true.
    pub fn wait(&self, closed: impl Fn() -> bool) -> Result<Event> {
        loop {
            if closed() {
                return Err(NormError::Closed);
            }
            if self.instance.has_next_event(WAIT_SLICE) {
                if let Some(event) = self.instance.next_event(false) {
                    return Ok(event);
                }
            }
        }
    }

    /// Like [`EventPump::wait`], but gives up with `Ok(None)` at `deadline`.
    /// A `None` deadline never expires.
    pub fn wait_until(
        &self,
        deadline: Option<Instant>,
        closed: impl Fn() -> bool,
    ) -> Result<Option<Event>> {
        loop {
            if closed() {
                return Err(NormError::Closed);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    WAIT_SLICE.min(deadline - now)
                }
                None => WAIT_SLICE,
            };
            if self.instance.has_next_event(slice) {
                if let Some(event) = self.instance.next_event(false) {
                    return Ok(Some(event));
                }
            }
        }
    }
}
