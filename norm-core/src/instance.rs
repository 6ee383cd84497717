//! Protocol engine instance: owns one native engine thread and its event queue.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::engine::{Engine, RawEvent, Readiness};
use crate::error::{NormError, Result};
use crate::event::Event;
use crate::handle::{InstanceHandle, NodeId};
use crate::session::{Session, SessionRegistry};

/// Sleep granularity of the polling fallback used when the engine cannot wait on
/// its descriptor natively.
pub const FALLBACK_POLL_GRANULARITY: Duration = Duration::from_millis(1);

/// A native protocol engine instance. Cheap to clone; clones share the instance.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    engine: Arc<dyn Engine>,
    handle: InstanceHandle,
    registry: Arc<SessionRegistry>,
    /// Event fetched by the polling fallback, handed out by the next `next_event`.
    lookahead: Mutex<Option<RawEvent>>,
    wake_requested: AtomicBool,
    destroyed: AtomicBool,
}

impl Instance {
    /// Create an engine instance. `priority_boost` asks for a higher-priority engine thread.
    pub fn create(engine: Arc<dyn Engine>, priority_boost: bool) -> Result<Self> {
        let handle = engine.create_instance(priority_boost);
        if !handle.is_valid() {
            return Err(NormError::Engine("failed to create instance"));
        }
        debug!(?handle, priority_boost, "engine instance created");
        Ok(Self {
            inner: Arc::new(InstanceInner {
                engine,
                handle,
                registry: Arc::new(SessionRegistry::new()),
                lookahead: Mutex::new(None),
                wake_requested: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> InstanceHandle {
        self.inner.handle
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    /// Sessions created through this instance, by handle.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Shut down and destroy the engine instance. Repeated calls are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.registry.clear();
        self.inner.engine.destroy_instance(self.inner.handle);
        debug!(handle = ?self.inner.handle, "engine instance destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Stop the engine thread. Blocking event retrieval returns once stopped.
    pub fn stop(&self) {
        self.inner.engine.stop_instance(self.inner.handle);
    }

    pub fn restart(&self) -> bool {
        self.inner.engine.restart_instance(self.inner.handle)
    }

    pub fn suspend(&self) -> bool {
        self.inner.engine.suspend_instance(self.inner.handle)
    }

    pub fn resume(&self) {
        self.inner.engine.resume_instance(self.inner.handle)
    }

    /// Directory receivers use to cache incoming file objects.
    pub fn set_cache_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self
            .inner
            .engine
            .set_cache_directory(self.inner.handle, path.as_ref())
        {
            return Err(NormError::Engine("failed to set the cache directory"));
        }
        Ok(())
    }

    pub fn open_debug_log(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self
            .inner
            .engine
            .open_debug_log(self.inner.handle, path.as_ref())
        {
            return Err(NormError::Engine("failed to open debug log"));
        }
        Ok(())
    }

    pub fn close_debug_log(&self) {
        self.inner.engine.close_debug_log(self.inner.handle)
    }

    pub fn open_debug_pipe(&self, name: &str) -> Result<()> {
        if !self.inner.engine.open_debug_pipe(self.inner.handle, name) {
            return Err(NormError::Engine("failed to open debug pipe"));
        }
        Ok(())
    }

    pub fn set_debug_level(&self, level: u32) {
        self.inner.engine.set_debug_level(level)
    }

    pub fn debug_level(&self) -> u32 {
        self.inner.engine.debug_level()
    }

    /// Create a session bound to `address:port`. Use [`NodeId::ANY`] to let the
    /// engine choose the local node id.
    pub fn create_session(&self, address: &str, port: u16, local_id: NodeId) -> Result<Session> {
        let handle = self
            .inner
            .engine
            .create_session(self.inner.handle, address, port, local_id);
        if !handle.is_valid() {
            return Err(NormError::Engine("failed to create session"));
        }
        debug!(?handle, address, port, "session created");
        Ok(Session::register(
            self.inner.engine.clone(),
            handle,
            &self.inner.registry,
        ))
    }

    /// Block up to `timeout` for an event to be queued. Never errors: an invalid
    /// descriptor reads as "no event".
    pub fn has_next_event(&self, timeout: Duration) -> bool {
        if self.inner.lookahead.lock().is_some() {
            return true;
        }
        let engine = &self.inner.engine;
        let descriptor = engine.descriptor(self.inner.handle);
        if !descriptor.is_valid() {
            trace!(handle = ?self.inner.handle, "invalid descriptor");
            return false;
        }
        match engine.wait_readable(self.inner.handle, descriptor, timeout) {
            Readiness::Ready => true,
            Readiness::TimedOut | Readiness::Woken => false,
            Readiness::Unsupported => self.poll_for_event(timeout),
        }
    }

    /// Fallback for engines without descriptor waiting: check every
    /// [`FALLBACK_POLL_GRANULARITY`] until an event shows up, the deadline passes
    /// or [`Instance::wake`] is called.
    fn poll_for_event(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(raw) = self.inner.engine.next_event(self.inner.handle, false) {
                *self.inner.lookahead.lock() = Some(raw);
                return true;
            }
            if self.inner.wake_requested.swap(false, Ordering::AcqRel) {
                return false;
            }
            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    FALLBACK_POLL_GRANULARITY.min(deadline - now)
                }
                None => FALLBACK_POLL_GRANULARITY,
            };
            thread::sleep(nap);
        }
    }

    /// Interrupt a `has_next_event` wait running on another thread.
    pub fn wake(&self) {
        self.inner.wake_requested.store(true, Ordering::Release);
        self.inner.engine.wake(self.inner.handle);
    }

    /// Retrieve the next event. With `wait` the call may block inside the engine
    /// until an event arrives or the instance is stopped; without it, `None` is
    /// returned immediately when nothing is queued.
    pub fn next_event(&self, wait: bool) -> Option<Event> {
        let raw = match self.inner.lookahead.lock().take() {
            Some(raw) => Some(raw),
            None => self.inner.engine.next_event(self.inner.handle, wait),
        }?;
        trace!(kind = %raw.kind, session = ?raw.session, object = ?raw.object, "event");
        Some(Event::new(
            raw,
            self.inner.engine.clone(),
            self.inner.registry.clone(),
        ))
    }

    /// Iterate over events, stopping at the first wait that exceeds `timeout`.
    pub fn events(&self, timeout: Duration) -> Events<'_> {
        Events {
            instance: self,
            timeout,
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for Instance {}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.inner.handle)
            .finish()
    }
}

/// Iterator returned by [`Instance::events`].
pub struct Events<'a> {
    instance: &'a Instance,
    timeout: Duration,
}

impl Iterator for Events<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if !self.instance.has_next_event(self.timeout) {
                return None;
            }
            if let Some(event) = self.instance.next_event(false) {
                return Some(event);
            }
        }
    }
}
