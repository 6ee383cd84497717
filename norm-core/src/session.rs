//! Transport sessions and the per-instance registry that maps engine handles
//! back to session values.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{Engine, SenderParams, SessionOption};
use crate::error::{NormError, Result};
use crate::handle::{NodeId, SessionHandle};
use crate::object::{DataObject, FileObject, StreamObject, TransportObject};
use crate::protocol::{AckingStatus, NackingMode, ProbingMode, RepairBoundary, SyncPolicy};

/// Handle-to-session lookup for one instance. Holds weak references only, so
/// registration never keeps a session alive.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionHandle, Weak<SessionInner>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live session registered under `handle`, if any.
    pub fn lookup(&self, handle: SessionHandle) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let inner = sessions.get(&handle)?.upgrade();
        match inner {
            Some(inner) => Some(Session { inner }),
            None => {
                sessions.remove(&handle);
                None
            }
        }
    }

    /// Number of live registered sessions.
    pub fn len(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, handle: SessionHandle, inner: &Arc<SessionInner>) {
        self.sessions.lock().insert(handle, Arc::downgrade(inner));
    }

    fn remove(&self, handle: SessionHandle) -> bool {
        self.sessions.lock().remove(&handle).is_some()
    }

    pub(crate) fn clear(&self) {
        self.sessions.lock().clear();
    }
}

/// A transport session: one multicast (or unicast) group address and port.
/// Clones share state; equality and hashing follow the engine handle.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    engine: Arc<dyn Engine>,
    handle: SessionHandle,
    registry: Weak<SessionRegistry>,
    roles: Mutex<Roles>,
}

#[derive(Default)]
struct Roles {
    sender: bool,
    receiver: bool,
    destroyed: bool,
}

/// Validate `offset`/`length` against a buffer of `len` bytes.
pub(crate) fn checked_span(
    len: usize,
    offset: isize,
    length: isize,
    offset_what: &'static str,
    length_what: &'static str,
) -> Result<Range<usize>> {
    if offset < 0 || offset as usize >= len {
        return Err(NormError::OutOfRange { what: offset_what });
    }
    let start = offset as usize;
    if length < 1 || length as usize > len - start {
        return Err(NormError::OutOfRange { what: length_what });
    }
    Ok(start..start + length as usize)
}

fn info_span<'a>(info: Option<(&'a [u8], isize, isize)>) -> Result<&'a [u8]> {
    match info {
        None => Ok(&[]),
        Some((buf, offset, length)) => {
            let range = checked_span(buf.len(), offset, length, "info offset", "info length")?;
            Ok(&buf[range])
        }
    }
}

impl Session {
    pub(crate) fn register(
        engine: Arc<dyn Engine>,
        handle: SessionHandle,
        registry: &Arc<SessionRegistry>,
    ) -> Session {
        let inner = Arc::new(SessionInner {
            engine,
            handle,
            registry: Arc::downgrade(registry),
            roles: Mutex::new(Roles::default()),
        });
        registry.insert(handle, &inner);
        Session { inner }
    }

    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    pub fn is_sender_active(&self) -> bool {
        self.inner.roles.lock().sender
    }

    pub fn is_receiver_active(&self) -> bool {
        self.inner.roles.lock().receiver
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.roles.lock().destroyed
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(NormError::SessionDestroyed);
        }
        Ok(())
    }

    /// Stop any active role, unregister and release the native session.
    pub fn destroy(&self) {
        {
            let mut roles = self.inner.roles.lock();
            if roles.destroyed {
                return;
            }
            if roles.sender {
                self.inner.engine.stop_sender(self.inner.handle);
            }
            if roles.receiver {
                self.inner.engine.stop_receiver(self.inner.handle);
            }
            *roles = Roles {
                destroyed: true,
                ..Roles::default()
            };
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.handle);
        }
        self.inner.engine.destroy_session(self.inner.handle);
        debug!(handle = ?self.inner.handle, "session destroyed");
    }

    pub fn local_node_id(&self) -> NodeId {
        self.inner.engine.local_node_id(self.inner.handle)
    }

    pub fn start_sender(&self, params: &SenderParams) -> Result<()> {
        let mut roles = self.inner.roles.lock();
        if roles.destroyed {
            return Err(NormError::SessionDestroyed);
        }
        if !self.inner.engine.start_sender(self.inner.handle, params) {
            return Err(NormError::Engine("failed to start sender"));
        }
        roles.sender = true;
        debug!(handle = ?self.inner.handle, session_id = params.session_id, "sender started");
        Ok(())
    }

    pub fn stop_sender(&self) {
        let mut roles = self.inner.roles.lock();
        if roles.sender {
            self.inner.engine.stop_sender(self.inner.handle);
            roles.sender = false;
        }
    }

    pub fn start_receiver(&self, buffer_space: u64) -> Result<()> {
        let mut roles = self.inner.roles.lock();
        if roles.destroyed {
            return Err(NormError::SessionDestroyed);
        }
        if !self
            .inner
            .engine
            .start_receiver(self.inner.handle, buffer_space)
        {
            return Err(NormError::Engine("failed to start receiver"));
        }
        roles.receiver = true;
        debug!(handle = ?self.inner.handle, buffer_space, "receiver started");
        Ok(())
    }

    pub fn stop_receiver(&self) {
        let mut roles = self.inner.roles.lock();
        if roles.receiver {
            self.inner.engine.stop_receiver(self.inner.handle);
            roles.receiver = false;
        }
    }

    /// Apply one pass-through tuning option.
    pub fn set_option(&self, option: SessionOption) -> Result<()> {
        self.ensure_alive()?;
        if !self
            .inner
            .engine
            .set_session_option(self.inner.handle, &option)
        {
            warn!(handle = ?self.inner.handle, ?option, "session option rejected");
            return Err(NormError::Engine("failed to apply session option"));
        }
        Ok(())
    }

    pub fn set_ttl(&self, ttl: u8) -> Result<()> {
        self.set_option(SessionOption::Ttl(ttl))
    }

    pub fn set_tos(&self, tos: u8) -> Result<()> {
        self.set_option(SessionOption::Tos(tos))
    }

    pub fn set_loopback(&self, enable: bool) -> Result<()> {
        self.set_option(SessionOption::Loopback(enable))
    }

    pub fn set_multicast_interface(&self, name: &str) -> Result<()> {
        self.set_option(SessionOption::MulticastInterface(name.to_owned()))
    }

    pub fn set_ssm(&self, source: &str) -> Result<()> {
        self.set_option(SessionOption::Ssm(source.to_owned()))
    }

    pub fn set_message_trace(&self, enable: bool) -> Result<()> {
        self.set_option(SessionOption::MessageTrace(enable))
    }

    pub fn set_tx_rate(&self, bits_per_second: f64) -> Result<()> {
        self.set_option(SessionOption::TxRate(bits_per_second))
    }

    pub fn set_tx_rate_bounds(&self, min: f64, max: f64) -> Result<()> {
        self.set_option(SessionOption::TxRateBounds { min, max })
    }

    pub fn set_congestion_control(&self, enable: bool, adjust_rate: bool) -> Result<()> {
        self.set_option(SessionOption::CongestionControl {
            enable,
            adjust_rate,
        })
    }

    pub fn set_grtt_estimate(&self, grtt: f64) -> Result<()> {
        self.set_option(SessionOption::GrttEstimate(grtt))
    }

    pub fn set_grtt_probing_mode(&self, mode: ProbingMode) -> Result<()> {
        self.set_option(SessionOption::GrttProbingMode(mode))
    }

    pub fn set_group_size(&self, size: u32) -> Result<()> {
        self.set_option(SessionOption::GroupSize(size))
    }

    pub fn set_silent_receiver(&self, silent: bool, max_delay: i32) -> Result<()> {
        self.set_option(SessionOption::SilentReceiver { silent, max_delay })
    }

    pub fn set_default_unicast_nack(&self, enable: bool) -> Result<()> {
        self.set_option(SessionOption::DefaultUnicastNack(enable))
    }

    pub fn set_default_sync_policy(&self, policy: SyncPolicy) -> Result<()> {
        self.set_option(SessionOption::DefaultSyncPolicy(policy))
    }

    pub fn set_default_nacking_mode(&self, mode: NackingMode) -> Result<()> {
        self.set_option(SessionOption::DefaultNackingMode(mode))
    }

    pub fn set_default_repair_boundary(&self, boundary: RepairBoundary) -> Result<()> {
        self.set_option(SessionOption::DefaultRepairBoundary(boundary))
    }

    pub fn tx_rate(&self) -> f64 {
        self.inner.engine.tx_rate(self.inner.handle)
    }

    pub fn grtt_estimate(&self) -> f64 {
        self.inner.engine.grtt_estimate(self.inner.handle)
    }

    pub fn report_interval(&self) -> f64 {
        self.inner.engine.report_interval(self.inner.handle)
    }

    /// Enqueue a file, using its path as the object info.
    pub fn file_enqueue(&self, path: impl AsRef<Path>) -> Result<FileObject> {
        let path = path.as_ref();
        let info = path.to_string_lossy().into_owned();
        self.file_enqueue_with_info(path, Some((info.as_bytes(), 0, info.len() as isize)))
    }

    /// Enqueue a file with `info[offset..offset + length]` as object info.
    pub fn file_enqueue_with_info(
        &self,
        path: impl AsRef<Path>,
        info: Option<(&[u8], isize, isize)>,
    ) -> Result<FileObject> {
        let info = info_span(info)?;
        self.ensure_alive()?;
        let handle = self
            .inner
            .engine
            .file_enqueue(self.inner.handle, path.as_ref(), info);
        if !handle.is_valid() {
            return Err(NormError::Engine("failed to enqueue file"));
        }
        Ok(FileObject::new(self.inner.engine.clone(), handle))
    }

    /// Enqueue `data[offset..offset + length]` for transmission. Offsets are
    /// signed so that caller arithmetic errors are caught rather than wrapped.
    pub fn data_enqueue(
        &self,
        data: impl Into<Arc<[u8]>>,
        offset: isize,
        length: isize,
    ) -> Result<DataObject> {
        self.data_enqueue_with_info(data, offset, length, None)
    }

    pub fn data_enqueue_with_info(
        &self,
        data: impl Into<Arc<[u8]>>,
        offset: isize,
        length: isize,
        info: Option<(&[u8], isize, isize)>,
    ) -> Result<DataObject> {
        let data = data.into();
        let range = checked_span(data.len(), offset, length, "data offset", "data length")?;
        let info = info_span(info)?;
        self.ensure_alive()?;
        let handle = self
            .inner
            .engine
            .data_enqueue(self.inner.handle, data, range, info);
        if !handle.is_valid() {
            return Err(NormError::Engine("failed to enqueue data"));
        }
        Ok(DataObject::new(self.inner.engine.clone(), handle))
    }

    /// Open a sender stream with a repair buffer of `buffer_size` bytes.
    pub fn stream_open(&self, buffer_size: u64) -> Result<StreamObject> {
        self.stream_open_with_info(buffer_size, None)
    }

    pub fn stream_open_with_info(
        &self,
        buffer_size: u64,
        info: Option<(&[u8], isize, isize)>,
    ) -> Result<StreamObject> {
        let info = info_span(info)?;
        self.ensure_alive()?;
        let handle = self
            .inner
            .engine
            .stream_open(self.inner.handle, buffer_size, info);
        if !handle.is_valid() {
            return Err(NormError::Engine("failed to open stream"));
        }
        Ok(StreamObject::new(self.inner.engine.clone(), handle))
    }

    pub fn requeue_object(&self, object: &impl TransportObject) -> Result<()> {
        if !self
            .inner
            .engine
            .requeue_object(self.inner.handle, object.handle())
        {
            return Err(NormError::Engine("failed to requeue object"));
        }
        Ok(())
    }

    /// Request positive acknowledgment from the acking nodes up to `object`.
    pub fn set_watermark(&self, object: &impl TransportObject, override_flush: bool) -> Result<()> {
        if !self
            .inner
            .engine
            .set_watermark(self.inner.handle, object.handle(), override_flush)
        {
            return Err(NormError::Engine("failed to set watermark"));
        }
        Ok(())
    }

    pub fn cancel_watermark(&self) {
        self.inner.engine.cancel_watermark(self.inner.handle)
    }

    pub fn reset_watermark(&self) -> Result<()> {
        if !self.inner.engine.reset_watermark(self.inner.handle) {
            return Err(NormError::Engine("failed to reset watermark"));
        }
        Ok(())
    }

    pub fn add_acking_node(&self, node: NodeId) -> Result<()> {
        if !self.inner.engine.add_acking_node(self.inner.handle, node) {
            return Err(NormError::Engine("failed to add acking node"));
        }
        Ok(())
    }

    pub fn remove_acking_node(&self, node: NodeId) {
        self.inner.engine.remove_acking_node(self.inner.handle, node)
    }

    /// Acknowledgment state of `node`, or the aggregate for [`NodeId::ANY`].
    pub fn acking_status(&self, node: NodeId) -> AckingStatus {
        self.inner.engine.acking_status(self.inner.handle, node)
    }

    /// Send an application command to the group. `robust` repeats it for reliability.
    pub fn send_command(
        &self,
        command: &[u8],
        offset: isize,
        length: isize,
        robust: bool,
    ) -> Result<()> {
        let range =
            checked_span(command.len(), offset, length, "command offset", "command length")?;
        if !self
            .inner
            .engine
            .send_command(self.inner.handle, &command[range], robust)
        {
            return Err(NormError::Engine("failed to send command"));
        }
        Ok(())
    }

    pub fn cancel_command(&self) {
        self.inner.engine.cancel_command(self.inner.handle)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.handle.hash(state)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.inner.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::protocol::FecType;
    use crate::sim::SimEngine;

    fn sender_params() -> SenderParams {
        SenderParams {
            session_id: 7,
            buffer_space: 64 * 1024,
            segment_size: 1400,
            block_size: 64,
            num_parity: 16,
            fec: FecType::Rs8,
        }
    }

    fn setup() -> (Arc<SimEngine>, Instance, Session) {
        let sim = Arc::new(SimEngine::new());
        let instance = Instance::create(sim.clone(), false).unwrap();
        let session = instance
            .create_session("224.1.2.3", 6003, NodeId(1))
            .unwrap();
        (sim, instance, session)
    }

    #[test]
    fn span_rules() {
        assert_eq!(checked_span(10, 0, 10, "o", "l").unwrap(), 0..10);
        assert_eq!(checked_span(10, 9, 1, "o", "l").unwrap(), 9..10);
        assert!(matches!(
            checked_span(10, -1, 1, "o", "l"),
            Err(NormError::OutOfRange { what: "o" })
        ));
        assert!(matches!(
            checked_span(10, 10, 1, "o", "l"),
            Err(NormError::OutOfRange { what: "o" })
        ));
        assert!(matches!(
            checked_span(10, 2, 0, "o", "l"),
            Err(NormError::OutOfRange { what: "l" })
        ));
        assert!(matches!(
            checked_span(10, 2, 9, "o", "l"),
            Err(NormError::OutOfRange { what: "l" })
        ));
        assert!(checked_span(0, 0, 1, "o", "l").is_err());
    }

    #[test]
    fn registry_resolves_to_same_session() {
        let (_sim, instance, session) = setup();
        let found = instance.registry().lookup(session.handle()).unwrap();
        assert_eq!(found, session);
        assert!(Arc::ptr_eq(&found.inner, &session.inner));
    }

    #[test]
    fn dropped_session_is_not_resolvable() {
        let (_sim, instance, session) = setup();
        let handle = session.handle();
        drop(session);
        assert!(instance.registry().lookup(handle).is_none());
        assert!(instance.registry().is_empty());
    }

    #[test]
    fn destroy_unregisters_and_stops_roles() {
        let (sim, instance, session) = setup();
        session.start_sender(&sender_params()).unwrap();
        session.start_receiver(1024).unwrap();
        session.destroy();
        assert!(instance.registry().lookup(session.handle()).is_none());
        assert!(!sim.is_sender(session.handle()));
        assert!(!sim.is_receiver(session.handle()));
        assert!(matches!(
            session.start_sender(&sender_params()),
            Err(NormError::SessionDestroyed)
        ));
        session.destroy();
    }

    #[test]
    fn rejected_sender_start_leaves_role_inactive() {
        let (_sim, _instance, session) = setup();
        let mut params = sender_params();
        params.buffer_space = 0;
        assert!(matches!(
            session.start_sender(&params),
            Err(NormError::Engine("failed to start sender"))
        ));
        assert!(!session.is_sender_active());
    }

    #[test]
    fn enqueue_validation_precedes_engine() {
        let (sim, _instance, session) = setup();
        session.start_sender(&sender_params()).unwrap();
        let data = vec![1u8; 16];
        assert!(matches!(
            session.data_enqueue(data.clone(), 16, 1),
            Err(NormError::OutOfRange { what: "data offset" })
        ));
        assert!(matches!(
            session.data_enqueue(data.clone(), 4, 13),
            Err(NormError::OutOfRange { what: "data length" })
        ));
        assert!(matches!(
            session.data_enqueue_with_info(data.clone(), 0, 16, Some((b"abc", 0, 4))),
            Err(NormError::OutOfRange { what: "info length" })
        ));
        assert_eq!(sim.enqueue_calls(), 0);

        let obj = session
            .data_enqueue_with_info(data, 4, 8, Some((b"abc", 1, 2)))
            .unwrap();
        assert_eq!(sim.enqueue_calls(), 1);
        assert_eq!(obj.size(), 8);
        assert_eq!(obj.info().as_deref(), Some(&b"bc"[..]));
    }

    #[test]
    fn enqueue_without_sender_fails() {
        let (_sim, _instance, session) = setup();
        assert!(matches!(
            session.data_enqueue(vec![0u8; 4], 0, 4),
            Err(NormError::Engine("failed to enqueue data"))
        ));
        assert!(matches!(
            session.stream_open(4096),
            Err(NormError::Engine("failed to open stream"))
        ));
    }

    #[test]
    fn options_pass_through() {
        let (sim, _instance, session) = setup();
        session.set_ttl(8).unwrap();
        session.set_loopback(true).unwrap();
        session.set_tx_rate(1.0e6).unwrap();
        assert_eq!(session.tx_rate(), 1.0e6);
        assert_eq!(
            sim.session_options(session.handle()),
            vec![
                SessionOption::Ttl(8),
                SessionOption::Loopback(true),
                SessionOption::TxRate(1.0e6)
            ]
        );
    }

    #[test]
    fn command_requires_sender() {
        let (sim, _instance, session) = setup();
        assert!(session.send_command(b"go", 0, 2, false).is_err());
        session.start_sender(&sender_params()).unwrap();
        session.send_command(b"go", 0, 2, true).unwrap();
        assert!(matches!(
            session.send_command(b"go", 0, 3, true),
            Err(NormError::OutOfRange { what: "command length" })
        ));
        assert_eq!(sim.pending_command(session.handle()).as_deref(), Some(&b"go"[..]));
        session.cancel_command();
        assert!(sim.pending_command(session.handle()).is_none());
    }
}
