//! In-process engine: no sockets, no engine thread.
//!
//! Instances, sessions, objects and nodes live in one table behind a mutex.
//! Sender streams forward what they accept to every receiving session bound to
//! the same address and port, on any instance of the same simulator, so a
//! writer and a reader can be wired together in one process. Hooks let tests
//! play the remote side: announce senders, deliver data, complete or abort
//! objects, drain transmit buffers and answer acknowledgment requests.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::engine::{Engine, NodeOption, RawEvent, Readiness, SenderParams, SessionOption};
use crate::handle::{Descriptor, InstanceHandle, NodeHandle, NodeId, ObjectHandle, SessionHandle};
use crate::protocol::{AckingStatus, EventType, FlushMode, NackingMode, ObjectType};

const DEFAULT_TX_RATE: f64 = 64_000.0;
const DEFAULT_GRTT: f64 = 0.5;
const DEFAULT_REPORT_INTERVAL: f64 = 20.0;

/// Simulated engine. Share it behind an `Arc` and hand clones to instances.
pub struct SimEngine {
    state: Mutex<SimState>,
    signal: Condvar,
}

struct SimState {
    next_handle: u64,
    instances: HashMap<InstanceHandle, SimInstance>,
    sessions: HashMap<SessionHandle, SimSession>,
    objects: HashMap<ObjectHandle, SimObject>,
    nodes: HashMap<NodeHandle, SimNode>,
    debug_level: u32,
    descriptor_wait: bool,
    tx_capacity: Option<usize>,
    enqueue_calls: usize,
}

#[derive(Default)]
struct SimInstance {
    queue: VecDeque<RawEvent>,
    woken: bool,
    running: bool,
    suspended: bool,
    descriptor_valid: bool,
    cache_dir: Option<PathBuf>,
    debug_log: Option<PathBuf>,
}

struct SimSession {
    instance: InstanceHandle,
    address: String,
    port: u16,
    local_id: NodeId,
    sender: Option<SenderParams>,
    receiver: Option<u64>,
    options: Vec<SessionOption>,
    tx_rate: f64,
    grtt: f64,
    report_interval: f64,
    watermark: Option<ObjectHandle>,
    acking: HashMap<NodeId, AckingStatus>,
    command: Option<Vec<u8>>,
}

struct SimObject {
    session: SessionHandle,
    info: Option<Vec<u8>>,
    size: u64,
    /// `NodeHandle::INVALID` for locally enqueued objects.
    sender: NodeHandle,
    nacking: NackingMode,
    retained: u32,
    cancelled: bool,
    body: SimBody,
}

enum SimBody {
    Data(Vec<u8>),
    File(PathBuf),
    Stream(SimStream),
}

#[derive(Default)]
struct SimStream {
    capacity: usize,
    /// Accepted by `stream_write`, not yet transmitted.
    pending: VecDeque<u8>,
    sent: Vec<u8>,
    /// Received, not yet read.
    rx: VecDeque<u8>,
    read_offset: u64,
    message_starts: VecDeque<u64>,
    peers: Vec<Peer>,
    broken: bool,
    closed: bool,
    completing: bool,
    completion_posted: bool,
    /// Gracefully closed sender stream; `TxObjectSent` follows once pending drains.
    finishing: bool,
    push_enable: bool,
    auto_flush: Option<FlushMode>,
    last_flush: Option<(bool, FlushMode)>,
    eom_marks: usize,
}

/// Receive-side copy of a local sender stream.
#[derive(Clone, Copy)]
struct Peer {
    session: SessionHandle,
    node: NodeHandle,
    object: ObjectHandle,
}

struct SimNode {
    session: SessionHandle,
    id: NodeId,
    address: Vec<u8>,
    port: u16,
    grtt: f64,
    command: Option<Vec<u8>>,
    options: Vec<NodeOption>,
    retained: u32,
    freed: bool,
}

impl SimObject {
    fn kind(&self) -> ObjectType {
        match self.body {
            SimBody::Data(_) => ObjectType::Data,
            SimBody::File(_) => ObjectType::File,
            SimBody::Stream(_) => ObjectType::Stream,
        }
    }

    fn is_local(&self) -> bool {
        !self.sender.is_valid()
    }

    fn stream(&self) -> Option<&SimStream> {
        match &self.body {
            SimBody::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    fn stream_mut(&mut self) -> Option<&mut SimStream> {
        match &mut self.body {
            SimBody::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

impl SimState {
    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn post(
        &mut self,
        session: SessionHandle,
        kind: EventType,
        node: NodeHandle,
        object: ObjectHandle,
    ) {
        let Some(instance) = self.sessions.get(&session).map(|s| s.instance) else {
            return;
        };
        if let Some(inst) = self.instances.get_mut(&instance) {
            trace!(%kind, ?session, ?object, "sim event");
            inst.queue.push_back(RawEvent::new(kind, session, node, object));
        }
    }

    fn stream_mut(&mut self, handle: ObjectHandle) -> Option<&mut SimStream> {
        self.objects.get_mut(&handle)?.stream_mut()
    }

    fn sender_active(&self, session: SessionHandle) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|s| s.sender.is_some())
    }

    fn add_object(
        &mut self,
        session: SessionHandle,
        sender: NodeHandle,
        info: Option<Vec<u8>>,
        size: u64,
        body: SimBody,
    ) -> ObjectHandle {
        let handle = ObjectHandle::from_raw(self.alloc());
        self.objects.insert(
            handle,
            SimObject {
                session,
                info,
                size,
                sender,
                nacking: NackingMode::Normal,
                retained: 0,
                cancelled: false,
                body,
            },
        );
        handle
    }

    fn add_node(
        &mut self,
        session: SessionHandle,
        id: NodeId,
        address: Vec<u8>,
        port: u16,
    ) -> NodeHandle {
        let handle = NodeHandle::from_raw(self.alloc());
        self.nodes.insert(
            handle,
            SimNode {
                session,
                id,
                address,
                port,
                grtt: DEFAULT_GRTT,
                command: None,
                options: Vec::new(),
                retained: 0,
                freed: false,
            },
        );
        self.post(session, EventType::RemoteSenderNew, handle, ObjectHandle::INVALID);
        handle
    }

    /// Receiving sessions in the same group as `session`, excluding itself.
    fn group_receivers(&self, session: SessionHandle) -> Vec<SessionHandle> {
        let Some(tx) = self.sessions.get(&session) else {
            return Vec::new();
        };
        self.sessions
            .iter()
            .filter(|(h, s)| {
                **h != session
                    && s.receiver.is_some()
                    && s.address == tx.address
                    && s.port == tx.port
            })
            .map(|(h, _)| *h)
            .collect()
    }

    fn peer_for(&mut self, tx: ObjectHandle, rx_session: SessionHandle) -> Option<Peer> {
        let existing = self
            .objects
            .get(&tx)?
            .stream()?
            .peers
            .iter()
            .find(|p| p.session == rx_session)
            .copied();
        if existing.is_some() {
            return existing;
        }
        let tx_obj = self.objects.get(&tx)?;
        let tx_session = self.sessions.get(&tx_obj.session)?;
        let (sender_id, port) = (tx_session.local_id, tx_session.port);
        let info = tx_obj.info.clone();
        let node = self.add_node(rx_session, sender_id, vec![127, 0, 0, 1], port);
        let body = SimBody::Stream(SimStream::default());
        let object = self.add_object(rx_session, node, info, 0, body);
        self.post(rx_session, EventType::RxObjectNew, node, object);
        let peer = Peer {
            session: rx_session,
            node,
            object,
        };
        self.stream_mut(tx)?.peers.push(peer);
        Some(peer)
    }

    /// Move everything pending on sender stream `tx` to the group's receivers.
    fn forward(&mut self, tx: ObjectHandle) {
        let Some(session) = self.objects.get(&tx).map(|o| o.session) else {
            return;
        };
        let receivers = self.group_receivers(session);
        if receivers.is_empty() {
            return;
        }
        let Some(stream) = self.stream_mut(tx) else {
            return;
        };
        let was_full = stream.pending.len() >= stream.capacity;
        let bytes: Vec<u8> = stream.pending.drain(..).collect();
        stream.sent.extend_from_slice(&bytes);
        if was_full && !bytes.is_empty() {
            self.post(session, EventType::TxQueueVacancy, NodeHandle::INVALID, tx);
        }
        self.settle_sent(tx);
        for rx_session in receivers {
            let Some(peer) = self.peer_for(tx, rx_session) else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }
            if let Some(rx) = self.stream_mut(peer.object) {
                rx.rx.extend(bytes.iter().copied());
            }
            self.post(peer.session, EventType::RxObjectUpdated, peer.node, peer.object);
        }
    }

    /// Post completion for a receive stream once its buffered bytes are read.
    fn settle_completion(&mut self, object: ObjectHandle) {
        let Some(obj) = self.objects.get_mut(&object) else {
            return;
        };
        let (session, sender) = (obj.session, obj.sender);
        let Some(stream) = obj.stream_mut() else {
            return;
        };
        if stream.completing && !stream.completion_posted && stream.rx.is_empty() {
            stream.completion_posted = true;
            self.post(session, EventType::RxObjectCompleted, sender, object);
        }
    }

    fn settle_sent(&mut self, tx: ObjectHandle) {
        let Some(session) = self.objects.get(&tx).map(|o| o.session) else {
            return;
        };
        let Some(stream) = self.stream_mut(tx) else {
            return;
        };
        if stream.finishing && stream.pending.is_empty() {
            stream.finishing = false;
            self.post(session, EventType::TxObjectSent, NodeHandle::INVALID, tx);
        }
    }

    fn settle_watermark(&mut self, session: SessionHandle) {
        let Some(s) = self.sessions.get(&session) else {
            return;
        };
        let Some(watermark) = s.watermark else {
            return;
        };
        if s.acking.values().all(|st| *st != AckingStatus::Pending) {
            self.post(session, EventType::TxWatermarkCompleted, NodeHandle::INVALID, watermark);
        }
    }

    fn set_ack(&mut self, session: SessionHandle, node: NodeId, status: AckingStatus) {
        let Some(s) = self.sessions.get_mut(&session) else {
            return;
        };
        if let Some(entry) = s.acking.get_mut(&node) {
            *entry = status;
        }
        self.settle_watermark(session);
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 0,
                instances: HashMap::new(),
                sessions: HashMap::new(),
                objects: HashMap::new(),
                nodes: HashMap::new(),
                debug_level: 0,
                descriptor_wait: true,
                tx_capacity: None,
                enqueue_calls: 0,
            }),
            signal: Condvar::new(),
        }
    }

    /// Cap every sender stream's transmit buffer at `capacity` bytes instead of
    /// the size requested at open.
    pub fn with_tx_capacity(capacity: usize) -> Self {
        let sim = Self::new();
        sim.state.lock().tx_capacity = Some(capacity);
        sim
    }

    /// Run `f` on the table, then wake every waiter.
    fn update<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let result = f(&mut self.state.lock());
        self.signal.notify_all();
        result
    }

    fn read<T>(&self, f: impl FnOnce(&SimState) -> T) -> T {
        f(&self.state.lock())
    }

    // Test hooks

    /// Make `wait_readable` report `Unsupported`, forcing callers to poll.
    pub fn disable_descriptor_wait(&self) {
        self.update(|st| st.descriptor_wait = false)
    }

    pub fn invalidate_descriptor(&self, instance: InstanceHandle) {
        self.update(|st| {
            if let Some(inst) = st.instances.get_mut(&instance) {
                inst.descriptor_valid = false;
            }
        })
    }

    /// Queue an arbitrary event on `instance`.
    pub fn post(&self, instance: InstanceHandle, event: RawEvent) {
        self.update(|st| {
            if let Some(inst) = st.instances.get_mut(&instance) {
                inst.queue.push_back(event);
            }
        })
    }

    /// Queue an event on the instance that owns `session`.
    pub fn post_event(
        &self,
        session: SessionHandle,
        kind: EventType,
        node: NodeHandle,
        object: ObjectHandle,
    ) {
        self.update(|st| st.post(session, kind, node, object))
    }

    /// Announce a remote sender on `session`.
    pub fn add_remote_node(
        &self,
        session: SessionHandle,
        id: NodeId,
        address: SocketAddr,
    ) -> NodeHandle {
        let bytes = match address.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        self.add_remote_node_with_address(session, id, &bytes, address.port())
    }

    /// Announce a remote sender whose address bytes are taken verbatim.
    pub fn add_remote_node_with_address(
        &self,
        session: SessionHandle,
        id: NodeId,
        address: &[u8],
        port: u16,
    ) -> NodeHandle {
        self.update(|st| st.add_node(session, id, address.to_vec(), port))
    }

    /// Announce a new stream from `node`.
    pub fn open_remote_stream(&self, session: SessionHandle, node: NodeHandle) -> ObjectHandle {
        self.update(|st| {
            let body = SimBody::Stream(SimStream::default());
            let object = st.add_object(session, node, None, 0, body);
            st.post(session, EventType::RxObjectNew, node, object);
            object
        })
    }

    pub fn add_remote_data(
        &self,
        session: SessionHandle,
        node: NodeHandle,
        data: &[u8],
        info: Option<&[u8]>,
    ) -> ObjectHandle {
        self.update(|st| {
            let object = st.add_object(
                session,
                node,
                info.map(<[u8]>::to_vec),
                data.len() as u64,
                SimBody::Data(data.to_vec()),
            );
            st.post(session, EventType::RxObjectNew, node, object);
            object
        })
    }

    pub fn add_remote_file(
        &self,
        session: SessionHandle,
        node: NodeHandle,
        path: &Path,
    ) -> ObjectHandle {
        self.update(|st| {
            let object = st.add_object(session, node, None, 0, SimBody::File(path.to_path_buf()));
            st.post(session, EventType::RxObjectNew, node, object);
            object
        })
    }

    /// Make `data` readable on a receive stream.
    pub fn deliver(&self, stream: ObjectHandle, data: &[u8]) {
        self.update(|st| {
            let Some(obj) = st.objects.get_mut(&stream) else {
                return;
            };
            let (session, sender) = (obj.session, obj.sender);
            if let Some(s) = obj.stream_mut() {
                s.rx.extend(data.iter().copied());
                st.post(session, EventType::RxObjectUpdated, sender, stream);
            }
        })
    }

    /// Deliver `data` as the start of a new message.
    pub fn deliver_message(&self, stream: ObjectHandle, data: &[u8]) {
        {
            let mut st = self.state.lock();
            if let Some(s) = st.stream_mut(stream) {
                let start = s.read_offset + s.rx.len() as u64;
                s.message_starts.push_back(start);
            }
        }
        self.deliver(stream, data);
    }

    /// Sender finished the object. For streams the completion event follows
    /// once the reader has drained what was delivered.
    pub fn complete(&self, object: ObjectHandle) {
        self.update(|st| {
            let Some(obj) = st.objects.get_mut(&object) else {
                return;
            };
            let (session, sender) = (obj.session, obj.sender);
            match obj.stream_mut() {
                Some(stream) => {
                    stream.completing = true;
                    st.settle_completion(object);
                }
                None => st.post(session, EventType::RxObjectCompleted, sender, object),
            }
        })
    }

    pub fn abort(&self, object: ObjectHandle) {
        self.update(|st| {
            let Some(obj) = st.objects.get(&object) else {
                return;
            };
            let (session, sender) = (obj.session, obj.sender);
            st.post(session, EventType::RxObjectAborted, sender, object);
        })
    }

    /// Make the next read on `stream` fail as a break in delivery order.
    pub fn break_stream(&self, stream: ObjectHandle) {
        self.update(|st| {
            if let Some(s) = st.stream_mut(stream) {
                s.broken = true;
            }
        })
    }

    /// Transmit up to `max` pending bytes of a sender stream. Posts
    /// `TxQueueVacancy` when the buffer was full.
    pub fn drain_tx(&self, stream: ObjectHandle, max: usize) -> Vec<u8> {
        self.update(|st| {
            let Some(session) = st.objects.get(&stream).map(|o| o.session) else {
                return Vec::new();
            };
            let Some(s) = st.stream_mut(stream) else {
                return Vec::new();
            };
            let was_full = s.pending.len() >= s.capacity;
            let n = max.min(s.pending.len());
            let bytes: Vec<u8> = s.pending.drain(..n).collect();
            s.sent.extend_from_slice(&bytes);
            if was_full && n > 0 {
                st.post(session, EventType::TxQueueVacancy, NodeHandle::INVALID, stream);
            }
            st.settle_sent(stream);
            bytes
        })
    }

    /// Everything a sender stream has transmitted so far.
    pub fn transmitted(&self, stream: ObjectHandle) -> Vec<u8> {
        self.read(|st| {
            st.objects
                .get(&stream)
                .and_then(SimObject::stream)
                .map(|s| s.sent.clone())
                .unwrap_or_default()
        })
    }

    /// Acking node `node` acknowledged the watermark.
    pub fn ack(&self, session: SessionHandle, node: NodeId) {
        self.update(|st| st.set_ack(session, node, AckingStatus::Success))
    }

    /// Acking node `node` never answered.
    pub fn fail_ack(&self, session: SessionHandle, node: NodeId) {
        self.update(|st| st.set_ack(session, node, AckingStatus::Failure))
    }

    /// Application command received from `node`.
    pub fn receive_command(&self, node: NodeHandle, command: &[u8]) {
        self.update(|st| {
            let Some(n) = st.nodes.get_mut(&node) else {
                return;
            };
            n.command = Some(command.to_vec());
            let session = n.session;
            st.post(session, EventType::RxCmdNew, node, ObjectHandle::INVALID);
        })
    }

    pub fn enqueue_calls(&self) -> usize {
        self.read(|st| st.enqueue_calls)
    }

    pub fn session_count(&self) -> usize {
        self.read(|st| st.sessions.len())
    }

    pub fn is_sender(&self, session: SessionHandle) -> bool {
        self.read(|st| st.sender_active(session))
    }

    pub fn is_receiver(&self, session: SessionHandle) -> bool {
        self.read(|st| {
            st.sessions
                .get(&session)
                .is_some_and(|s| s.receiver.is_some())
        })
    }

    pub fn session_options(&self, session: SessionHandle) -> Vec<SessionOption> {
        self.read(|st| {
            st.sessions
                .get(&session)
                .map(|s| s.options.clone())
                .unwrap_or_default()
        })
    }

    pub fn node_options(&self, node: NodeHandle) -> Vec<NodeOption> {
        self.read(|st| {
            st.nodes
                .get(&node)
                .map(|n| n.options.clone())
                .unwrap_or_default()
        })
    }

    pub fn retain_count(&self, object: ObjectHandle) -> u32 {
        self.read(|st| st.objects.get(&object).map_or(0, |o| o.retained))
    }

    pub fn is_cancelled(&self, object: ObjectHandle) -> bool {
        self.read(|st| st.objects.get(&object).is_some_and(|o| o.cancelled))
    }

    pub fn nacking_mode(&self, object: ObjectHandle) -> Option<NackingMode> {
        self.read(|st| st.objects.get(&object).map(|o| o.nacking))
    }

    pub fn node_retain_count(&self, node: NodeHandle) -> u32 {
        self.read(|st| st.nodes.get(&node).map_or(0, |n| n.retained))
    }

    pub fn node_buffers_freed(&self, node: NodeHandle) -> bool {
        self.read(|st| st.nodes.get(&node).is_some_and(|n| n.freed))
    }

    /// Last command handed to `send_command` and not cancelled.
    pub fn pending_command(&self, session: SessionHandle) -> Option<Vec<u8>> {
        self.read(|st| st.sessions.get(&session)?.command.clone())
    }

    pub fn instance_running(&self, instance: InstanceHandle) -> bool {
        self.read(|st| st.instances.get(&instance).is_some_and(|i| i.running))
    }

    pub fn is_suspended(&self, instance: InstanceHandle) -> bool {
        self.read(|st| st.instances.get(&instance).is_some_and(|i| i.suspended))
    }

    pub fn debug_log(&self, instance: InstanceHandle) -> Option<PathBuf> {
        self.read(|st| st.instances.get(&instance)?.debug_log.clone())
    }

    pub fn cache_directory(&self, instance: InstanceHandle) -> Option<PathBuf> {
        self.read(|st| st.instances.get(&instance)?.cache_dir.clone())
    }

    fn with_stream<T: Default>(&self, stream: ObjectHandle, f: impl FnOnce(&SimStream) -> T) -> T {
        self.read(|st| {
            st.objects
                .get(&stream)
                .and_then(SimObject::stream)
                .map(f)
                .unwrap_or_default()
        })
    }

    pub fn last_flush(&self, stream: ObjectHandle) -> Option<(bool, FlushMode)> {
        self.with_stream(stream, |s| s.last_flush)
    }

    pub fn eom_marks(&self, stream: ObjectHandle) -> usize {
        self.with_stream(stream, |s| s.eom_marks)
    }

    pub fn push_enabled(&self, stream: ObjectHandle) -> bool {
        self.with_stream(stream, |s| s.push_enable)
    }

    pub fn auto_flush(&self, stream: ObjectHandle) -> FlushMode {
        self.with_stream(stream, |s| s.auto_flush.unwrap_or_default())
    }

    pub fn is_stream_closed(&self, stream: ObjectHandle) -> bool {
        self.with_stream(stream, |s| s.closed)
    }
}

impl Engine for SimEngine {
    fn create_instance(&self, _priority_boost: bool) -> InstanceHandle {
        self.update(|st| {
            let handle = InstanceHandle::from_raw(st.alloc());
            st.instances.insert(
                handle,
                SimInstance {
                    running: true,
                    descriptor_valid: true,
                    ..SimInstance::default()
                },
            );
            handle
        })
    }

    fn destroy_instance(&self, instance: InstanceHandle) {
        self.update(|st| {
            st.instances.remove(&instance);
            st.sessions.retain(|_, s| s.instance != instance);
        })
    }

    fn stop_instance(&self, instance: InstanceHandle) {
        self.update(|st| {
            if let Some(inst) = st.instances.get_mut(&instance) {
                inst.running = false;
            }
        })
    }

    fn restart_instance(&self, instance: InstanceHandle) -> bool {
        self.update(|st| match st.instances.get_mut(&instance) {
            Some(inst) => {
                inst.running = true;
                inst.suspended = false;
                true
            }
            None => false,
        })
    }

    fn suspend_instance(&self, instance: InstanceHandle) -> bool {
        self.update(|st| match st.instances.get_mut(&instance) {
            Some(inst) => {
                inst.suspended = true;
                true
            }
            None => false,
        })
    }

    fn resume_instance(&self, instance: InstanceHandle) {
        self.update(|st| {
            if let Some(inst) = st.instances.get_mut(&instance) {
                inst.suspended = false;
            }
        })
    }

    fn set_cache_directory(&self, instance: InstanceHandle, path: &Path) -> bool {
        self.update(|st| match st.instances.get_mut(&instance) {
            Some(inst) => {
                inst.cache_dir = Some(path.to_path_buf());
                true
            }
            None => false,
        })
    }

    fn open_debug_log(&self, instance: InstanceHandle, path: &Path) -> bool {
        self.update(|st| match st.instances.get_mut(&instance) {
            Some(inst) if !path.as_os_str().is_empty() => {
                inst.debug_log = Some(path.to_path_buf());
                true
            }
            _ => false,
        })
    }

    fn close_debug_log(&self, instance: InstanceHandle) {
        self.update(|st| {
            if let Some(inst) = st.instances.get_mut(&instance) {
                inst.debug_log = None;
            }
        })
    }

    fn open_debug_pipe(&self, instance: InstanceHandle, name: &str) -> bool {
        self.read(|st| st.instances.contains_key(&instance) && !name.is_empty())
    }

    fn set_debug_level(&self, level: u32) {
        self.update(|st| st.debug_level = level)
    }

    fn debug_level(&self) -> u32 {
        self.read(|st| st.debug_level)
    }

    fn descriptor(&self, instance: InstanceHandle) -> Descriptor {
        self.read(|st| match st.instances.get(&instance) {
            Some(inst) if inst.descriptor_valid => Descriptor(instance.as_raw() as i64),
            _ => Descriptor::INVALID,
        })
    }

    fn wait_readable(
        &self,
        instance: InstanceHandle,
        descriptor: Descriptor,
        timeout: Duration,
    ) -> Readiness {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
        let mut st = self.state.lock();
        if !st.descriptor_wait {
            return Readiness::Unsupported;
        }
        loop {
            let Some(inst) = st.instances.get_mut(&instance) else {
                return Readiness::TimedOut;
            };
            if !inst.descriptor_valid || descriptor != Descriptor(instance.as_raw() as i64) {
                return Readiness::TimedOut;
            }
            if !inst.queue.is_empty() {
                return Readiness::Ready;
            }
            if inst.woken {
                inst.woken = false;
                return Readiness::Woken;
            }
            if self.signal.wait_until(&mut st, deadline).timed_out() {
                let ready = st
                    .instances
                    .get(&instance)
                    .is_some_and(|i| !i.queue.is_empty());
                return if ready {
                    Readiness::Ready
                } else {
                    Readiness::TimedOut
                };
            }
        }
    }

    fn wake(&self, instance: InstanceHandle) {
        self.update(|st| {
            if let Some(inst) = st.instances.get_mut(&instance) {
                inst.woken = true;
            }
        })
    }

    fn next_event(&self, instance: InstanceHandle, wait: bool) -> Option<RawEvent> {
        let mut st = self.state.lock();
        loop {
            let inst = st.instances.get_mut(&instance)?;
            if let Some(event) = inst.queue.pop_front() {
                return Some(event);
            }
            if !wait || !inst.running {
                return None;
            }
            self.signal.wait(&mut st);
        }
    }

    fn create_session(
        &self,
        instance: InstanceHandle,
        address: &str,
        port: u16,
        local_id: NodeId,
    ) -> SessionHandle {
        self.update(|st| {
            if !st.instances.contains_key(&instance) || address.is_empty() || port == 0 {
                return SessionHandle::INVALID;
            }
            let raw = st.alloc();
            let handle = SessionHandle::from_raw(raw);
            let local_id = if local_id == NodeId::ANY {
                NodeId(raw as u32)
            } else {
                local_id
            };
            st.sessions.insert(
                handle,
                SimSession {
                    instance,
                    address: address.to_owned(),
                    port,
                    local_id,
                    sender: None,
                    receiver: None,
                    options: Vec::new(),
                    tx_rate: DEFAULT_TX_RATE,
                    grtt: DEFAULT_GRTT,
                    report_interval: DEFAULT_REPORT_INTERVAL,
                    watermark: None,
                    acking: HashMap::new(),
                    command: None,
                },
            );
            handle
        })
    }

    fn destroy_session(&self, session: SessionHandle) {
        self.update(|st| {
            st.sessions.remove(&session);
        })
    }

    fn local_node_id(&self, session: SessionHandle) -> NodeId {
        self.read(|st| st.sessions.get(&session).map_or(NodeId::NONE, |s| s.local_id))
    }

    fn set_session_option(&self, session: SessionHandle, option: &SessionOption) -> bool {
        self.update(|st| {
            let Some(s) = st.sessions.get_mut(&session) else {
                return false;
            };
            match option {
                SessionOption::TxRate(rate) => s.tx_rate = *rate,
                SessionOption::GrttEstimate(grtt) => s.grtt = *grtt,
                SessionOption::ReportInterval(interval) => s.report_interval = *interval,
                _ => {}
            }
            s.options.push(option.clone());
            true
        })
    }

    fn tx_rate(&self, session: SessionHandle) -> f64 {
        self.read(|st| st.sessions.get(&session).map_or(-1.0, |s| s.tx_rate))
    }

    fn grtt_estimate(&self, session: SessionHandle) -> f64 {
        self.read(|st| st.sessions.get(&session).map_or(-1.0, |s| s.grtt))
    }

    fn report_interval(&self, session: SessionHandle) -> f64 {
        self.read(|st| st.sessions.get(&session).map_or(-1.0, |s| s.report_interval))
    }

    fn start_sender(&self, session: SessionHandle, params: &SenderParams) -> bool {
        self.update(|st| {
            let Some(s) = st.sessions.get_mut(&session) else {
                return false;
            };
            if params.buffer_space == 0 || params.segment_size == 0 || params.block_size == 0 {
                return false;
            }
            s.sender = Some(*params);
            true
        })
    }

    fn stop_sender(&self, session: SessionHandle) {
        self.update(|st| {
            if let Some(s) = st.sessions.get_mut(&session) {
                s.sender = None;
            }
        })
    }

    fn start_receiver(&self, session: SessionHandle, buffer_space: u64) -> bool {
        self.update(|st| {
            let Some(s) = st.sessions.get_mut(&session) else {
                return false;
            };
            if buffer_space == 0 {
                return false;
            }
            s.receiver = Some(buffer_space);
            let (address, port) = (s.address.clone(), s.port);
            // Hand anything already queued by local senders in this group to the new receiver.
            let streams: Vec<ObjectHandle> = st
                .objects
                .iter()
                .filter(|(_, o)| {
                    o.is_local()
                        && o.stream().is_some_and(|s| !s.closed)
                        && st
                            .sessions
                            .get(&o.session)
                            .is_some_and(|s| s.address == address && s.port == port)
                })
                .map(|(h, _)| *h)
                .collect();
            for stream in streams {
                st.forward(stream);
            }
            true
        })
    }

    fn stop_receiver(&self, session: SessionHandle) {
        self.update(|st| {
            if let Some(s) = st.sessions.get_mut(&session) {
                s.receiver = None;
            }
        })
    }

    fn file_enqueue(&self, session: SessionHandle, path: &Path, info: &[u8]) -> ObjectHandle {
        self.update(|st| {
            st.enqueue_calls += 1;
            if !st.sender_active(session) {
                return ObjectHandle::INVALID;
            }
            let size = std::fs::metadata(path).map_or(0, |m| m.len());
            let info = (!info.is_empty()).then(|| info.to_vec());
            let body = SimBody::File(path.to_path_buf());
            st.add_object(session, NodeHandle::INVALID, info, size, body)
        })
    }

    fn data_enqueue(
        &self,
        session: SessionHandle,
        data: Arc<[u8]>,
        range: Range<usize>,
        info: &[u8],
    ) -> ObjectHandle {
        self.update(|st| {
            st.enqueue_calls += 1;
            if !st.sender_active(session) {
                return ObjectHandle::INVALID;
            }
            let Some(payload) = data.get(range) else {
                return ObjectHandle::INVALID;
            };
            let info = (!info.is_empty()).then(|| info.to_vec());
            st.add_object(
                session,
                NodeHandle::INVALID,
                info,
                payload.len() as u64,
                SimBody::Data(payload.to_vec()),
            )
        })
    }

    fn stream_open(&self, session: SessionHandle, buffer_size: u64, info: &[u8]) -> ObjectHandle {
        self.update(|st| {
            st.enqueue_calls += 1;
            if !st.sender_active(session) || buffer_size == 0 {
                return ObjectHandle::INVALID;
            }
            let capacity = st.tx_capacity.unwrap_or(buffer_size as usize);
            let info = (!info.is_empty()).then(|| info.to_vec());
            let stream = SimStream {
                capacity,
                ..SimStream::default()
            };
            st.add_object(session, NodeHandle::INVALID, info, 0, SimBody::Stream(stream))
        })
    }

    fn requeue_object(&self, session: SessionHandle, object: ObjectHandle) -> bool {
        self.read(|st| {
            st.sender_active(session)
                && st
                    .objects
                    .get(&object)
                    .is_some_and(|o| o.session == session && o.is_local())
        })
    }

    fn set_watermark(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        _override_flush: bool,
    ) -> bool {
        self.update(|st| {
            if !st.sender_active(session) || !st.objects.contains_key(&object) {
                return false;
            }
            let Some(s) = st.sessions.get_mut(&session) else {
                return false;
            };
            s.watermark = Some(object);
            for status in s.acking.values_mut() {
                *status = AckingStatus::Pending;
            }
            st.settle_watermark(session);
            true
        })
    }

    fn cancel_watermark(&self, session: SessionHandle) {
        self.update(|st| {
            if let Some(s) = st.sessions.get_mut(&session) {
                s.watermark = None;
            }
        })
    }

    fn reset_watermark(&self, session: SessionHandle) -> bool {
        self.update(|st| {
            let Some(s) = st.sessions.get_mut(&session) else {
                return false;
            };
            if s.watermark.is_none() {
                return false;
            }
            for status in s.acking.values_mut() {
                *status = AckingStatus::Pending;
            }
            true
        })
    }

    fn add_acking_node(&self, session: SessionHandle, node: NodeId) -> bool {
        self.update(|st| {
            let Some(s) = st.sessions.get_mut(&session) else {
                return false;
            };
            let status = if s.watermark.is_some() {
                AckingStatus::Pending
            } else {
                AckingStatus::Invalid
            };
            s.acking.insert(node, status);
            true
        })
    }

    fn remove_acking_node(&self, session: SessionHandle, node: NodeId) {
        self.update(|st| {
            if let Some(s) = st.sessions.get_mut(&session) {
                s.acking.remove(&node);
            }
        })
    }

    fn acking_status(&self, session: SessionHandle, node: NodeId) -> AckingStatus {
        self.read(|st| {
            let Some(s) = st.sessions.get(&session) else {
                return AckingStatus::Invalid;
            };
            if node != NodeId::ANY {
                return s.acking.get(&node).copied().unwrap_or(AckingStatus::Invalid);
            }
            if s.watermark.is_none() || s.acking.is_empty() {
                return AckingStatus::Invalid;
            }
            let statuses: Vec<AckingStatus> = s.acking.values().copied().collect();
            if statuses.contains(&AckingStatus::Pending) {
                AckingStatus::Pending
            } else if statuses.contains(&AckingStatus::Failure) {
                AckingStatus::Failure
            } else {
                AckingStatus::Success
            }
        })
    }

    fn send_command(&self, session: SessionHandle, command: &[u8], _robust: bool) -> bool {
        self.update(|st| {
            if !st.sender_active(session) {
                return false;
            }
            if let Some(s) = st.sessions.get_mut(&session) {
                s.command = Some(command.to_vec());
            }
            st.post(session, EventType::TxCmdSent, NodeHandle::INVALID, ObjectHandle::INVALID);
            true
        })
    }

    fn cancel_command(&self, session: SessionHandle) {
        self.update(|st| {
            if let Some(s) = st.sessions.get_mut(&session) {
                s.command = None;
            }
        })
    }

    fn object_type(&self, object: ObjectHandle) -> ObjectType {
        self.read(|st| st.objects.get(&object).map_or(ObjectType::None, SimObject::kind))
    }

    fn object_info(&self, object: ObjectHandle) -> Option<Vec<u8>> {
        self.read(|st| st.objects.get(&object)?.info.clone())
    }

    fn object_size(&self, object: ObjectHandle) -> u64 {
        self.read(|st| st.objects.get(&object).map_or(0, |o| o.size))
    }

    fn object_bytes_pending(&self, object: ObjectHandle) -> u64 {
        self.read(|st| {
            st.objects
                .get(&object)
                .and_then(SimObject::stream)
                .map_or(0, |s| s.pending.len() as u64)
        })
    }

    fn object_sender(&self, object: ObjectHandle) -> NodeHandle {
        self.read(|st| st.objects.get(&object).map_or(NodeHandle::INVALID, |o| o.sender))
    }

    fn object_set_nacking_mode(&self, object: ObjectHandle, mode: NackingMode) {
        self.update(|st| {
            if let Some(o) = st.objects.get_mut(&object) {
                o.nacking = mode;
            }
        })
    }

    fn object_cancel(&self, object: ObjectHandle) {
        self.update(|st| {
            if let Some(o) = st.objects.get_mut(&object) {
                o.cancelled = true;
            }
        })
    }

    fn object_retain(&self, object: ObjectHandle) {
        self.update(|st| {
            if let Some(o) = st.objects.get_mut(&object) {
                o.retained += 1;
            }
        })
    }

    fn object_release(&self, object: ObjectHandle) {
        self.update(|st| {
            if let Some(o) = st.objects.get_mut(&object) {
                o.retained = o.retained.saturating_sub(1);
            }
        })
    }

    fn data_access(&self, object: ObjectHandle) -> Vec<u8> {
        self.read(|st| match st.objects.get(&object).map(|o| &o.body) {
            Some(SimBody::Data(bytes)) => bytes.clone(),
            _ => Vec::new(),
        })
    }

    fn file_name(&self, object: ObjectHandle, buf: &mut [u8]) -> bool {
        self.read(|st| match st.objects.get(&object).map(|o| &o.body) {
            Some(SimBody::File(path)) => {
                let name = path.to_string_lossy();
                let bytes = name.as_bytes();
                // strncpy semantics: no terminator when the name fills the buffer.
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < buf.len() {
                    buf[n] = 0;
                }
                true
            }
            _ => false,
        })
    }

    fn file_rename(&self, object: ObjectHandle, path: &Path) -> bool {
        self.update(|st| match st.objects.get_mut(&object).map(|o| &mut o.body) {
            Some(SimBody::File(current)) => {
                *current = path.to_path_buf();
                true
            }
            _ => false,
        })
    }

    fn stream_write(&self, stream: ObjectHandle, buf: &[u8]) -> Option<usize> {
        self.update(|st| {
            let obj = st.objects.get_mut(&stream)?;
            if !obj.is_local() {
                return None;
            }
            let s = obj.stream_mut()?;
            if s.closed || s.broken {
                return None;
            }
            let n = s.capacity.saturating_sub(s.pending.len()).min(buf.len());
            s.pending.extend(buf[..n].iter().copied());
            st.forward(stream);
            Some(n)
        })
    }

    fn stream_read(&self, stream: ObjectHandle, buf: &mut [u8]) -> Option<usize> {
        self.update(|st| {
            let s = st.stream_mut(stream)?;
            if s.broken {
                return None;
            }
            let n = s.rx.len().min(buf.len());
            for (dst, src) in buf.iter_mut().zip(s.rx.drain(..n)) {
                *dst = src;
            }
            s.read_offset += n as u64;
            st.settle_completion(stream);
            Some(n)
        })
    }

    fn stream_flush(&self, stream: ObjectHandle, eom: bool, mode: FlushMode) {
        self.update(|st| {
            if let Some(s) = st.stream_mut(stream) {
                s.last_flush = Some((eom, mode));
            }
        })
    }

    fn stream_mark_eom(&self, stream: ObjectHandle) {
        self.update(|st| {
            if let Some(s) = st.stream_mut(stream) {
                s.eom_marks += 1;
            }
        })
    }

    fn stream_close(&self, stream: ObjectHandle, graceful: bool) {
        self.update(|st| {
            let local = st.objects.get(&stream).is_some_and(|o| o.is_local());
            let Some(s) = st.stream_mut(stream) else {
                return;
            };
            if s.closed {
                return;
            }
            s.closed = true;
            s.finishing = graceful && local;
            let peers = s.peers.clone();
            for peer in peers {
                if graceful {
                    if let Some(rx) = st.stream_mut(peer.object) {
                        rx.completing = true;
                    }
                    st.settle_completion(peer.object);
                } else {
                    st.post(peer.session, EventType::RxObjectAborted, peer.node, peer.object);
                }
            }
            if graceful {
                st.settle_sent(stream);
            }
        })
    }

    fn stream_has_vacancy(&self, stream: ObjectHandle) -> bool {
        self.with_stream(stream, |s| s.pending.len() < s.capacity)
    }

    fn stream_read_offset(&self, stream: ObjectHandle) -> u64 {
        self.with_stream(stream, |s| s.read_offset)
    }

    fn stream_seek_msg_start(&self, stream: ObjectHandle) -> bool {
        self.update(|st| {
            let Some(s) = st.stream_mut(stream) else {
                return false;
            };
            while s.message_starts.front().is_some_and(|b| *b < s.read_offset) {
                s.message_starts.pop_front();
            }
            let Some(start) = s.message_starts.pop_front() else {
                return false;
            };
            let skip = (start - s.read_offset) as usize;
            if skip > s.rx.len() {
                return false;
            }
            s.rx.drain(..skip);
            s.read_offset = start;
            true
        })
    }

    fn stream_set_push_enable(&self, stream: ObjectHandle, enable: bool) {
        self.update(|st| {
            if let Some(s) = st.stream_mut(stream) {
                s.push_enable = enable;
            }
        })
    }

    fn stream_set_auto_flush(&self, stream: ObjectHandle, mode: FlushMode) {
        self.update(|st| {
            if let Some(s) = st.stream_mut(stream) {
                s.auto_flush = Some(mode);
            }
        })
    }

    fn node_id(&self, node: NodeHandle) -> NodeId {
        self.read(|st| st.nodes.get(&node).map_or(NodeId::NONE, |n| n.id))
    }

    fn node_address(&self, node: NodeHandle, buf: &mut [u8]) -> Option<(usize, u16)> {
        self.read(|st| {
            let n = st.nodes.get(&node)?;
            if n.address.len() > buf.len() {
                return None;
            }
            buf[..n.address.len()].copy_from_slice(&n.address);
            Some((n.address.len(), n.port))
        })
    }

    fn node_grtt(&self, node: NodeHandle) -> f64 {
        self.read(|st| st.nodes.get(&node).map_or(-1.0, |n| n.grtt))
    }

    fn node_command(&self, node: NodeHandle, buf: &mut [u8]) -> Option<usize> {
        self.read(|st| {
            let command = st.nodes.get(&node)?.command.as_ref()?;
            let dst = buf.get_mut(..command.len())?;
            dst.copy_from_slice(command);
            Some(command.len())
        })
    }

    fn set_node_option(&self, node: NodeHandle, option: NodeOption) {
        self.update(|st| {
            if let Some(n) = st.nodes.get_mut(&node) {
                n.options.push(option);
            }
        })
    }

    fn node_free_buffers(&self, node: NodeHandle) {
        self.update(|st| {
            if let Some(n) = st.nodes.get_mut(&node) {
                n.freed = true;
            }
        })
    }

    fn node_retain(&self, node: NodeHandle) {
        self.update(|st| {
            if let Some(n) = st.nodes.get_mut(&node) {
                n.retained += 1;
            }
        })
    }

    fn node_release(&self, node: NodeHandle) {
        self.update(|st| {
            if let Some(n) = st.nodes.get_mut(&node) {
                n.retained = n.retained.saturating_sub(1);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FecType;

    fn params() -> SenderParams {
        SenderParams {
            session_id: 3,
            buffer_space: 4096,
            segment_size: 512,
            block_size: 16,
            num_parity: 4,
            fec: FecType::Rs8,
        }
    }

    fn drain(sim: &SimEngine, instance: InstanceHandle) -> Vec<EventType> {
        std::iter::from_fn(|| sim.next_event(instance, false))
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn loopback_forwards_to_group_receivers() {
        let sim = SimEngine::new();
        let tx_inst = sim.create_instance(false);
        let rx_inst = sim.create_instance(false);
        let tx = sim.create_session(tx_inst, "224.9.9.9", 7000, NodeId(1));
        let rx = sim.create_session(rx_inst, "224.9.9.9", 7000, NodeId(2));
        let other = sim.create_session(rx_inst, "224.9.9.9", 7001, NodeId(3));
        assert!(sim.start_receiver(rx, 4096));
        assert!(sim.start_receiver(other, 4096));
        assert!(sim.start_sender(tx, &params()));
        let stream = sim.stream_open(tx, 1024, b"");

        assert_eq!(sim.stream_write(stream, b"abc"), Some(3));
        assert_eq!(
            drain(&sim, rx_inst),
            vec![
                EventType::RemoteSenderNew,
                EventType::RxObjectNew,
                EventType::RxObjectUpdated
            ]
        );
        assert_eq!(sim.transmitted(stream), b"abc");

        sim.stream_close(stream, false);
        assert_eq!(drain(&sim, rx_inst), vec![EventType::RxObjectAborted]);
    }

    #[test]
    fn bounded_transmit_buffer() {
        let sim = SimEngine::with_tx_capacity(4);
        let inst = sim.create_instance(false);
        let tx = sim.create_session(inst, "224.9.9.9", 7000, NodeId(1));
        assert!(sim.start_sender(tx, &params()));
        let stream = sim.stream_open(tx, 1024, b"");
        assert_eq!(sim.stream_write(stream, b"abcdef"), Some(4));
        assert_eq!(sim.stream_write(stream, b"ef"), Some(0));
        assert!(!sim.stream_has_vacancy(stream));
        assert_eq!(sim.drain_tx(stream, 2), b"ab");
        assert_eq!(drain(&sim, inst), vec![EventType::TxQueueVacancy]);
        assert_eq!(sim.stream_write(stream, b"ef"), Some(2));
    }

    #[test]
    fn wait_readable_sees_posted_event_and_wake() {
        let sim = SimEngine::new();
        let inst = sim.create_instance(false);
        let fd = sim.descriptor(inst);
        assert_eq!(sim.wait_readable(inst, fd, Duration::ZERO), Readiness::TimedOut);
        sim.wake(inst);
        assert_eq!(sim.wait_readable(inst, fd, Duration::from_secs(5)), Readiness::Woken);
        sim.post(
            inst,
            RawEvent::new(
                EventType::UserTimeout,
                SessionHandle::INVALID,
                NodeHandle::INVALID,
                ObjectHandle::INVALID,
            ),
        );
        assert_eq!(sim.wait_readable(inst, fd, Duration::from_secs(5)), Readiness::Ready);
        sim.disable_descriptor_wait();
        assert_eq!(sim.wait_readable(inst, fd, Duration::ZERO), Readiness::Unsupported);
    }

    #[test]
    fn completion_waits_for_reader() {
        let sim = SimEngine::new();
        let inst = sim.create_instance(false);
        let rx = sim.create_session(inst, "224.9.9.9", 7000, NodeId(2));
        let node = sim.add_remote_node(rx, NodeId(5), "10.0.0.5:7000".parse().unwrap());
        let stream = sim.open_remote_stream(rx, node);
        sim.deliver(stream, b"xy");
        sim.complete(stream);
        assert_eq!(
            drain(&sim, inst),
            vec![
                EventType::RemoteSenderNew,
                EventType::RxObjectNew,
                EventType::RxObjectUpdated
            ]
        );
        let mut buf = [0u8; 8];
        assert_eq!(sim.stream_read(stream, &mut buf), Some(2));
        assert_eq!(drain(&sim, inst), vec![EventType::RxObjectCompleted]);
    }

    #[test]
    fn aggregate_acking_status() {
        let sim = SimEngine::new();
        let inst = sim.create_instance(false);
        let tx = sim.create_session(inst, "224.9.9.9", 7000, NodeId(1));
        assert!(sim.start_sender(tx, &params()));
        let obj = sim.data_enqueue(tx, Arc::from(&b"payload"[..]), 0..7, b"");
        assert!(sim.add_acking_node(tx, NodeId(10)));
        assert!(sim.add_acking_node(tx, NodeId(11)));
        assert_eq!(sim.acking_status(tx, NodeId::ANY), AckingStatus::Invalid);
        assert!(sim.set_watermark(tx, obj, false));
        assert_eq!(sim.acking_status(tx, NodeId::ANY), AckingStatus::Pending);
        sim.ack(tx, NodeId(10));
        assert_eq!(sim.acking_status(tx, NodeId(10)), AckingStatus::Success);
        assert_eq!(sim.acking_status(tx, NodeId::ANY), AckingStatus::Pending);
        sim.fail_ack(tx, NodeId(11));
        assert_eq!(sim.acking_status(tx, NodeId::ANY), AckingStatus::Failure);
        assert_eq!(drain(&sim, inst), vec![EventType::TxWatermarkCompleted]);
        assert_eq!(sim.acking_status(tx, NodeId(99)), AckingStatus::Invalid);
    }
}
