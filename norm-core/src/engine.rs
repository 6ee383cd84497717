//! The boundary with the native protocol engine.
//!
//! One method per native call the adaptation layer needs. Methods return the raw
//! results the engine produces (handles, flags, counts); turning those into
//! errors and managed wrappers is the job of the layers above. Implementations:
//! [`crate::sim::SimEngine`] (in-process) and, with the `native` feature,
//! `crate::ffi::NativeEngine` (libnorm).

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::handle::{Descriptor, InstanceHandle, NodeHandle, NodeId, ObjectHandle, SessionHandle};
use crate::protocol::{
    AckingStatus, EventType, FecType, FlushMode, NackingMode, ObjectType, ProbingMode,
    RepairBoundary, SyncPolicy,
};

/// One notification as posted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventType,
    pub session: SessionHandle,
    pub node: NodeHandle,
    pub object: ObjectHandle,
}

impl RawEvent {
    pub fn new(
        kind: EventType,
        session: SessionHandle,
        node: NodeHandle,
        object: ObjectHandle,
    ) -> Self {
        Self {
            kind,
            session,
            node,
            object,
        }
    }
}

/// Outcome of waiting on an instance descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one event is queued.
    Ready,
    TimedOut,
    /// [`Engine::wake`] was called while waiting.
    Woken,
    /// The platform has no native wait-on-descriptor; caller must poll.
    Unsupported,
}

/// Parameters of `NormStartSender`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderParams {
    pub session_id: u16,
    pub buffer_space: u64,
    pub segment_size: u16,
    pub block_size: u16,
    pub num_parity: u16,
    pub fec: FecType,
}

/// Per-session pass-through tuning. Each variant maps onto one native setter.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOption {
    TxPort {
        port: u16,
        enable_reuse: bool,
        tx_address: Option<String>,
    },
    RxPortReuse {
        enable: bool,
        rx_bind_address: Option<String>,
        sender_address: Option<String>,
        sender_port: u16,
    },
    EcnSupport {
        ecn_enable: bool,
        ignore_loss: bool,
        tolerate_loss: bool,
    },
    MulticastInterface(String),
    Ssm(String),
    Ttl(u8),
    Tos(u8),
    Loopback(bool),
    MessageTrace(bool),
    TxLoss(f64),
    RxLoss(f64),
    ReportInterval(f64),
    TxOnly {
        tx_only: bool,
        connect_to_session_address: bool,
    },
    TxRate(f64),
    FlowControl(f64),
    TxSocketBuffer(u64),
    CongestionControl {
        enable: bool,
        adjust_rate: bool,
    },
    TxRateBounds {
        min: f64,
        max: f64,
    },
    TxCacheBounds {
        size_max: u64,
        count_min: u32,
        count_max: u32,
    },
    AutoParity(u8),
    GrttEstimate(f64),
    GrttMax(f64),
    GrttProbingMode(ProbingMode),
    GrttProbingInterval {
        min: f64,
        max: f64,
    },
    BackoffFactor(f64),
    GroupSize(u32),
    TxRobustFactor(i32),
    RxCacheLimit(u16),
    RxSocketBuffer(u64),
    SilentReceiver {
        silent: bool,
        max_delay: i32,
    },
    DefaultUnicastNack(bool),
    DefaultSyncPolicy(SyncPolicy),
    DefaultNackingMode(NackingMode),
    DefaultRepairBoundary(RepairBoundary),
    DefaultRxRobustFactor(i32),
}

/// Per-remote-node receive tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOption {
    UnicastNack(bool),
    NackingMode(NackingMode),
    RepairBoundary(RepairBoundary),
    RxRobustFactor(i32),
}

/// Native engine API as seen by this crate.
///
/// Handles passed in may be stale; implementations must tolerate that the way
/// the native library does (ignore, or return the invalid/default value).
pub trait Engine: Send + Sync {
    // Instance
    fn create_instance(&self, priority_boost: bool) -> InstanceHandle;
    fn destroy_instance(&self, instance: InstanceHandle);
    fn stop_instance(&self, instance: InstanceHandle);
    fn restart_instance(&self, instance: InstanceHandle) -> bool;
    fn suspend_instance(&self, instance: InstanceHandle) -> bool;
    fn resume_instance(&self, instance: InstanceHandle);
    fn set_cache_directory(&self, instance: InstanceHandle, path: &Path) -> bool;
    fn open_debug_log(&self, instance: InstanceHandle, path: &Path) -> bool;
    fn close_debug_log(&self, instance: InstanceHandle);
    fn open_debug_pipe(&self, instance: InstanceHandle, name: &str) -> bool;
    fn set_debug_level(&self, level: u32);
    fn debug_level(&self) -> u32;
    fn descriptor(&self, instance: InstanceHandle) -> Descriptor;
    /// Block until `descriptor` is readable, `timeout` elapses or [`Engine::wake`] is called.
    fn wait_readable(
        &self,
        instance: InstanceHandle,
        descriptor: Descriptor,
        timeout: Duration,
    ) -> Readiness;
    /// Interrupt a `wait_readable` in progress for `instance`.
    fn wake(&self, instance: InstanceHandle);
    fn next_event(&self, instance: InstanceHandle, wait: bool) -> Option<RawEvent>;

    // Session
    fn create_session(
        &self,
        instance: InstanceHandle,
        address: &str,
        port: u16,
        local_id: NodeId,
    ) -> SessionHandle;
    fn destroy_session(&self, session: SessionHandle);
    fn local_node_id(&self, session: SessionHandle) -> NodeId;
    fn set_session_option(&self, session: SessionHandle, option: &SessionOption) -> bool;
    fn tx_rate(&self, session: SessionHandle) -> f64;
    fn grtt_estimate(&self, session: SessionHandle) -> f64;
    fn report_interval(&self, session: SessionHandle) -> f64;
    fn start_sender(&self, session: SessionHandle, params: &SenderParams) -> bool;
    fn stop_sender(&self, session: SessionHandle);
    fn start_receiver(&self, session: SessionHandle, buffer_space: u64) -> bool;
    fn stop_receiver(&self, session: SessionHandle);
    fn file_enqueue(&self, session: SessionHandle, path: &Path, info: &[u8]) -> ObjectHandle;
    /// `data[range]` is transmitted. The engine may hold on to `data` for the
    /// life of the object.
    fn data_enqueue(
        &self,
        session: SessionHandle,
        data: Arc<[u8]>,
        range: Range<usize>,
        info: &[u8],
    ) -> ObjectHandle;
    fn stream_open(&self, session: SessionHandle, buffer_size: u64, info: &[u8]) -> ObjectHandle;
    fn requeue_object(&self, session: SessionHandle, object: ObjectHandle) -> bool;
    fn set_watermark(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        override_flush: bool,
    ) -> bool;
    fn cancel_watermark(&self, session: SessionHandle);
    fn reset_watermark(&self, session: SessionHandle) -> bool;
    fn add_acking_node(&self, session: SessionHandle, node: NodeId) -> bool;
    fn remove_acking_node(&self, session: SessionHandle, node: NodeId);
    fn acking_status(&self, session: SessionHandle, node: NodeId) -> AckingStatus;
    fn send_command(&self, session: SessionHandle, command: &[u8], robust: bool) -> bool;
    fn cancel_command(&self, session: SessionHandle);

    // Object
    fn object_type(&self, object: ObjectHandle) -> ObjectType;
    fn object_info(&self, object: ObjectHandle) -> Option<Vec<u8>>;
    fn object_size(&self, object: ObjectHandle) -> u64;
    fn object_bytes_pending(&self, object: ObjectHandle) -> u64;
    fn object_sender(&self, object: ObjectHandle) -> NodeHandle;
    fn object_set_nacking_mode(&self, object: ObjectHandle, mode: NackingMode);
    fn object_cancel(&self, object: ObjectHandle);
    fn object_retain(&self, object: ObjectHandle);
    fn object_release(&self, object: ObjectHandle);
    fn data_access(&self, object: ObjectHandle) -> Vec<u8>;
    /// Write the NUL-terminated file name into `buf`. False on failure.
    fn file_name(&self, object: ObjectHandle, buf: &mut [u8]) -> bool;
    fn file_rename(&self, object: ObjectHandle, path: &Path) -> bool;

    // Stream
    /// Bytes accepted; `Some(0)` when there is no vacancy. `None` on failure.
    fn stream_write(&self, stream: ObjectHandle, buf: &[u8]) -> Option<usize>;
    /// Bytes read; `None` on a break in delivery order.
    fn stream_read(&self, stream: ObjectHandle, buf: &mut [u8]) -> Option<usize>;
    fn stream_flush(&self, stream: ObjectHandle, eom: bool, mode: FlushMode);
    fn stream_mark_eom(&self, stream: ObjectHandle);
    fn stream_close(&self, stream: ObjectHandle, graceful: bool);
    fn stream_has_vacancy(&self, stream: ObjectHandle) -> bool;
    fn stream_read_offset(&self, stream: ObjectHandle) -> u64;
    fn stream_seek_msg_start(&self, stream: ObjectHandle) -> bool;
    fn stream_set_push_enable(&self, stream: ObjectHandle, enable: bool);
    fn stream_set_auto_flush(&self, stream: ObjectHandle, mode: FlushMode);

    // Node
    fn node_id(&self, node: NodeHandle) -> NodeId;
    /// Raw address bytes into `buf`; returns `(length, port)`.
    fn node_address(&self, node: NodeHandle, buf: &mut [u8]) -> Option<(usize, u16)>;
    fn node_grtt(&self, node: NodeHandle) -> f64;
    fn node_command(&self, node: NodeHandle, buf: &mut [u8]) -> Option<usize>;
    fn set_node_option(&self, node: NodeHandle, option: NodeOption);
    fn node_free_buffers(&self, node: NodeHandle);
    fn node_retain(&self, node: NodeHandle);
    fn node_release(&self, node: NodeHandle);
}
