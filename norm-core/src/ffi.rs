//! [`Engine`] over the native NORM library (`libnorm`).
//!
//! Handles cross the boundary as opaque pointers and are carried as integers on
//! this side. Buffers handed to `NormDataEnqueue` are pinned here until the
//! engine purges the object, since the library keeps reading from them.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_uint, c_void, CString};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{Engine, NodeOption, RawEvent, Readiness, SenderParams, SessionOption};
use crate::handle::{Descriptor, InstanceHandle, NodeHandle, NodeId, ObjectHandle, SessionHandle};
use crate::protocol::{
    AckingStatus, EventType, FecType, FlushMode, NackingMode, ObjectType,
};

type Handle = *const c_void;
/// `off_t` on 64-bit unix, `__int64` on Windows.
type NormSize = i64;

#[repr(C)]
struct NormEvent {
    kind: c_int,
    session: Handle,
    sender: Handle,
    object: Handle,
}

#[link(name = "norm")]
extern "C" {
    fn NormCreateInstance(priority_boost: bool) -> Handle;
    fn NormDestroyInstance(instance: Handle);
    fn NormStopInstance(instance: Handle);
    fn NormRestartInstance(instance: Handle) -> bool;
    fn NormSuspendInstance(instance: Handle) -> bool;
    fn NormResumeInstance(instance: Handle);
    fn NormSetCacheDirectory(instance: Handle, path: *const c_char) -> bool;
    fn NormOpenDebugLog(instance: Handle, path: *const c_char) -> bool;
    fn NormCloseDebugLog(instance: Handle);
    fn NormOpenDebugPipe(instance: Handle, name: *const c_char) -> bool;
    fn NormSetDebugLevel(level: c_uint);
    fn NormGetDebugLevel() -> c_uint;
    fn NormGetDescriptor(instance: Handle) -> c_int;
    fn NormGetNextEvent(instance: Handle, event: *mut NormEvent, wait: bool) -> bool;

    fn NormCreateSession(
        instance: Handle,
        address: *const c_char,
        port: u16,
        local_id: u32,
    ) -> Handle;
    fn NormDestroySession(session: Handle);
    fn NormGetLocalNodeId(session: Handle) -> u32;
    fn NormSetTxPort(session: Handle, port: u16, reuse: bool, bind: *const c_char) -> bool;
    fn NormSetRxPortReuse(
        session: Handle,
        enable: bool,
        rx_bind: *const c_char,
        sender: *const c_char,
        sender_port: u16,
    );
    fn NormSetEcnSupport(session: Handle, ecn: bool, ignore_loss: bool, tolerate_loss: bool);
    fn NormSetMulticastInterface(session: Handle, name: *const c_char) -> bool;
    fn NormSetSSM(session: Handle, source: *const c_char) -> bool;
    fn NormSetTTL(session: Handle, ttl: u8) -> bool;
    fn NormSetTOS(session: Handle, tos: u8) -> bool;
    fn NormSetLoopback(session: Handle, loopback: bool) -> bool;
    fn NormSetMessageTrace(session: Handle, state: bool);
    fn NormSetTxLoss(session: Handle, percent: f64);
    fn NormSetRxLoss(session: Handle, percent: f64);
    fn NormSetReportInterval(session: Handle, interval: f64);
    fn NormGetReportInterval(session: Handle) -> f64;
    fn NormSetTxOnly(session: Handle, tx_only: bool, connect: bool);
    fn NormStartSender(
        session: Handle,
        session_id: u16,
        buffer_space: u32,
        segment_size: u16,
        num_data: u16,
        num_parity: u16,
        fec_id: u8,
    ) -> bool;
    fn NormStopSender(session: Handle);
    fn NormSetTxRate(session: Handle, bits_per_second: f64);
    fn NormGetTxRate(session: Handle) -> f64;
    fn NormSetTxSocketBuffer(session: Handle, size: c_uint) -> bool;
    fn NormSetFlowControl(session: Handle, factor: f64);
    fn NormSetCongestionControl(session: Handle, enable: bool, adjust_rate: bool);
    fn NormSetTxRateBounds(session: Handle, min: f64, max: f64);
    fn NormSetTxCacheBounds(session: Handle, size_max: NormSize, count_min: u32, count_max: u32);
    fn NormSetAutoParity(session: Handle, parity: u8);
    fn NormSetGrttEstimate(session: Handle, grtt: f64);
    fn NormGetGrttEstimate(session: Handle) -> f64;
    fn NormSetGrttMax(session: Handle, grtt_max: f64);
    fn NormSetGrttProbingMode(session: Handle, mode: c_int);
    fn NormSetGrttProbingInterval(session: Handle, min: f64, max: f64);
    fn NormSetBackoffFactor(session: Handle, factor: f64);
    fn NormSetGroupSize(session: Handle, size: c_uint);
    fn NormSetTxRobustFactor(session: Handle, factor: c_int);
    fn NormFileEnqueue(
        session: Handle,
        name: *const c_char,
        info: *const c_char,
        info_len: c_uint,
    ) -> Handle;
    fn NormDataEnqueue(
        session: Handle,
        data: *const c_char,
        data_len: u32,
        info: *const c_char,
        info_len: c_uint,
    ) -> Handle;
    fn NormRequeueObject(session: Handle, object: Handle) -> bool;
    fn NormStreamOpen(
        session: Handle,
        buffer_size: u32,
        info: *const c_char,
        info_len: c_uint,
    ) -> Handle;
    fn NormSetWatermark(session: Handle, object: Handle, override_flush: bool) -> bool;
    fn NormResetWatermark(session: Handle) -> bool;
    fn NormCancelWatermark(session: Handle);
    fn NormAddAckingNode(session: Handle, node: u32) -> bool;
    fn NormRemoveAckingNode(session: Handle, node: u32);
    fn NormGetAckingStatus(session: Handle, node: u32) -> c_int;
    fn NormSendCommand(session: Handle, cmd: *const c_char, len: c_uint, robust: bool) -> bool;
    fn NormCancelCommand(session: Handle);
    fn NormStartReceiver(session: Handle, buffer_space: u32) -> bool;
    fn NormStopReceiver(session: Handle);
    fn NormSetRxCacheLimit(session: Handle, count_max: u16);
    fn NormSetRxSocketBuffer(session: Handle, size: c_uint) -> bool;
    fn NormSetSilentReceiver(session: Handle, silent: bool, max_delay: c_int);
    fn NormSetDefaultUnicastNack(session: Handle, enable: bool);
    fn NormSetDefaultSyncPolicy(session: Handle, policy: c_int);
    fn NormSetDefaultNackingMode(session: Handle, mode: c_int);
    fn NormSetDefaultRepairBoundary(session: Handle, boundary: c_int);
    fn NormSetDefaultRxRobustFactor(session: Handle, factor: c_int);

    fn NormObjectGetType(object: Handle) -> c_int;
    fn NormObjectHasInfo(object: Handle) -> bool;
    fn NormObjectGetInfoLength(object: Handle) -> u16;
    fn NormObjectGetInfo(object: Handle, buf: *mut c_char, len: u16) -> u16;
    fn NormObjectGetSize(object: Handle) -> NormSize;
    fn NormObjectGetBytesPending(object: Handle) -> NormSize;
    fn NormObjectGetSender(object: Handle) -> Handle;
    fn NormObjectSetNackingMode(object: Handle, mode: c_int);
    fn NormObjectCancel(object: Handle);
    fn NormObjectRetain(object: Handle);
    fn NormObjectRelease(object: Handle);
    fn NormDataAccessData(object: Handle) -> *const c_char;
    fn NormFileGetName(object: Handle, buf: *mut c_char, len: c_uint) -> bool;
    fn NormFileRename(object: Handle, name: *const c_char) -> bool;

    fn NormStreamWrite(stream: Handle, buf: *const c_char, len: c_uint) -> c_uint;
    fn NormStreamRead(stream: Handle, buf: *mut c_char, len: *mut c_uint) -> bool;
    fn NormStreamFlush(stream: Handle, eom: bool, mode: c_int);
    fn NormStreamMarkEom(stream: Handle);
    fn NormStreamClose(stream: Handle, graceful: bool);
    fn NormStreamHasVacancy(stream: Handle) -> bool;
    fn NormStreamGetReadOffset(stream: Handle) -> u32;
    fn NormStreamSeekMsgStart(stream: Handle) -> bool;
    fn NormStreamSetPushEnable(stream: Handle, enable: bool);
    fn NormStreamSetAutoFlush(stream: Handle, mode: c_int);

    fn NormNodeGetId(node: Handle) -> u32;
    fn NormNodeGetAddress(node: Handle, buf: *mut c_char, len: *mut c_uint, port: *mut u16) -> bool;
    fn NormNodeGetGrtt(node: Handle) -> f64;
    fn NormNodeGetCommand(node: Handle, buf: *mut c_char, len: *mut c_uint) -> bool;
    fn NormNodeSetUnicastNack(node: Handle, enable: bool);
    fn NormNodeSetNackingMode(node: Handle, mode: c_int);
    fn NormNodeSetRepairBoundary(node: Handle, boundary: c_int);
    fn NormNodeSetRxRobustFactor(node: Handle, factor: c_int);
    fn NormNodeFreeBuffers(node: Handle);
    fn NormNodeRetain(node: Handle);
    fn NormNodeRelease(node: Handle);
}

fn ptr(raw: u64) -> Handle {
    raw as usize as Handle
}

fn raw(handle: Handle) -> u64 {
    handle as usize as u64
}

/// Borrowed C string for an optional Rust string. Interior NULs make the
/// string unrepresentable; callers treat that as a refused call.
fn c_string(s: &str) -> Option<CString> {
    CString::new(s).ok()
}

fn c_path(path: &Path) -> Option<CString> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        CString::new(path.as_os_str().as_bytes()).ok()
    }
    #[cfg(not(unix))]
    {
        CString::new(path.to_string_lossy().into_owned()).ok()
    }
}

fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(std::ptr::null(), |s| s.as_ptr())
}

fn info_args(info: &[u8]) -> (*const c_char, c_uint) {
    if info.is_empty() {
        (std::ptr::null(), 0)
    } else {
        (info.as_ptr().cast(), info.len() as c_uint)
    }
}

/// Native `fecId` argument of `NormStartSender`.
fn fec_id(fec: FecType) -> u8 {
    match fec {
        FecType::Rs8 => 5,
        FecType::Rs16 => 2,
        FecType::Mdp => 129,
    }
}

#[cfg(unix)]
mod wake {
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

    use nix::errno::Errno;
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::unistd;
    use tracing::warn;

    /// Non-blocking self-pipe merged into the descriptor wait so that a
    /// blocked waiter can be interrupted from another thread.
    pub(super) struct WakePipe {
        read: OwnedFd,
        write: OwnedFd,
    }

    pub(super) enum Wait {
        Ready,
        TimedOut,
        Woken,
    }

    impl WakePipe {
        pub(super) fn new() -> nix::Result<Self> {
            let (read, write) = unistd::pipe()?;
            for fd in [&read, &write] {
                fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
            }
            Ok(Self { read, write })
        }

        pub(super) fn signal(&self) {
            match unistd::write(&self.write, &[1]) {
                // A full pipe already carries a pending wake.
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(e) => warn!(error = %e, "wake pipe write failed"),
            }
        }

        fn drain(&self) {
            let mut buf = [0u8; 64];
            while let Ok(n) = unistd::read(self.read.as_raw_fd(), &mut buf) {
                if n == 0 {
                    break;
                }
            }
        }

        pub(super) fn wait(&self, descriptor: BorrowedFd<'_>, timeout_ms: i32) -> Wait {
            let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
            let mut fds = [
                PollFd::new(descriptor, PollFlags::POLLIN),
                PollFd::new(self.read.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(n) if n > 0 => {}
                Ok(_) | Err(Errno::EINTR) => return Wait::TimedOut,
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    return Wait::TimedOut;
                }
            }
            let readable =
                |fd: &PollFd<'_>| fd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN));
            if readable(&fds[1]) {
                self.drain();
                Wait::Woken
            } else if readable(&fds[0]) {
                Wait::Ready
            } else {
                Wait::TimedOut
            }
        }
    }
}

/// Engine backed by `libnorm`. One value serves any number of instances.
#[derive(Default)]
pub struct NativeEngine {
    /// Enqueued data buffers by object, with the session that owns them.
    pinned: Mutex<HashMap<ObjectHandle, (SessionHandle, Arc<[u8]>)>>,
    #[cfg(unix)]
    wakers: Mutex<HashMap<InstanceHandle, Arc<wake::WakePipe>>>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn unpin(&self, object: ObjectHandle) {
        if self.pinned.lock().remove(&object).is_some() {
            debug!(?object, "released enqueued data buffer");
        }
    }
}

impl Engine for NativeEngine {
    fn create_instance(&self, priority_boost: bool) -> InstanceHandle {
        let handle = InstanceHandle::from_raw(raw(unsafe { NormCreateInstance(priority_boost) }));
        #[cfg(unix)]
        if handle.is_valid() {
            match wake::WakePipe::new() {
                Ok(pipe) => {
                    self.wakers.lock().insert(handle, Arc::new(pipe));
                }
                Err(e) => {
                    warn!(?handle, error = %e, "no wake pipe; close will wait for the next slice")
                }
            }
        }
        handle
    }

    fn destroy_instance(&self, instance: InstanceHandle) {
        #[cfg(unix)]
        self.wakers.lock().remove(&instance);
        unsafe { NormDestroyInstance(ptr(instance.as_raw())) }
    }

    fn stop_instance(&self, instance: InstanceHandle) {
        unsafe { NormStopInstance(ptr(instance.as_raw())) }
    }

    fn restart_instance(&self, instance: InstanceHandle) -> bool {
        unsafe { NormRestartInstance(ptr(instance.as_raw())) }
    }

    fn suspend_instance(&self, instance: InstanceHandle) -> bool {
        unsafe { NormSuspendInstance(ptr(instance.as_raw())) }
    }

    fn resume_instance(&self, instance: InstanceHandle) {
        unsafe { NormResumeInstance(ptr(instance.as_raw())) }
    }

    fn set_cache_directory(&self, instance: InstanceHandle, path: &Path) -> bool {
        let Some(path) = c_path(path) else {
            return false;
        };
        unsafe { NormSetCacheDirectory(ptr(instance.as_raw()), path.as_ptr()) }
    }

    fn open_debug_log(&self, instance: InstanceHandle, path: &Path) -> bool {
        let Some(path) = c_path(path) else {
            return false;
        };
        unsafe { NormOpenDebugLog(ptr(instance.as_raw()), path.as_ptr()) }
    }

    fn close_debug_log(&self, instance: InstanceHandle) {
        unsafe { NormCloseDebugLog(ptr(instance.as_raw())) }
    }

    fn open_debug_pipe(&self, instance: InstanceHandle, name: &str) -> bool {
        let Some(name) = c_string(name) else {
            return false;
        };
        unsafe { NormOpenDebugPipe(ptr(instance.as_raw()), name.as_ptr()) }
    }

    fn set_debug_level(&self, level: u32) {
        unsafe { NormSetDebugLevel(level) }
    }

    fn debug_level(&self) -> u32 {
        unsafe { NormGetDebugLevel() }
    }

    fn descriptor(&self, instance: InstanceHandle) -> Descriptor {
        let fd = unsafe { NormGetDescriptor(ptr(instance.as_raw())) };
        if fd < 0 {
            Descriptor::INVALID
        } else {
            Descriptor(i64::from(fd))
        }
    }

    #[cfg(unix)]
    fn wait_readable(
        &self,
        instance: InstanceHandle,
        descriptor: Descriptor,
        timeout: Duration,
    ) -> Readiness {
        let Some(pipe) = self.wakers.lock().get(&instance).cloned() else {
            return Readiness::Unsupported;
        };
        let Ok(fd) = c_int::try_from(descriptor.0) else {
            return Readiness::Unsupported;
        };
        if fd < 0 {
            return Readiness::Unsupported;
        }
        // SAFETY: the instance owns this descriptor and stays alive for the
        // duration of the wait.
        let descriptor = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        match pipe.wait(descriptor, timeout_ms) {
            wake::Wait::Ready => Readiness::Ready,
            wake::Wait::TimedOut => Readiness::TimedOut,
            wake::Wait::Woken => Readiness::Woken,
        }
    }

    #[cfg(not(unix))]
    fn wait_readable(&self, _: InstanceHandle, _: Descriptor, _: Duration) -> Readiness {
        Readiness::Unsupported
    }

    fn wake(&self, instance: InstanceHandle) {
        #[cfg(unix)]
        if let Some(pipe) = self.wakers.lock().get(&instance) {
            pipe.signal();
        }
        #[cfg(not(unix))]
        let _ = instance;
    }

    fn next_event(&self, instance: InstanceHandle, wait: bool) -> Option<RawEvent> {
        let mut event = NormEvent {
            kind: 0,
            session: std::ptr::null(),
            sender: std::ptr::null(),
            object: std::ptr::null(),
        };
        if !unsafe { NormGetNextEvent(ptr(instance.as_raw()), &mut event, wait) } {
            return None;
        }
        let kind = EventType::from_raw(event.kind).unwrap_or(EventType::Invalid);
        let object = ObjectHandle::from_raw(raw(event.object));
        if kind == EventType::TxObjectPurged {
            self.unpin(object);
        }
        Some(RawEvent::new(
            kind,
            SessionHandle::from_raw(raw(event.session)),
            NodeHandle::from_raw(raw(event.sender)),
            object,
        ))
    }

    fn create_session(
        &self,
        instance: InstanceHandle,
        address: &str,
        port: u16,
        local_id: NodeId,
    ) -> SessionHandle {
        let Some(address) = c_string(address) else {
            return SessionHandle::INVALID;
        };
        let h = unsafe {
            NormCreateSession(ptr(instance.as_raw()), address.as_ptr(), port, local_id.0)
        };
        SessionHandle::from_raw(raw(h))
    }

    fn destroy_session(&self, session: SessionHandle) {
        unsafe { NormDestroySession(ptr(session.as_raw())) }
        self.pinned.lock().retain(|_, (owner, _)| *owner != session);
    }

    fn local_node_id(&self, session: SessionHandle) -> NodeId {
        NodeId(unsafe { NormGetLocalNodeId(ptr(session.as_raw())) })
    }

    fn set_session_option(&self, session: SessionHandle, option: &SessionOption) -> bool {
        let s = ptr(session.as_raw());
        // Void native setters report success.
        unsafe {
            match option {
                SessionOption::TxPort {
                    port,
                    enable_reuse,
                    tx_address,
                } => {
                    let bind = tx_address.as_deref().and_then(c_string);
                    if tx_address.is_some() && bind.is_none() {
                        return false;
                    }
                    NormSetTxPort(s, *port, *enable_reuse, opt_ptr(&bind))
                }
                SessionOption::RxPortReuse {
                    enable,
                    rx_bind_address,
                    sender_address,
                    sender_port,
                } => {
                    let bind = rx_bind_address.as_deref().and_then(c_string);
                    let sender = sender_address.as_deref().and_then(c_string);
                    NormSetRxPortReuse(s, *enable, opt_ptr(&bind), opt_ptr(&sender), *sender_port);
                    true
                }
                SessionOption::EcnSupport {
                    ecn_enable,
                    ignore_loss,
                    tolerate_loss,
                } => {
                    NormSetEcnSupport(s, *ecn_enable, *ignore_loss, *tolerate_loss);
                    true
                }
                SessionOption::MulticastInterface(name) => match c_string(name) {
                    Some(name) => NormSetMulticastInterface(s, name.as_ptr()),
                    None => false,
                },
                SessionOption::Ssm(source) => match c_string(source) {
                    Some(source) => NormSetSSM(s, source.as_ptr()),
                    None => false,
                },
                SessionOption::Ttl(ttl) => NormSetTTL(s, *ttl),
                SessionOption::Tos(tos) => NormSetTOS(s, *tos),
                SessionOption::Loopback(on) => NormSetLoopback(s, *on),
                SessionOption::MessageTrace(on) => {
                    NormSetMessageTrace(s, *on);
                    true
                }
                SessionOption::TxLoss(percent) => {
                    NormSetTxLoss(s, *percent);
                    true
                }
                SessionOption::RxLoss(percent) => {
                    NormSetRxLoss(s, *percent);
                    true
                }
                SessionOption::ReportInterval(secs) => {
                    NormSetReportInterval(s, *secs);
                    true
                }
                SessionOption::TxOnly {
                    tx_only,
                    connect_to_session_address,
                } => {
                    NormSetTxOnly(s, *tx_only, *connect_to_session_address);
                    true
                }
                SessionOption::TxRate(rate) => {
                    NormSetTxRate(s, *rate);
                    true
                }
                SessionOption::FlowControl(factor) => {
                    NormSetFlowControl(s, *factor);
                    true
                }
                SessionOption::TxSocketBuffer(size) => match c_uint::try_from(*size) {
                    Ok(size) => NormSetTxSocketBuffer(s, size),
                    Err(_) => false,
                },
                SessionOption::CongestionControl {
                    enable,
                    adjust_rate,
                } => {
                    NormSetCongestionControl(s, *enable, *adjust_rate);
                    true
                }
                SessionOption::TxRateBounds { min, max } => {
                    NormSetTxRateBounds(s, *min, *max);
                    true
                }
                SessionOption::TxCacheBounds {
                    size_max,
                    count_min,
                    count_max,
                } => match NormSize::try_from(*size_max) {
                    Ok(size_max) => {
                        NormSetTxCacheBounds(s, size_max, *count_min, *count_max);
                        true
                    }
                    Err(_) => false,
                },
                SessionOption::AutoParity(parity) => {
                    NormSetAutoParity(s, *parity);
                    true
                }
                SessionOption::GrttEstimate(grtt) => {
                    NormSetGrttEstimate(s, *grtt);
                    true
                }
                SessionOption::GrttMax(grtt) => {
                    NormSetGrttMax(s, *grtt);
                    true
                }
                SessionOption::GrttProbingMode(mode) => {
                    NormSetGrttProbingMode(s, mode.as_raw());
                    true
                }
                SessionOption::GrttProbingInterval { min, max } => {
                    NormSetGrttProbingInterval(s, *min, *max);
                    true
                }
                SessionOption::BackoffFactor(factor) => {
                    NormSetBackoffFactor(s, *factor);
                    true
                }
                SessionOption::GroupSize(size) => {
                    NormSetGroupSize(s, *size);
                    true
                }
                SessionOption::TxRobustFactor(factor) => {
                    NormSetTxRobustFactor(s, *factor);
                    true
                }
                SessionOption::RxCacheLimit(count) => {
                    NormSetRxCacheLimit(s, *count);
                    true
                }
                SessionOption::RxSocketBuffer(size) => match c_uint::try_from(*size) {
                    Ok(size) => NormSetRxSocketBuffer(s, size),
                    Err(_) => false,
                },
                SessionOption::SilentReceiver { silent, max_delay } => {
                    NormSetSilentReceiver(s, *silent, *max_delay);
                    true
                }
                SessionOption::DefaultUnicastNack(on) => {
                    NormSetDefaultUnicastNack(s, *on);
                    true
                }
                SessionOption::DefaultSyncPolicy(policy) => {
                    NormSetDefaultSyncPolicy(s, policy.as_raw());
                    true
                }
                SessionOption::DefaultNackingMode(mode) => {
                    NormSetDefaultNackingMode(s, mode.as_raw());
                    true
                }
                SessionOption::DefaultRepairBoundary(boundary) => {
                    NormSetDefaultRepairBoundary(s, boundary.as_raw());
                    true
                }
                SessionOption::DefaultRxRobustFactor(factor) => {
                    NormSetDefaultRxRobustFactor(s, *factor);
                    true
                }
            }
        }
    }

    fn tx_rate(&self, session: SessionHandle) -> f64 {
        unsafe { NormGetTxRate(ptr(session.as_raw())) }
    }

    fn grtt_estimate(&self, session: SessionHandle) -> f64 {
        unsafe { NormGetGrttEstimate(ptr(session.as_raw())) }
    }

    fn report_interval(&self, session: SessionHandle) -> f64 {
        unsafe { NormGetReportInterval(ptr(session.as_raw())) }
    }

    fn start_sender(&self, session: SessionHandle, params: &SenderParams) -> bool {
        let Ok(buffer_space) = u32::try_from(params.buffer_space) else {
            warn!(buffer_space = params.buffer_space, "sender buffer exceeds native limit");
            return false;
        };
        unsafe {
            NormStartSender(
                ptr(session.as_raw()),
                params.session_id,
                buffer_space,
                params.segment_size,
                params.block_size,
                params.num_parity,
                fec_id(params.fec),
            )
        }
    }

    fn stop_sender(&self, session: SessionHandle) {
        unsafe { NormStopSender(ptr(session.as_raw())) }
    }

    fn start_receiver(&self, session: SessionHandle, buffer_space: u64) -> bool {
        let Ok(buffer_space) = u32::try_from(buffer_space) else {
            return false;
        };
        unsafe { NormStartReceiver(ptr(session.as_raw()), buffer_space) }
    }

    fn stop_receiver(&self, session: SessionHandle) {
        unsafe { NormStopReceiver(ptr(session.as_raw())) }
    }

    fn file_enqueue(&self, session: SessionHandle, path: &Path, info: &[u8]) -> ObjectHandle {
        let Some(path) = c_path(path) else {
            return ObjectHandle::INVALID;
        };
        let (info_ptr, info_len) = info_args(info);
        let h =
            unsafe { NormFileEnqueue(ptr(session.as_raw()), path.as_ptr(), info_ptr, info_len) };
        ObjectHandle::from_raw(raw(h))
    }

    fn data_enqueue(
        &self,
        session: SessionHandle,
        data: Arc<[u8]>,
        range: Range<usize>,
        info: &[u8],
    ) -> ObjectHandle {
        let Some(bytes) = data.get(range) else {
            return ObjectHandle::INVALID;
        };
        let Ok(len) = u32::try_from(bytes.len()) else {
            return ObjectHandle::INVALID;
        };
        let (info_ptr, info_len) = info_args(info);
        let h = unsafe {
            NormDataEnqueue(
                ptr(session.as_raw()),
                bytes.as_ptr().cast(),
                len,
                info_ptr,
                info_len,
            )
        };
        let handle = ObjectHandle::from_raw(raw(h));
        if handle.is_valid() {
            self.pinned.lock().insert(handle, (session, data));
        }
        handle
    }

    fn stream_open(&self, session: SessionHandle, buffer_size: u64, info: &[u8]) -> ObjectHandle {
        let Ok(buffer_size) = u32::try_from(buffer_size) else {
            return ObjectHandle::INVALID;
        };
        let (info_ptr, info_len) = info_args(info);
        let h = unsafe { NormStreamOpen(ptr(session.as_raw()), buffer_size, info_ptr, info_len) };
        ObjectHandle::from_raw(raw(h))
    }

    fn requeue_object(&self, session: SessionHandle, object: ObjectHandle) -> bool {
        unsafe { NormRequeueObject(ptr(session.as_raw()), ptr(object.as_raw())) }
    }

    fn set_watermark(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        override_flush: bool,
    ) -> bool {
        unsafe { NormSetWatermark(ptr(session.as_raw()), ptr(object.as_raw()), override_flush) }
    }

    fn cancel_watermark(&self, session: SessionHandle) {
        unsafe { NormCancelWatermark(ptr(session.as_raw())) }
    }

    fn reset_watermark(&self, session: SessionHandle) -> bool {
        unsafe { NormResetWatermark(ptr(session.as_raw())) }
    }

    fn add_acking_node(&self, session: SessionHandle, node: NodeId) -> bool {
        unsafe { NormAddAckingNode(ptr(session.as_raw()), node.0) }
    }

    fn remove_acking_node(&self, session: SessionHandle, node: NodeId) {
        unsafe { NormRemoveAckingNode(ptr(session.as_raw()), node.0) }
    }

    fn acking_status(&self, session: SessionHandle, node: NodeId) -> AckingStatus {
        let code = unsafe { NormGetAckingStatus(ptr(session.as_raw()), node.0) };
        AckingStatus::from_raw(code).unwrap_or(AckingStatus::Invalid)
    }

    fn send_command(&self, session: SessionHandle, command: &[u8], robust: bool) -> bool {
        let Ok(len) = c_uint::try_from(command.len()) else {
            return false;
        };
        unsafe { NormSendCommand(ptr(session.as_raw()), command.as_ptr().cast(), len, robust) }
    }

    fn cancel_command(&self, session: SessionHandle) {
        unsafe { NormCancelCommand(ptr(session.as_raw())) }
    }

    fn object_type(&self, object: ObjectHandle) -> ObjectType {
        let code = unsafe { NormObjectGetType(ptr(object.as_raw())) };
        ObjectType::from_raw(code).unwrap_or(ObjectType::None)
    }

    fn object_info(&self, object: ObjectHandle) -> Option<Vec<u8>> {
        let h = ptr(object.as_raw());
        if !unsafe { NormObjectHasInfo(h) } {
            return None;
        }
        let len = unsafe { NormObjectGetInfoLength(h) };
        let mut buf = vec![0u8; usize::from(len)];
        let copied = unsafe { NormObjectGetInfo(h, buf.as_mut_ptr().cast(), len) };
        buf.truncate(usize::from(copied));
        Some(buf)
    }

    fn object_size(&self, object: ObjectHandle) -> u64 {
        let size = unsafe { NormObjectGetSize(ptr(object.as_raw())) };
        u64::try_from(size).unwrap_or(0)
    }

    fn object_bytes_pending(&self, object: ObjectHandle) -> u64 {
        let pending = unsafe { NormObjectGetBytesPending(ptr(object.as_raw())) };
        u64::try_from(pending).unwrap_or(0)
    }

    fn object_sender(&self, object: ObjectHandle) -> NodeHandle {
        NodeHandle::from_raw(raw(unsafe { NormObjectGetSender(ptr(object.as_raw())) }))
    }

    fn object_set_nacking_mode(&self, object: ObjectHandle, mode: NackingMode) {
        unsafe { NormObjectSetNackingMode(ptr(object.as_raw()), mode.as_raw()) }
    }

    fn object_cancel(&self, object: ObjectHandle) {
        unsafe { NormObjectCancel(ptr(object.as_raw())) }
        self.unpin(object);
    }

    fn object_retain(&self, object: ObjectHandle) {
        unsafe { NormObjectRetain(ptr(object.as_raw())) }
    }

    fn object_release(&self, object: ObjectHandle) {
        unsafe { NormObjectRelease(ptr(object.as_raw())) }
    }

    fn data_access(&self, object: ObjectHandle) -> Vec<u8> {
        let h = ptr(object.as_raw());
        let data = unsafe { NormDataAccessData(h) };
        if data.is_null() {
            return Vec::new();
        }
        let len = self.object_size(object) as usize;
        // SAFETY: the library keeps `len` bytes at `data` for the life of the object.
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }.to_vec()
    }

    fn file_name(&self, object: ObjectHandle, buf: &mut [u8]) -> bool {
        let Ok(len) = c_uint::try_from(buf.len()) else {
            return false;
        };
        unsafe { NormFileGetName(ptr(object.as_raw()), buf.as_mut_ptr().cast(), len) }
    }

    fn file_rename(&self, object: ObjectHandle, path: &Path) -> bool {
        let Some(path) = c_path(path) else {
            return false;
        };
        unsafe { NormFileRename(ptr(object.as_raw()), path.as_ptr()) }
    }

    fn stream_write(&self, stream: ObjectHandle, buf: &[u8]) -> Option<usize> {
        let len = c_uint::try_from(buf.len()).unwrap_or(c_uint::MAX);
        let n = unsafe { NormStreamWrite(ptr(stream.as_raw()), buf.as_ptr().cast(), len) };
        Some(n as usize)
    }

    fn stream_read(&self, stream: ObjectHandle, buf: &mut [u8]) -> Option<usize> {
        let mut len = c_uint::try_from(buf.len()).unwrap_or(c_uint::MAX);
        let ok = unsafe { NormStreamRead(ptr(stream.as_raw()), buf.as_mut_ptr().cast(), &mut len) };
        ok.then_some(len as usize)
    }

    fn stream_flush(&self, stream: ObjectHandle, eom: bool, mode: FlushMode) {
        unsafe { NormStreamFlush(ptr(stream.as_raw()), eom, mode.as_raw()) }
    }

    fn stream_mark_eom(&self, stream: ObjectHandle) {
        unsafe { NormStreamMarkEom(ptr(stream.as_raw())) }
    }

    fn stream_close(&self, stream: ObjectHandle, graceful: bool) {
        unsafe { NormStreamClose(ptr(stream.as_raw()), graceful) }
    }

    fn stream_has_vacancy(&self, stream: ObjectHandle) -> bool {
        unsafe { NormStreamHasVacancy(ptr(stream.as_raw())) }
    }

    fn stream_read_offset(&self, stream: ObjectHandle) -> u64 {
        u64::from(unsafe { NormStreamGetReadOffset(ptr(stream.as_raw())) })
    }

    fn stream_seek_msg_start(&self, stream: ObjectHandle) -> bool {
        unsafe { NormStreamSeekMsgStart(ptr(stream.as_raw())) }
    }

    fn stream_set_push_enable(&self, stream: ObjectHandle, enable: bool) {
        unsafe { NormStreamSetPushEnable(ptr(stream.as_raw()), enable) }
    }

    fn stream_set_auto_flush(&self, stream: ObjectHandle, mode: FlushMode) {
        unsafe { NormStreamSetAutoFlush(ptr(stream.as_raw()), mode.as_raw()) }
    }

    fn node_id(&self, node: NodeHandle) -> NodeId {
        NodeId(unsafe { NormNodeGetId(ptr(node.as_raw())) })
    }

    fn node_address(&self, node: NodeHandle, buf: &mut [u8]) -> Option<(usize, u16)> {
        let mut len = c_uint::try_from(buf.len()).ok()?;
        let mut port = 0u16;
        let ok = unsafe {
            NormNodeGetAddress(ptr(node.as_raw()), buf.as_mut_ptr().cast(), &mut len, &mut port)
        };
        ok.then_some((len as usize, port))
    }

    fn node_grtt(&self, node: NodeHandle) -> f64 {
        unsafe { NormNodeGetGrtt(ptr(node.as_raw())) }
    }

    fn node_command(&self, node: NodeHandle, buf: &mut [u8]) -> Option<usize> {
        let mut len = c_uint::try_from(buf.len()).ok()?;
        let ok =
            unsafe { NormNodeGetCommand(ptr(node.as_raw()), buf.as_mut_ptr().cast(), &mut len) };
        ok.then_some(len as usize)
    }

    fn set_node_option(&self, node: NodeHandle, option: NodeOption) {
        let n = ptr(node.as_raw());
        unsafe {
            match option {
                NodeOption::UnicastNack(on) => NormNodeSetUnicastNack(n, on),
                NodeOption::NackingMode(mode) => NormNodeSetNackingMode(n, mode.as_raw()),
                NodeOption::RepairBoundary(b) => NormNodeSetRepairBoundary(n, b.as_raw()),
                NodeOption::RxRobustFactor(f) => NormNodeSetRxRobustFactor(n, f),
            }
        }
    }

    fn node_free_buffers(&self, node: NodeHandle) {
        unsafe { NormNodeFreeBuffers(ptr(node.as_raw())) }
    }

    fn node_retain(&self, node: NodeHandle) {
        unsafe { NormNodeRetain(ptr(node.as_raw())) }
    }

    fn node_release(&self, node: NodeHandle) {
        unsafe { NormNodeRelease(ptr(node.as_raw())) }
    }
}
