//! Transport objects: data, file and stream variants over one engine handle.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{NormError, Result};
use crate::handle::ObjectHandle;
use crate::node::Node;
use crate::protocol::{FlushMode, NackingMode, ObjectType};

/// Size of the buffer handed to the engine when asking for a file name.
pub const FILENAME_MAX: usize = 4096;

/// Engine handle plus the engine that issued it. Shared by every object variant.
#[derive(Clone)]
pub struct ObjectCore {
    handle: ObjectHandle,
    engine: Arc<dyn Engine>,
}

/// Operations common to all transport objects.
pub trait TransportObject {
    fn core(&self) -> &ObjectCore;

    fn handle(&self) -> ObjectHandle {
        self.core().handle
    }

    /// Variant as reported by the engine right now.
    fn object_type(&self) -> ObjectType {
        let core = self.core();
        core.engine.object_type(core.handle)
    }

    /// Application info attached by the sender, if any.
    fn info(&self) -> Option<Vec<u8>> {
        let core = self.core();
        core.engine.object_info(core.handle)
    }

    fn size(&self) -> u64 {
        let core = self.core();
        core.engine.object_size(core.handle)
    }

    fn bytes_pending(&self) -> u64 {
        let core = self.core();
        core.engine.object_bytes_pending(core.handle)
    }

    /// The remote node that sent this object. Fails for objects enqueued locally.
    fn sender(&self) -> Result<Node> {
        let core = self.core();
        let node = core.engine.object_sender(core.handle);
        if !node.is_valid() {
            return Err(NormError::Engine("locally originated sender object"));
        }
        Ok(Node::new(core.engine.clone(), node))
    }

    fn set_nacking_mode(&self, mode: NackingMode) {
        let core = self.core();
        core.engine.object_set_nacking_mode(core.handle, mode)
    }

    fn cancel(&self) {
        let core = self.core();
        core.engine.object_cancel(core.handle)
    }

    /// Keep the native object alive past the event that announced it.
    fn retain(&self) {
        let core = self.core();
        core.engine.object_retain(core.handle)
    }

    /// Drop one native reference taken with [`TransportObject::retain`].
    ///
    /// # Safety
    ///
    /// Every `release` must pair with an earlier `retain` on the same handle.
    /// After the last reference is released the engine may reuse the handle, so
    /// no clone of this object may be used again.
    unsafe fn release(&self) {
        let core = self.core();
        core.engine.object_release(core.handle)
    }
}

macro_rules! object_variant {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            core: ObjectCore,
        }

        impl $name {
            pub(crate) fn new(engine: Arc<dyn Engine>, handle: ObjectHandle) -> Self {
                Self {
                    core: ObjectCore { handle, engine },
                }
            }
        }

        impl TransportObject for $name {
            fn core(&self) -> &ObjectCore {
                &self.core
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.core.handle == other.core.handle
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.core.handle.hash(state)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.core.handle)
            }
        }
    };
}

object_variant!(
    /// In-memory data object.
    DataObject
);
object_variant!(
    /// File object; receivers find it in the cache directory.
    FileObject
);
object_variant!(
    /// Byte stream object.
    StreamObject
);

impl DataObject {
    /// Copy of the object's payload.
    pub fn data(&self) -> Vec<u8> {
        self.core.engine.data_access(self.core.handle)
    }
}

impl FileObject {
    pub fn name(&self) -> Result<PathBuf> {
        let mut buf = vec![0u8; FILENAME_MAX];
        if !self.core.engine.file_name(self.core.handle, &mut buf) {
            return Err(NormError::Engine("failed to get file name"));
        }
        let end = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(NormError::NameTruncated(FILENAME_MAX))?;
        buf.truncate(end);
        let name = String::from_utf8(buf).map_err(|_| NormError::BadName)?;
        Ok(PathBuf::from(name))
    }

    pub fn rename(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.core.engine.file_rename(self.core.handle, path.as_ref()) {
            return Err(NormError::Engine("failed to rename file"));
        }
        Ok(())
    }
}

impl StreamObject {
    /// Queue bytes for transmission. `Ok(0)` means the send buffer is full; a
    /// rejected write is a [`NormError::StreamBreak`].
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.core
            .engine
            .stream_write(self.core.handle, buf)
            .ok_or(NormError::StreamBreak)
    }

    /// Take received bytes. `Ok(0)` means nothing is buffered yet.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.core
            .engine
            .stream_read(self.core.handle, buf)
            .ok_or(NormError::StreamBreak)
    }

    pub fn flush(&self, eom: bool, mode: FlushMode) {
        self.core.engine.stream_flush(self.core.handle, eom, mode)
    }

    pub fn mark_eom(&self) {
        self.core.engine.stream_mark_eom(self.core.handle)
    }

    pub fn close(&self, graceful: bool) {
        self.core.engine.stream_close(self.core.handle, graceful)
    }

    pub fn has_vacancy(&self) -> bool {
        self.core.engine.stream_has_vacancy(self.core.handle)
    }

    pub fn read_offset(&self) -> u64 {
        self.core.engine.stream_read_offset(self.core.handle)
    }

    /// Skip ahead to the next message boundary. False if none is buffered.
    pub fn seek_msg_start(&self) -> bool {
        self.core.engine.stream_seek_msg_start(self.core.handle)
    }

    pub fn set_push_enable(&self, enable: bool) {
        self.core.engine.stream_set_push_enable(self.core.handle, enable)
    }

    pub fn set_auto_flush(&self, mode: FlushMode) {
        self.core.engine.stream_set_auto_flush(self.core.handle, mode)
    }
}

/// A transport object of any variant.
#[derive(Clone, Debug)]
pub enum Object {
    Data(DataObject),
    File(FileObject),
    Stream(StreamObject),
}

impl Object {
    /// Wrap `handle` as the variant the engine reports. `None` for the invalid
    /// handle or an object of no known type.
    pub fn from_handle(engine: Arc<dyn Engine>, handle: ObjectHandle) -> Option<Object> {
        if !handle.is_valid() {
            return None;
        }
        match engine.object_type(handle) {
            ObjectType::Data => Some(Object::Data(DataObject::new(engine, handle))),
            ObjectType::File => Some(Object::File(FileObject::new(engine, handle))),
            ObjectType::Stream => Some(Object::Stream(StreamObject::new(engine, handle))),
            ObjectType::None => None,
        }
    }

    /// Variant this value was built as, without asking the engine.
    pub fn variant(&self) -> ObjectType {
        match self {
            Object::Data(_) => ObjectType::Data,
            Object::File(_) => ObjectType::File,
            Object::Stream(_) => ObjectType::Stream,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamObject> {
        match self {
            Object::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataObject> {
        match self {
            Object::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileObject> {
        match self {
            Object::File(file) => Some(file),
            _ => None,
        }
    }
}

impl TransportObject for Object {
    fn core(&self) -> &ObjectCore {
        match self {
            Object::Data(o) => o.core(),
            Object::File(o) => o.core(),
            Object::Stream(o) => o.core(),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.handle() == other.handle()
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle().hash(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{NodeHandle, NodeId};
    use crate::instance::Instance;
    use crate::session::Session;
    use crate::sim::SimEngine;
    use std::collections::HashSet;

    fn receiver() -> (Arc<SimEngine>, Instance, Session, NodeHandle) {
        let sim = Arc::new(SimEngine::new());
        let instance = Instance::create(sim.clone(), false).unwrap();
        let session = instance
            .create_session("224.1.2.3", 6003, NodeId(2))
            .unwrap();
        session.start_receiver(1 << 16).unwrap();
        let node = sim.add_remote_node(
            session.handle(),
            NodeId(9),
            "10.0.0.9:6003".parse().unwrap(),
        );
        (sim, instance, session, node)
    }

    #[test]
    fn from_handle_builds_reported_variant() {
        let sim = Arc::new(SimEngine::new());
        let instance = Instance::create(sim.clone(), false).unwrap();
        let session = instance.create_session("224.1.2.3", 6003, NodeId(2)).unwrap();
        let node = sim.add_remote_node(
            session.handle(),
            NodeId(9),
            "10.0.0.9:6003".parse().unwrap(),
        );
        let handle = sim.open_remote_stream(session.handle(), node);
        let engine: Arc<dyn Engine> = sim.clone();
        let obj = Object::from_handle(engine.clone(), handle).unwrap();
        assert_eq!(obj.variant(), ObjectType::Stream);
        assert!(obj.as_stream().is_some());
        assert!(Object::from_handle(engine.clone(), ObjectHandle::INVALID).is_none());
        assert!(Object::from_handle(engine, ObjectHandle::from_raw(9999)).is_none());
    }

    #[test]
    fn identity_follows_handle() {
        let sim = Arc::new(SimEngine::new());
        let engine: Arc<dyn Engine> = sim;
        let a = Object::Stream(StreamObject::new(engine.clone(), ObjectHandle::from_raw(5)));
        let b = Object::Data(DataObject::new(engine.clone(), ObjectHandle::from_raw(5)));
        let c = Object::Data(DataObject::new(engine, ObjectHandle::from_raw(6)));
        assert_eq!(a, b);
        assert_ne!(b, c);
        let set: HashSet<Object> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn sender_of_received_and_local_objects() {
        let (sim, _instance, session, node) = receiver();
        let engine: Arc<dyn Engine> = sim.clone();
        let rx = sim.open_remote_stream(session.handle(), node);
        let obj = StreamObject::new(engine.clone(), rx);
        assert_eq!(obj.sender().unwrap().id(), NodeId(9));

        let local = DataObject::new(engine, ObjectHandle::from_raw(0x7777));
        assert!(matches!(
            local.sender(),
            Err(NormError::Engine("locally originated sender object"))
        ));
    }

    #[test]
    fn file_name_requires_terminator() {
        let (sim, _instance, session, node) = receiver();
        let engine: Arc<dyn Engine> = sim.clone();

        let ok = sim.add_remote_file(session.handle(), node, Path::new("/var/cache/norm/a.bin"));
        let file = FileObject::new(engine.clone(), ok);
        assert_eq!(file.name().unwrap(), PathBuf::from("/var/cache/norm/a.bin"));
        file.rename("/tmp/b.bin").unwrap();
        assert_eq!(file.name().unwrap(), PathBuf::from("/tmp/b.bin"));

        let long = "x".repeat(FILENAME_MAX);
        let truncated = sim.add_remote_file(session.handle(), node, Path::new(&long));
        let file = FileObject::new(engine, truncated);
        assert!(matches!(file.name(), Err(NormError::NameTruncated(FILENAME_MAX))));
    }

    #[test]
    fn retain_release_pairing() {
        let (sim, _instance, session, node) = receiver();
        let engine: Arc<dyn Engine> = sim.clone();
        let h = sim.add_remote_data(session.handle(), node, b"payload", Some(b"meta"));
        let data = DataObject::new(engine, h);
        data.retain();
        assert_eq!(sim.retain_count(h), 1);
        unsafe { data.release() };
        assert_eq!(sim.retain_count(h), 0);
        assert_eq!(data.data(), b"payload");
        assert_eq!(data.info().as_deref(), Some(&b"meta"[..]));
    }
}
