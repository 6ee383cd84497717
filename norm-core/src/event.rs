//! Events as delivered to applications.

use std::fmt;
use std::sync::Arc;

use crate::engine::{Engine, RawEvent};
use crate::handle::{NodeHandle, ObjectHandle, SessionHandle};
use crate::node::Node;
use crate::object::{Object, TransportObject};
use crate::protocol::EventType;
use crate::session::{Session, SessionRegistry};

/// One engine notification. The session, node and object are resolved on
/// demand, so an event whose object has since been freed still reads safely.
#[derive(Clone)]
pub struct Event {
    raw: RawEvent,
    engine: Arc<dyn Engine>,
    registry: Arc<SessionRegistry>,
}

impl Event {
    pub(crate) fn new(
        raw: RawEvent,
        engine: Arc<dyn Engine>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            raw,
            engine,
            registry,
        }
    }

    pub fn kind(&self) -> EventType {
        self.raw.kind
    }

    pub fn raw(&self) -> RawEvent {
        self.raw
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.raw.session
    }

    pub fn node_handle(&self) -> NodeHandle {
        self.raw.node
    }

    pub fn object_handle(&self) -> ObjectHandle {
        self.raw.object
    }

    /// The registered session this event concerns, if it is still alive.
    pub fn session(&self) -> Option<Session> {
        if !self.raw.session.is_valid() {
            return None;
        }
        self.registry.lookup(self.raw.session)
    }

    pub fn node(&self) -> Option<Node> {
        if !self.raw.node.is_valid() {
            return None;
        }
        Some(Node::new(self.engine.clone(), self.raw.node))
    }

    /// The object, typed by what the engine reports now.
    pub fn object(&self) -> Option<Object> {
        Object::from_handle(self.engine.clone(), self.raw.object)
    }

    /// Whether this event is about `object`.
    pub fn concerns(&self, object: &impl TransportObject) -> bool {
        self.raw.object.is_valid() && self.raw.object == object.handle()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NormEvent [type={}]", self.raw.kind)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.raw.kind)
            .field("session", &self.raw.session)
            .field("node", &self.raw.node)
            .field("object", &self.raw.object)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::NodeId;
    use crate::instance::Instance;
    use crate::sim::SimEngine;
    use std::time::Duration;

    #[test]
    fn resolves_session_node_and_object() {
        let sim = Arc::new(SimEngine::new());
        let instance = Instance::create(sim.clone(), false).unwrap();
        let session = instance.create_session("224.1.2.3", 6003, NodeId(1)).unwrap();
        session.start_receiver(4096).unwrap();
        let node = sim.add_remote_node(
            session.handle(),
            NodeId(8),
            "10.0.0.8:6003".parse().unwrap(),
        );
        let stream = sim.open_remote_stream(session.handle(), node);

        let events: Vec<Event> = instance.events(Duration::from_millis(10)).collect();
        let kinds: Vec<EventType> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventType::RemoteSenderNew, EventType::RxObjectNew]);

        let new_obj = &events[1];
        assert_eq!(new_obj.session().unwrap(), session);
        assert_eq!(new_obj.node().unwrap().id(), NodeId(8));
        let obj = new_obj.object().unwrap();
        assert_eq!(obj.handle(), stream);
        assert!(new_obj.concerns(&obj));
        assert_eq!(new_obj.to_string(), "NormEvent [type=RxObjectNew]");
    }

    #[test]
    fn session_of_dropped_session_is_absent() {
        let sim = Arc::new(SimEngine::new());
        let instance = Instance::create(sim.clone(), false).unwrap();
        let session = instance.create_session("224.1.2.3", 6003, NodeId(1)).unwrap();
        sim.post_event(
            session.handle(),
            EventType::GrttUpdated,
            NodeHandle::INVALID,
            ObjectHandle::INVALID,
        );
        drop(session);
        let event = instance.next_event(false).unwrap();
        assert_eq!(event.kind(), EventType::GrttUpdated);
        assert!(event.session().is_none());
        assert!(event.object().is_none());
    }
}
