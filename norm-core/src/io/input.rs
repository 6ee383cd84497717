//! Blocking byte-stream reader over a receiver session.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::{NormError, Result};
use crate::event::Event;
use crate::handle::NodeId;
use crate::instance::Instance;
use crate::io::listener::{EventListener, ListenerId, ListenerSet};
use crate::io::pump::{EventPump, WAIT_SLICE};
use crate::object::{Object, StreamObject, TransportObject};
use crate::protocol::EventType;
use crate::session::Session;

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the caller's buffer.
    Data(usize),
    /// The sender finished (or aborted) the stream. Repeats on every later read.
    EndOfStream,
}

struct InputState {
    closed: bool,
    opened_before: bool,
    buffer_empty: bool,
    end_of_stream: bool,
    stream: Option<StreamObject>,
}

/// Receives one stream from a multicast group and exposes it as blocking reads.
///
/// The adapter owns its own engine instance and session. It starts closed;
/// call [`NormInputStream::open`] before reading.
pub struct NormInputStream {
    instance: Instance,
    session: Session,
    pump: EventPump,
    state: Mutex<InputState>,
    io: Mutex<()>,
    listeners: ListenerSet,
}

impl NormInputStream {
    pub fn new(engine: Arc<dyn Engine>, address: &str, port: u16) -> Result<Self> {
        let instance = Instance::create(engine, false)?;
        let session = match instance.create_session(address, port, NodeId::ANY) {
            Ok(session) => session,
            Err(e) => {
                instance.destroy();
                return Err(e);
            }
        };
        Ok(Self {
            pump: EventPump::new(instance.clone()),
            instance,
            session,
            state: Mutex::new(InputState {
                closed: true,
                opened_before: false,
                buffer_empty: true,
                end_of_stream: false,
                stream: None,
            }),
            io: Mutex::new(()),
            listeners: ListenerSet::new(),
        })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The receiver session, for pass-through tuning.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn add_listener(&self, listener: impl EventListener + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Start receiving with `buffer_space` bytes of receive buffer per sender.
    pub fn open(&self, buffer_space: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            return Err(NormError::AlreadyOpen);
        }
        if state.opened_before && !self.instance.restart() {
            return Err(NormError::Engine("failed to restart instance"));
        }
        self.session.start_receiver(buffer_space)?;
        *state = InputState {
            closed: false,
            opened_before: true,
            buffer_empty: true,
            end_of_stream: false,
            stream: None,
        };
        debug!(session = ?self.session.handle(), "input stream opened");
        Ok(())
    }

    /// Stop receiving. Idempotent; a read blocked on another thread returns
    /// [`NormError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.instance.wake();
        if let Some(stream) = state.stream.take() {
            stream.close(false);
        }
        self.session.stop_receiver();
        self.instance.stop();
        debug!(session = ?self.session.handle(), "input stream closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.state.lock().end_of_stream
    }

    /// The stream object currently being read, once one has been announced.
    pub fn stream(&self) -> Option<StreamObject> {
        self.state.lock().stream.clone()
    }

    /// Pump events until a sender's stream is adopted or `timeout` passes.
    /// Returns whether a stream is now current.
    pub fn wait_for_stream(&self, timeout: Duration) -> Result<bool> {
        let _io = self.io.lock();
        let deadline = Instant::now().checked_add(timeout);
        loop {
            {
                let state = self.state.lock();
                if state.closed {
                    return Err(NormError::Closed);
                }
                if state.stream.is_some() {
                    return Ok(true);
                }
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    WAIT_SLICE.min(deadline - now)
                }
                None => WAIT_SLICE,
            };
            if self.instance.has_next_event(slice) {
                if let Some(event) = self.instance.next_event(false) {
                    self.process(&event);
                }
            }
        }
    }

    /// Read into `buf`, blocking until data, end of stream, or close.
    pub fn read_some(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let _io = self.io.lock();
        loop {
            loop {
                let buffer_empty = {
                    let state = self.state.lock();
                    if state.closed {
                        return Err(NormError::Closed);
                    }
                    if state.end_of_stream {
                        return Ok(ReadOutcome::EndOfStream);
                    }
                    if buf.is_empty() {
                        return Ok(ReadOutcome::Data(0));
                    }
                    state.buffer_empty
                };
                let event = if buffer_empty {
                    self.pump.wait(|| self.is_closed())?
                } else {
                    match self.pump.poll() {
                        Some(event) => event,
                        None => break,
                    }
                };
                self.process(&event);
            }

            let mut state = self.state.lock();
            if state.closed {
                return Err(NormError::Closed);
            }
            let Some(stream) = state.stream.clone() else {
                state.buffer_empty = true;
                continue;
            };
            match stream.read(buf) {
                Ok(0) => state.buffer_empty = true,
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) => {
                    warn!(stream = ?stream.handle(), "stream integrity break");
                    return Err(e);
                }
            }
        }
    }

    /// Skip to the next message boundary in the current stream.
    pub fn seek_msg_start(&self) -> Result<bool> {
        let state = self.state.lock();
        let stream = state
            .stream
            .as_ref()
            .ok_or(NormError::NotOpen("seek message start"))?;
        Ok(stream.seek_msg_start())
    }

    pub fn read_offset(&self) -> Result<u64> {
        let state = self.state.lock();
        let stream = state
            .stream
            .as_ref()
            .ok_or(NormError::NotOpen("get the read offset"))?;
        Ok(stream.read_offset())
    }

    fn process(&self, event: &Event) {
        self.apply(event);
        self.listeners.dispatch(event);
    }

    fn apply(&self, event: &Event) {
        let adopted = match event.kind() {
            EventType::RxObjectNew => match event.object() {
                Some(Object::Stream(stream)) => Some(stream),
                _ => None,
            },
            _ => None,
        };
        let mut state = self.state.lock();
        let is_current = state
            .stream
            .as_ref()
            .is_some_and(|stream| event.concerns(stream));
        match event.kind() {
            EventType::RxObjectNew => {
                if let Some(stream) = adopted {
                    debug!(stream = ?stream.handle(), "adopted input stream");
                    state.stream = Some(stream);
                }
            }
            EventType::RxObjectUpdated if is_current => state.buffer_empty = false,
            EventType::RxObjectCompleted | EventType::RxObjectAborted if is_current => {
                debug!(kind = %event.kind(), "input stream ended");
                state.end_of_stream = true;
                state.stream = None;
            }
            _ => {}
        }
    }
}

impl Drop for NormInputStream {
    fn drop(&mut self) {
        self.close();
        self.session.destroy();
        self.instance.destroy();
    }
}

impl io::Read for &NormInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_some(buf)? {
            ReadOutcome::Data(n) => Ok(n),
            ReadOutcome::EndOfStream => Ok(0),
        }
    }
}

impl io::Read for NormInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{NodeHandle, ObjectHandle};
    use crate::sim::SimEngine;
    use std::io::Read;

    fn open_input() -> (Arc<SimEngine>, NormInputStream, NodeHandle) {
        let sim = Arc::new(SimEngine::new());
        let input = NormInputStream::new(sim.clone(), "224.1.2.3", 6003).unwrap();
        input.open(1 << 20).unwrap();
        let node = sim.add_remote_node(
            input.session().handle(),
            NodeId(7),
            "10.0.0.7:6003".parse().unwrap(),
        );
        (sim, input, node)
    }

    #[test]
    fn reads_delivered_bytes_then_eof() {
        let (sim, input, node) = open_input();
        let stream = sim.open_remote_stream(input.session().handle(), node);
        sim.deliver(stream, b"hello ");
        sim.deliver(stream, b"world");
        sim.complete(stream);

        let mut out = Vec::new();
        (&input).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert!(input.is_end_of_stream());
        let mut buf = [0u8; 4];
        assert_eq!(input.read_some(&mut buf).unwrap(), ReadOutcome::EndOfStream);
        assert_eq!(input.read_some(&mut buf).unwrap(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn events_for_other_objects_leave_state_alone() {
        let (sim, input, node) = open_input();
        let stream = sim.open_remote_stream(input.session().handle(), node);
        assert!(input.wait_for_stream(Duration::from_secs(1)).unwrap());
        sim.post_event(
            input.session().handle(),
            EventType::RxObjectCompleted,
            node,
            ObjectHandle::from_raw(0xdead),
        );
        sim.deliver(stream, b"abc");
        let mut buf = [0u8; 8];
        assert_eq!(input.read_some(&mut buf).unwrap(), ReadOutcome::Data(3));
        assert!(!input.is_end_of_stream());
    }

    #[test]
    fn reads_fail_after_close() {
        let (_sim, input, _node) = open_input();
        input.close();
        input.close();
        let mut buf = [0u8; 4];
        assert!(matches!(input.read_some(&mut buf), Err(NormError::Closed)));
    }

    #[test]
    fn open_twice_is_rejected_and_reopen_restarts() {
        let (sim, input, _node) = open_input();
        assert!(matches!(input.open(1024), Err(NormError::AlreadyOpen)));
        input.close();
        assert!(!sim.instance_running(input.instance().handle()));
        input.open(1024).unwrap();
        assert!(sim.instance_running(input.instance().handle()));
        assert!(sim.is_receiver(input.session().handle()));
    }

    #[test]
    fn break_in_stream_is_reported() {
        let (sim, input, node) = open_input();
        let stream = sim.open_remote_stream(input.session().handle(), node);
        sim.deliver(stream, b"abc");
        sim.break_stream(stream);
        let mut buf = [0u8; 8];
        assert!(matches!(input.read_some(&mut buf), Err(NormError::StreamBreak)));
    }

    #[test]
    fn setters_need_a_stream() {
        let (_sim, input, _node) = open_input();
        assert!(matches!(input.seek_msg_start(), Err(NormError::NotOpen(_))));
        assert!(matches!(input.read_offset(), Err(NormError::NotOpen(_))));
    }

    #[test]
    fn seek_to_message_boundary() {
        let (sim, input, node) = open_input();
        let stream = sim.open_remote_stream(input.session().handle(), node);
        sim.deliver(stream, b"partial-");
        sim.deliver_message(stream, b"whole");
        assert!(input.wait_for_stream(Duration::from_secs(1)).unwrap());
        assert!(input.seek_msg_start().unwrap());
        assert_eq!(input.read_offset().unwrap(), 8);
        let mut buf = [0u8; 16];
        assert_eq!(input.read_some(&mut buf).unwrap(), ReadOutcome::Data(5));
        assert_eq!(&buf[..5], b"whole");
    }

    #[test]
    fn zero_length_read_does_not_block() {
        let (_sim, input, _node) = open_input();
        assert_eq!(input.read_some(&mut []).unwrap(), ReadOutcome::Data(0));
    }
}
