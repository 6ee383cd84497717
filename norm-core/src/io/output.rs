//! Blocking byte-stream writer over a sender session.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{Engine, SenderParams};
use crate::error::{NormError, Result};
use crate::event::Event;
use crate::handle::NodeId;
use crate::instance::Instance;
use crate::io::listener::{EventListener, ListenerId, ListenerSet};
use crate::io::pump::EventPump;
use crate::object::{StreamObject, TransportObject};
use crate::protocol::{EventType, FlushMode};
use crate::session::Session;

/// How long [`NormOutputStream::finish`] waits for the engine to report the
/// stream's tail as sent.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

struct OutputState {
    closed: bool,
    opened_before: bool,
    buffer_full: bool,
    stream: Option<StreamObject>,
}

/// Sends a byte stream to a multicast group with blocking, backpressured writes.
///
/// Starts closed; call [`NormOutputStream::open`] before writing.
pub struct NormOutputStream {
    instance: Instance,
    session: Session,
    pump: EventPump,
    state: Mutex<OutputState>,
    io: Mutex<()>,
    listeners: ListenerSet,
}

impl NormOutputStream {
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
            state: Mutex::new(OutputState {
                closed: true,
                opened_before: false,
                buffer_full: false,
                stream: None,
            }),
            io: Mutex::new(()),
            listeners: ListenerSet::new(),
        })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The sender session, for pass-through tuning.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn add_listener(&self, listener: impl EventListener + 'static) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Start the sender and open a stream with `repair_window` bytes of buffer.
    pub fn open(&self, params: &SenderParams, repair_window: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            return Err(NormError::AlreadyOpen);
        }
        if state.opened_before && !self.instance.restart() {
            return Err(NormError::Engine("failed to restart instance"));
        }
        self.session.start_sender(params)?;
        let stream = match self.session.stream_open(repair_window) {
            Ok(stream) => stream,
            Err(e) => {
                self.session.stop_sender();
                return Err(e);
            }
        };
        debug!(stream = ?stream.handle(), "output stream opened");
        *state = OutputState {
            closed: false,
            opened_before: true,
            buffer_full: false,
            stream: Some(stream),
        };
        Ok(())
    }

    /// Abort the stream and stop sending. Idempotent; a write blocked on another
    /// thread returns what it wrote so far, or [`NormError::Closed`].
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
        self.session.stop_sender();
        self.instance.stop();
        debug!(session = ?self.session.handle(), "output stream closed");
    }

    /// Close the stream gracefully so receivers see a clean end, then stop.
    /// Waits up to [`FINISH_TIMEOUT`] for the tail to go out.
    pub fn finish(&self) {
        self.finish_within(FINISH_TIMEOUT);
    }

    /// Close the stream gracefully and keep the engine running until it
    /// reports the stream sent, the send queue empty or a completed flush, or
    /// until `timeout` passes. Returns whether the engine confirmed.
    pub fn finish_within(&self, timeout: Duration) -> bool {
        let _io = self.io.lock();
        let stream = {
            let state = self.state.lock();
            if state.closed {
                return false;
            }
            state.stream.clone()
        };
        let confirmed = match stream {
            Some(stream) => self.drain_graceful(&stream, timeout),
            None => true,
        };
        // Already closed gracefully; only the session is left to stop.
        self.state.lock().stream = None;
        self.close();
        confirmed
    }

    fn drain_graceful(&self, stream: &StreamObject, timeout: Duration) -> bool {
        stream.close(true);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.pump.wait_until(deadline, || self.is_closed()) {
                Ok(Some(event)) => {
                    let done = match event.kind() {
                        EventType::TxObjectSent => event.concerns(stream),
                        EventType::TxQueueEmpty | EventType::TxFlushCompleted => true,
                        _ => false,
                    };
                    self.process(&event);
                    if done {
                        debug!(kind = %event.kind(), "output stream drained");
                        return true;
                    }
                }
                Ok(None) => {
                    warn!(?timeout, "graceful close not confirmed before timeout");
                    return false;
                }
                Err(_) => return false,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The stream object being written, while it exists.
    pub fn stream(&self) -> Option<StreamObject> {
        self.state.lock().stream.clone()
    }

    /// Write all of `buf`, blocking while the send buffer is full. If the
    /// stream fails after some bytes were accepted, the partial count is
    /// returned and the next call reports the failure.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let _io = self.io.lock();
        if self.is_closed() {
            return Err(NormError::Closed);
        }
        let mut written = 0;
        while written < buf.len() {
            match self.write_chunk(&buf[written..]) {
                Ok(n) => written += n,
                Err(e) if written > 0 => {
                    debug!(written, error = %e, "partial write");
                    return Ok(written);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<usize> {
        while let Some(event) = self.pump.poll() {
            self.process(&event);
        }
        loop {
            {
                let state = self.state.lock();
                if state.closed {
                    return Err(NormError::Closed);
                }
                if !state.buffer_full || state.stream.is_none() {
                    break;
                }
            }
            let event = self.pump.wait(|| self.is_closed())?;
            self.process(&event);
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(NormError::Closed);
        }
        let stream = state.stream.clone().ok_or(NormError::NoStream)?;
        let n = stream.write(chunk)?;
        state.buffer_full = n == 0;
        Ok(n)
    }

    pub fn mark_eom(&self) -> Result<()> {
        self.with_stream("mark EOM", |stream| stream.mark_eom())
    }

    /// Flush the stream, optionally marking end of message.
    pub fn flush_stream(&self, eom: bool, mode: FlushMode) -> Result<()> {
        self.with_stream("flush", |stream| stream.flush(eom, mode))
    }

    pub fn set_auto_flush(&self, mode: FlushMode) -> Result<()> {
        self.with_stream("set auto flush", |stream| stream.set_auto_flush(mode))
    }

    pub fn set_push_enable(&self, enable: bool) -> Result<()> {
        self.with_stream("set push enable", |stream| {
            stream.set_push_enable(enable)
        })
    }

    pub fn has_vacancy(&self) -> Result<bool> {
        self.with_stream("check vacancy", |stream| stream.has_vacancy())
    }

    fn with_stream<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&StreamObject) -> T,
    ) -> Result<T> {
        let state = self.state.lock();
        let stream = state.stream.as_ref().ok_or(NormError::NotOpen(op))?;
        Ok(f(stream))
    }

    fn process(&self, event: &Event) {
        self.apply(event);
        self.listeners.dispatch(event);
    }

    fn apply(&self, event: &Event) {
        let mut state = self.state.lock();
        let is_current = state
            .stream
            .as_ref()
            .is_some_and(|stream| event.concerns(stream));
        if !is_current {
            return;
        }
        match event.kind() {
            EventType::TxQueueVacancy | EventType::TxQueueEmpty => state.buffer_full = false,
            EventType::TxObjectSent | EventType::TxObjectPurged => {
                debug!(kind = %event.kind(), "output stream released by engine");
                state.stream = None;
            }
            _ => {}
        }
    }
}

impl Drop for NormOutputStream {
    fn drop(&mut self) {
        self.close();
        self.session.destroy();
        self.instance.destroy();
    }
}

impl io::Write for &NormOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(NormOutputStream::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.flush_stream(false, FlushMode::Passive) {
            Ok(()) | Err(NormError::NotOpen(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl io::Write for NormOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FecType;
    use crate::sim::SimEngine;
    use std::io::Write;

    fn params() -> SenderParams {
        SenderParams {
            session_id: 1,
            buffer_space: 1 << 20,
            segment_size: 1400,
            block_size: 64,
            num_parity: 16,
            fec: FecType::Rs8,
        }
    }

    fn open_output(capacity: usize) -> (Arc<SimEngine>, NormOutputStream) {
        let sim = Arc::new(SimEngine::with_tx_capacity(capacity));
        let output = NormOutputStream::new(sim.clone(), "224.1.2.3", 6003).unwrap();
        output.open(&params(), 1 << 20).unwrap();
        (sim, output)
    }

    #[test]
    fn write_fits_in_buffer() {
        let (sim, output) = open_output(64);
        assert_eq!(output.write(b"0123456789").unwrap(), 10);
        let stream = output.stream().unwrap();
        assert_eq!(sim.drain_tx(stream.handle(), 64), b"0123456789");
    }

    #[test]
    fn setters_before_open_fail() {
        let sim = Arc::new(SimEngine::new());
        let output = NormOutputStream::new(sim, "224.1.2.3", 6003).unwrap();
        assert!(matches!(output.mark_eom(), Err(NormError::NotOpen("mark EOM"))));
        assert!(matches!(
            output.set_auto_flush(FlushMode::Active),
            Err(NormError::NotOpen(_))
        ));
        assert!(matches!(output.write(b"x"), Err(NormError::Closed)));
    }

    #[test]
    fn setters_reach_the_stream() {
        let (sim, output) = open_output(64);
        let h = output.stream().unwrap().handle();
        output.set_push_enable(true).unwrap();
        output.set_auto_flush(FlushMode::Active).unwrap();
        output.mark_eom().unwrap();
        output.flush_stream(true, FlushMode::Active).unwrap();
        assert!(sim.push_enabled(h));
        assert_eq!(sim.auto_flush(h), FlushMode::Active);
        assert_eq!(sim.eom_marks(h), 1);
        assert_eq!(sim.last_flush(h), Some((true, FlushMode::Active)));
        assert!(output.has_vacancy().unwrap());
    }

    #[test]
    fn purged_stream_turns_into_error() {
        let (sim, output) = open_output(4);
        let stream = output.stream().unwrap();
        assert_eq!(output.write(b"abcd").unwrap(), 4);
        sim.post_event(
            output.session().handle(),
            EventType::TxObjectPurged,
            crate::handle::NodeHandle::INVALID,
            stream.handle(),
        );
        assert!(matches!(output.write(b"e"), Err(NormError::NoStream)));
    }

    #[test]
    fn close_aborts_stream_and_stops_sender() {
        let (sim, output) = open_output(64);
        let h = output.stream().unwrap().handle();
        output.close();
        assert!(sim.is_stream_closed(h));
        assert!(!sim.is_sender(output.session().handle()));
        assert!(matches!(output.write(b"x"), Err(NormError::Closed)));
        assert!(matches!(output.open(&params(), 1024), Ok(())));
    }

    #[test]
    fn io_write_and_flush() {
        let (sim, mut output) = open_output(64);
        output.write_all(b"abc").unwrap();
        Write::flush(&mut output).unwrap();
        let h = output.stream().unwrap().handle();
        assert_eq!(sim.last_flush(h), Some((false, FlushMode::Passive)));
    }
}
