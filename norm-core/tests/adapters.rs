//! Blocking adapter behaviour against the in-process engine.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use norm_core::engine::SenderParams;
use norm_core::error::NormError;
use norm_core::event::Event;
use norm_core::handle::{NodeHandle, NodeId};
use norm_core::TransportObject;
use norm_core::io::{NormInputStream, NormOutputStream, ReadOutcome, WAIT_SLICE};
use norm_core::protocol::{EventType, FecType};
use norm_core::sim::SimEngine;
use parking_lot::Mutex;

const GROUP: &str = "224.1.2.3";
const PORT: u16 = 6003;

fn params() -> SenderParams {
    SenderParams {
        session_id: 11,
        buffer_space: 1 << 20,
        segment_size: 1400,
        block_size: 64,
        num_parity: 16,
        fec: FecType::Rs8,
    }
}

fn read_to_eof(input: &NormInputStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 7];
    loop {
        match input.read_some(&mut buf).unwrap() {
            ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadOutcome::EndOfStream => return out,
        }
    }
}

#[test]
fn end_of_stream_is_sticky() {
    let sim = Arc::new(SimEngine::new());
    let input = NormInputStream::new(sim.clone(), GROUP, PORT).unwrap();
    input.open(1 << 20).unwrap();
    let node = sim.add_remote_node(
        input.session().handle(),
        NodeId(9),
        "10.0.0.9:6003".parse().unwrap(),
    );
    let stream = sim.open_remote_stream(input.session().handle(), node);
    sim.deliver(stream, b"hello world");
    sim.complete(stream);

    assert_eq!(read_to_eof(&input), b"hello world");
    let mut buf = [0u8; 4];
    for _ in 0..3 {
        assert!(matches!(input.read_some(&mut buf), Ok(ReadOutcome::EndOfStream)));
    }
    assert!(input.is_end_of_stream());
    assert_eq!((&input).read(&mut buf).unwrap(), 0);
}

#[test]
fn writer_blocks_until_vacancy() {
    let sim = Arc::new(SimEngine::with_tx_capacity(8));
    let output = Arc::new(NormOutputStream::new(sim.clone(), GROUP, PORT).unwrap());
    output.open(&params(), 1 << 20).unwrap();
    let stream = output.stream().unwrap().handle();
    let payload: Vec<u8> = (0u8..20).collect();

    let writer = {
        let output = output.clone();
        let payload = payload.clone();
        thread::spawn(move || output.write(&payload))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished(), "write returned with the buffer still full");
    assert_eq!(sim.transmitted(stream), b"");

    let deadline = Instant::now() + Duration::from_secs(10);
    while sim.transmitted(stream).len() < payload.len() {
        assert!(Instant::now() < deadline, "writer stalled");
        sim.drain_tx(stream, 4);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(writer.join().unwrap().unwrap(), payload.len());
    assert_eq!(sim.transmitted(stream), payload);
}

#[test]
fn listeners_see_events_in_engine_order() {
    let sim = Arc::new(SimEngine::new());
    let input = NormInputStream::new(sim.clone(), GROUP, PORT).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let seen = seen.clone();
        input.add_listener(move |e: &Event| seen.lock().push(("first", e.kind())))
    };
    {
        let seen = seen.clone();
        input.add_listener(move |e: &Event| seen.lock().push(("second", e.kind())));
    }
    input.open(1 << 20).unwrap();
    let session = input.session().handle();
    let node = sim.add_remote_node(session, NodeId(2), "10.0.0.2:6003".parse().unwrap());
    let stream = sim.open_remote_stream(session, node);
    sim.deliver(stream, b"ab");
    sim.complete(stream);

    assert_eq!(read_to_eof(&input), b"ab");
    let kinds: Vec<EventType> = seen
        .lock()
        .iter()
        .filter(|(who, _)| *who == "first")
        .map(|(_, k)| *k)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventType::RemoteSenderNew,
            EventType::RxObjectNew,
            EventType::RxObjectUpdated,
            EventType::RxObjectCompleted,
        ]
    );
    let order: Vec<&str> = seen.lock().iter().take(2).map(|(who, _)| *who).collect();
    assert_eq!(order, vec!["first", "second"]);

    assert!(input.remove_listener(first));
    assert!(!input.remove_listener(first));
}

#[test]
fn events_for_other_objects_leave_state_alone() {
    let sim = Arc::new(SimEngine::new());
    let input = NormInputStream::new(sim.clone(), GROUP, PORT).unwrap();
    input.open(1 << 20).unwrap();
    let session = input.session().handle();
    let node = sim.add_remote_node(session, NodeId(3), "10.0.0.3:6003".parse().unwrap());
    let stream = sim.open_remote_stream(session, node);
    assert!(input.wait_for_stream(Duration::from_secs(5)).unwrap());
    assert_eq!(input.stream().unwrap().handle(), stream);

    let data = sim.add_remote_data(session, node, b"side", None);
    sim.complete(data);
    sim.deliver(stream, b"main");

    let mut buf = [0u8; 16];
    assert!(matches!(input.read_some(&mut buf), Ok(ReadOutcome::Data(4))));
    assert_eq!(&buf[..4], b"main");
    assert!(!input.is_end_of_stream());
    assert_eq!(input.stream().unwrap().handle(), stream);
}

#[test]
fn close_unblocks_reader_promptly() {
    let sim = Arc::new(SimEngine::new());
    let input = Arc::new(NormInputStream::new(sim, GROUP, PORT).unwrap());
    input.open(1 << 20).unwrap();

    let reader = {
        let input = input.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            input.read_some(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    input.close();
    let result = reader.join().unwrap();
    assert!(matches!(result, Err(NormError::Closed)));
    assert!(started.elapsed() < WAIT_SLICE);
}

#[test]
fn close_returns_partial_write() {
    let sim = Arc::new(SimEngine::with_tx_capacity(4));
    let output = Arc::new(NormOutputStream::new(sim, GROUP, PORT).unwrap());
    output.open(&params(), 1 << 20).unwrap();

    let writer = {
        let output = output.clone();
        thread::spawn(move || output.write(b"0123456789"))
    };
    thread::sleep(Duration::from_millis(50));
    output.close();
    assert_eq!(writer.join().unwrap().unwrap(), 4);
    assert!(matches!(output.write(b"x"), Err(NormError::Closed)));
}

#[test]
fn polling_fallback_delivers_everything() {
    let sim = Arc::new(SimEngine::new());
    sim.disable_descriptor_wait();
    let input = NormInputStream::new(sim.clone(), GROUP, PORT).unwrap();
    input.open(1 << 20).unwrap();
    let session = input.session().handle();
    let node = sim.add_remote_node(session, NodeId(4), "10.0.0.4:6003".parse().unwrap());
    let stream = sim.open_remote_stream(session, node);
    sim.deliver(stream, b"polled ");
    sim.deliver(stream, b"bytes");
    sim.complete(stream);
    assert_eq!(read_to_eof(&input), b"polled bytes");

    let started = Instant::now();
    assert!(!input.instance().has_next_event(Duration::from_millis(20)));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn loopback_output_to_input() {
    let sim = Arc::new(SimEngine::new());
    let input = Arc::new(NormInputStream::new(sim.clone(), GROUP, PORT).unwrap());
    input.open(1 << 20).unwrap();
    let mut output = NormOutputStream::new(sim, GROUP, PORT).unwrap();
    output.open(&params(), 1 << 20).unwrap();

    let reader = {
        let input = input.clone();
        thread::spawn(move || {
            let mut out = Vec::new();
            (&*input).read_to_end(&mut out).map(|_| out)
        })
    };

    let message = b"multicast bytes, in order".repeat(40);
    output.write_all(&message).unwrap();
    output.flush().unwrap();
    output.finish();

    assert_eq!(reader.join().unwrap().unwrap(), message);
}

#[test]
fn dropping_adapters_releases_sessions() {
    let sim = Arc::new(SimEngine::new());
    {
        let input = NormInputStream::new(sim.clone(), GROUP, PORT).unwrap();
        let output = NormOutputStream::new(sim.clone(), GROUP, PORT).unwrap();
        input.open(1 << 20).unwrap();
        output.open(&params(), 1 << 20).unwrap();
        assert_eq!(sim.session_count(), 2);
    }
    assert_eq!(sim.session_count(), 0);
}

#[test]
fn aborted_stream_reads_as_end_of_stream() {
    let sim = Arc::new(SimEngine::new());
    let input = NormInputStream::new(sim.clone(), GROUP, PORT).unwrap();
    input.open(1 << 20).unwrap();
    let session = input.session().handle();
    let node = sim.add_remote_node(session, NodeId(5), "10.0.0.5:6003".parse().unwrap());
    let stream = sim.open_remote_stream(session, node);
    assert!(input.wait_for_stream(Duration::from_secs(5)).unwrap());
    sim.abort(stream);

    let mut buf = [0u8; 8];
    for _ in 0..2 {
        assert!(matches!(input.read_some(&mut buf), Ok(ReadOutcome::EndOfStream)));
    }
    assert!(input.stream().is_none());
}

#[test]
fn rejected_write_is_a_stream_break() {
    let sim = Arc::new(SimEngine::new());
    let output = NormOutputStream::new(sim.clone(), GROUP, PORT).unwrap();
    output.open(&params(), 1 << 20).unwrap();
    sim.break_stream(output.stream().unwrap().handle());

    assert!(matches!(output.write(b"abc"), Err(NormError::StreamBreak)));
    let err = Write::write(&mut &output, b"abc").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn sent_stream_is_released() {
    let sim = Arc::new(SimEngine::new());
    let output = NormOutputStream::new(sim.clone(), GROUP, PORT).unwrap();
    output.open(&params(), 1 << 20).unwrap();
    let stream = output.stream().unwrap().handle();
    sim.post_event(
        output.session().handle(),
        EventType::TxObjectSent,
        NodeHandle::INVALID,
        stream,
    );

    assert!(matches!(output.write(b"late"), Err(NormError::NoStream)));
    assert!(output.stream().is_none());
}

#[test]
fn finish_waits_for_the_tail_to_go_out() {
    let sim = Arc::new(SimEngine::with_tx_capacity(4));
    let output = Arc::new(NormOutputStream::new(sim.clone(), GROUP, PORT).unwrap());
    output.open(&params(), 1 << 20).unwrap();
    let stream = output.stream().unwrap().handle();
    assert_eq!(output.write(b"tail").unwrap(), 4);

    let finisher = {
        let output = output.clone();
        thread::spawn(move || output.finish_within(Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!finisher.is_finished(), "finish returned before the tail was sent");
    assert!(!output.is_closed());

    assert_eq!(sim.drain_tx(stream, 4), b"tail");
    assert!(finisher.join().unwrap());
    assert!(output.is_closed());
    assert!(!sim.is_sender(output.session().handle()));
}

#[test]
fn finish_gives_up_after_timeout() {
    let sim = Arc::new(SimEngine::with_tx_capacity(4));
    let output = NormOutputStream::new(sim.clone(), GROUP, PORT).unwrap();
    output.open(&params(), 1 << 20).unwrap();
    assert_eq!(output.write(b"full").unwrap(), 4);

    let started = Instant::now();
    assert!(!output.finish_within(Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(output.is_closed());
}

#[test]
fn unbounded_waits_end_on_close() {
    let sim = Arc::new(SimEngine::new());
    sim.disable_descriptor_wait();
    let input = Arc::new(NormInputStream::new(sim, GROUP, PORT).unwrap());
    input.open(1 << 20).unwrap();

    let waiter = {
        let input = input.clone();
        thread::spawn(move || input.wait_for_stream(Duration::MAX))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    input.close();
    assert!(matches!(waiter.join().unwrap(), Err(NormError::Closed)));
}
