//! Adaptation layer over a NORM (NACK-Oriented Reliable Multicast) engine.
//!
//! The engine owns all protocol state and hands out opaque handles. This crate
//! wraps those handles in typed sessions, objects, nodes and events, keeps one
//! managed [`Session`] per live session handle, and offers blocking
//! `std::io::Read`/`Write` adapters over stream objects.
//!
//! [`sim::SimEngine`] is an in-process engine for tests and demos; the `native`
//! feature adds `ffi::NativeEngine`, which links `libnorm`.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod handle;
pub mod instance;
pub mod io;
pub mod node;
pub mod object;
pub mod protocol;
pub mod session;
pub mod sim;

#[cfg(feature = "native")]
pub mod ffi;

pub use engine::{Engine, RawEvent, Readiness, SenderParams, SessionOption};
pub use error::{NormError, Result};
pub use event::Event;
pub use handle::{NodeHandle, NodeId, ObjectHandle, SessionHandle};
pub use instance::Instance;
pub use io::{EventListener, NormInputStream, NormOutputStream, ReadOutcome};
pub use node::Node;
pub use object::{DataObject, FileObject, Object, StreamObject, TransportObject};
pub use protocol::{EventType, FecType, FlushMode, ObjectType};
pub use session::Session;
