//! Engine-assigned handles. A handle is the only stable identity of a native
//! instance, session, object or node; it carries no type until the engine is asked.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Sentinel returned by the engine on failure.
            pub const INVALID: $name = $name(0);

            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }

            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

define_handle!(
    /// Handle of a protocol engine instance.
    InstanceHandle
);
define_handle!(
    /// Handle of a transport session.
    SessionHandle
);
define_handle!(
    /// Handle of a transport object (data, file or stream).
    ObjectHandle
);
define_handle!(
    /// Handle of a remote node.
    NodeHandle
);

/// Node identifier carried on the wire (not a handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(0);
    /// Wildcard: lets the engine pick a local id, or matches every acking node.
    pub const ANY: NodeId = NodeId(0xffff_ffff);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wait-able descriptor exported by an instance. Readable while events are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub i64);

impl Descriptor {
    pub const INVALID: Descriptor = Descriptor(-1);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}
