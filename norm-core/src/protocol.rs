//! Engine vocabulary: event types, object types and the tuning enumerations.
//! Discriminants match the native API's integer codes.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $code:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        #[repr(i32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code),+
        }

        impl $name {
            /// Decode a native code. Unknown codes yield `None`.
            pub fn from_raw(raw: i32) -> Option<Self> {
                match raw {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_raw(self) -> i32 {
                self as i32
            }
        }
    };
}

raw_enum! {
    /// Every notification the engine can post.
    pub enum EventType {
        Invalid = 0,
        TxQueueVacancy = 1,
        TxQueueEmpty = 2,
        TxFlushCompleted = 3,
        TxWatermarkCompleted = 4,
        TxCmdSent = 5,
        TxObjectSent = 6,
        TxObjectPurged = 7,
        TxRateChanged = 8,
        LocalSenderClosed = 9,
        RemoteSenderNew = 10,
        RemoteSenderReset = 11,
        RemoteSenderAddress = 12,
        RemoteSenderActive = 13,
        RemoteSenderInactive = 14,
        RemoteSenderPurged = 15,
        RxCmdNew = 16,
        RxObjectNew = 17,
        RxObjectInfo = 18,
        RxObjectUpdated = 19,
        RxObjectCompleted = 20,
        RxObjectAborted = 21,
        RxAckRequest = 22,
        GrttUpdated = 23,
        CcActive = 24,
        CcInactive = 25,
        AckingNodeNew = 26,
        SendError = 27,
        UserTimeout = 28,
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

raw_enum! {
    /// Variant tag of a transport object.
    pub enum ObjectType {
        None = 0,
        Data = 1,
        File = 2,
        Stream = 3,
    }
}

raw_enum! {
    pub enum NackingMode {
        None = 0,
        InfoOnly = 1,
        Normal = 2,
    }
}

raw_enum! {
    pub enum FlushMode {
        None = 0,
        Passive = 1,
        Active = 2,
    }
}

raw_enum! {
    pub enum ProbingMode {
        None = 0,
        Passive = 1,
        Active = 2,
    }
}

raw_enum! {
    pub enum RepairBoundary {
        Block = 0,
        Object = 1,
    }
}

raw_enum! {
    pub enum SyncPolicy {
        Current = 0,
        Stream = 1,
        All = 2,
    }
}

raw_enum! {
    /// Result of an acknowledgment collection query.
    pub enum AckingStatus {
        /// Unknown session or node.
        Invalid = 0,
        /// No response after the full robustness-factor retransmission.
        Failure = 1,
        /// Still collecting; query again later.
        Pending = 2,
        Success = 3,
    }
}

raw_enum! {
    /// Forward error correction scheme used by a sender.
    pub enum FecType {
        Rs8 = 0,
        Rs16 = 1,
        Mdp = 2,
    }
}

impl Default for FecType {
    fn default() -> Self {
        FecType::Rs8
    }
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::Passive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_match_native_ordering() {
        assert_eq!(EventType::from_raw(0), Some(EventType::Invalid));
        assert_eq!(EventType::from_raw(17), Some(EventType::RxObjectNew));
        assert_eq!(EventType::from_raw(28), Some(EventType::UserTimeout));
        assert_eq!(EventType::from_raw(29), None);
        assert_eq!(EventType::TxQueueVacancy.as_raw(), 1);
    }

    #[test]
    fn object_type_codes() {
        assert_eq!(ObjectType::from_raw(3), Some(ObjectType::Stream));
        assert_eq!(ObjectType::from_raw(-1), None);
    }

    #[test]
    fn modes_deserialize_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            flush: FlushMode,
            nack: NackingMode,
        }
        let w: Wrapper = toml::from_str("flush = \"active\"\nnack = \"info_only\"").unwrap();
        assert_eq!(w.flush, FlushMode::Active);
        assert_eq!(w.nack, NackingMode::InfoOnly);
    }
}
