//! Error type shared by every layer of the crate.

use std::io;

/// Failures surfaced by sessions, objects, nodes and the stream adapters.
#[derive(Debug, thiserror::Error)]
pub enum NormError {
    /// Offset or length outside the caller's buffer. Raised before any engine call.
    #[error("the {what} is out of range")]
    OutOfRange { what: &'static str },
    /// A stream-specific operation was attempted before the stream object exists.
    #[error("can only {0} after the stream is open")]
    NotOpen(&'static str),
    /// The engine refused the request or returned an invalid handle.
    #[error("{0}")]
    Engine(&'static str),
    /// The engine reported a break in stream delivery order (data lost beyond repair).
    #[error("break in stream integrity")]
    StreamBreak,
    #[error("stream is closed")]
    Closed,
    #[error("stream is already open")]
    AlreadyOpen,
    #[error("session has been destroyed")]
    SessionDestroyed,
    /// The stream object went away (sent or purged) while data was still pending.
    #[error("no live stream object to write to")]
    NoStream,
    #[error("file name does not fit in {0} bytes")]
    NameTruncated(usize),
    #[error("file name is not valid UTF-8")]
    BadName,
    #[error("node address has unexpected length {0}")]
    BadAddress(usize),
}

pub type Result<T> = std::result::Result<T, NormError>;

impl NormError {
    fn kind(&self) -> io::ErrorKind {
        match self {
            NormError::OutOfRange { .. } => io::ErrorKind::InvalidInput,
            NormError::NotOpen(_) | NormError::NoStream => io::ErrorKind::NotConnected,
            NormError::StreamBreak | NormError::BadName | NormError::BadAddress(_) => {
                io::ErrorKind::InvalidData
            }
            NormError::Closed | NormError::SessionDestroyed => io::ErrorKind::BrokenPipe,
            NormError::AlreadyOpen => io::ErrorKind::AlreadyExists,
            NormError::Engine(_) | NormError::NameTruncated(_) => io::ErrorKind::Other,
        }
    }
}

impl From<NormError> for io::Error {
    fn from(err: NormError) -> Self {
        io::Error::new(err.kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mapping_keeps_category() {
        let e: io::Error = NormError::StreamBreak.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
        assert_eq!(e.to_string(), "break in stream integrity");

        let e: io::Error = NormError::OutOfRange { what: "data offset" }.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(e.to_string(), "the data offset is out of range");
    }

    #[test]
    fn not_open_message() {
        assert_eq!(
            NormError::NotOpen("mark EOM").to_string(),
            "can only mark EOM after the stream is open"
        );
    }
}
