//! Blocking stream adapters: `std::io::Read`/`Write` over a NORM stream object.

mod input;
mod listener;
mod output;
mod pump;

pub use input::{NormInputStream, ReadOutcome};
pub use listener::{EventListener, ListenerId, ListenerSet};
pub use output::{NormOutputStream, FINISH_TIMEOUT};
pub use pump::WAIT_SLICE;
