//! Device transport mechanics.
//!
//! - [`Publisher`]: the narrow downlink interface the retry engine sends through
//! - [`InMemoryPublisher`]: recording test double with failure injection
//! - [`message`]: uplink JSON envelopes and the shared operation codes

pub mod in_memory;
pub mod message;
pub mod publisher;

pub use in_memory::{InMemoryPublisher, PublishedMessage};
pub use message::{UpMsg, opcode};
pub use publisher::{Publisher, TransportError};
