//! Wire schema shared by every transport.
//!
//! - **Envelope**: sequence, kind, error and payload
//! - **Messages**: the typed payload union
//! - **Codec**: binary and JSON encodings of an envelope

pub mod codec;
pub mod envelope;
pub mod messages;

pub use codec::Codec;
pub use envelope::{Envelope, MessageType};
pub use messages::*;
