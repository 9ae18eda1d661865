//! Top-level facade crate for crosswire.
//!
//! Re-exports the protocol core, the server library, and the client library
//! so users can depend on a single crate.

pub mod core {
    pub use crosswire_core::*;
}

pub mod server {
    pub use crosswire_server::*;
}

pub mod client {
    pub use crosswire_client::*;
}

pub use crosswire_core::error::{Error, Result};
pub use crosswire_core::protocol::codec::WireCodec;
pub use crosswire_core::protocol::envelope::{Envelope, Meta};
