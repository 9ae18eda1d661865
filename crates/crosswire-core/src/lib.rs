//! crosswire core: wire protocol, envelope, codec tokens, shared errors.
//!
//! Everything here is transport-agnostic. The server and client crates build
//! their connection loops on top of `protocol::frame` and route on
//! `protocol::envelope`.

pub mod error;
pub mod protocol;
