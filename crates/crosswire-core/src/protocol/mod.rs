//! Wire protocol: envelope layout, stream framing, codec tokens.

pub mod codec;
pub mod envelope;
pub mod frame;
