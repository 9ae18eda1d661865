//! Built-in services.

pub mod echo;
