//! crosswire server library entry.
//!
//! This crate wires the dispatch pipeline (registry + interceptors), the
//! bounded worker pool, the timer wheel, and the connection lifecycle for the
//! TCP and WebSocket transports into one server stack. It is consumed by the
//! binary (`main.rs`) and by integration tests.

pub mod config;
pub mod conn;
pub mod naming;
pub mod pool;
pub mod registry;
pub mod server;
pub mod services;
pub mod timer;
