//! crosswire client: consistent-hash backend selection and a correlating TCP
//! client for the binary wire protocol.

pub mod balance;
pub mod client;

pub use balance::{Backend, KetamaBalancer};
pub use client::Client;
