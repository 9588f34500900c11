//! Session delivery and logout on top of the broker handle.
//!
//! Everything here runs as ordinary async tasks outside the broker loop
//! and reaches the connection registry only through
//! [`BrokerHandle`](crate::broker::handle::BrokerHandle).

pub mod logout;
pub mod origin;
pub mod relay;
pub mod service;
pub mod store;
