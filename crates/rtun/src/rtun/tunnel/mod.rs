//! Client side of the reverse tunnel: one multiplexed session to the tunnel
//! server, a control stream for registrations, and worker streams routed by
//! name to local forwarders.

pub mod client;
pub mod inject;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod service;
pub mod transport;
