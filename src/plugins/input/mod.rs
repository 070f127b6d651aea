//! Built-in input plugins: UDP and TCP listeners, IPFIX file replay.

pub mod file;
pub mod tcp;
pub mod udp;
