pub mod address;
pub mod connection_state;
pub mod datagram;
pub mod peer;
pub mod stats;
pub mod stream;

mod channel;
mod nonblocking_guard;
mod options;
