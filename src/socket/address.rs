use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{SocketError, SocketResult};

/// Parses a dotted-quad IPv4 address. Host names are not resolved.
pub fn parse_endpoint(ip: &str, port: u16) -> SocketResult<SocketAddrV4> {
    let ip: Ipv4Addr = ip.trim().parse()
        .map_err(|_| SocketError::InvalidAddress(ip.to_string()))?;
    Ok(SocketAddrV4::new(ip, port))
}
