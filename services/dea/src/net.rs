//! Local address helpers.

use std::io;
use std::net::{IpAddr, TcpListener, UdpSocket};

/// Asks the OS for a free TCP port. The port is released before returning,
/// so the caller races other processes for it.
pub fn grab_ephemeral_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

/// The local address used to reach `route_to`. No packet is sent.
pub fn local_ip(route_to: &str) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect((route_to, 1))?;
    Ok(socket.local_addr()?.ip())
}
