//! Host address the speaker can reach us on

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::{debug, warn};

/// Address of the interface holding the default route
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick a source
/// address. The target need not be reachable. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    let route_ip = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };

    match route_ip() {
        Ok(ip) if !ip.is_unspecified() => {
            debug!(%ip, "Resolved local address");
            ip
        }
        Ok(_) => {
            warn!("No routable local address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(e) => {
            warn!("Could not determine local address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
