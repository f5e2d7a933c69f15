//! Address candidate discovery

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

use crate::protocol::{preference_order, Candidate};

/// Host candidates for a socket bound at `local`.
///
/// A wildcard bind is resolved to the address of the interface holding the
/// default route (no packet is sent to find it).
pub fn host_candidates(local: SocketAddr) -> Vec<Candidate> {
    if !local.ip().is_unspecified() {
        return vec![Candidate::host(local)];
    }

    match default_interface_ip() {
        Some(ip) => vec![Candidate::host(SocketAddr::new(ip, local.port()))],
        None => {
            debug!("No default route; falling back to loopback host candidate");
            vec![Candidate::host(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()))]
        }
    }
}

/// Server-reflexive candidate from the address the signal server observed.
///
/// The signal socket is not the transport socket, so the transport port is
/// assumed to be preserved by the NAT.
pub fn server_reflexive(observed: SocketAddr, transport_port: u16) -> Candidate {
    Candidate::server_reflexive(SocketAddr::new(observed.ip(), transport_port))
}

/// Everything we advertise, in probe order
pub fn gather(local: SocketAddr, observed: Option<SocketAddr>) -> Vec<Candidate> {
    let mut all = host_candidates(local);
    if let Some(observed) = observed {
        all.push(server_reflexive(observed, local.port()));
    }
    preference_order(&all)
}

fn default_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
