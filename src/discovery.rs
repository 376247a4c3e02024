//! UDP broadcast discovery of EtherNet/IP devices.
//!
//! A ListIdentity frame (session handle 0) is broadcast from every IPv4
//! interface address on the host and each reply that echoes our sender
//! context back is decoded into an [`IdentityObject`]. Discovery is
//! best-effort: the receive timeout is the loop terminator, and any socket
//! error simply ends collection on that interface.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::codec::{context_matches, BuildContext, Request, RequestKind, Response};
use crate::config::ETHERNET_IP_PORT;
use crate::error::{CipError, Result};
use crate::identity::IdentityObject;

const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Discovers EtherNet/IP devices reachable by broadcast.
///
/// Broadcasts from every usable interface address; if none are found (or
/// none yield replies), retries once from an unbound socket and lets the
/// OS pick the route.
pub async fn discover(context: &[u8; 8]) -> Result<Vec<IdentityObject>> {
    let mut devices = Vec::new();
    for address in interface_addresses() {
        match broadcast_from(Some(address), context).await {
            Ok(found) => devices.extend(found),
            Err(err) => warn!("discovery on {address} failed: {err}"),
        }
    }
    if devices.is_empty() {
        devices = broadcast_from(None, context).await?;
    }
    Ok(devices)
}

/// Broadcasts one ListIdentity request and collects replies until the
/// receive timeout fires.
async fn broadcast_from(
    address: Option<Ipv4Addr>,
    context: &[u8; 8],
) -> Result<Vec<IdentityObject>> {
    let bind = address.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let socket = broadcast_socket(bind)?;

    let request = Request::new(RequestKind::ListIdentity);
    let ctx = BuildContext {
        session: 0,
        context,
        option: 0,
        protocol_version: 1,
        target_cid: None,
        sequence: None,
    };
    let frame = request.build(&ctx)?;

    let target = SocketAddr::V4(SocketAddrV4::new(BROADCAST_ADDR, ETHERNET_IP_PORT));
    socket
        .send_to(&frame, target)
        .await
        .map_err(|err| CipError::comm_with("failed to broadcast ListIdentity", err))?;

    let mut devices = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let (len, peer) = match timeout(RECEIVE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            // Timeout is the expected terminator; errors end collection too.
            Ok(Err(err)) => {
                debug!("discovery receive ended: {err}");
                break;
            }
            Err(_) => break,
        };

        let raw = &buf[..len];
        if !context_matches(raw, context) {
            debug!("ignoring reply from {peer} with foreign context");
            continue;
        }
        let response = Response::parse(&request, Some(raw));
        match response.identity {
            Some(identity) => {
                debug!("discovered {} at {peer}", identity.product_name);
                devices.push(identity);
            }
            None => {
                if let Some(error) = response.error {
                    debug!("undecodable reply from {peer}: {error}");
                }
            }
        }
    }
    Ok(devices)
}

/// Builds a broadcast-enabled UDP socket bound to the given address.
fn broadcast_socket(bind: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|err| CipError::comm_with("failed to create discovery socket", err))?;
    socket
        .set_reuse_address(true)
        .and_then(|_| socket.set_broadcast(true))
        .and_then(|_| socket.set_nonblocking(true))
        .and_then(|_| socket.bind(&SocketAddr::V4(SocketAddrV4::new(bind, 0)).into()))
        .map_err(|err| CipError::comm_with("failed to configure discovery socket", err))?;
    UdpSocket::from_std(socket.into())
        .map_err(|err| CipError::comm_with("failed to register discovery socket", err))
}

/// Enumerates the host's non-loopback IPv4 addresses.
#[cfg(unix)]
fn interface_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(std::ptr::addr_of_mut!(ifaddrs)) != 0 {
            return addresses;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null()
                && i32::from((*ifa.ifa_addr).sa_family) == libc::AF_INET
            {
                #[allow(clippy::cast_ptr_alignment)]
                let sockaddr = ifa.ifa_addr.cast::<libc::sockaddr_in>();
                let ip = Ipv4Addr::from(u32::from_be((*sockaddr).sin_addr.s_addr));
                if !ip.is_loopback() {
                    addresses.push(ip);
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addresses
}

#[cfg(not(unix))]
fn interface_addresses() -> Vec<Ipv4Addr> {
    // No enumeration here; discovery falls back to an unbound socket.
    Vec::new()
}
