//! Connection path parsing.
//!
//! A connection path is a string like `10.20.30.100`, `10.20.30.100/1` or
//! `1.2.3.4/backplane/2/enet/6.7.8.9/backplane/0`, using `/` or `\` as the
//! separator. The first token must be an IPv4 address; the remaining tokens
//! describe the CIP route. This module only tokenizes: symbolic port names
//! (`backplane`/`bp`, `enet`) and link addresses are resolved when the route
//! is encoded as an EPATH (see [`crate::epath`]).

use std::net::Ipv4Addr;

use crate::error::{CipError, Result};

/// One hop of a CIP route: a port and the link address to take through it.
///
/// The port is symbolic (`"backplane"`, `"bp"`, `"enet"`) or a decimal port
/// number; the link is a slot number or an IP address for network hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSegment {
    pub port: String,
    pub link: String,
}

impl PortSegment {
    pub fn new(port: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            link: link.into(),
        }
    }

    /// Backplane routing to a specific slot, the most common single hop.
    pub fn backplane(slot: u8) -> Self {
        Self::new("bp", slot.to_string())
    }
}

/// Parses a connection path into the destination address and route segments.
///
/// - no tokens after the address: backplane slot 0
/// - one token: backplane slot `<token>`
/// - two or more tokens: consecutive `(port, link)` pairs, in order
///
/// An odd trailing token is discarded by the pairwise grouping. That mirrors
/// the historical behavior; a trailing singleton is arguably an input error
/// (see DESIGN.md).
pub fn parse_connection_path(path: &str) -> Result<(Ipv4Addr, Vec<PortSegment>)> {
    let normalized = path.replace('\\', "/");
    let mut tokens = normalized.split('/');

    let ip_token = tokens.next().unwrap_or_default();
    let address: Ipv4Addr = ip_token.parse().map_err(|err| {
        CipError::request_with(format!("invalid IP address: {ip_token}"), Box::new(err))
    })?;

    let rest: Vec<&str> = tokens.collect();
    let route = match rest.len() {
        0 => vec![PortSegment::new("bp", "0")],
        1 => vec![PortSegment::new("bp", rest[0])],
        _ => rest
            .chunks_exact(2)
            .map(|pair| PortSegment::new(pair[0], pair[1]))
            .collect(),
    };

    Ok((address, route))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_only_defaults_to_backplane_slot_zero() {
        let (addr, route) = parse_connection_path("10.20.30.100").unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 20, 30, 100));
        assert_eq!(route, vec![PortSegment::new("bp", "0")]);
    }

    #[test]
    fn single_token_is_backplane_slot() {
        let (_, route) = parse_connection_path("10.20.30.100/2").unwrap();
        assert_eq!(route, vec![PortSegment::new("bp", "2")]);
    }

    #[test]
    fn multiple_tokens_group_into_port_link_pairs() {
        let (addr, route) =
            parse_connection_path("1.2.3.4/backplane/2/enet/6.7.8.9").unwrap();
        assert_eq!(addr, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(
            route,
            vec![
                PortSegment::new("backplane", "2"),
                PortSegment::new("enet", "6.7.8.9"),
            ]
        );
    }

    #[test]
    fn backslash_separator_is_accepted() {
        let (_, route) = parse_connection_path(r"10.20.30.100\3").unwrap();
        assert_eq!(route, vec![PortSegment::new("bp", "3")]);
    }

    #[test]
    fn invalid_address_fails_with_offending_token() {
        let err = parse_connection_path("not-an-ip/1").unwrap_err();
        match err {
            CipError::Request { context, .. } => {
                assert!(context.contains("not-an-ip"), "context was: {context}");
            }
            other => panic!("expected a Request fault, got {other:?}"),
        }
    }

    #[test]
    fn odd_trailing_token_is_dropped() {
        let (_, route) = parse_connection_path("1.2.3.4/bp/1/enet").unwrap();
        assert_eq!(route, vec![PortSegment::new("bp", "1")]);
    }
}
