//! EPATH segment encoding.
//!
//! CIP addresses objects with a packed sequence of path segments. Two kinds
//! matter to this driver: logical segments (class/instance/attribute, used
//! inside message-router requests) and port segments (routing hops, used in
//! route paths). Multi-byte segments are padded to even length, and route
//! paths are prefixed with their size in 16-bit words - with or without a
//! reserved pad byte after the size, depending on the service.

use crate::error::{CipError, Result};
use crate::path::PortSegment;

/// Logical path to the Message Router object (class 0x02, instance 0x01),
/// appended to the route for Forward Open / Forward Close requests.
pub(crate) const MSG_ROUTER_PATH: [u8; 4] = [0x20, 0x02, 0x24, 0x01];

/// Encodes a logical class segment (8- or 16-bit form).
pub(crate) fn logical_class(class_code: u16) -> Vec<u8> {
    if class_code <= 0xFF {
        vec![0x20, class_code as u8]
    } else {
        let b = class_code.to_le_bytes();
        vec![0x21, 0x00, b[0], b[1]]
    }
}

/// Encodes a logical instance segment (8- or 16-bit form).
pub(crate) fn logical_instance(instance: u16) -> Vec<u8> {
    if instance <= 0xFF {
        vec![0x24, instance as u8]
    } else {
        let b = instance.to_le_bytes();
        vec![0x25, 0x00, b[0], b[1]]
    }
}

/// Encodes a logical attribute segment (8- or 16-bit form).
pub(crate) fn logical_attribute(attribute: u16) -> Vec<u8> {
    if attribute <= 0xFF {
        vec![0x30, attribute as u8]
    } else {
        let b = attribute.to_le_bytes();
        vec![0x31, 0x00, b[0], b[1]]
    }
}

fn resolve_port(port: &str) -> Result<u16> {
    match port {
        "backplane" | "bp" => Ok(1),
        "enet" => Ok(2),
        other => other
            .parse::<u16>()
            .map_err(|_| CipError::request(format!("invalid port: {other}"))),
    }
}

/// Encodes one port segment.
///
/// Numeric links use the compact two-byte form; non-numeric links (IP
/// addresses for network hops) use the extended-link form with an ASCII
/// address and a trailing pad byte when the total length is odd. Port
/// numbers above 14 use the extended-port form with a 16-bit port number.
pub(crate) fn encode_port_segment(segment: &PortSegment) -> Result<Vec<u8>> {
    let port = resolve_port(&segment.port)?;
    let numeric_link = segment.link.parse::<u8>().ok();
    let extended_link = numeric_link.is_none();

    if extended_link && (segment.link.is_empty() || !segment.link.is_ascii()) {
        return Err(CipError::request(format!(
            "invalid link address: {:?}",
            segment.link
        )));
    }

    let mut bytes = Vec::with_capacity(4 + segment.link.len());
    let port_nibble = if port < 15 { port as u8 } else { 0x0F };
    bytes.push(if extended_link { 0x10 } else { 0x00 } | port_nibble);

    if extended_link {
        bytes.push(segment.link.len() as u8);
    }
    if port >= 15 {
        bytes.extend_from_slice(&port.to_le_bytes());
    }

    match numeric_link {
        Some(link) => bytes.push(link),
        None => bytes.extend_from_slice(segment.link.as_bytes()),
    }

    if bytes.len() % 2 != 0 {
        bytes.push(0x00);
    }

    Ok(bytes)
}

/// Encodes a route path: port segments, an optional trailing message-router
/// path, a leading size in words and, when `pad_length` is set, a reserved
/// zero byte between the size and the segments.
///
/// Forward Open uses the unpadded form; Forward Close and unconnected
/// generic messages use the padded form.
pub(crate) fn encode_route_path(
    segments: &[PortSegment],
    with_msg_router: bool,
    pad_length: bool,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for segment in segments {
        data.extend_from_slice(&encode_port_segment(segment)?);
    }
    if with_msg_router {
        data.extend_from_slice(&MSG_ROUTER_PATH);
    }

    let mut path = Vec::with_capacity(data.len() + 2);
    path.push((data.len() / 2) as u8);
    if pad_length {
        path.push(0x00);
    }
    path.extend_from_slice(&data);
    Ok(path)
}
