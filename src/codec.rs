//! Encapsulation and CIP service frame codec.
//!
//! Builds the byte-exact frames the driver puts on the wire and parses the
//! replies back into [`Response`] objects keyed to the request that produced
//! them. All multi-byte fields are little-endian except the socket address
//! inside ListIdentity replies, which is big-endian per the encapsulation
//! spec.
//!
//! Frame layout, encapsulation header (24 bytes):
//! command (2), length (2), session handle (4), status (4),
//! sender context (8), options (4), then the command-specific payload.

use crate::epath::{logical_attribute, logical_class, logical_instance};
use crate::error::{CipError, Result};
use crate::identity::IdentityObject;

// Encapsulation commands.
pub(crate) const CMD_LIST_IDENTITY: u16 = 0x0063;
pub(crate) const CMD_REGISTER_SESSION: u16 = 0x0065;
pub(crate) const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub(crate) const CMD_SEND_RR_DATA: u16 = 0x006F;
pub(crate) const CMD_SEND_UNIT_DATA: u16 = 0x0070;

// CIP services.
pub const GET_ATTRIBUTES_ALL: u8 = 0x01;
pub(crate) const UNCONNECTED_SEND: u8 = 0x52;
pub(crate) const FORWARD_OPEN: u8 = 0x54;
pub(crate) const LARGE_FORWARD_OPEN: u8 = 0x5B;
pub(crate) const FORWARD_CLOSE: u8 = 0x4E;

// Class codes.
pub const CLASS_IDENTITY: u16 = 0x01;
pub(crate) const CLASS_CONNECTION_MANAGER: u16 = 0x06;
pub(crate) const CM_INSTANCE_OPEN_REQUEST: u16 = 0x01;

// CPF item types.
const ITEM_NULL_ADDRESS: u16 = 0x0000;
const ITEM_LIST_IDENTITY: u16 = 0x000C;
const ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
const ITEM_CONNECTED_DATA: u16 = 0x00B1;
const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

// Forward Open constants (CIP Vol 1, 3-5.5).
pub(crate) const PRIORITY: u8 = 0x0A;
pub(crate) const TIMEOUT_TICKS: u8 = 0x05;
pub(crate) const TIMEOUT_MULTIPLIER: u8 = 0x07;
pub(crate) const TRANSPORT_CLASS: u8 = 0xA3;
pub(crate) const RPI: [u8; 4] = [0x01, 0x40, 0x20, 0x00];
const INIT_NET_PARAMS: u32 = 0b0100_0010_0000_0000;

pub(crate) const ENCAP_HEADER_LEN: usize = 24;

/// Bit-packed network parameters field for a Forward Open request.
///
/// The connection size occupies the low bits with the initialization
/// parameters shifted above it: a 32-bit field for the Extended Forward
/// Open, a 16-bit field (size masked to 9 bits) for the standard one.
pub(crate) fn network_parameters(extended: bool, size: u16) -> Vec<u8> {
    if extended {
        let params = (size as u32 & 0xFFFF) | (INIT_NET_PARAMS << 16);
        params.to_le_bytes().to_vec()
    } else {
        let params = (size & 0x01FF) | INIT_NET_PARAMS as u16;
        params.to_le_bytes().to_vec()
    }
}

/// A request ready for the exchange primitive.
///
/// `error` marks a request that failed to build (for example an explicit
/// route that could not be encoded); such a request skips transmission and
/// resolves directly to a failed [`Response`].
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub kind: RequestKind,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum RequestKind {
    RegisterSession,
    UnregisterSession,
    ListIdentity,
    GenericUnconnected {
        service: u8,
        class_code: u16,
        instance: u16,
        attribute: Option<u16>,
        data: Vec<u8>,
        route_path: Option<Vec<u8>>,
        unconnected_send: bool,
    },
    GenericConnected {
        service: u8,
        class_code: u16,
        instance: u16,
        attribute: Option<u16>,
        data: Vec<u8>,
    },
}

/// Everything the codec needs from driver state to build a frame.
pub(crate) struct BuildContext<'a> {
    pub session: u32,
    pub context: &'a [u8; 8],
    pub option: u32,
    pub protocol_version: u16,
    pub target_cid: Option<&'a [u8; 4]>,
    /// Sequence value for this frame; drawn by the caller for connected
    /// requests only.
    pub sequence: Option<u16>,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self { kind, error: None }
    }

    pub fn invalid(kind: RequestKind, error: String) -> Self {
        Self {
            kind,
            error: Some(error),
        }
    }

    /// Unregister-Session is fire-and-forget; everything else expects
    /// exactly one reply frame.
    pub fn no_response(&self) -> bool {
        matches!(self.kind, RequestKind::UnregisterSession)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.kind, RequestKind::GenericConnected { .. })
    }

    /// Serializes the request into a wire frame.
    pub fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<u8>> {
        match &self.kind {
            RequestKind::RegisterSession => {
                let mut body = Vec::with_capacity(4);
                body.extend_from_slice(&ctx.protocol_version.to_le_bytes());
                body.extend_from_slice(&[0x00, 0x00]); // option flags
                frame(CMD_REGISTER_SESSION, 0, ctx, &body)
            }
            RequestKind::UnregisterSession => {
                frame(CMD_UNREGISTER_SESSION, ctx.session, ctx, &[])
            }
            RequestKind::ListIdentity => frame(CMD_LIST_IDENTITY, ctx.session, ctx, &[]),
            RequestKind::GenericUnconnected {
                service,
                class_code,
                instance,
                attribute,
                data,
                route_path,
                unconnected_send,
            } => {
                let mut cip =
                    router_request(*service, *class_code, *instance, *attribute, data);
                if *unconnected_send {
                    let route = route_path.as_deref().ok_or_else(|| {
                        CipError::request("unconnected send requires a route path")
                    })?;
                    cip = wrap_unconnected_send(&cip, route);
                } else if let Some(route) = route_path {
                    // Bare UCMM request: route path trails the service data.
                    cip.extend_from_slice(route);
                }
                send_rr_data(ctx, &cip)
            }
            RequestKind::GenericConnected {
                service,
                class_code,
                instance,
                attribute,
                data,
            } => {
                let cip =
                    router_request(*service, *class_code, *instance, *attribute, data);
                let cid = ctx.target_cid.ok_or_else(|| {
                    CipError::request("no open connection for connected request")
                })?;
                let sequence = ctx.sequence.ok_or_else(|| {
                    CipError::request("no sequence number for connected request")
                })?;
                send_unit_data(ctx, cid, sequence, &cip)
            }
        }
    }
}

fn encap_header(
    command: u16,
    length: u16,
    session: u32,
    context: &[u8; 8],
    option: u32,
) -> Vec<u8> {
    let mut header = Vec::with_capacity(ENCAP_HEADER_LEN);
    header.extend_from_slice(&command.to_le_bytes());
    header.extend_from_slice(&length.to_le_bytes());
    header.extend_from_slice(&session.to_le_bytes());
    header.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // status
    header.extend_from_slice(context);
    header.extend_from_slice(&option.to_le_bytes());
    header
}

fn frame(
    command: u16,
    session: u32,
    ctx: &BuildContext<'_>,
    body: &[u8],
) -> Result<Vec<u8>> {
    let length = u16::try_from(body.len()).map_err(|_| {
        CipError::request(format!(
            "encapsulation payload of {} bytes exceeds the 65535-byte limit",
            body.len()
        ))
    })?;
    let mut packet = encap_header(command, length, session, ctx.context, ctx.option);
    packet.extend_from_slice(body);
    Ok(packet)
}

/// Message-router request: service, path size in words, logical path, data.
fn router_request(
    service: u8,
    class_code: u16,
    instance: u16,
    attribute: Option<u16>,
    data: &[u8],
) -> Vec<u8> {
    let mut path = logical_class(class_code);
    path.extend_from_slice(&logical_instance(instance));
    if let Some(attribute) = attribute {
        path.extend_from_slice(&logical_attribute(attribute));
    }

    let mut request = Vec::with_capacity(2 + path.len() + data.len());
    request.push(service);
    request.push((path.len() / 2) as u8);
    request.extend_from_slice(&path);
    request.extend_from_slice(data);
    request
}

/// Wraps a CIP request in an Unconnected Send (0x52) envelope addressed to
/// the Connection Manager. The route path arrives already encoded in the
/// padded form (size, reserved byte, segments) and trails the envelope.
fn wrap_unconnected_send(embedded: &[u8], route_path: &[u8]) -> Vec<u8> {
    let mut wrapped = Vec::with_capacity(16 + embedded.len() + route_path.len());
    wrapped.push(UNCONNECTED_SEND);
    wrapped.push(0x02); // path size in words
    wrapped.extend_from_slice(&logical_class(CLASS_CONNECTION_MANAGER));
    wrapped.extend_from_slice(&logical_instance(CM_INSTANCE_OPEN_REQUEST));
    wrapped.push(PRIORITY);
    wrapped.push(TIMEOUT_TICKS);
    wrapped.extend_from_slice(&(embedded.len() as u16).to_le_bytes());
    wrapped.extend_from_slice(embedded);
    if embedded.len() % 2 != 0 {
        wrapped.push(0x00);
    }
    wrapped.extend_from_slice(route_path);
    wrapped
}

/// SendRRData: CPF with a null address item and an unconnected data item.
fn send_rr_data(ctx: &BuildContext<'_>, cip: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(16 + cip.len());
    body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // interface handle
    body.extend_from_slice(&[0x0A, 0x00]); // timeout
    body.extend_from_slice(&2u16.to_le_bytes()); // item count
    body.extend_from_slice(&ITEM_NULL_ADDRESS.to_le_bytes());
    body.extend_from_slice(&[0x00, 0x00]);
    body.extend_from_slice(&ITEM_UNCONNECTED_DATA.to_le_bytes());
    body.extend_from_slice(&(cip.len() as u16).to_le_bytes());
    body.extend_from_slice(cip);
    frame(CMD_SEND_RR_DATA, ctx.session, ctx, &body)
}

/// SendUnitData: CPF with the connected address item (target connection id)
/// and a connected data item carrying the sequence number and the request.
fn send_unit_data(
    ctx: &BuildContext<'_>,
    target_cid: &[u8; 4],
    sequence: u16,
    cip: &[u8],
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(20 + cip.len());
    body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // interface handle
    body.extend_from_slice(&[0x00, 0x00]); // timeout (unused for connected)
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&ITEM_CONNECTED_ADDRESS.to_le_bytes());
    body.extend_from_slice(&4u16.to_le_bytes());
    body.extend_from_slice(target_cid);
    body.extend_from_slice(&ITEM_CONNECTED_DATA.to_le_bytes());
    body.extend_from_slice(&((cip.len() + 2) as u16).to_le_bytes());
    body.extend_from_slice(&sequence.to_le_bytes());
    body.extend_from_slice(cip);
    frame(CMD_SEND_UNIT_DATA, ctx.session, ctx, &body)
}

/// Parsed reply, keyed to the request that produced it.
#[derive(Debug, Default)]
pub(crate) struct Response {
    /// Service data (or raw body) on success, empty otherwise.
    pub value: Vec<u8>,
    /// Protocol-level failure text; `None` means success.
    pub error: Option<String>,
    /// Session handle from a Register-Session reply.
    pub session: u32,
    /// Decoded identity from a ListIdentity reply.
    pub identity: Option<IdentityObject>,
}

impl Response {
    /// Parses `reply` according to the originating request.
    pub fn parse(request: &Request, reply: Option<&[u8]>) -> Response {
        if let Some(error) = &request.error {
            return Response {
                error: Some(error.clone()),
                ..Default::default()
            };
        }

        let raw = match reply {
            Some(raw) => raw,
            None if request.no_response() => return Response::default(),
            None => {
                return Response {
                    error: Some("no reply received".to_string()),
                    ..Default::default()
                }
            }
        };

        if raw.len() < ENCAP_HEADER_LEN {
            return Response {
                error: Some(format!("reply too short: {} bytes", raw.len())),
                ..Default::default()
            };
        }

        let encap_status = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        if encap_status != 0 {
            return Response {
                error: Some(format!(
                    "encapsulation command failed, status 0x{encap_status:08X}"
                )),
                ..Default::default()
            };
        }

        let length = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        let body = &raw[ENCAP_HEADER_LEN..raw.len().min(ENCAP_HEADER_LEN + length)];

        match &request.kind {
            RequestKind::RegisterSession => Response {
                session: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
                value: body.to_vec(),
                ..Default::default()
            },
            RequestKind::UnregisterSession => Response::default(),
            RequestKind::ListIdentity => parse_list_identity(body),
            RequestKind::GenericUnconnected { .. } => {
                match cpf_item(body, 8, ITEM_UNCONNECTED_DATA) {
                    Some(data) => parse_service_reply(data),
                    None => Response {
                        error: Some("no unconnected data item in reply".to_string()),
                        ..Default::default()
                    },
                }
            }
            RequestKind::GenericConnected { .. } => {
                match cpf_item(body, 8, ITEM_CONNECTED_DATA) {
                    // First two bytes of the connected data item echo the
                    // sequence number.
                    Some(data) if data.len() >= 2 => parse_service_reply(&data[2..]),
                    _ => Response {
                        error: Some("no connected data item in reply".to_string()),
                        ..Default::default()
                    },
                }
            }
        }
    }
}

/// Walks the CPF item list starting at `offset` and returns the data of the
/// first item with the wanted type code.
fn cpf_item(body: &[u8], offset: usize, wanted: u16) -> Option<&[u8]> {
    if body.len() < offset {
        return None;
    }
    let count = u16::from_le_bytes([body[offset - 2], body[offset - 1]]) as usize;
    let mut pos = offset;
    for _ in 0..count {
        if pos + 4 > body.len() {
            return None;
        }
        let item_type = u16::from_le_bytes([body[pos], body[pos + 1]]);
        let item_len = u16::from_le_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;
        if pos + item_len > body.len() {
            return None;
        }
        if item_type == wanted {
            return Some(&body[pos..pos + item_len]);
        }
        pos += item_len;
    }
    None
}

/// Parses a message-router reply: service echo, reserved byte, general
/// status, extended-status word count, extended words, then data.
fn parse_service_reply(data: &[u8]) -> Response {
    if data.len() < 4 {
        return Response {
            error: Some(format!("service reply too short: {} bytes", data.len())),
            ..Default::default()
        };
    }
    let status = data[2];
    let ext_words = data[3] as usize;
    let payload_start = 4 + ext_words * 2;

    if status != 0 {
        return Response {
            error: Some(format!(
                "{} - 0x{status:02X}",
                general_status_text(status)
            )),
            ..Default::default()
        };
    }

    Response {
        value: data.get(payload_start..).unwrap_or_default().to_vec(),
        ..Default::default()
    }
}

/// ListIdentity reply body: item count followed by identity items.
fn parse_list_identity(body: &[u8]) -> Response {
    if body.len() < 2 {
        return Response {
            error: Some("ListIdentity reply truncated".to_string()),
            ..Default::default()
        };
    }
    match cpf_item(body, 2, ITEM_LIST_IDENTITY) {
        Some(data) => match IdentityObject::from_list_identity(data) {
            Ok(identity) => Response {
                value: data.to_vec(),
                identity: Some(identity),
                ..Default::default()
            },
            Err(err) => Response {
                error: Some(err.to_string()),
                ..Default::default()
            },
        },
        None => Response {
            error: Some("no identity item in ListIdentity reply".to_string()),
            ..Default::default()
        },
    }
}

/// Validates that a discovery reply echoes the sender context we broadcast.
pub(crate) fn context_matches(raw: &[u8], context: &[u8; 8]) -> bool {
    raw.len() >= ENCAP_HEADER_LEN && &raw[12..20] == context
}

/// Human-readable text for a CIP general status code.
pub fn general_status_text(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Partial transfer",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x21 => "Write-once value or medium already written",
        0x22 => "Invalid reply received",
        0x23 => "Buffer overflow",
        0x24 => "Invalid message format",
        0x25 => "Key failure in path",
        0x26 => "Path size invalid",
        0x27 => "Unexpected attribute in list",
        0x28 => "Invalid member ID",
        0x29 => "Member not settable",
        _ => "Unknown CIP error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTEXT: [u8; 8] = *b"_cipcli_";

    fn ctx(session: u32) -> BuildContext<'static> {
        BuildContext {
            session,
            context: &CONTEXT,
            option: 0,
            protocol_version: 1,
            target_cid: None,
            sequence: None,
        }
    }

    #[test]
    fn register_session_frame_layout() {
        let request = Request::new(RequestKind::RegisterSession);
        let packet = request.build(&ctx(0)).unwrap();
        assert_eq!(packet.len(), 28);
        assert_eq!(&packet[0..2], &[0x65, 0x00]);
        assert_eq!(&packet[2..4], &[0x04, 0x00]); // length
        assert_eq!(&packet[4..8], &[0x00; 4]); // session not yet assigned
        assert_eq!(&packet[12..20], &CONTEXT);
        assert_eq!(&packet[24..26], &[0x01, 0x00]); // protocol version
    }

    #[test]
    fn network_parameters_packing() {
        // Extended: 32-bit field, size in the low 16 bits.
        let ext = network_parameters(true, 4000);
        assert_eq!(u32::from_le_bytes(ext.try_into().unwrap()), 0x4200_0FA0);
        // Standard: 16-bit field, size masked to 9 bits.
        let std_ = network_parameters(false, 500);
        assert_eq!(u16::from_le_bytes(std_.try_into().unwrap()), 0x4200 | 500);
    }

    #[test]
    fn unconnected_frame_has_null_address_and_data_items() {
        let request = Request::new(RequestKind::GenericUnconnected {
            service: GET_ATTRIBUTES_ALL,
            class_code: CLASS_IDENTITY,
            instance: 1,
            attribute: None,
            data: vec![],
            route_path: None,
            unconnected_send: false,
        });
        let packet = request.build(&ctx(0x0102_0304)).unwrap();
        assert_eq!(&packet[0..2], &[0x6F, 0x00]);
        assert_eq!(&packet[4..8], &0x0102_0304u32.to_le_bytes());
        let body = &packet[24..];
        assert_eq!(&body[6..8], &[0x02, 0x00]); // item count
        assert_eq!(&body[8..10], &[0x00, 0x00]); // null address item
        assert_eq!(&body[12..14], &[0xB2, 0x00]); // unconnected data item
        // CIP request: service, path size 2 words, class 0x01, instance 1
        assert_eq!(&body[16..22], &[0x01, 0x02, 0x20, 0x01, 0x24, 0x01]);
    }

    #[test]
    fn connected_frame_carries_cid_and_sequence() {
        let cid = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut build = ctx(0x11);
        build.target_cid = Some(&cid);
        build.sequence = Some(7);
        let request = Request::new(RequestKind::GenericConnected {
            service: 0x4C,
            class_code: 0x6B,
            instance: 0,
            attribute: None,
            data: vec![0x01, 0x00],
        });
        let packet = request.build(&build).unwrap();
        assert_eq!(&packet[0..2], &[0x70, 0x00]);
        let body = &packet[24..];
        assert_eq!(&body[8..10], &[0xA1, 0x00]);
        assert_eq!(&body[12..16], &cid);
        assert_eq!(&body[16..18], &[0xB1, 0x00]);
        assert_eq!(&body[20..22], &7u16.to_le_bytes());
    }

    #[test]
    fn oversized_payload_is_rejected_before_framing() {
        let request = Request::new(RequestKind::GenericUnconnected {
            service: 0x4D,
            class_code: 0x6B,
            instance: 0x01,
            attribute: None,
            data: vec![0u8; 70_000],
            route_path: None,
            unconnected_send: false,
        });
        match request.build(&ctx(0x11)) {
            Err(CipError::Request { context, .. }) => {
                assert!(context.contains("65535"), "context: {context}");
            }
            other => panic!("expected a Request fault, got {other:?}"),
        }
    }

    #[test]
    fn connected_frame_without_cid_is_a_request_fault() {
        let request = Request::new(RequestKind::GenericConnected {
            service: 0x4C,
            class_code: 0x6B,
            instance: 0,
            attribute: None,
            data: vec![],
        });
        assert!(matches!(
            request.build(&ctx(0x11)),
            Err(CipError::Request { .. })
        ));
    }

    #[test]
    fn service_reply_error_carries_status_text() {
        // service 0xD4, reserved, status 0x01, no extended words
        let response = parse_service_reply(&[0xD4, 0x00, 0x01, 0x00]);
        let error = response.error.unwrap();
        assert!(error.contains("Connection failure"), "error was: {error}");
        assert!(error.contains("0x01"));
    }

    #[test]
    fn service_reply_skips_extended_status_words() {
        let data = [0xD4, 0x00, 0x00, 0x01, 0x11, 0x03, 0xAA, 0xBB];
        let response = parse_service_reply(&data);
        assert!(response.error.is_none());
        assert_eq!(response.value, vec![0xAA, 0xBB]);
    }

    #[test]
    fn invalid_request_skips_straight_to_failure() {
        let request = Request::invalid(
            RequestKind::ListIdentity,
            "invalid port: serial".to_string(),
        );
        let response = Response::parse(&request, None);
        assert_eq!(response.error.as_deref(), Some("invalid port: serial"));
    }

    #[test]
    fn context_echo_check() {
        let mut raw = vec![0u8; 24];
        raw[12..20].copy_from_slice(&CONTEXT);
        assert!(context_matches(&raw, &CONTEXT));
        raw[13] = b'X';
        assert!(!context_matches(&raw, &CONTEXT));
    }
}
