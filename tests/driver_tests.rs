//! End-to-end driver tests against a scripted transport.
//!
//! The mock transport replays canned reply frames and records everything
//! the driver sends, so session, forward-open fallback and teardown
//! behavior can be verified byte-for-byte without a device.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cip_client::{CipDriver, CipError, GenericMessage, PortSegment, RoutePath, Transport};

#[derive(Default)]
struct MockState {
    replies: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    connects: usize,
    closed: bool,
    fail_send: bool,
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _addr: SocketAddr) -> cip_client::Result<()> {
        self.state.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> cip_client::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_send {
            return Err(CipError::Comm {
                context: "failed to send frame".to_string(),
                source: None,
            });
        }
        state.sent.push(frame.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> cip_client::Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .replies
            .pop_front()
            .ok_or(CipError::Comm {
                context: "no scripted reply left".to_string(),
                source: None,
            })
    }

    async fn close(&mut self) -> cip_client::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

const SESSION: u32 = 0x0102_0304;

fn encap_reply(command: u16, session: u32, status: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(24 + body.len());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(&session.to_le_bytes());
    frame.extend_from_slice(&status.to_le_bytes());
    frame.extend_from_slice(b"_cipcli_");
    frame.extend_from_slice(&[0x00; 4]);
    frame.extend_from_slice(body);
    frame
}

fn register_reply(session: u32) -> Vec<u8> {
    encap_reply(0x0065, session, 0, &[0x01, 0x00, 0x00, 0x00])
}

/// Message-router reply: service echo, reserved, status, no extended words.
fn service_reply(status: u8, data: &[u8]) -> Vec<u8> {
    let mut reply = vec![0xD4, 0x00, status, 0x00];
    reply.extend_from_slice(data);
    reply
}

fn rr_reply(session: u32, service_data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x00; 4]); // interface handle
    body.extend_from_slice(&[0x00; 2]); // timeout
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&0x0000u16.to_le_bytes()); // null address item
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0x00B2u16.to_le_bytes());
    body.extend_from_slice(&(service_data.len() as u16).to_le_bytes());
    body.extend_from_slice(service_data);
    encap_reply(0x006F, session, 0, &body)
}

fn unit_reply(session: u32, cid: [u8; 4], service_data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x00; 4]);
    body.extend_from_slice(&[0x00; 2]);
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&0x00A1u16.to_le_bytes());
    body.extend_from_slice(&4u16.to_le_bytes());
    body.extend_from_slice(&cid);
    body.extend_from_slice(&0x00B1u16.to_le_bytes());
    body.extend_from_slice(&((service_data.len() + 2) as u16).to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes()); // sequence echo
    body.extend_from_slice(service_data);
    encap_reply(0x0070, session, 0, &body)
}

const TARGET_CID: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// Forward Open reply data: target's O->T connection id first.
fn forward_open_reply(session: u32) -> Vec<u8> {
    let mut data = TARGET_CID.to_vec();
    data.extend_from_slice(&[0x00; 22]);
    rr_reply(session, &service_reply(0x00, &data))
}

fn driver(state_replies: Vec<Vec<u8>>) -> (CipDriver, Arc<Mutex<MockState>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (transport, state) = MockTransport::new();
    state.lock().unwrap().replies = state_replies.into();
    let driver = CipDriver::with_transport("10.20.30.100/1", Box::new(transport)).unwrap();
    (driver, state)
}

#[tokio::test]
async fn open_is_idempotent_and_registers_once() {
    let (mut driver, state) = driver(vec![register_reply(SESSION)]);

    assert!(driver.open().await.unwrap());
    assert_eq!(driver.session_id(), SESSION);
    assert!(driver.open().await.unwrap());

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1);
    assert_eq!(state.sent.len(), 1, "only one registration frame expected");
    assert_eq!(&state.sent[0][0..2], &[0x65, 0x00]);
}

#[tokio::test]
async fn rejected_registration_returns_false_with_transport_connected() {
    let rejected = encap_reply(0x0065, 0, 0x0001, &[]);
    let (mut driver, state) = driver(vec![rejected]);

    assert!(!driver.open().await.unwrap());
    assert_eq!(driver.session_id(), 0);

    let state = state.lock().unwrap();
    assert_eq!(state.connects, 1);
    assert!(!state.closed, "transport must stay connected after rejection");
}

#[tokio::test]
async fn reopen_after_rejected_registration_still_reports_failure() {
    let rejected = encap_reply(0x0065, 0, 0x0001, &[]);
    let (mut driver, state) = driver(vec![rejected]);

    assert!(!driver.open().await.unwrap());
    // A second open is a no-op and must not claim a session exists.
    assert!(!driver.open().await.unwrap());
    assert_eq!(state.lock().unwrap().connects, 1);
}

#[tokio::test]
async fn sequence_advances_only_for_connected_requests() {
    let (mut driver, state) = driver(vec![
        register_reply(SESSION),
        forward_open_reply(SESSION),
        unit_reply(SESSION, TARGET_CID, &service_reply(0x00, &[])),
        rr_reply(SESSION, &service_reply(0x00, &[])),
        unit_reply(SESSION, TARGET_CID, &service_reply(0x00, &[])),
    ]);

    driver.open().await.unwrap();
    driver
        .generic_message(GenericMessage {
            name: "first".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    driver
        .generic_message(GenericMessage {
            connected: false,
            route_path: RoutePath::None,
            name: "between".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    driver
        .generic_message(GenericMessage {
            name: "second".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let state = state.lock().unwrap();
    // register, forward open, connected, unconnected, connected
    assert_eq!(state.sent.len(), 5);
    // Sequence number sits after the connected-address item in SendUnitData.
    assert_eq!(&state.sent[2][44..46], &1u16.to_le_bytes());
    assert_eq!(&state.sent[3][0..2], &[0x6F, 0x00]);
    // The interleaved unconnected request drew no sequence value.
    assert_eq!(&state.sent[4][44..46], &2u16.to_le_bytes());
}

#[tokio::test]
async fn extended_forward_open_falls_back_to_standard() {
    let (mut driver, state) = driver(vec![
        register_reply(SESSION),
        // Extended forward open rejected by the target.
        rr_reply(SESSION, &service_reply(0x08, &[])),
        forward_open_reply(SESSION),
        unit_reply(SESSION, TARGET_CID, &service_reply(0x00, &[0x42])),
    ]);

    driver.open().await.unwrap();
    assert!(driver.config().extended_forward_open);

    let result = driver
        .generic_message(GenericMessage {
            service: 0x4C,
            class_code: 0x6B,
            instance: 0x01,
            name: "read".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(result.value, vec![0x42]);
    assert!(driver.connected());
    assert!(!driver.config().extended_forward_open, "downgrade is sticky");
    assert_eq!(driver.connection_size(), 500);

    let state = state.lock().unwrap();
    // register, large forward open, standard forward open, connected read
    assert_eq!(state.sent.len(), 4);
    assert_eq!(state.sent[1][40], 0x5B, "first attempt is the large service");
    assert_eq!(state.sent[2][40], 0x54, "retry uses the standard service");
    assert_eq!(&state.sent[3][0..2], &[0x70, 0x00]);
    // Connected frame addresses the target's connection id.
    assert_eq!(&state.sent[3][36..40], &TARGET_CID);
}

#[tokio::test]
async fn exhausted_fallback_names_the_operation() {
    let (mut driver, _state) = driver(vec![
        register_reply(SESSION),
        rr_reply(SESSION, &service_reply(0x08, &[])),
        rr_reply(SESSION, &service_reply(0x08, &[])),
    ]);

    driver.open().await.unwrap();
    let err = driver
        .generic_message(GenericMessage {
            name: "read_plc_status".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    match err {
        CipError::Response { context, .. } => {
            assert!(context.contains("read_plc_status"), "context: {context}");
        }
        other => panic!("expected a Response fault, got {other:?}"),
    }
    assert!(!driver.connected());
}

#[tokio::test]
async fn unconnected_message_goes_through_ucmm() {
    let (mut driver, state) = driver(vec![
        register_reply(SESSION),
        rr_reply(SESSION, &service_reply(0x00, &[0x01, 0x02])),
    ]);

    driver.open().await.unwrap();
    let result = driver
        .generic_message(GenericMessage {
            connected: false,
            route_path: RoutePath::None,
            name: "identity".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.value, vec![0x01, 0x02]);
    let state = state.lock().unwrap();
    assert_eq!(&state.sent[1][0..2], &[0x6F, 0x00]);
    assert_eq!(&state.sent[1][4..8], &SESSION.to_le_bytes());
}

#[tokio::test]
async fn protocol_rejection_is_data_not_a_fault() {
    let (mut driver, _state) = driver(vec![
        register_reply(SESSION),
        rr_reply(SESSION, &service_reply(0x05, &[])),
    ]);

    driver.open().await.unwrap();
    let result = driver
        .generic_message(GenericMessage {
            connected: false,
            route_path: RoutePath::None,
            name: "missing".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!result.succeeded());
    let error = result.error.unwrap();
    assert!(error.contains("Path destination unknown"), "error: {error}");
}

#[tokio::test]
async fn bad_route_segments_never_reach_the_wire() {
    let (mut driver, state) = driver(vec![register_reply(SESSION)]);

    driver.open().await.unwrap();
    let result = driver
        .generic_message(GenericMessage {
            connected: false,
            route_path: RoutePath::Segments(vec![PortSegment::new("serial", "0")]),
            name: "bad_route".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(result.error.unwrap().contains("invalid port"));
    let state = state.lock().unwrap();
    assert_eq!(state.sent.len(), 1, "only the registration frame was sent");
}

#[tokio::test]
async fn get_module_info_decodes_identity_and_promotes_errors() {
    let mut attrs = Vec::new();
    attrs.extend_from_slice(&0x0001u16.to_le_bytes());
    attrs.extend_from_slice(&0x000Eu16.to_le_bytes());
    attrs.extend_from_slice(&0x0041u16.to_le_bytes());
    attrs.extend_from_slice(&[20, 11]);
    attrs.extend_from_slice(&0x0030u16.to_le_bytes());
    attrs.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    attrs.push(8);
    attrs.extend_from_slice(b"1756-L85");

    let (mut driver, state) = driver(vec![
        register_reply(SESSION),
        rr_reply(SESSION, &service_reply(0x00, &attrs)),
        rr_reply(SESSION, &service_reply(0x16, &[])),
    ]);

    driver.open().await.unwrap();
    let identity = driver.get_module_info(0).await.unwrap();
    assert_eq!(identity.product_name, "1756-L85");
    assert_eq!(identity.serial_number, 0xDEAD_BEEF);
    assert_eq!(identity.revision, (20, 11));

    // The request is wrapped in an Unconnected Send (0x52).
    {
        let state = state.lock().unwrap();
        assert_eq!(state.sent[1][40], 0x52);
    }

    let err = driver.get_module_info(1).await.unwrap_err();
    match err {
        CipError::Response { context, .. } => {
            assert!(context.contains("Object does not exist"), "context: {context}");
        }
        other => panic!("expected a Response fault, got {other:?}"),
    }
}

#[tokio::test]
async fn close_without_open_is_a_quiet_no_op() {
    let (mut driver, state) = driver(vec![]);
    driver.close().await.unwrap();
    assert_eq!(state.lock().unwrap().sent.len(), 0);
}

#[tokio::test]
async fn close_runs_every_step_and_aggregates_faults() {
    let (mut driver, state) = driver(vec![
        register_reply(SESSION),
        forward_open_reply(SESSION),
        unit_reply(SESSION, TARGET_CID, &service_reply(0x00, &[])),
    ]);

    driver.open().await.unwrap();
    driver
        .generic_message(GenericMessage {
            name: "warm_up".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(driver.connected());

    state.lock().unwrap().fail_send = true;
    let err = driver.close().await.unwrap_err();

    assert!(err.is_comm());
    let text = err.to_string();
    // Both the forward close and the unregistration failed.
    assert_eq!(text.matches("failed to send frame").count(), 2, "text: {text}");

    // State is reset and the transport was still released.
    assert_eq!(driver.session_id(), 0);
    assert!(!driver.connected());
    assert!(state.lock().unwrap().closed);
}

#[tokio::test]
async fn close_after_clean_session_unregisters_without_reply() {
    let (mut driver, state) = driver(vec![register_reply(SESSION)]);

    driver.open().await.unwrap();
    driver.close().await.unwrap();

    let state = state.lock().unwrap();
    assert!(state.closed);
    assert_eq!(state.sent.len(), 2);
    assert_eq!(&state.sent[1][0..2], &[0x66, 0x00]);
    assert_eq!(&state.sent[1][4..8], &SESSION.to_le_bytes());
    assert_eq!(state.replies.len(), 0, "no reply was consumed for unregister");
}
