//! # CIP Client
//!
//! A client driver for EtherNet/IP (CIP) devices: PLCs, drives, I/O
//! adapters and anything else that answers on TCP port 44818. The driver
//! handles the encapsulation session, CIP connection management with an
//! automatic Extended Forward Open fallback, generic explicit messaging
//! (connected and unconnected), identity retrieval and UDP broadcast
//! discovery.
//!
//! ## Features
//!
//! - **Session management** - Register/Unregister Session with per-open
//!   identifier regeneration
//! - **Connection management** - Extended (4000 byte) Forward Open with a
//!   one-way fallback to the standard (500 byte) Forward Open
//! - **Generic messaging** - any service/class/instance/attribute, connected
//!   or unconnected, with optional Unconnected Send routing
//! - **Discovery** - broadcast ListIdentity from every local interface
//! - **Routing** - multi-hop connection paths like
//!   `"10.20.30.100/backplane/2/enet/6.7.8.9/bp/0"`
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cip_client::{CipDriver, GenericMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut driver = CipDriver::new("10.20.30.100/1")?;
//!     driver.open().await?;
//!
//!     let identity = driver.get_module_info(0).await?;
//!     println!("slot 0: {}", identity.product_name);
//!
//!     let result = driver
//!         .generic_message(GenericMessage {
//!             service: 0x4C,
//!             class_code: 0x6B,
//!             instance: 0x01,
//!             request_data: vec![0x01, 0x00],
//!             name: "read".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("{}: {:?}", result.name, result.value);
//!
//!     driver.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Protocol failures from a generic message are data, not errors: they come
//! back in [`MessageResult::error`] so a scan over many objects can record
//! per-object failures without aborting. Transport failures always raise
//! [`CipError::Comm`].

mod codec;
mod config;
mod discovery;
mod epath;
mod error;
mod identity;
mod path;
mod transport;

pub use codec::{general_status_text, CLASS_IDENTITY, GET_ATTRIBUTES_ALL};
pub use config::{
    DriverConfig, Sequencer, ETHERNET_IP_PORT, EXTENDED_CONNECTION_SIZE,
    STANDARD_CONNECTION_SIZE,
};
pub use error::{CipError, Result};
pub use identity::IdentityObject;
pub use path::{parse_connection_path, PortSegment};
pub use transport::{TcpTransport, Transport};

use std::net::SocketAddr;

use log::{debug, info, warn};

use codec::{
    network_parameters, BuildContext, Request, RequestKind, Response,
    CLASS_CONNECTION_MANAGER, CM_INSTANCE_OPEN_REQUEST, FORWARD_CLOSE, FORWARD_OPEN,
    LARGE_FORWARD_OPEN, PRIORITY, RPI, TIMEOUT_MULTIPLIER, TIMEOUT_TICKS,
    TRANSPORT_CLASS,
};
use epath::encode_route_path;

/// Route selection for an unconnected generic message.
#[derive(Debug, Clone, Default)]
pub enum RoutePath {
    /// Use the route parsed from the driver's connection path.
    #[default]
    Configured,
    /// Send without any route path.
    None,
    /// Encode the given segments as the route.
    Segments(Vec<PortSegment>),
    /// Use pre-encoded route path bytes as-is.
    Raw(Vec<u8>),
}

/// A generic CIP request, similar to a MSG instruction.
///
/// Defaults describe a connected Get_Attributes_All of the Identity object;
/// set the fields that differ and leave the rest to `..Default::default()`.
#[derive(Debug, Clone)]
pub struct GenericMessage {
    /// CIP service code.
    pub service: u8,
    /// Target object class.
    pub class_code: u16,
    /// Target instance.
    pub instance: u16,
    /// Optional attribute appended to the request path.
    pub attribute: Option<u16>,
    /// Service-specific data following the request path.
    pub request_data: Vec<u8>,
    /// Caller's label, echoed in the [`MessageResult`].
    pub name: String,
    /// `true` to send over the CIP connection (opening it if needed),
    /// `false` for an unconnected (UCMM) request.
    pub connected: bool,
    /// Unconnected only: wrap the request in an Unconnected Send envelope.
    pub unconnected_send: bool,
    /// Unconnected only: route selection.
    pub route_path: RoutePath,
}

impl Default for GenericMessage {
    fn default() -> Self {
        Self {
            service: GET_ATTRIBUTES_ALL,
            class_code: CLASS_IDENTITY,
            instance: 0x01,
            attribute: None,
            request_data: Vec::new(),
            name: "generic".to_string(),
            connected: true,
            unconnected_send: false,
            route_path: RoutePath::Configured,
        }
    }
}

/// Outcome of a generic message.
///
/// A protocol-level rejection is reported through `error`, not as a raised
/// fault, so callers can batch requests and inspect failures afterwards.
#[derive(Debug, Clone)]
pub struct MessageResult {
    /// Label from the originating [`GenericMessage`].
    pub name: String,
    /// Service reply data; empty when the request failed.
    pub value: Vec<u8>,
    /// Failure text, `None` on success.
    pub error: Option<String>,
}

impl MessageResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// EtherNet/IP client driver.
///
/// One driver owns one TCP connection, one registered session and at most
/// one CIP connection. All exchanges take `&mut self`: a single request is
/// in flight at a time, and every reply is matched to the request that
/// produced it.
pub struct CipDriver {
    config: DriverConfig,
    transport: Box<dyn Transport>,
    session_id: u32,
    sequence: Sequencer,
    target_cid: Option<[u8; 4]>,
    target_is_connected: bool,
    connection_opened: bool,
}

impl CipDriver {
    /// Creates a driver for the given connection path, e.g. `"10.20.30.100"`
    /// or `"10.20.30.100/backplane/2/enet/6.7.8.9/bp/0"`.
    pub fn new(path: &str) -> Result<Self> {
        let (address, route) = parse_connection_path(path)?;
        let config = DriverConfig::new(address, route);
        let transport = Box::new(TcpTransport::new(config.timeout));
        Ok(Self::from_parts(config, transport))
    }

    /// Creates a driver with a caller-supplied transport, mainly for tests
    /// and for tunneled deployments.
    pub fn with_transport(path: &str, transport: Box<dyn Transport>) -> Result<Self> {
        let (address, route) = parse_connection_path(path)?;
        Ok(Self::from_parts(DriverConfig::new(address, route), transport))
    }

    fn from_parts(config: DriverConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            session_id: 0,
            sequence: Sequencer::new(),
            target_cid: None,
            target_is_connected: false,
            connection_opened: false,
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Mutable configuration access, for adjusting the timeout or the
    /// Forward Open preference before `open()`.
    pub fn config_mut(&mut self) -> &mut DriverConfig {
        &mut self.config
    }

    /// True once a Forward Open has succeeded.
    pub fn connected(&self) -> bool {
        self.target_is_connected
    }

    /// Registered session handle, 0 when unregistered.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Adopts an externally registered session handle.
    pub fn set_session_id(&mut self, session: u32) {
        self.session_id = session;
    }

    /// Per-frame service data capacity of the current frame-size class.
    pub fn connection_size(&self) -> u16 {
        self.config.connection_size()
    }

    /// Connects the transport and registers a session.
    ///
    /// Returns `Ok(true)` once registered. A rejected registration returns
    /// `Ok(false)` with the transport left connected; transport failures
    /// raise [`CipError::Comm`]. Calling `open()` again while open is a
    /// no-op reporting whether a session is registered. Every fresh open
    /// draws new connection identifiers.
    pub async fn open(&mut self) -> Result<bool> {
        if self.connection_opened {
            return Ok(self.session_id != 0);
        }
        self.config.regenerate_identifiers();
        let addr = SocketAddr::from((self.config.address, self.config.port));
        self.transport.connect(addr).await?;
        self.connection_opened = true;
        debug!("connected to {addr}");
        Ok(self.register_session().await? != 0)
    }

    /// Tears everything down: Forward Close if connected, Unregister
    /// Session if registered, then the transport. Each step runs even if
    /// an earlier one failed; failures are joined into a single
    /// [`CipError::Comm`]. State is reset regardless of the outcome.
    pub async fn close(&mut self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        if self.target_is_connected {
            if let Err(err) = self.forward_close().await {
                failures.push(err.to_string());
            }
        }
        if self.session_id != 0 {
            if let Err(err) = self.unregister_session().await {
                failures.push(err.to_string());
            }
        }
        if let Err(err) = self.transport.close().await {
            failures.push(err.to_string());
        }

        self.session_id = 0;
        self.target_cid = None;
        self.target_is_connected = false;
        self.connection_opened = false;

        if failures.is_empty() {
            info!("connection closed");
            Ok(())
        } else {
            Err(CipError::comm(format!(
                "errors during close: {}",
                failures.join("; ")
            )))
        }
    }

    /// Registers an encapsulation session, returning the session handle.
    ///
    /// Short-circuits if a session is already registered. A rejected
    /// registration leaves the handle at 0.
    async fn register_session(&mut self) -> Result<u32> {
        if self.session_id != 0 {
            return Ok(self.session_id);
        }
        let response = self.send(Request::new(RequestKind::RegisterSession)).await?;
        match response.error {
            None => {
                self.session_id = response.session;
                info!("session registered: {}", self.session_id);
            }
            Some(error) => warn!("session registration rejected: {error}"),
        }
        Ok(self.session_id)
    }

    /// Unregisters the session. Fire-and-forget: no reply is read.
    async fn unregister_session(&mut self) -> Result<()> {
        self.send(Request::new(RequestKind::UnregisterSession))
            .await?;
        debug!("session {} unregistered", self.session_id);
        self.session_id = 0;
        Ok(())
    }

    /// Opens a CIP connection with the current frame-size class.
    ///
    /// Returns `Ok(false)` on a protocol rejection (logged, not raised) so
    /// the caller can retry with the standard frame size.
    async fn forward_open(&mut self) -> Result<bool> {
        if self.target_is_connected {
            return Ok(true);
        }
        if self.session_id == 0 {
            return Err(CipError::comm(
                "a session must be registered before a forward open",
            ));
        }

        let extended = self.config.extended_forward_open;
        let service = if extended {
            LARGE_FORWARD_OPEN
        } else {
            FORWARD_OPEN
        };
        let net_params = network_parameters(extended, self.config.connection_size());

        let mut data = Vec::with_capacity(40);
        data.push(PRIORITY);
        data.push(TIMEOUT_TICKS);
        data.extend_from_slice(&[0x00; 4]); // O->T connection id, target assigns
        data.extend_from_slice(&self.config.cid); // T->O connection id
        data.extend_from_slice(&self.config.csn);
        data.extend_from_slice(&self.config.vid);
        data.extend_from_slice(&self.config.vsn);
        data.push(TIMEOUT_MULTIPLIER);
        data.extend_from_slice(&[0x00; 3]); // reserved
        data.extend_from_slice(&RPI); // O->T RPI
        data.extend_from_slice(&net_params);
        data.extend_from_slice(&RPI); // T->O RPI
        data.extend_from_slice(&net_params);
        data.push(TRANSPORT_CLASS);

        let route = encode_route_path(&self.config.route, true, false)?;
        let request = Request::new(RequestKind::GenericUnconnected {
            service,
            class_code: CLASS_CONNECTION_MANAGER,
            instance: CM_INSTANCE_OPEN_REQUEST,
            attribute: None,
            data,
            route_path: Some(route),
            unconnected_send: false,
        });

        let response = self.send(request).await?;
        match response.error {
            None if response.value.len() >= 4 => {
                self.target_cid = Some([
                    response.value[0],
                    response.value[1],
                    response.value[2],
                    response.value[3],
                ]);
                self.target_is_connected = true;
                info!(
                    "forward open succeeded, connection size {}",
                    self.config.connection_size()
                );
                Ok(true)
            }
            None => {
                warn!("forward open reply too short to carry a connection id");
                Ok(false)
            }
            Some(error) => {
                warn!("forward open failed: {error}");
                Ok(false)
            }
        }
    }

    /// Makes sure a CIP connection is open before `operation` runs,
    /// downgrading from the Extended Forward Open to the standard one if
    /// the target rejects it. The downgrade is one-way and permanent for
    /// this driver instance.
    async fn ensure_connected(&mut self, operation: &str) -> Result<()> {
        if self.forward_open().await? {
            return Ok(());
        }
        if self.config.extended_forward_open {
            info!("retrying with a standard forward open");
            self.config.extended_forward_open = false;
            if self.forward_open().await? {
                return Ok(());
            }
        }
        Err(CipError::response(format!(
            "target did not connect, {operation} will not be executed"
        )))
    }

    /// Closes the CIP connection.
    async fn forward_close(&mut self) -> Result<()> {
        if self.session_id == 0 {
            return Err(CipError::comm(
                "a session must be registered before a forward close",
            ));
        }

        let mut data = Vec::with_capacity(16);
        data.push(PRIORITY);
        data.push(TIMEOUT_TICKS);
        data.extend_from_slice(&self.config.csn);
        data.extend_from_slice(&self.config.vid);
        data.extend_from_slice(&self.config.vsn);
        data.extend_from_slice(&encode_route_path(&self.config.route, true, true)?);

        let request = Request::new(RequestKind::GenericUnconnected {
            service: FORWARD_CLOSE,
            class_code: CLASS_CONNECTION_MANAGER,
            instance: CM_INSTANCE_OPEN_REQUEST,
            attribute: None,
            data,
            route_path: None,
            unconnected_send: false,
        });

        let response = self.send(request).await?;
        self.target_is_connected = false;
        self.target_cid = None;
        match response.error {
            None => {
                debug!("forward close succeeded");
                Ok(())
            }
            Some(error) => Err(CipError::response(format!(
                "forward close failed: {error}"
            ))),
        }
    }

    /// Performs a generic CIP message, similar to a MSG instruction.
    ///
    /// Connected messages open the CIP connection first (with the frame-size
    /// fallback); unconnected messages go through the UCMM with the route
    /// selected by [`GenericMessage::route_path`]. Protocol rejections come
    /// back in [`MessageResult::error`].
    pub async fn generic_message(
        &mut self,
        message: GenericMessage,
    ) -> Result<MessageResult> {
        let GenericMessage {
            service,
            class_code,
            instance,
            attribute,
            request_data,
            name,
            connected,
            unconnected_send,
            route_path,
        } = message;

        let request = if connected {
            self.ensure_connected(&name).await?;
            Request::new(RequestKind::GenericConnected {
                service,
                class_code,
                instance,
                attribute,
                data: request_data,
            })
        } else {
            let route = match &route_path {
                RoutePath::Configured => {
                    encode_route_path(&self.config.route, false, true).map(Some)
                }
                RoutePath::None => Ok(None),
                RoutePath::Segments(segments) => {
                    encode_route_path(segments, false, true).map(Some)
                }
                RoutePath::Raw(bytes) => Ok(Some(bytes.clone())),
            };
            let kind = |route_path| RequestKind::GenericUnconnected {
                service,
                class_code,
                instance,
                attribute,
                data: request_data,
                route_path,
                unconnected_send,
            };
            match route {
                Ok(route) => Request::new(kind(route)),
                // An unencodable route never reaches the wire; the request
                // resolves directly to a failed result.
                Err(err) => Request::invalid(kind(None), err.to_string()),
            }
        };

        let response = self.send(request).await?;
        Ok(MessageResult {
            name,
            value: response.value,
            error: response.error,
        })
    }

    /// Reads the Identity object of the module in the given backplane slot
    /// via an Unconnected Send through the configured route.
    ///
    /// Unlike [`generic_message`](Self::generic_message), a protocol
    /// rejection here is promoted to a raised fault.
    pub async fn get_module_info(&mut self, slot: u8) -> Result<IdentityObject> {
        let result = self
            .generic_message(GenericMessage {
                service: GET_ATTRIBUTES_ALL,
                class_code: CLASS_IDENTITY,
                instance: 0x01,
                name: format!("get_module_info(slot={slot})"),
                connected: false,
                unconnected_send: true,
                route_path: RoutePath::Segments(vec![PortSegment::backplane(slot)]),
                ..Default::default()
            })
            .await?;

        match result.error {
            None => IdentityObject::from_attributes_all(&result.value),
            Some(error) => Err(CipError::response(format!(
                "failed to get module info: {error}"
            ))),
        }
    }

    /// Queries the identity of a single device over its TCP connection.
    ///
    /// Opens a throwaway driver for `path`, sends ListIdentity, and closes.
    pub async fn list_identity(path: &str) -> Result<Option<IdentityObject>> {
        let mut driver = CipDriver::new(path)?;
        driver.open().await?;
        let response = driver.send(Request::new(RequestKind::ListIdentity)).await;
        let closed = driver.close().await;
        let identity = response?.identity;
        closed?;
        Ok(identity)
    }

    /// Discovers EtherNet/IP devices on the local networks by UDP
    /// broadcast. Best-effort: unreachable interfaces are skipped and an
    /// empty list is a valid outcome.
    pub async fn discover() -> Result<Vec<IdentityObject>> {
        discovery::discover(b"_cipcli_").await
    }

    /// Single exchange primitive: build, transmit, receive, parse.
    ///
    /// A request carrying a build error skips transmission entirely. The
    /// sequence counter advances exactly once per connected request.
    async fn send(&mut self, request: Request) -> Result<Response> {
        if request.error.is_some() {
            return Ok(Response::parse(&request, None));
        }

        let sequence = request.is_connected().then(|| self.sequence.next());
        let ctx = BuildContext {
            session: self.session_id,
            context: &self.config.context,
            option: self.config.option,
            protocol_version: self.config.protocol_version,
            target_cid: self.target_cid.as_ref(),
            sequence,
        };
        let frame = request.build(&ctx)?;

        self.transport.send(&frame).await?;
        debug!("sent {} bytes: {:?}", frame.len(), request.kind);

        let reply = if request.no_response() {
            None
        } else {
            Some(self.transport.receive().await?)
        };
        Ok(Response::parse(&request, reply.as_deref()))
    }
}
