//! Byte transport under the driver.
//!
//! The driver talks to the wire through the [`Transport`] trait so tests can
//! substitute a scripted peer. The production implementation is a TCP stream
//! with every connect and read bounded by the configured timeout.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::ENCAP_HEADER_LEN;
use crate::error::{CipError, Result};

/// Frame-oriented transport used by the driver.
///
/// `receive` is frame-aware: it returns exactly one whole encapsulation
/// frame (header plus payload), never a partial read.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, addr: SocketAddr) -> Result<()>;
    async fn send(&mut self, frame: &[u8]) -> Result<()>;
    async fn receive(&mut self) -> Result<Vec<u8>>;
    async fn close(&mut self) -> Result<()>;
}

/// TCP transport with timeout-bounded connect and receive.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stream: None,
            timeout,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| CipError::comm("transport is not connected"))
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = self.timeout;
        let stream = self.stream()?;
        match timeout(deadline, stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(CipError::comm_with("failed to receive reply", err)),
            Err(_) => Err(CipError::comm(format!(
                "timed out after {deadline:?} waiting for reply"
            ))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let stream = match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(CipError::comm_with(
                    format!("failed to connect to {addr}"),
                    err,
                ))
            }
            Err(_) => {
                return Err(CipError::comm(format!(
                    "timed out connecting to {addr}"
                )))
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|err| CipError::comm_with("failed to set TCP_NODELAY", err))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.stream()?
            .write_all(frame)
            .await
            .map_err(|err| CipError::comm_with("failed to send frame", err))
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; ENCAP_HEADER_LEN];
        self.read_exact_timed(&mut header).await?;

        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut frame = vec![0u8; ENCAP_HEADER_LEN + length];
        frame[..ENCAP_HEADER_LEN].copy_from_slice(&header);
        if length > 0 {
            self.read_exact_timed(&mut frame[ENCAP_HEADER_LEN..]).await?;
        }
        Ok(frame)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .shutdown()
                .await
                .map_err(|err| CipError::comm_with("failed to close connection", err))?;
        }
        Ok(())
    }
}
