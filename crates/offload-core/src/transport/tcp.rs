//! Persistent socket transport.
//!
//! Envelopes travel as length-prefixed frames over one TCP connection. The
//! encoding is negotiated once in a handshake and fixed afterwards:
//!
//! 1. the provider sends one frame with the offered subprotocol names,
//!    comma separated, in order of preference;
//! 2. the broker answers with one frame holding the chosen name.
//!
//! An answer outside the offered set is a protocol violation.
//!
//! # Thread Safety
//!
//! A background task owns the read half and feeds the inbound queue. The
//! write half sits behind a tokio `Mutex` so concurrent senders never
//! interleave frames.

use super::frame::{read_frame, read_handshake, write_frame};
use super::{Transmit, Transport, TransportState};
use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use crate::protocol::Codec;
use crate::{ProviderError, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport over a single TCP connection.
pub struct TcpTransport {
    state: Arc<TransportState>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    codec: Codec,
    peer_addr: SocketAddr,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer_addr", &self.peer_addr)
            .field("codec", &self.codec)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

impl TcpTransport {
    /// Connect to a broker and negotiate one of the `offered` encodings.
    pub async fn connect(addr: &str, offered: &[Codec]) -> Result<Self> {
        if offered.is_empty() {
            return Err(ProviderError::Config {
                message: "no encodings offered".to_string(),
            });
        }

        let stream = tokio::time::timeout(ProtocolConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProviderError::TransportClosed {
                reason: format!("connect to {} timed out", addr),
            })??;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();

        let offer = offered
            .iter()
            .map(|c| c.subprotocol())
            .collect::<Vec<_>>()
            .join(",");
        write_frame(&mut writer, offer.as_bytes()).await?;

        let answer = read_handshake(&mut reader).await?;

        let codec = Codec::from_subprotocol(&answer)
            .filter(|c| offered.contains(c))
            .ok_or(ProviderError::Negotiation {
                subprotocol: answer.clone(),
            })?;

        let peer_addr = reader.peer_addr()?;
        info!("Connected to broker at {} using {}", peer_addr, codec);
        Ok(Self::from_halves(reader, writer, codec, peer_addr))
    }

    /// Accept the broker side of a connection, choosing the first offered
    /// encoding that is also in `supported`.
    pub async fn accept(stream: TcpStream, supported: &[Codec]) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let offer = read_handshake(&mut reader).await?;

        let chosen = offer
            .split(',')
            .filter_map(|name| Codec::from_subprotocol(name.trim()))
            .find(|c| supported.contains(c));

        let Some(codec) = chosen else {
            // an empty answer tells the peer nothing matched
            let _ = write_frame(&mut writer, b"").await;
            return Err(ProviderError::Negotiation { subprotocol: offer });
        };
        write_frame(&mut writer, codec.subprotocol().as_bytes()).await?;

        debug!("Accepted connection from {} using {}", peer_addr, codec);
        Ok(Self::from_halves(reader, writer, codec, peer_addr))
    }

    fn from_halves(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        codec: Codec,
        peer_addr: SocketAddr,
    ) -> Self {
        let state = Arc::new(TransportState::new());
        let reader_task = tokio::spawn(Self::read_loop(reader, codec, state.clone()));
        Self {
            state,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            codec,
            peer_addr,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    async fn read_loop(mut reader: OwnedReadHalf, codec: Codec, state: Arc<TransportState>) {
        loop {
            match read_frame(&mut reader, ProtocolConfig::MAX_MESSAGE_SIZE).await {
                Ok(Some(frame)) => state.push(codec.decode(&frame).map(Transmit::new)),
                Ok(None) => {
                    debug!("Broker closed the connection");
                    state.close("connection closed by peer");
                    return;
                }
                Err(e) => {
                    warn!("Connection read failed: {}", e);
                    let reason = e.to_string();
                    state.push(Err(e));
                    state.close(&reason);
                    return;
                }
            }
        }
    }

    /// Negotiated encoding.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn recv(&self) -> Option<Result<Transmit>> {
        self.state.next().await
    }

    async fn send(&self, transmit: Transmit) -> Result<()> {
        self.state.ensure_open()?;
        let bytes = self.codec.encode(&transmit.envelope)?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &bytes).await {
            drop(writer);
            self.close(&format!("write failed: {}", e));
            return Err(e);
        }
        Ok(())
    }

    fn close(&self, reason: &str) {
        if !self.state.close(reason) {
            return;
        }
        info!("Closing connection to {}: {}", self.peer_addr, reason);

        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }

        let writer = self.writer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = writer.lock().await.shutdown().await;
            });
        }
    }

    fn closed(&self) -> CancellationToken {
        self.state.closed()
    }

    async fn ready(&self) -> Result<()> {
        // the handshake completes before the transport is handed out
        self.state.ensure_open()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close("transport dropped");
    }
}
