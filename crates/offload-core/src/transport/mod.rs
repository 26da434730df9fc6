//! Ordered, bidirectional envelope channels to a broker.
//!
//! A `Transport` exposes an inbound sequence of envelopes, a send operation,
//! a closed signal and a readiness signal. It never interprets payloads and
//! has no request/response semantics; that is the messenger's job.
//!
//! # Implementations
//!
//! - **tcp**: persistent socket with length-prefixed frames and a negotiated encoding
//! - **peer**: many peer data channels multiplexed by identifier, with packet framing
//! - **memory**: a linked in-process pair

pub mod frame;
pub mod memory;
pub mod packet;
pub mod peer;
pub mod tcp;

pub use memory::MemoryTransport;
pub use packet::{fragment, fragment_with_size, PacketDefragmenter};
pub use peer::{
    DataChannel, IceCandidate, PeerNegotiator, PeerSession, PeerTransport, ProviderAnnounce,
    SignalEnvelope, SignalMessage, Signaling,
};
pub use tcp::TcpTransport;

use crate::cancel::CancellationToken;
use crate::protocol::Envelope;
use crate::{ProviderError, Result};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// An envelope together with the peer it came from or goes to.
///
/// `identifier` is only meaningful for transports that multiplex peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub envelope: Envelope,
    pub identifier: Option<String>,
}

impl Transmit {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            identifier: None,
        }
    }

    pub fn to_peer(envelope: Envelope, identifier: Option<String>) -> Self {
        Self {
            envelope,
            identifier,
        }
    }
}

/// A bidirectional envelope channel.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Next inbound envelope. `None` once the connection has ended; an `Err`
    /// item is a protocol violation the consumer should close on.
    async fn recv(&self) -> Option<Result<Transmit>>;

    /// Send one envelope. Fails once the transport is closed.
    async fn send(&self, transmit: Transmit) -> Result<()>;

    /// Close the connection; idempotent.
    fn close(&self, reason: &str);

    /// Signal cancelled when the transport closes.
    fn closed(&self) -> CancellationToken;

    /// Resolves once the transport can send, or fails if it closed first.
    async fn ready(&self) -> Result<()>;
}

/// Inbound queue and closed signal shared by the transport implementations.
#[derive(Debug)]
pub(crate) struct TransportState {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<Transmit>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Transmit>>>,
    closed: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl TransportState {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// Queue an inbound item; dropped silently after close.
    pub(crate) fn push(&self, item: Result<Transmit>) {
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(item);
            }
        }
    }

    pub(crate) async fn next(&self) -> Option<Result<Transmit>> {
        self.rx.lock().await.recv().await
    }

    /// Mark closed. Returns false if it already was.
    pub(crate) fn close(&self, reason: &str) -> bool {
        let mut stored = match self.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if stored.is_some() {
            return false;
        }
        *stored = Some(reason.to_string());
        drop(stored);

        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.closed.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Error describing why the transport closed.
    pub(crate) fn closed_error(&self) -> ProviderError {
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "closed".to_string());
        ProviderError::TransportClosed { reason }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, Payload, Ping};

    #[tokio::test]
    async fn test_state_drains_then_ends_after_close() {
        let state = TransportState::new();
        state.push(Ok(Transmit::new(Envelope::event(0, Payload::Ping(Ping::default())))));
        assert!(state.close("done"));
        assert!(!state.close("again"));

        // queued before close is still delivered, then the stream ends
        let first = state.next().await.unwrap().unwrap();
        assert_eq!(first.envelope.message_type, MessageType::Event);
        assert!(state.next().await.is_none());

        match state.ensure_open() {
            Err(ProviderError::TransportClosed { reason }) => assert_eq!(reason, "done"),
            other => panic!("Expected TransportClosed, got: {:?}", other),
        }
    }
}
