//! In-process transport pair.
//!
//! Every envelope is encoded and decoded with the pair's codec on the way
//! through, so both ends see exactly what a socket would deliver.

use super::{Transmit, Transport, TransportState};
use crate::cancel::CancellationToken;
use crate::protocol::Codec;
use crate::Result;
use std::sync::{Arc, Weak};
use tracing::debug;

/// One end of a linked in-process transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Arc<TransportState>,
    remote: Weak<TransportState>,
    codec: Codec,
}

impl MemoryTransport {
    /// Create two linked ends.
    pub fn pair(codec: Codec) -> (MemoryTransport, MemoryTransport) {
        let a = Arc::new(TransportState::new());
        let b = Arc::new(TransportState::new());
        (
            MemoryTransport {
                state: a.clone(),
                remote: Arc::downgrade(&b),
                codec,
            },
            MemoryTransport {
                state: b,
                remote: Arc::downgrade(&a),
                codec,
            },
        )
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Deliver raw encoded bytes to the other end as if received from the wire.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.state.ensure_open()?;
        let remote = self.remote()?;
        remote.push(self.codec.decode(bytes).map(Transmit::new));
        Ok(())
    }

    fn remote(&self) -> Result<Arc<TransportState>> {
        match self.remote.upgrade() {
            Some(remote) if !remote.is_closed() => Ok(remote),
            Some(remote) => Err(remote.closed_error()),
            None => Err(crate::ProviderError::TransportClosed {
                reason: "remote end dropped".to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn recv(&self) -> Option<Result<Transmit>> {
        self.state.next().await
    }

    async fn send(&self, transmit: Transmit) -> Result<()> {
        self.state.ensure_open()?;
        let bytes = self.codec.encode(&transmit.envelope)?;
        let remote = self.remote()?;
        let envelope = self.codec.decode(&bytes)?;
        remote.push(Ok(Transmit::to_peer(envelope, transmit.identifier)));
        Ok(())
    }

    fn close(&self, reason: &str) {
        if self.state.close(reason) {
            debug!("Memory transport closed: {}", reason);
            // a closed socket ends the other side's stream as well
            if let Some(remote) = self.remote.upgrade() {
                remote.close(reason);
            }
        }
    }

    fn closed(&self) -> CancellationToken {
        self.state.closed()
    }

    async fn ready(&self) -> Result<()> {
        self.state.ensure_open()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close("transport dropped");
    }
}
