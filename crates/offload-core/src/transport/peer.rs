//! Peer data channel transport.
//!
//! Many remote peers are multiplexed behind one `Transport`: every inbound
//! envelope is tagged with the identifier of the peer it came from, and an
//! outbound envelope is routed by its identifier. Data channels limit the
//! size of a single send, so every envelope is fragmented with the packet
//! framer and reassembled by a per-peer defragmenter. Envelopes on data
//! channels always use the binary encoding.
//!
//! Connection setup goes through two collaborators:
//!
//! - [`Signaling`] relays offers, answers and candidates between peers and
//!   carries the provider's availability announcements;
//! - [`PeerNegotiator`] turns an offer into an answer and eventually a data
//!   channel.
//!
//! A failure on one peer (malformed envelope, oversized packet, closed
//! channel) detaches that peer only. A zero-length message is the explicit
//! disconnect signal.

use super::packet::{fragment, PacketDefragmenter};
use super::{Transmit, Transport, TransportState};
use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use crate::protocol::{Codec, Payload};
use crate::{ProviderError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A reliable, ordered, message-based channel to one peer.
#[async_trait::async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> &str;

    /// Send one packet; packets are at most `MAX_FRAGMENT_SIZE` bytes.
    async fn send(&self, packet: Bytes) -> Result<()>;

    /// Next packet, `None` once the channel is closed.
    async fn recv(&self) -> Option<Bytes>;

    fn close(&self);
}

/// A connectivity candidate relayed through signaling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

/// One signaling message with its routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub source: String,
    pub destination: String,
    pub message: SignalMessage,
}

/// Availability announcement published on the signaling side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAnnounce<'a> {
    pub id: &'a str,
    pub concurrency: u32,
}

/// Outbound half of the signaling service.
#[async_trait::async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Relay a message to another peer.
    async fn deliver(&self, envelope: SignalEnvelope) -> Result<()>;

    /// Publish this provider's availability.
    async fn announce(&self, announce: ProviderAnnounce<'_>) -> Result<()>;
}

/// Result of accepting an offer.
pub struct PeerSession {
    /// Session description sent back to the offering peer.
    pub answer: String,
    /// Resolves with the data channel once the peer opens it.
    pub channel: oneshot::Receiver<Arc<dyn DataChannel>>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("answer", &self.answer)
            .finish_non_exhaustive()
    }
}

/// Connection negotiation with remote peers.
#[async_trait::async_trait]
pub trait PeerNegotiator: Send + Sync + 'static {
    async fn accept_offer(&self, peer: &str, sdp: &str) -> Result<PeerSession>;

    async fn add_candidate(&self, peer: &str, candidate: IceCandidate) -> Result<()>;
}

struct PeerLink {
    generation: u64,
    channel: Arc<dyn DataChannel>,
    // fragments of one envelope must not interleave with another's
    write: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    fn shutdown(&self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
        self.channel.close();
    }
}

struct PeerInner {
    id: String,
    state: TransportState,
    signaling: Arc<dyn Signaling>,
    negotiator: Arc<dyn PeerNegotiator>,
    peers: Mutex<HashMap<String, Arc<PeerLink>>>,
    next_generation: Mutex<u64>,
    concurrency: Mutex<Option<u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerInner {
    fn link(&self, peer: &str) -> Option<Arc<PeerLink>> {
        self.peers.lock().ok()?.get(peer).cloned()
    }

    /// Remove a peer; with `generation` set, only if it is still that link.
    fn detach(&self, peer: &str, generation: Option<u64>) -> bool {
        let removed = match self.peers.lock() {
            Ok(mut peers) => match peers.get(peer) {
                Some(link) if generation.map_or(true, |g| g == link.generation) => {
                    peers.remove(peer)
                }
                _ => None,
            },
            Err(_) => None,
        };
        match removed {
            Some(link) => {
                link.shutdown();
                info!("Peer {} detached", peer);
                true
            }
            None => false,
        }
    }

    async fn announce(&self, concurrency: u32) -> Result<()> {
        self.signaling
            .announce(ProviderAnnounce {
                id: &self.id,
                concurrency,
            })
            .await
    }
}

/// Transport multiplexing many peer data channels.
#[derive(Clone)]
pub struct PeerTransport {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("id", &self.inner.id)
            .field("peers", &self.peers())
            .finish()
    }
}

impl PeerTransport {
    pub fn new(
        id: impl Into<String>,
        signaling: Arc<dyn Signaling>,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id: id.into(),
                state: TransportState::new(),
                signaling,
                negotiator,
                peers: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                concurrency: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identifier of this provider on the signaling side.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Identifiers of the attached peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .inner
            .peers
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Re-publish the last announced concurrency every `interval` until close.
    pub fn announce_every(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let closed = self.inner.state.closed();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { return };
                let last = inner.concurrency.lock().ok().and_then(|c| *c);
                if let Some(concurrency) = last {
                    if let Err(e) = inner.announce(concurrency).await {
                        warn!("Periodic announce failed: {}", e);
                    }
                }
            }
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    /// Handle one message received from signaling.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        if envelope.destination != self.inner.id {
            return Ok(());
        }
        self.inner.state.ensure_open()?;
        let peer = envelope.source;

        match envelope.message {
            SignalMessage::Offer { sdp } => {
                debug!("Offer from {}", peer);
                let session = self.inner.negotiator.accept_offer(&peer, &sdp).await?;
                self.inner
                    .signaling
                    .deliver(SignalEnvelope {
                        source: self.inner.id.clone(),
                        destination: peer.clone(),
                        message: SignalMessage::Answer {
                            sdp: session.answer,
                        },
                    })
                    .await?;

                let transport = self.clone();
                let closed = self.inner.state.closed();
                let task = tokio::spawn(async move {
                    tokio::select! {
                        _ = closed.cancelled() => {}
                        channel = session.channel => match channel {
                            Ok(channel) => transport.attach(peer, channel),
                            Err(_) => debug!("Peer {} never opened a channel", peer),
                        },
                    }
                });
                self.track(task);
            }
            SignalMessage::Candidate { mut candidate } => {
                if let Some(stripped) = candidate.candidate.strip_prefix("a=") {
                    candidate.candidate = stripped.to_string();
                }
                self.inner
                    .negotiator
                    .add_candidate(&peer, candidate)
                    .await?;
            }
            SignalMessage::Answer { .. } => {
                debug!("Ignoring unsolicited answer from {}", peer);
            }
        }
        Ok(())
    }

    /// Attach an open data channel for `peer`, replacing any previous one.
    ///
    /// Channels with a foreign label are closed and ignored.
    pub fn attach(&self, peer: impl Into<String>, channel: Arc<dyn DataChannel>) {
        let peer = peer.into();
        if channel.label() != ProtocolConfig::DATA_CHANNEL_LABEL {
            debug!(
                "Ignoring data channel '{}' from {}",
                channel.label(),
                peer
            );
            channel.close();
            return;
        }
        if self.inner.state.is_closed() {
            channel.close();
            return;
        }

        let generation = match self.inner.next_generation.lock() {
            Ok(mut next) => {
                *next += 1;
                *next
            }
            Err(_) => return,
        };
        let link = Arc::new(PeerLink {
            generation,
            channel: channel.clone(),
            write: tokio::sync::Mutex::new(()),
            reader: Mutex::new(None),
        });

        let previous = match self.inner.peers.lock() {
            Ok(mut peers) => peers.insert(peer.clone(), link.clone()),
            Err(_) => return,
        };
        if let Some(previous) = previous {
            previous.shutdown();
        }

        let reader = tokio::spawn(read_peer(
            Arc::downgrade(&self.inner),
            peer.clone(),
            generation,
            channel,
        ));
        if let Ok(mut slot) = link.reader.lock() {
            *slot = Some(reader);
        }
        info!("Peer {} attached", peer);
    }

    /// Drop a peer and close its channel. Returns false if it was unknown.
    pub fn detach(&self, peer: &str) -> bool {
        self.inner.detach(peer, None)
    }
}

async fn read_peer(
    inner: Weak<PeerInner>,
    peer: String,
    generation: u64,
    channel: Arc<dyn DataChannel>,
) {
    let mut defrag = PacketDefragmenter::new();
    let reason = 'read: loop {
        let Some(packet) = channel.recv().await else {
            break 'read "channel closed".to_string();
        };
        if let Err(e) = defrag.process_bytes(&packet) {
            break 'read e.to_string();
        }
        while let Some(message) = defrag.next_message() {
            if message.is_empty() {
                break 'read "disconnect requested".to_string();
            }
            let Some(inner) = inner.upgrade() else { return };
            match Codec::Binary.decode(&message) {
                Ok(envelope) => inner
                    .state
                    .push(Ok(Transmit::to_peer(envelope, Some(peer.clone())))),
                Err(e) => break 'read e.to_string(),
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        warn!("Dropping peer {}: {}", peer, reason);
        inner.detach(&peer, Some(generation));
    }
}

#[async_trait::async_trait]
impl Transport for PeerTransport {
    async fn recv(&self) -> Option<Result<Transmit>> {
        self.inner.state.next().await
    }

    async fn send(&self, transmit: Transmit) -> Result<()> {
        self.inner.state.ensure_open()?;

        let Some(peer) = transmit.identifier else {
            return match transmit.envelope.payload {
                Some(Payload::ProviderResources(resources)) => {
                    if let Ok(mut last) = self.inner.concurrency.lock() {
                        *last = Some(resources.concurrency);
                    }
                    self.inner.announce(resources.concurrency).await
                }
                _ => {
                    debug!(
                        "Dropping envelope without peer: {}",
                        transmit.envelope.describe()
                    );
                    Ok(())
                }
            };
        };

        let link = self
            .inner
            .link(&peer)
            .ok_or_else(|| ProviderError::NotFound {
                name: format!("peer {}", peer),
            })?;
        let bytes = Codec::Binary.encode(&transmit.envelope)?;
        let fragments = fragment(&bytes)?;

        let _guard = link.write.lock().await;
        for packet in fragments {
            if let Err(e) = link.channel.send(packet).await {
                drop(_guard);
                self.inner.detach(&peer, Some(link.generation));
                return Err(e);
            }
        }
        Ok(())
    }

    fn close(&self, reason: &str) {
        if !self.inner.state.close(reason) {
            return;
        }
        info!("Closing peer transport {}: {}", self.inner.id, reason);

        let links: Vec<Arc<PeerLink>> = match self.inner.peers.lock() {
            Ok(mut peers) => peers.drain().map(|(_, link)| link).collect(),
            Err(_) => Vec::new(),
        };
        for link in links {
            link.shutdown();
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn closed(&self) -> CancellationToken {
        self.inner.state.closed()
    }

    async fn ready(&self) -> Result<()> {
        self.inner.state.ensure_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Ping, ProviderResources};
    use tokio::sync::mpsc;

    struct TestChannel {
        label: String,
        tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    }

    #[async_trait::async_trait]
    impl DataChannel for TestChannel {
        fn label(&self) -> &str {
            &self.label
        }

        async fn send(&self, packet: Bytes) -> Result<()> {
            let tx = self.tx.lock().unwrap().clone();
            match tx {
                Some(tx) => tx.send(packet).map_err(|_| ProviderError::TransportClosed {
                    reason: "remote gone".into(),
                }),
                None => Err(ProviderError::TransportClosed {
                    reason: "closed".into(),
                }),
            }
        }

        async fn recv(&self) -> Option<Bytes> {
            self.rx.lock().await.recv().await
        }

        fn close(&self) {
            self.tx.lock().unwrap().take();
        }
    }

    /// Linked channels: what one side sends the other receives.
    fn channel_pair(label: &str) -> (Arc<TestChannel>, Arc<TestChannel>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = TestChannel {
            label: label.to_string(),
            tx: Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
        };
        let b = TestChannel {
            label: label.to_string(),
            tx: Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
        };
        (Arc::new(a), Arc::new(b))
    }

    #[derive(Default)]
    struct RecordingSignaling {
        delivered: Mutex<Vec<SignalEnvelope>>,
        announced: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait::async_trait]
    impl Signaling for RecordingSignaling {
        async fn deliver(&self, envelope: SignalEnvelope) -> Result<()> {
            self.delivered.lock().unwrap().push(envelope);
            Ok(())
        }

        async fn announce(&self, announce: ProviderAnnounce<'_>) -> Result<()> {
            self.announced
                .lock()
                .unwrap()
                .push((announce.id.to_string(), announce.concurrency));
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestNegotiator {
        channel: Mutex<Option<Arc<dyn DataChannel>>>,
        candidates: Mutex<Vec<(String, IceCandidate)>>,
    }

    #[async_trait::async_trait]
    impl PeerNegotiator for TestNegotiator {
        async fn accept_offer(&self, _peer: &str, sdp: &str) -> Result<PeerSession> {
            let (tx, rx) = oneshot::channel();
            if let Some(channel) = self.channel.lock().unwrap().take() {
                let _ = tx.send(channel);
            }
            Ok(PeerSession {
                answer: format!("answer to {}", sdp),
                channel: rx,
            })
        }

        async fn add_candidate(&self, peer: &str, candidate: IceCandidate) -> Result<()> {
            self.candidates
                .lock()
                .unwrap()
                .push((peer.to_string(), candidate));
            Ok(())
        }
    }

    fn transport() -> (PeerTransport, Arc<RecordingSignaling>, Arc<TestNegotiator>) {
        let signaling = Arc::new(RecordingSignaling::default());
        let negotiator = Arc::new(TestNegotiator::default());
        let transport = PeerTransport::new("provider-1", signaling.clone(), negotiator.clone());
        (transport, signaling, negotiator)
    }

    async fn send_envelope(channel: &TestChannel, envelope: &Envelope) {
        let bytes = Codec::Binary.encode(envelope).unwrap();
        for packet in fragment(&bytes).unwrap() {
            channel.send(packet).await.unwrap();
        }
    }

    async fn wait_for_peers(transport: &PeerTransport, expected: usize) {
        for _ in 0..200 {
            if transport.peers().len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} peers, have {:?}", expected, transport.peers());
    }

    #[tokio::test]
    async fn test_inbound_envelopes_are_tagged_with_peer() {
        let (transport, _, _) = transport();
        let (local, remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        transport.attach("client-a", local);

        send_envelope(&remote, &Envelope::request(3, Payload::Ping(Ping::default()))).await;

        let got = transport.recv().await.unwrap().unwrap();
        assert_eq!(got.identifier.as_deref(), Some("client-a"));
        assert_eq!(got.envelope.sequence, 3);
    }

    #[tokio::test]
    async fn test_outbound_envelope_is_fragmented_to_its_peer() {
        let (transport, _, _) = transport();
        let (local, remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        transport.attach("client-a", local);

        let big = crate::protocol::FileSystemUpdate {
            added: vec!["x".repeat(200_000)],
            removed: vec![],
        };
        let envelope = Envelope::event(0, Payload::FileSystemUpdate(big));
        transport
            .send(Transmit::to_peer(envelope.clone(), Some("client-a".into())))
            .await
            .unwrap();

        let mut defrag = PacketDefragmenter::new();
        let message = loop {
            let packet = remote.recv().await.unwrap();
            assert!(packet.len() <= ProtocolConfig::MAX_FRAGMENT_SIZE);
            defrag.process_bytes(&packet).unwrap();
            if let Some(message) = defrag.next_message() {
                break message;
            }
        };
        assert_eq!(Codec::Binary.decode(&message).unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_unknown_peer_send_fails() {
        let (transport, _, _) = transport();
        let result = transport
            .send(Transmit::to_peer(Envelope::default(), Some("ghost".into())))
            .await;
        assert!(matches!(result, Err(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_resources_without_peer_become_announce() {
        let (transport, signaling, _) = transport();
        let resources = ProviderResources {
            concurrency: 4,
            tasks: 1,
        };
        transport
            .send(Transmit::new(Envelope::event(
                0,
                Payload::ProviderResources(resources),
            )))
            .await
            .unwrap();
        transport
            .send(Transmit::new(Envelope::event(1, Payload::Ping(Ping::default()))))
            .await
            .unwrap();

        let announced = signaling.announced.lock().unwrap().clone();
        assert_eq!(announced, vec![("provider-1".to_string(), 4)]);
    }

    #[tokio::test]
    async fn test_zero_length_message_detaches_peer() {
        let (transport, _, _) = transport();
        let (local, remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        transport.attach("client-a", local);
        assert_eq!(transport.peers(), vec!["client-a".to_string()]);

        remote.send(Bytes::from_static(&[0, 0, 0, 0])).await.unwrap();
        wait_for_peers(&transport, 0).await;
        assert!(transport.ready().await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_packet_drops_only_that_peer() {
        let (transport, _, _) = transport();
        let (bad_local, bad_remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        let (good_local, good_remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        transport.attach("bad", bad_local);
        transport.attach("good", good_local);

        bad_remote
            .send(Bytes::copy_from_slice(&100_000_001u32.to_be_bytes()))
            .await
            .unwrap();
        wait_for_peers(&transport, 1).await;
        assert_eq!(transport.peers(), vec!["good".to_string()]);

        send_envelope(&good_remote, &Envelope::event(0, Payload::Ping(Ping::default()))).await;
        let got = transport.recv().await.unwrap().unwrap();
        assert_eq!(got.identifier.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_foreign_label_is_ignored() {
        let (transport, _, _) = transport();
        let (local, _remote) = channel_pair("chat");
        transport.attach("client-a", local);
        assert!(transport.peers().is_empty());
    }

    #[tokio::test]
    async fn test_offer_is_answered_and_channel_attached() {
        let (transport, signaling, negotiator) = transport();
        let (local, _remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        *negotiator.channel.lock().unwrap() = Some(local as Arc<dyn DataChannel>);

        transport
            .handle_signal(SignalEnvelope {
                source: "client-a".into(),
                destination: "provider-1".into(),
                message: SignalMessage::Offer { sdp: "v=0".into() },
            })
            .await
            .unwrap();

        let delivered = signaling.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].destination, "client-a");
        assert_eq!(
            delivered[0].message,
            SignalMessage::Answer {
                sdp: "answer to v=0".into()
            }
        );
        wait_for_peers(&transport, 1).await;
    }

    #[tokio::test]
    async fn test_candidates_are_stripped_and_forwarded() {
        let (transport, _, negotiator) = transport();
        let signal = |destination: &str| SignalEnvelope {
            source: "client-a".into(),
            destination: destination.into(),
            message: SignalMessage::Candidate {
                candidate: IceCandidate {
                    candidate: "a=candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host".into(),
                    ..Default::default()
                },
            },
        };

        transport.handle_signal(signal("someone-else")).await.unwrap();
        transport.handle_signal(signal("provider-1")).await.unwrap();

        let candidates = negotiator.candidates.lock().unwrap().clone();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, "client-a");
        assert!(candidates[0].1.candidate.starts_with("candidate:1 "));
    }

    #[tokio::test]
    async fn test_close_detaches_everything() {
        let (transport, _, _) = transport();
        let (local, _remote) = channel_pair(ProtocolConfig::DATA_CHANNEL_LABEL);
        transport.attach("client-a", local);

        transport.close("shutdown");
        assert!(transport.peers().is_empty());
        assert!(transport.recv().await.is_none());
        assert!(transport.ready().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_announce_repeats_last_concurrency() {
        let (transport, signaling, _) = transport();
        transport
            .send(Transmit::new(Envelope::event(
                0,
                Payload::ProviderResources(ProviderResources {
                    concurrency: 2,
                    tasks: 0,
                }),
            )))
            .await
            .unwrap();
        transport.announce_every(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(61)).await;
        let announced = signaling.announced.lock().unwrap().len();
        assert_eq!(announced, 3);
    }
}
