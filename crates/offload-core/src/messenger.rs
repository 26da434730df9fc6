//! Request/response and event multiplexing over one transport.
//!
//! The messenger splits an ordered envelope stream into three flows:
//!
//! - inbound requests, handed out as [`PendingCall`]s to be answered;
//! - inbound events, handed out as [`InboundEvent`]s;
//! - responses to our own requests, which resolve the matching
//!   [`Messenger::send_request`] call by sequence number.
//!
//! Requests and events are numbered by two independent counters that both
//! start at zero and are never reused. Every outbound request resolves
//! exactly once: with the response payload, with the remote error, or with a
//! closed error when the messenger shuts down first.

use crate::cancel::CancellationToken;
use crate::protocol::{Envelope, MessageType, Payload};
use crate::transport::{Transmit, Transport};
use crate::{ProviderError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ResponseSender = oneshot::Sender<Result<Payload>>;

/// An inbound request waiting for its answer.
///
/// Dropping a `PendingCall` without answering leaves the remote waiting, so
/// every call should end in [`PendingCall::respond_with`] or
/// [`PendingCall::respond`].
pub struct PendingCall {
    sequence: u64,
    payload: Payload,
    identifier: Option<String>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("sequence", &self.sequence)
            .field("payload", &self.payload.kind())
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl PendingCall {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Peer the request came from, on multiplexing transports.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Run `handler` on the request and send its result as the response.
    ///
    /// A handler failure is sent as the response's error message.
    pub async fn respond_with<F, Fut>(self, handler: F) -> Result<()>
    where
        F: FnOnce(Payload) -> Fut,
        Fut: Future<Output = Result<Payload>>,
    {
        let PendingCall {
            sequence,
            payload,
            identifier,
            transport,
        } = self;
        let result = handler(payload).await;
        send_response(&*transport, sequence, identifier, result).await
    }

    /// Send an already computed result as the response.
    pub async fn respond(self, result: Result<Payload>) -> Result<()> {
        send_response(&*self.transport, self.sequence, self.identifier, result).await
    }
}

async fn send_response(
    transport: &dyn Transport,
    sequence: u64,
    identifier: Option<String>,
    result: Result<Payload>,
) -> Result<()> {
    let envelope = match result {
        Ok(payload) => Envelope::response(sequence, payload),
        Err(e) => {
            debug!("Request #{} failed: {}", sequence, e);
            Envelope::error_response(sequence, e.to_string())
        }
    };
    transport.send(Transmit::to_peer(envelope, identifier)).await
}

/// An inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub sequence: u64,
    pub payload: Payload,
    pub identifier: Option<String>,
}

struct MessengerInner {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, ResponseSender>>,
    next_request: AtomicU64,
    next_event: AtomicU64,
    requests_tx: Mutex<Option<mpsc::UnboundedSender<PendingCall>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>,
    closed: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl MessengerInner {
    fn closed_error(&self) -> ProviderError {
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "messenger closed".to_string());
        ProviderError::TransportClosed { reason }
    }

    fn close(&self, reason: &str) -> bool {
        // the pending table lock orders close against request registration
        let drained: Vec<ResponseSender> = {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut stored = match self.reason.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if stored.is_some() {
                return false;
            }
            *stored = Some(reason.to_string());
            self.closed.cancel();
            pending.drain().map(|(_, tx)| tx).collect()
        };

        info!(
            "Messenger closing ({} pending requests): {}",
            drained.len(),
            reason
        );
        for tx in drained {
            let _ = tx.send(Err(ProviderError::TransportClosed {
                reason: reason.to_string(),
            }));
        }
        if let Ok(mut tx) = self.requests_tx.lock() {
            tx.take();
        }
        if let Ok(mut tx) = self.events_tx.lock() {
            tx.take();
        }
        self.transport.close(reason);
        true
    }

    fn route(&self, transmit: Transmit) {
        let Transmit {
            envelope,
            identifier,
        } = transmit;

        match envelope.message_type {
            MessageType::Request => {
                let Some(payload) = envelope.payload else {
                    warn!("Request #{} has no payload", envelope.sequence);
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        let _ = send_response(
                            &*transport,
                            envelope.sequence,
                            identifier,
                            Err(ProviderError::MissingPayload),
                        )
                        .await;
                    });
                    return;
                };
                let call = PendingCall {
                    sequence: envelope.sequence,
                    payload,
                    identifier,
                    transport: self.transport.clone(),
                };
                if let Ok(tx) = self.requests_tx.lock() {
                    if let Some(tx) = tx.as_ref() {
                        let _ = tx.send(call);
                    }
                }
            }
            MessageType::Response => {
                let waiter = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut p| p.remove(&envelope.sequence));
                let Some(waiter) = waiter else {
                    debug!("Response #{} matches no pending request", envelope.sequence);
                    return;
                };
                let result = if envelope.is_error() {
                    Err(ProviderError::Remote(envelope.error))
                } else {
                    envelope.payload.ok_or(ProviderError::MissingPayload)
                };
                let _ = waiter.send(result);
            }
            MessageType::Event => {
                let Some(payload) = envelope.payload else {
                    warn!("Event #{} has no payload", envelope.sequence);
                    return;
                };
                let event = InboundEvent {
                    sequence: envelope.sequence,
                    payload,
                    identifier,
                };
                if let Ok(tx) = self.events_tx.lock() {
                    if let Some(tx) = tx.as_ref() {
                        let _ = tx.send(event);
                    }
                }
            }
            MessageType::Unknown => {
                warn!("{}", ProviderError::UnknownMessageType {
                    sequence: envelope.sequence
                });
            }
        }
    }
}

/// Protocol layer over one [`Transport`].
pub struct Messenger {
    inner: Arc<MessengerInner>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingCall>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundEvent>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Messenger {
    /// Start the inbound dispatch loop on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MessengerInner {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            next_event: AtomicU64::new(0),
            requests_tx: Mutex::new(Some(requests_tx)),
            events_tx: Mutex::new(Some(events_tx)),
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
        });

        let dispatch = tokio::spawn(Self::dispatch_loop(inner.clone()));

        Self {
            inner,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            events_rx: tokio::sync::Mutex::new(events_rx),
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    async fn dispatch_loop(inner: Arc<MessengerInner>) {
        loop {
            let item = tokio::select! {
                _ = inner.closed.cancelled() => return,
                item = inner.transport.recv() => item,
            };
            match item {
                Some(Ok(transmit)) => inner.route(transmit),
                Some(Err(e)) => {
                    warn!("Closing connection on protocol error: {}", e);
                    inner.close(&e.to_string());
                    return;
                }
                None => {
                    inner.close("iterator exited");
                    return;
                }
            }
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    /// Send a request and wait for its response payload.
    pub async fn send_request(&self, payload: impl Into<Payload>) -> Result<Payload> {
        self.send_request_to(None, payload).await
    }

    /// Send a request routed to `identifier` on multiplexing transports.
    pub async fn send_request_to(
        &self,
        identifier: Option<String>,
        payload: impl Into<Payload>,
    ) -> Result<Payload> {
        let (tx, rx) = oneshot::channel();
        let sequence = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .map_err(|_| ProviderError::Other("pending table poisoned".to_string()))?;
            if self.inner.closed.is_cancelled() {
                return Err(self.inner.closed_error());
            }
            let sequence = self.inner.next_request.fetch_add(1, Ordering::SeqCst);
            pending.insert(sequence, tx);
            sequence
        };

        let envelope = Envelope::request(sequence, payload.into());
        debug!("-> {}", envelope.describe());
        if let Err(e) = self
            .inner
            .transport
            .send(Transmit::to_peer(envelope, identifier))
            .await
        {
            if let Ok(mut pending) = self.inner.pending.lock() {
                pending.remove(&sequence);
            }
            return Err(e);
        }

        rx.await.map_err(|_| self.inner.closed_error())?
    }

    /// Typed request: the response must be the payload variant of `Resp`.
    pub async fn request<Req, Resp>(&self, request: Req) -> Result<Resp>
    where
        Req: Into<Payload>,
        Resp: TryFrom<Payload, Error = ProviderError>,
    {
        let payload = self.send_request(request).await?;
        Resp::try_from(payload)
    }

    /// Send an event; there is no acknowledgement.
    pub async fn send_event(&self, payload: impl Into<Payload>) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(self.inner.closed_error());
        }
        let sequence = self.inner.next_event.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::event(sequence, payload.into());
        debug!("-> {}", envelope.describe());
        self.inner.transport.send(Transmit::new(envelope)).await
    }

    /// Next inbound request; `None` once the messenger is closed.
    pub async fn next_request(&self) -> Option<PendingCall> {
        self.requests_rx.lock().await.recv().await
    }

    /// Next inbound event; `None` once the messenger is closed.
    pub async fn next_event(&self) -> Option<InboundEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Close the messenger and its transport, failing every pending request.
    ///
    /// Idempotent; returns false if it was already closed.
    pub fn close(&self, reason: &str) -> bool {
        let closed = self.inner.close(reason);
        if closed {
            if let Ok(mut dispatch) = self.dispatch.lock() {
                if let Some(dispatch) = dispatch.take() {
                    dispatch.abort();
                }
            }
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Signal cancelled once the messenger closes, for whatever reason.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Reason the messenger closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.close("messenger dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Codec, FileProbeRequest, FileProbeResponse, GenericEvent, Ping, PingDirection,
    };
    use crate::transport::MemoryTransport;
    use std::time::Duration;

    fn setup() -> (Messenger, MemoryTransport) {
        let (local, remote) = MemoryTransport::pair(Codec::Binary);
        (Messenger::new(Arc::new(local)), remote)
    }

    async fn wait_pending(messenger: &Messenger, count: usize) {
        for _ in 0..200 {
            if messenger.pending_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {} pending requests", count);
    }

    fn probe(name: &str) -> FileProbeRequest {
        FileProbeRequest {
            filename: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_request_sequences_start_at_zero() {
        let (messenger, remote) = setup();
        let messenger = Arc::new(messenger);

        for expected in 0..2u64 {
            let m = messenger.clone();
            let call = tokio::spawn(async move { m.send_request(probe("a")).await });
            let got = remote.recv().await.unwrap().unwrap();
            assert_eq!(got.envelope.message_type, MessageType::Request);
            assert_eq!(got.envelope.sequence, expected);
            remote
                .send(Transmit::new(Envelope::response(
                    expected,
                    FileProbeResponse { found: true }.into(),
                )))
                .await
                .unwrap();
            call.await.unwrap().unwrap();
        }

        // events count separately
        messenger
            .send_event(GenericEvent {
                message: "hi".into(),
            })
            .await
            .unwrap();
        let got = remote.recv().await.unwrap().unwrap();
        assert_eq!(got.envelope.message_type, MessageType::Event);
        assert_eq!(got.envelope.sequence, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_matched_by_sequence() {
        let (messenger, remote) = setup();
        let messenger = Arc::new(messenger);

        let m = messenger.clone();
        let a = tokio::spawn(async move {
            m.request::<_, FileProbeResponse>(probe("a")).await
        });
        let first = remote.recv().await.unwrap().unwrap().envelope.sequence;

        let m = messenger.clone();
        let b = tokio::spawn(async move {
            m.request::<_, FileProbeResponse>(probe("b")).await
        });
        let second = remote.recv().await.unwrap().unwrap().envelope.sequence;

        remote
            .send(Transmit::new(Envelope::response(
                second,
                FileProbeResponse { found: false }.into(),
            )))
            .await
            .unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(!b.found);
        assert!(!a.is_finished());

        remote
            .send(Transmit::new(Envelope::response(
                first,
                FileProbeResponse { found: true }.into(),
            )))
            .await
            .unwrap();
        assert!(a.await.unwrap().unwrap().found);
    }

    #[tokio::test]
    async fn test_remote_error_rejects_request() {
        let (messenger, remote) = setup();
        let messenger = Arc::new(messenger);
        let m = messenger.clone();
        let call = tokio::spawn(async move { m.send_request(probe("a")).await });

        let seq = remote.recv().await.unwrap().unwrap().envelope.sequence;
        remote
            .send(Transmit::new(Envelope::error_response(seq, "no such file")))
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(ProviderError::Remote(message)) => assert_eq!(message, "no such file"),
            other => panic!("Expected Remote error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_later_requests() {
        let (messenger, remote) = setup();
        let messenger = Arc::new(messenger);

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let m = messenger.clone();
                tokio::spawn(async move { m.send_request(probe(&i.to_string())).await })
            })
            .collect();
        wait_pending(&messenger, 3).await;

        assert!(messenger.close("going away"));
        assert!(!messenger.close("again"));

        for call in calls {
            match call.await.unwrap() {
                Err(ProviderError::TransportClosed { reason }) => assert_eq!(reason, "going away"),
                other => panic!("Expected TransportClosed, got: {:?}", other),
            }
        }

        let fourth = messenger.send_request(probe("late")).await;
        assert!(matches!(fourth, Err(ProviderError::TransportClosed { .. })));

        // only the three requests made it to the wire
        let mut sent = 0;
        while let Some(item) = remote.recv().await {
            item.unwrap();
            sent += 1;
        }
        assert_eq!(sent, 3);
        assert_eq!(messenger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_inbound_request_is_answered_with_same_sequence() {
        let (messenger, remote) = setup();
        remote
            .send(Transmit::new(Envelope::request(
                41,
                Payload::Ping(Ping::default()),
            )))
            .await
            .unwrap();

        let call = messenger.next_request().await.unwrap();
        assert_eq!(call.sequence(), 41);
        call.respond_with(|payload| async move {
            assert!(matches!(payload, Payload::Ping(_)));
            Ok(Payload::Ping(Ping {
                direction: PingDirection::Pong,
            }))
        })
        .await
        .unwrap();

        let response = remote.recv().await.unwrap().unwrap().envelope;
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.sequence, 41);
        assert_eq!(
            response.payload,
            Some(Payload::Ping(Ping {
                direction: PingDirection::Pong
            }))
        );
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_field() {
        let (messenger, remote) = setup();
        remote
            .send(Transmit::new(Envelope::request(7, probe("x").into())))
            .await
            .unwrap();

        let call = messenger.next_request().await.unwrap();
        call.respond_with(|_| async {
            Err(ProviderError::NotFound {
                name: "x".to_string(),
            })
        })
        .await
        .unwrap();

        let response = remote.recv().await.unwrap().unwrap().envelope;
        assert_eq!(response.sequence, 7);
        assert_eq!(response.error, "Not found: x");
        assert!(response.payload.is_none());
        assert!(!messenger.is_closed());
    }

    #[tokio::test]
    async fn test_request_without_payload_is_rejected() {
        let (messenger, remote) = setup();
        let mut envelope = Envelope::request(3, Payload::Ping(Ping::default()));
        envelope.payload = None;
        remote.send(Transmit::new(envelope)).await.unwrap();

        let response = remote.recv().await.unwrap().unwrap().envelope;
        assert_eq!(response.sequence, 3);
        assert!(response.is_error());
        assert!(!messenger.is_closed());
    }

    #[tokio::test]
    async fn test_events_and_unknown_types() {
        let (messenger, remote) = setup();
        let mut unknown = Envelope::event(0, Payload::Ping(Ping::default()));
        unknown.message_type = MessageType::Unknown;
        remote.send(Transmit::new(unknown)).await.unwrap();
        remote
            .send(Transmit::new(Envelope::event(
                1,
                GenericEvent {
                    message: "update".into(),
                }
                .into(),
            )))
            .await
            .unwrap();

        let event = messenger.next_event().await.unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(
            event.payload,
            Payload::GenericEvent(GenericEvent {
                message: "update".into()
            })
        );
        assert!(!messenger.is_closed());
    }

    #[tokio::test]
    async fn test_unrecognized_type_on_the_wire_is_skipped() {
        let event = Envelope::event(
            1,
            GenericEvent {
                message: "after".into(),
            }
            .into(),
        );
        for codec in [Codec::Json, Codec::Binary] {
            let (local, remote) = MemoryTransport::pair(codec);
            let messenger = Messenger::new(Arc::new(local));

            let unrecognized = match codec {
                Codec::Json => br#"{"sequence":0,"type":"Stream"}"#.to_vec(),
                Codec::Binary => {
                    let mut bytes = codec
                        .encode(&Envelope::event(0, GenericEvent::default().into()))
                        .unwrap();
                    bytes[1] = 9;
                    bytes
                }
            };
            remote.send_raw(&unrecognized).unwrap();
            remote.send(Transmit::new(event.clone())).await.unwrap();

            let got = tokio::time::timeout(Duration::from_secs(1), messenger.next_event())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.sequence, 1, "codec {}", codec);
            assert!(!messenger.is_closed(), "codec {}", codec);
        }
    }

    #[tokio::test]
    async fn test_malformed_envelope_closes_messenger() {
        let (messenger, remote) = setup();
        remote.send_raw(b"\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();

        tokio::time::timeout(Duration::from_secs(1), messenger.closed().cancelled())
            .await
            .unwrap();
        assert!(messenger
            .close_reason()
            .unwrap()
            .contains("Protocol violation"));
        assert!(messenger.next_request().await.is_none());
        assert!(messenger.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_ends_streams() {
        let (messenger, remote) = setup();
        remote.close("broker shutdown");

        assert!(messenger.next_request().await.is_none());
        assert!(messenger.is_closed());
        assert!(messenger.send_event(GenericEvent::default()).await.is_err());
    }
}
