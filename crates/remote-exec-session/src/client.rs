//! Client-role session: correlated calls and the `initialize` handshake.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};
use remote_exec_core::{
    Inbound, Message, Notification, Request, RequestId, Response, RpcError, Transport,
    protocol::{
        CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult, ListToolsResult,
        PROTOCOL_VERSION, methods,
    },
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::SessionError;

/// Correlation id reserved for the `initialize` request.
///
/// Ordinary calls count up from 1 and never reach it.
pub const HANDSHAKE_ID: i64 = 0;

const NOTIFICATION_CAPACITY: usize = 64;

type Reply = oneshot::Sender<Result<Value, SessionError>>;
type SharedHandshake = Shared<BoxFuture<'static, Result<InitializeResult, SessionError>>>;

enum HandshakeState {
    NotStarted,
    InFlight {
        outcome: SharedHandshake,
        reply: Option<Reply>,
    },
    Completed(InitializeResult),
    Failed,
}

struct Inner {
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, Reply>>,
    handshake: Mutex<HandshakeState>,
    closed: AtomicBool,
    notifications: broadcast::Sender<Notification>,
    shutdown: CancellationToken,
}

/// One JSON-RPC session in the client role.
///
/// Any number of calls may be outstanding at once; responses are matched by id
/// in whatever order they arrive. Dropping the session closes it.
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Take over `transport` and start dispatching its inbound messages.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the transport's inbound stream was already taken.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        let inbound = transport.subscribe()?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let inner = Arc::new(Inner {
            transport,
            next_id: AtomicI64::new(HANDSHAKE_ID + 1),
            pending: Mutex::new(HashMap::new()),
            handshake: Mutex::new(HandshakeState::NotStarted),
            closed: AtomicBool::new(false),
            notifications,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Inner::dispatch(Arc::clone(&inner), inbound));
        Ok(Self { inner })
    }

    /// Run the `initialize` exchange once.
    ///
    /// Callers arriving while it is in flight share its outcome; after success
    /// the cached result is returned without touching the transport. A failed
    /// handshake may be attempted again.
    ///
    /// # Errors
    /// Returns the remote error, a transport failure, or `Closed`.
    pub async fn perform_handshake(
        &self,
        client_name: &str,
        client_version: &str,
    ) -> Result<InitializeResult, SessionError> {
        let outcome = {
            let mut state = lock(&self.inner.handshake);
            match &*state {
                HandshakeState::Completed(result) => return Ok(result.clone()),
                HandshakeState::InFlight { outcome, .. } => outcome.clone(),
                HandshakeState::NotStarted | HandshakeState::Failed => {
                    if self.inner.is_closed() {
                        return Err(SessionError::Closed);
                    }
                    let params = InitializeParams {
                        protocol_version: PROTOCOL_VERSION.to_owned(),
                        capabilities: json!({}),
                        client_info: Implementation::new(client_name, client_version),
                    };
                    let (tx, rx) = oneshot::channel();
                    let inner = Arc::clone(&self.inner);
                    let outcome = async move {
                        let outcome = inner.run_handshake(params, rx).await;
                        inner.finish_handshake(&outcome);
                        outcome
                    }
                    .boxed()
                    .shared();
                    *state = HandshakeState::InFlight {
                        outcome: outcome.clone(),
                        reply: Some(tx),
                    };
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.inner.handshake), HandshakeState::Completed(_))
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// Returns the remote error, a transport failure, or `Closed`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, SessionError> {
        if self.inner.is_closed() {
            return Err(SessionError::Closed);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        // A close that raced the insert may have drained the map already.
        if self.inner.is_closed() {
            lock(&self.inner.pending).remove(&id);
            return Err(SessionError::Closed);
        }

        tracing::trace!(%id, method, "Sending request");
        if let Err(e) = self.inner.send(Message::request(id.clone(), method, params)).await {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }

        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Send a notification. Nothing is tracked.
    ///
    /// # Errors
    /// Returns a transport failure, or `Closed`.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        if self.inner.is_closed() {
            return Err(SessionError::Closed);
        }
        self.inner.send(Message::notification(method, params)).await
    }

    /// `tools/list`.
    ///
    /// # Errors
    /// Returns error if the call fails or the result is malformed.
    pub async fn list_tools(&self) -> Result<ListToolsResult, SessionError> {
        let value = self.call(methods::TOOLS_LIST, None).await?;
        decode(value)
    }

    /// `tools/call`.
    ///
    /// # Errors
    /// Returns error if the call fails or the result is malformed.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, SessionError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_owned(),
            arguments,
        })
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let value = self.call(methods::TOOLS_CALL, Some(params)).await?;
        decode(value)
    }

    /// Subscribe to notifications sent by the peer.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the transport and fail everything still waiting with `Closed`.
    ///
    /// # Errors
    /// Returns error if the transport fails to close.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.inner.close().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The dispatch task notices and closes the transport.
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send on the transport, giving up with `Closed` once the session closes.
    async fn send(&self, message: Message) -> Result<(), SessionError> {
        tokio::select! {
            sent = self.transport.send(message) => match sent {
                Ok(()) => Ok(()),
                Err(_) if self.is_closed() => Err(SessionError::Closed),
                Err(e) => Err(e.into()),
            },
            () = self.shutdown.cancelled() => Err(SessionError::Closed),
        }
    }

    async fn dispatch(self: Arc<Self>, mut inbound: Inbound) {
        loop {
            let message = tokio::select! {
                () = self.shutdown.cancelled() => break,
                message = inbound.recv() => message,
            };
            let Some(message) = message else {
                tracing::debug!("Inbound stream ended");
                break;
            };
            if self.is_closed() {
                break;
            }

            match message {
                Message::Response(response) => self.resolve(response),
                Message::Request(request) => {
                    tokio::spawn(Arc::clone(&self).answer(request));
                }
                Message::Notification(notification) => {
                    tracing::trace!(method = %notification.method, "Received notification");
                    // No subscribers is fine.
                    let _ = self.notifications.send(notification);
                }
            }
        }

        if let Err(e) = self.close().await {
            tracing::debug!("Failed to close session transport: {e}");
        }
    }

    fn resolve(&self, response: Response) {
        let id = response.id.clone();
        let outcome = response.into_result().map_err(SessionError::from);

        if id == RequestId::Number(HANDSHAKE_ID) {
            let reply = match &mut *lock(&self.handshake) {
                HandshakeState::InFlight { reply, .. } => reply.take(),
                _ => None,
            };
            match reply {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => tracing::debug!("Discarding handshake response with no handshake in flight"),
            }
            return;
        }

        let reply = lock(&self.pending).remove(&id);
        match reply {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(%id, "Discarding response for unknown request"),
        }
    }

    async fn answer(self: Arc<Self>, request: Request) {
        let response = if request.method == methods::PING {
            Response::success(request.id, json!({}))
        } else {
            tracing::debug!(method = %request.method, "Rejecting inbound request");
            Response::error(request.id, RpcError::method_not_found(&request.method))
        };
        if let Err(e) = self.send(response.into()).await {
            tracing::debug!("Failed to answer inbound request: {e}");
        }
    }

    async fn run_handshake(
        &self,
        params: InitializeParams,
        reply: oneshot::Receiver<Result<Value, SessionError>>,
    ) -> Result<InitializeResult, SessionError> {
        let params = serde_json::to_value(params).map_err(|e| SessionError::Protocol(e.to_string()))?;
        self.send(Message::request(HANDSHAKE_ID, methods::INITIALIZE, Some(params)))
            .await?;

        let value = reply.await.unwrap_or(Err(SessionError::Closed))?;
        let result: InitializeResult = decode(value)?;

        if let Err(e) = self.send(Message::notification(methods::INITIALIZED, None)).await {
            tracing::warn!("Failed to send initialized notification: {e}");
        }

        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "Handshake completed"
        );
        Ok(result)
    }

    fn finish_handshake(&self, outcome: &Result<InitializeResult, SessionError>) {
        let mut state = lock(&self.handshake);
        *state = match outcome {
            Ok(result) => HandshakeState::Completed(result.clone()),
            Err(e) => {
                tracing::warn!("Handshake failed: {e}");
                HandshakeState::Failed
            }
        };
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        // Waiters are released before the transport, whose close may block.
        let pending: Vec<Reply> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        tracing::debug!(pending = pending.len(), "Session closed");
        for tx in pending {
            let _ = tx.send(Err(SessionError::Closed));
        }

        let handshake_reply = match &mut *lock(&self.handshake) {
            HandshakeState::InFlight { reply, .. } => reply.take(),
            _ => None,
        };
        if let Some(tx) = handshake_reply {
            let _ = tx.send(Err(SessionError::Closed));
        }

        self.transport.close().await.map_err(Into::into)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, SessionError> {
    serde_json::from_value(value).map_err(|e| SessionError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use remote_exec_core::{ChannelTransport, TransportError, message::codes};

    use super::*;

    fn connected() -> (Session, ChannelTransport, Inbound) {
        let (client_end, server_end) = ChannelTransport::pair();
        let session = Session::new(Arc::new(client_end)).unwrap();
        let peer_in = server_end.subscribe().unwrap();
        (session, server_end, peer_in)
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "peer", "version": "1.0"}
        })
    }

    async fn next_request(peer_in: &mut Inbound) -> Request {
        match peer_in.recv().await {
            Some(Message::Request(request)) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (session, peer, mut peer_in) = connected();

        let peer_task = async {
            let first = next_request(&mut peer_in).await;
            let second = next_request(&mut peer_in).await;
            for request in [second, first] {
                let echo = json!({ "method": request.method });
                peer.send(Response::success(request.id, echo).into()).await.unwrap();
            }
        };

        let (a, b, ()) = tokio::join!(session.call("alpha", None), session.call("beta", None), peer_task);
        assert_eq!(a.unwrap()["method"], "alpha");
        assert_eq!(b.unwrap()["method"], "beta");
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (session, peer, mut peer_in) = connected();

        let peer_task = async {
            let request = next_request(&mut peer_in).await;
            let err = RpcError::method_not_found(&request.method).with_data(json!({"hint": 1}));
            peer.send(Response::error(request.id, err).into()).await.unwrap();
        };

        let (result, ()) = tokio::join!(session.call("nope", None), peer_task);
        let err = result.unwrap_err();
        assert_eq!(err.code(), Some(codes::METHOD_NOT_FOUND));
        let SessionError::Remote { data, .. } = err else {
            panic!("expected remote error");
        };
        assert_eq!(data, Some(json!({"hint": 1})));
    }

    #[tokio::test]
    async fn test_close_resolves_pending_once() {
        let (session, _peer, mut peer_in) = connected();

        let closer = async {
            next_request(&mut peer_in).await;
            next_request(&mut peer_in).await;
            session.close().await.unwrap();
            session.close().await.unwrap();
        };

        let (a, b, ()) = tokio::join!(session.call("a", None), session.call("b", None), closer);
        assert!(matches!(a, Err(SessionError::Closed)));
        assert_eq!(b.unwrap_err().code(), Some(codes::CONNECTION_CLOSED));
        assert!(session.is_closed());
        assert!(matches!(session.call("c", None).await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_session() {
        let (session, peer, mut peer_in) = connected();

        let hangup = async {
            next_request(&mut peer_in).await;
            peer.close().await.unwrap();
        };

        let (result, ()) = tokio::join!(session.call("slow", None), hangup);
        assert!(matches!(result, Err(SessionError::Closed)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_handshake_shared_by_concurrent_callers() {
        let (session, peer, mut peer_in) = connected();

        let peer_task = async {
            let request = next_request(&mut peer_in).await;
            assert_eq!(request.id, RequestId::Number(HANDSHAKE_ID));
            assert_eq!(request.method, methods::INITIALIZE);
            let params: InitializeParams = serde_json::from_value(request.params.unwrap()).unwrap();
            assert_eq!(params.client_info.name, "tester");
            assert_eq!(params.protocol_version, PROTOCOL_VERSION);

            peer.send(Response::success(request.id, init_result()).into())
                .await
                .unwrap();

            match peer_in.recv().await {
                Some(Message::Notification(n)) => assert_eq!(n.method, methods::INITIALIZED),
                other => panic!("expected initialized notification, got {other:?}"),
            }
        };

        assert!(!session.is_ready());
        let (a, b, ()) = tokio::join!(
            session.perform_handshake("tester", "0.1"),
            session.perform_handshake("tester", "0.1"),
            peer_task
        );
        assert_eq!(a.unwrap().server_info.name, "peer");
        assert_eq!(b.unwrap().server_info.name, "peer");
        assert!(session.is_ready());

        // Cached: nothing else goes out.
        let cached = session.perform_handshake("tester", "0.1").await.unwrap();
        assert_eq!(cached.protocol_version, PROTOCOL_VERSION);
        assert!(peer_in.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_handshake_can_retry() {
        let (session, peer, mut peer_in) = connected();

        let reject = async {
            let request = next_request(&mut peer_in).await;
            peer.send(Response::error(request.id, RpcError::internal("not yet")).into())
                .await
                .unwrap();
        };
        let (first, ()) = tokio::join!(session.perform_handshake("tester", "0.1"), reject);
        assert!(matches!(first, Err(SessionError::Remote { .. })));
        assert!(!session.is_ready());

        let accept = async {
            let request = next_request(&mut peer_in).await;
            peer.send(Response::success(request.id, init_result()).into())
                .await
                .unwrap();
        };
        let (second, ()) = tokio::join!(session.perform_handshake("tester", "0.1"), accept);
        assert!(second.is_ok());
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_close_fails_inflight_handshake() {
        let (session, _peer, mut peer_in) = connected();

        let closer = async {
            next_request(&mut peer_in).await;
            session.close().await.unwrap();
        };
        let (result, ()) = tokio::join!(session.perform_handshake("tester", "0.1"), closer);
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_stray_handshake_response_discarded() {
        let (session, peer, mut peer_in) = connected();

        peer.send(Response::success(RequestId::Number(HANDSHAKE_ID), json!("stray")).into())
            .await
            .unwrap();

        let peer_task = async {
            let request = next_request(&mut peer_in).await;
            assert_eq!(request.id, RequestId::Number(1));
            peer.send(Response::success(request.id, init_result()).into())
                .await
                .unwrap();
        };

        // An ordinary `initialize` goes through the pending map.
        let (result, ()) = tokio::join!(session.call(methods::INITIALIZE, Some(json!({}))), peer_task);
        assert_eq!(result.unwrap()["serverInfo"]["name"], "peer");
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_answers_inbound_requests() {
        let (_session, peer, mut peer_in) = connected();

        peer.send(Message::request(7_i64, methods::PING, None)).await.unwrap();
        peer.send(Message::request("x", "sampling/createMessage", None))
            .await
            .unwrap();

        // Answers are sent from their own tasks, so either may come first.
        let mut answers = HashMap::new();
        for _ in 0..2 {
            let Some(Message::Response(response)) = peer_in.recv().await else {
                panic!("expected response");
            };
            answers.insert(response.id.clone(), response);
        }
        let pong = answers.remove(&RequestId::Number(7)).unwrap();
        assert_eq!(pong.into_result().unwrap(), json!({}));
        let rejected = answers.remove(&RequestId::from("x")).unwrap();
        assert_eq!(rejected.into_result().unwrap_err().code, codes::METHOD_NOT_FOUND);
    }

    /// Client end whose outbound responses never finish sending.
    struct StalledReplies(ChannelTransport);

    #[async_trait]
    impl Transport for StalledReplies {
        async fn send(&self, message: Message) -> Result<(), TransportError> {
            if matches!(message, Message::Response(_)) {
                std::future::pending::<()>().await;
            }
            self.0.send(message).await
        }

        fn subscribe(&self) -> Result<Inbound, TransportError> {
            self.0.subscribe()
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_slow_answer_does_not_stall_responses() {
        let (client_end, peer) = ChannelTransport::pair();
        let session = Session::new(Arc::new(StalledReplies(client_end))).unwrap();
        let mut peer_in = peer.subscribe().unwrap();

        let peer_task = async {
            let request = next_request(&mut peer_in).await;
            peer.send(Message::request(9_i64, methods::PING, None)).await.unwrap();
            peer.send(Response::success(request.id, json!("done")).into())
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(2), session.call("work", None)),
            peer_task
        );
        assert_eq!(result.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_notifications_broadcast() {
        let (session, peer, _peer_in) = connected();
        let mut notes = session.notifications();

        peer.send(Message::notification("notifications/progress", Some(json!({"p": 1}))))
            .await
            .unwrap();

        let note = tokio::time::timeout(Duration::from_secs(1), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.method, "notifications/progress");
    }

    #[tokio::test]
    async fn test_notify_is_untracked() {
        let (session, _peer, mut peer_in) = connected();
        session.notify("notifications/cancelled", None).await.unwrap();
        let Some(Message::Notification(n)) = peer_in.recv().await else {
            panic!("expected notification");
        };
        assert_eq!(n.method, "notifications/cancelled");
    }
}
