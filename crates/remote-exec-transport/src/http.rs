//! HTTP/SSE server side.
//!
//! Each `GET /sse` opens one connection: the first event is `endpoint`,
//! naming `/message?sessionId=<uuid>`, and responses follow as `message`
//! events. Requests are POSTed to that URL and answered `202 Accepted`.
//! Every connection is served by its own [`serve`] loop over a
//! [`ChannelTransport`].

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError},
};

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use remote_exec_core::{ChannelTransport, Message, TransportError};
use remote_exec_session::{RequestHandler, serve};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::{Stream, StreamExt, wrappers::UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

type Connections = Mutex<HashMap<Uuid, mpsc::UnboundedSender<Message>>>;

struct AppState {
    handler: Arc<dyn RequestHandler>,
    connections: Connections,
}

impl AppState {
    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedSender<Message>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its connection from the table when the event stream is dropped.
struct ConnectionGuard {
    id: Uuid,
    state: Arc<AppState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // Dropping the sender ends the connection's serve loop.
        self.state.connections().remove(&self.id);
        tracing::info!(session_id = %self.id, "Event stream disconnected");
    }
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Uuid,
}

/// Build the router for `/sse`, `/message`, and `/health`.
pub fn router(handler: Arc<dyn RequestHandler>) -> Router {
    let state = Arc::new(AppState {
        handler,
        connections: Mutex::new(HashMap::new()),
    });
    routes(state)
}

fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sse", get(open_stream))
        .route("/message", post(post_message))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve on `listener` until `shutdown` is cancelled.
///
/// Open event streams are ended on shutdown so the server can drain.
///
/// # Errors
/// Returns error if the listener fails.
pub async fn serve_http(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let state = Arc::new(AppState {
        handler,
        connections: Mutex::new(HashMap::new()),
    });
    let app = routes(Arc::clone(&state));

    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP/SSE transport listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            state.connections().clear();
        })
        .await?;

    tracing::info!("HTTP/SSE transport shut down");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn open_stream(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = Uuid::new_v4();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    state.connections().insert(id, inbound_tx);
    tracing::info!(session_id = %id, "Event stream connected");

    let transport = Arc::new(ChannelTransport::new(outbound_tx, inbound_rx));
    let handler = Arc::clone(&state.handler);
    tokio::spawn(async move {
        if let Err(e) = serve(transport, handler).await {
            tracing::error!(session_id = %id, "Connection failed: {e}");
        }
    });

    let guard = ConnectionGuard { id, state };
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={id}"));
    let messages = UnboundedReceiverStream::new(outbound_rx).filter_map(move |message| {
        let _connection = &guard;
        match serde_json::to_string(&message) {
            Ok(json) => Some(Event::default().event("message").data(json)),
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                None
            }
        }
    });

    let stream = tokio_stream::once(endpoint).chain(messages).map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> StatusCode {
    let message: Message = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(session_id = %query.session_id, "Rejecting malformed message: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let sender = state.connections().get(&query.session_id).cloned();
    match sender {
        Some(sender) if sender.send(message).is_ok() => StatusCode::ACCEPTED,
        _ => StatusCode::NOT_FOUND,
    }
}
