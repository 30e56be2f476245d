//! Server-role request loop.

use std::sync::Arc;

use async_trait::async_trait;
use remote_exec_core::{Message, MethodCall, Notification, Request, Response, RpcError, Transport};
use serde_json::Value;
use tokio::task::JoinSet;

use crate::SessionError;

/// Answers requests arriving at a served transport.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the result for one decoded request.
    async fn handle_request(&self, call: MethodCall) -> Result<Value, RpcError>;

    /// Observe a notification. Ignored by default.
    async fn handle_notification(&self, notification: Notification) {
        tracing::trace!(method = %notification.method, "Ignoring notification");
    }
}

/// Serve `transport` until its inbound stream ends.
///
/// Each request runs on its own task and is answered with exactly one
/// response; requests still running when the stream ends are awaited before
/// returning.
///
/// # Errors
/// Returns error if the transport's inbound stream was already taken.
pub async fn serve(transport: Arc<dyn Transport>, handler: Arc<dyn RequestHandler>) -> Result<(), SessionError> {
    let mut inbound = transport.subscribe()?;
    let mut tasks = JoinSet::new();

    while let Some(message) = inbound.recv().await {
        while tasks.try_join_next().is_some() {}

        match message {
            Message::Request(request) => {
                let transport = Arc::clone(&transport);
                let handler = Arc::clone(&handler);
                tasks.spawn(async move {
                    let response = handle(handler.as_ref(), request).await;
                    if let Err(e) = transport.send(response.into()).await {
                        tracing::debug!("Failed to send response: {e}");
                    }
                });
            }
            Message::Notification(notification) => handler.handle_notification(notification).await,
            Message::Response(response) => {
                tracing::debug!(id = %response.id, "Discarding unsolicited response");
            }
        }
    }

    tracing::debug!(in_flight = tasks.len(), "Inbound stream ended");
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn handle(handler: &dyn RequestHandler, request: Request) -> Response {
    let Request { id, method, params } = request;
    tracing::debug!(%id, %method, "Handling request");

    let result = match MethodCall::parse(&method, params) {
        Ok(call) => handler.handle_request(call).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(value) => Response::success(id, value),
        Err(e) => {
            tracing::debug!(%id, %method, code = e.code, "Request failed: {}", e.message);
            Response::error(id, e)
        }
    }
}
