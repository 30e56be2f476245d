//! Client transport over an HTTP event stream.
//!
//! Inbound messages arrive as `message` events on a long-lived `GET /sse`
//! response; the first `endpoint` event names the URL that each outbound
//! message is POSTed to.

use std::{
    pin::Pin,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use remote_exec_core::{Inbound, Message, Transport, TransportError};
use reqwest::{Client, Url, header};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{SseEvent, SseParser};

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Transport reading an event stream and writing with HTTP POST.
pub struct EventStreamTransport {
    client: Client,
    endpoint: Url,
    inbound: Mutex<Option<Inbound>>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl EventStreamTransport {
    /// Open `{base_url}/sse` and wait for the server to name its POST endpoint.
    ///
    /// # Errors
    /// Returns error if the URL is invalid, the request fails, or the stream
    /// ends before an `endpoint` event.
    pub async fn connect(base_url: &str) -> Result<Self, TransportError> {
        let stream_url = Url::parse(&format!("{}/sse", base_url.trim_end_matches('/')))
            .map_err(|e| TransportError::InvalidDescriptor(format!("{base_url}: {e}")))?;
        let client = Client::new();

        let response = client
            .get(stream_url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("GET {stream_url} returned {status}")));
        }

        let mut stream: ByteStream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let endpoint = loop {
            let Some(chunk) = stream.next().await else {
                return Err(TransportError::Http("event stream ended before endpoint event".to_owned()));
            };
            let chunk = chunk.map_err(|e| TransportError::Http(e.to_string()))?;

            let mut endpoint = None;
            for event in parser.feed_bytes(&chunk) {
                if endpoint.is_none() && event.event == ENDPOINT_EVENT {
                    let url = stream_url
                        .join(event.data.trim())
                        .map_err(|e| TransportError::Http(format!("bad endpoint {:?}: {e}", event.data)))?;
                    endpoint = Some(url);
                } else {
                    deliver(event, &tx);
                }
            }
            if let Some(endpoint) = endpoint {
                break endpoint;
            }
        };

        tracing::info!(stream = %stream_url, %endpoint, "Event stream connected");
        let reader = tokio::spawn(pump(stream, parser, tx));

        Ok(Self {
            client,
            endpoint,
            inbound: Mutex::new(Some(rx)),
            reader,
            closed: AtomicBool::new(false),
        })
    }

    /// URL outbound messages are POSTed to.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

async fn pump(mut stream: ByteStream, mut parser: SseParser, tx: mpsc::UnboundedSender<Message>) {
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                for event in parser.feed_bytes(&chunk) {
                    deliver(event, &tx);
                }
            }
            Err(e) => {
                tracing::debug!("Event stream read failed: {e}");
                break;
            }
        }
    }
    if let Some(event) = parser.flush() {
        deliver(event, &tx);
    }
    tracing::debug!("Event stream ended");
}

fn deliver(event: SseEvent, tx: &mpsc::UnboundedSender<Message>) {
    if event.event != MESSAGE_EVENT {
        tracing::debug!(event = %event.event, "Ignoring event");
        return;
    }
    match serde_json::from_str::<Message>(&event.data) {
        Ok(message) => {
            // A dropped receiver means nobody is listening any more.
            let _ = tx.send(message);
        }
        Err(e) => tracing::debug!("Dropping malformed event: {e}"),
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&message)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Http(format!("POST {} returned {status}", self.endpoint)))
        }
    }

    fn subscribe(&self) -> Result<Inbound, TransportError> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.reader.abort();
        }
        Ok(())
    }
}

impl Drop for EventStreamTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
