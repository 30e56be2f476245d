//! Newline-delimited JSON framing.
//!
//! Wraps [`LinesCodec`] with a per-line limit. Lines over the limit are
//! skipped and decoding resumes at the next newline; lines that are not a
//! valid UTF-8 JSON-RPC message are logged and skipped. Neither ends the stream.

use bytes::{BufMut, BytesMut};
use remote_exec_core::{Message, TransportError};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest inbound line accepted: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One [`Message`] per `\n`-terminated line.
#[derive(Debug)]
pub struct NdjsonCodec(LinesCodec);

impl NdjsonCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    #[must_use]
    pub fn with_max_line_bytes(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }

    fn next_message(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Message>, TransportError> {
        loop {
            let line = if eof {
                self.0.decode_eof(src)
            } else {
                self.0.decode(src)
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(max = self.0.max_length(), "Discarding oversized line");
                    continue;
                }
                // The offending line has already been consumed.
                Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::debug!("Dropping non-UTF-8 frame: {e}");
                    continue;
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::debug!("Dropping malformed frame: {e}"),
            }
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        self.next_message(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        self.next_message(src, true)
    }
}

impl Encoder<Message> for NdjsonCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
