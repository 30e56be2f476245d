//! Incremental `text/event-stream` parser.

/// A parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type from `event:`, `message` when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Last `id:` value.
    pub id: Option<String>,
    /// Reconnection hint from `retry:`, in milliseconds.
    pub retry: Option<u64>,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            event: DEFAULT_EVENT.to_owned(),
            data: String::new(),
            id: None,
            retry: None,
        }
    }
}

const DEFAULT_EVENT: &str = "message";

/// Splits a byte stream into [`SseEvent`]s.
///
/// Accepts CR, LF, and CRLF line endings in any mix, strips a leading BOM,
/// and ignores comment lines. Chunks may split lines, events, or UTF-8
/// sequences anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    undecoded: Vec<u8>,
    current: SseEvent,
    has_data: bool,
    bom_checked: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; an incomplete trailing UTF-8 sequence is held back.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.undecoded.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.undecoded);
        match std::str::from_utf8(&bytes) {
            Ok(text) => self.feed(text),
            Err(e) if e.error_len().is_none() => {
                let (valid, tail) = bytes.split_at(e.valid_up_to());
                self.undecoded = tail.to_vec();
                // `valid_up_to` marks a boundary of valid UTF-8.
                self.feed(&String::from_utf8_lossy(valid))
            }
            Err(_) => self.feed(&String::from_utf8_lossy(&bytes)),
        }
    }

    /// Feed text and collect the events it completes.
    pub fn feed(&mut self, data: &str) -> Vec<SseEvent> {
        self.buffer.push_str(data);
        if !self.bom_checked && !self.buffer.is_empty() {
            self.bom_checked = true;
            if self.buffer.starts_with('\u{FEFF}') {
                self.buffer.drain(..'\u{FEFF}'.len_utf8());
            }
        }

        let buffer = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(rel) = buffer[start..].find(['\r', '\n']) {
            let pos = start + rel;
            let next = if buffer.as_bytes()[pos] == b'\r' {
                match buffer.as_bytes().get(pos + 1) {
                    Some(b'\n') => pos + 2,
                    Some(_) => pos + 1,
                    // A trailing CR may be the first half of CRLF.
                    None => break,
                }
            } else {
                pos + 1
            };

            let line = &buffer[start..pos];
            start = next;

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else {
                self.process_line(line);
            }
        }

        self.buffer = buffer[start..].to_owned();
        events
    }

    /// Finish the stream, returning the event left without a blank line.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end_matches('\r');
        if !rest.is_empty() {
            self.process_line(rest);
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => value.clone_into(&mut self.current.event),
            "data" => {
                self.current.data.push_str(value);
                self.current.data.push('\n');
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.current.id = Some(value.to_owned()),
            "retry" => self.current.retry = value.parse().ok(),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            self.current.event = DEFAULT_EVENT.to_owned();
            return None;
        }
        self.has_data = false;
        let mut event = std::mem::take(&mut self.current);
        // `id` persists across events.
        self.current.id.clone_from(&event.id);
        if event.data.ends_with('\n') {
            event.data.pop();
        }
        if event.event.is_empty() {
            DEFAULT_EVENT.clone_into(&mut event.event);
        }
        Some(event)
    }
}
