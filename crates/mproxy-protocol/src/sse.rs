use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser.
///
/// Input arrives as arbitrary byte chunks; multi-byte UTF-8 sequences split
/// across chunks are buffered until complete, never dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    bytes: Vec<u8>,
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.bytes.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.bytes) {
            Ok(_) => self.bytes.len(),
            Err(err) => err.valid_up_to(),
        };
        if valid_up_to == 0 {
            return Vec::new();
        }
        let complete: Vec<u8> = self.bytes.drain(..valid_up_to).collect();
        // Infallible: the prefix was just validated.
        let text = String::from_utf8_lossy(&complete).into_owned();
        self.push_str(&text)
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
                continue;
            }
            if line == "data" {
                self.data_lines.push(String::new());
            }
        }

        events
    }

    /// Flush any buffered partial event at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push_str("event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn buffers_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"text\":").is_empty());
        let events = parser.push_str("\"hi\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"hi\"}");
    }

    #[test]
    fn reassembles_utf8_split_across_chunks() {
        let mut parser = SseParser::new();
        let full = "data: {\"text\":\"héllo\"}\n\n".as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let split = full.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let first = Bytes::copy_from_slice(&full[..split]);
        let second = Bytes::copy_from_slice(&full[split..]);
        assert!(parser.push_bytes(&first).is_empty());
        let events = parser.push_bytes(&second);
        assert_eq!(events.len(), 1);
        assert!(events[0].data.contains("héllo"));
    }

    #[test]
    fn ignores_comment_lines() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keepalive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }
}
