//! Byte-level stream codecs: decoding upstream SSE / JSON-line bodies into
//! typed events and encoding caller events back out.

use bytes::Bytes;

use mproxy_protocol::sse::{SseEvent, SseParser};

use crate::dispatch::{Proto, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// `event: <name>` + `data:` framing (Claude).
    SseNamedEvent,
    /// `data:`-only framing with a `[DONE]` terminator (OpenAI).
    SseDataOnly,
    /// Newline-delimited JSON objects (Gemini).
    JsonLines,
}

pub fn stream_format(proto: Proto) -> StreamFormat {
    match proto {
        Proto::Claude => StreamFormat::SseNamedEvent,
        Proto::OpenAI => StreamFormat::SseDataOnly,
        Proto::Gemini => StreamFormat::JsonLines,
    }
}

pub fn content_type_for_stream(proto: Proto) -> &'static str {
    match proto {
        Proto::Gemini => "application/json",
        _ => "text/event-stream",
    }
}

/// Incremental decoder for one upstream stream body.
///
/// Accepts arbitrary byte chunks; partial SSE lines, partial JSON lines and
/// split UTF-8 sequences are buffered until complete.
#[derive(Debug)]
pub struct StreamDecoder {
    proto: Proto,
    sse: SseParser,
    json_bytes: Vec<u8>,
    json_buf: String,
    done_seen: bool,
}

impl StreamDecoder {
    pub fn new(proto: Proto) -> Self {
        Self {
            proto,
            sse: SseParser::new(),
            json_bytes: Vec::new(),
            json_buf: String::new(),
            done_seen: false,
        }
    }

    /// True once an explicit terminator (`data: [DONE]`) has been observed.
    pub fn done(&self) -> bool {
        self.done_seen
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match stream_format(self.proto) {
            StreamFormat::SseNamedEvent | StreamFormat::SseDataOnly => {
                for ev in self.sse.push_bytes(chunk) {
                    self.decode_sse(&ev, &mut out);
                }
            }
            StreamFormat::JsonLines => {
                // Some Gemini-compatible upstreams use SSE framing even for
                // the JSON stream endpoint; try both.
                for ev in self.sse.push_bytes(chunk) {
                    self.decode_sse(&ev, &mut out);
                }
                self.push_json_bytes(chunk, &mut out);
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let pending = self.sse.finish();
        for ev in pending {
            self.decode_sse(&ev, &mut out);
        }
        let line = self.json_buf.trim().to_string();
        if !line.is_empty()
            && (line.starts_with('{') || line.starts_with('['))
            && let Some(item) = decode_json_line(self.proto, &line)
        {
            out.push(item);
        }
        self.json_buf.clear();
        out
    }

    fn push_json_bytes(&mut self, chunk: &Bytes, out: &mut Vec<StreamEvent>) {
        self.json_bytes.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.json_bytes) {
            Ok(_) => self.json_bytes.len(),
            Err(err) => err.valid_up_to(),
        };
        if valid_up_to == 0 {
            return;
        }
        let complete: Vec<u8> = self.json_bytes.drain(..valid_up_to).collect();
        self.json_buf
            .push_str(&String::from_utf8_lossy(&complete));
        while let Some(pos) = self.json_buf.find('\n') {
            let mut line = self.json_buf[..pos].to_string();
            self.json_buf.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            let line = line.trim().trim_start_matches(',');
            // Array-framed responses open with '[' and close with ']'.
            let line = line.trim_start_matches('[').trim_end_matches(']').trim();
            if line.is_empty() || !line.starts_with('{') {
                continue;
            }
            if let Some(item) = decode_json_line(self.proto, line) {
                out.push(item);
            }
        }
    }

    fn decode_sse(&mut self, ev: &SseEvent, out: &mut Vec<StreamEvent>) {
        let data = ev.data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.done_seen = true;
            return;
        }
        let decoded = match self.proto {
            Proto::Claude => serde_json::from_str(data).ok().map(StreamEvent::Claude),
            Proto::OpenAI => serde_json::from_str(data).ok().map(StreamEvent::OpenAI),
            Proto::Gemini => serde_json::from_str(data).ok().map(StreamEvent::Gemini),
        };
        if let Some(item) = decoded {
            out.push(item);
        }
    }
}

fn decode_json_line(proto: Proto, line: &str) -> Option<StreamEvent> {
    match proto {
        Proto::Gemini => serde_json::from_str(line).ok().map(StreamEvent::Gemini),
        _ => None,
    }
}

/// Encode one caller-dialect event into its wire framing.
pub fn encode_stream_event(caller: Proto, event: &StreamEvent) -> Option<Bytes> {
    match (caller, event) {
        (Proto::Claude, StreamEvent::Claude(ev)) => {
            let data = serde_json::to_string(ev).ok()?;
            Some(encode_sse(Some(ev.event_name()), &data))
        }
        (Proto::OpenAI, StreamEvent::OpenAI(ev)) => {
            let data = serde_json::to_string(ev).ok()?;
            Some(encode_sse(None, &data))
        }
        (Proto::Gemini, StreamEvent::Gemini(ev)) => {
            let mut data = serde_json::to_vec(ev).ok()?;
            data.push(b'\n');
            Some(Bytes::from(data))
        }
        _ => None,
    }
}

pub fn encode_openai_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn encode_sse(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_openai_sse_and_done_marker() {
        let mut decoder = StreamDecoder::new(Proto::OpenAI);
        let chunk = Bytes::from_static(
            b"data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[]}\n\ndata: [DONE]\n\n",
        );
        let events = decoder.push_bytes(&chunk);
        assert_eq!(events.len(), 1);
        assert!(decoder.done());
    }

    #[test]
    fn decodes_gemini_json_lines_split_across_chunks() {
        let mut decoder = StreamDecoder::new(Proto::Gemini);
        let first = Bytes::from_static(b"{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"te");
        let second = Bytes::from_static(b"xt\":\"hi\"}]}}]}\n");
        assert!(decoder.push_bytes(&first).is_empty());
        let events = decoder.push_bytes(&second);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Gemini(resp) => {
                assert_eq!(resp.candidates[0].content.as_ref().unwrap().joined_text(), "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn claude_events_encode_with_event_names() {
        let event = StreamEvent::Claude(mproxy_protocol::claude::StreamEvent::MessageStop);
        let bytes = encode_stream_event(Proto::Claude, &event).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("event: message_stop\n"));
        assert!(text.contains("data: {\"type\":\"message_stop\"}"));
    }
}
