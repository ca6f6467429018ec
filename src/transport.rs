use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::artifact::ArtifactPayload;
use crate::error::ChatError;
use crate::session::{Message, Role, SessionId};

/// One `data:` record of the chat stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_detected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self { delta: text.into(), ..Self::default() }
    }

    pub fn done() -> Self {
        Self { done: true, ..Self::default() }
    }

    /// The server-side artifact carried by this record, if it is one and it has the
    /// expected shape.
    pub fn artifact(&self) -> Option<ArtifactPayload> {
        if self.artifact_detected != Some(true) {
            return None;
        }
        let data = self.artifact_data.clone()?;
        match serde_json::from_value::<ArtifactPayload>(data) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "discarding malformed artifact_data");
                None
            }
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for HistoryEntry {
    fn from(m: &Message) -> Self {
        Self { role: m.role, content: m.content.clone(), timestamp: m.timestamp }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: SessionId,
    pub conversation_history: Vec<HistoryEntry>,
}

/// Reassembles newline-delimited `data:` records from arbitrary byte packets.
#[derive(Debug, Default)]
pub struct SseLineReader {
    buffer: Vec<u8>,
    malformed: u64,
}

impl SseLineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and drain every record completed by them, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(chunk) = self.parse_line(&line[..pos]) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Parse whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<StreamChunk> {
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(&rest)
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<StreamChunk> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        let payload = line.strip_prefix("data:")?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim().is_empty() || payload.trim() == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                self.malformed += 1;
                metrics::counter!("artifact_chat_malformed_records_total").increment(1);
                warn!(error = %e, "dropping malformed stream record");
                None
            }
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ChatError>>;

struct RecordState<S> {
    bytes: S,
    reader: SseLineReader,
    pending: VecDeque<StreamChunk>,
    ended: bool,
}

/// Turns a byte stream into records delivered in arrival order. A transport error
/// ends the stream after being yielded once.
pub fn record_stream<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
    E: Into<ChatError>,
{
    let state = RecordState { bytes, reader: SseLineReader::new(), pending: VecDeque::new(), ended: false };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.ended {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(packet)) => {
                    let records = st.reader.feed(packet.as_ref());
                    st.pending.extend(records);
                }
                Some(Err(e)) => {
                    st.ended = true;
                    return Some((Err(e.into()), st));
                }
                None => {
                    st.ended = true;
                    let last = st.reader.finish();
                    st.pending.extend(last);
                }
            }
        }
    })
    .boxed()
}

/// Parse a complete stream body in one shot.
pub fn parse_records(input: &str) -> Vec<StreamChunk> {
    let mut reader = SseLineReader::new();
    let mut chunks = reader.feed(input.as_bytes());
    chunks.extend(reader.finish());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_split_across_packets_are_reassembled() {
        let mut reader = SseLineReader::new();
        assert!(reader.feed(b"data: {\"delta\":\"hel").is_empty());
        assert!(!reader.is_empty_buffer());
        let chunks = reader.feed(b"lo\",\"done\":false}\n\ndata: {\"delta\":\"\",\"done\":true}\n");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].delta, "hello");
        assert!(chunks[1].done);
        assert!(reader.is_empty_buffer());
    }

    #[test]
    fn utf8_split_inside_a_packet_boundary() {
        let line = "data: {\"delta\":\"caf\u{e9}\"}\n".as_bytes().to_vec();
        let cut = line.len() - 4;
        let mut reader = SseLineReader::new();
        assert!(reader.feed(&line[..cut]).is_empty());
        let chunks = reader.feed(&line[cut..]);
        assert_eq!(chunks[0].delta, "caf\u{e9}");
    }

    #[test]
    fn malformed_records_are_dropped_and_counted() {
        let mut reader = SseLineReader::new();
        let chunks = reader.feed(b"data: {broken\ndata: {\"delta\":\"ok\"}\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, "ok");
        assert_eq!(reader.malformed_count(), 1);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let chunks = parse_records(": keepalive\nevent: message\ndata: [DONE]\n\r\ndata:{\"delta\":\"x\"}\r\n");
        assert_eq!(chunks, vec![StreamChunk::delta("x")]);
    }

    #[test]
    fn trailing_record_without_newline_is_parsed_at_end() {
        let chunks = parse_records("data: {\"delta\":\"a\"}\ndata: {\"done\":true}");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn record_stream_yields_in_order_then_error() {
        let packets: Vec<Result<&'static [u8], ChatError>> = vec![
            Ok(b"data: {\"delta\":\"a\"}\ndata: {\"del".as_slice()),
            Ok(b"ta\":\"b\"}\n".as_slice()),
            Err(ChatError::StreamFailed("reset".into())),
            Ok(b"data: {\"delta\":\"never\"}\n".as_slice()),
        ];
        let items: Vec<_> = record_stream(stream::iter(packets)).collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().delta, "a");
        assert_eq!(items[1].as_ref().unwrap().delta, "b");
        assert!(matches!(items[2], Err(ChatError::StreamFailed(_))));
    }

    #[tokio::test]
    async fn record_stream_flushes_unterminated_last_record() {
        let packets: Vec<Result<Vec<u8>, ChatError>> = vec![Ok(b"data: {\"done\":true}".to_vec())];
        let items: Vec<_> = record_stream(stream::iter(packets)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap().done);
    }

    #[test]
    fn artifact_chunk_requires_flag_and_shape() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"delta":"","done":false,"artifact_detected":true,"artifact_data":{"id":"a","language":"python","title":"T","code":"x=1","created_at":"2024-01-01T00:00:00"}}"#,
        )
        .unwrap();
        let payload = chunk.artifact().unwrap();
        assert_eq!(payload.id.as_deref(), Some("a"));
        assert_eq!(payload.code, "x=1");

        let unflagged = StreamChunk { artifact_data: chunk.artifact_data.clone(), ..StreamChunk::default() };
        assert!(unflagged.artifact().is_none());

        let bad = StreamChunk {
            artifact_detected: Some(true),
            artifact_data: Some(serde_json::json!({"title": "no code"})),
            ..StreamChunk::default()
        };
        assert!(bad.artifact().is_none());
    }
}
