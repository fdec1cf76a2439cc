use bytes::BytesMut;
use futures::StreamExt;
use serde_json::error::Category;
use snafu::{ResultExt, Snafu, ensure};

use crate::event::StreamEvent;
use crate::transport::{ByteStream, TransportError};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Most bytes held while waiting for a line terminator.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1 << 20;

pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    #[snafu(display("stream frame is not a well-formed event: {line}"))]
    MalformedEvent {
        stage: &'static str,
        line: String,
        source: serde_json::Error,
    },
    #[snafu(display("stream line exceeds {limit} bytes without a terminator"))]
    LineTooLong { stage: &'static str, limit: usize },
    #[snafu(display("failed to read stream body on `{stage}`, {source}"))]
    ReadBody {
        stage: &'static str,
        source: TransportError,
    },
}

/// Incremental splitter from raw body chunks to decoded events.
///
/// Bytes after the last newline stay buffered until the next chunk arrives, so both
/// lines and multi-byte characters may be split anywhere by the transport.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next event from complete lines, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> FrameResult<Option<StreamEvent>> {
        loop {
            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|byte| *byte == b'\n')
            else {
                self.scanned = self.buffer.len();
                ensure!(
                    self.buffer.len() <= self.max_line_bytes,
                    LineTooLongSnafu {
                        stage: "frame-buffer-line",
                        limit: self.max_line_bytes,
                    }
                );
                return Ok(None);
            };

            let newline = self.scanned + offset;
            let line = self.buffer.split_to(newline + 1);
            self.scanned = 0;
            if let Some(event) = decode_line(&line[..newline])? {
                return Ok(Some(event));
            }
        }
    }

    /// Flushes an unterminated final line once the body has ended.
    pub fn finish(&mut self) -> FrameResult<Option<StreamEvent>> {
        if let Some(event) = self.next_event()? {
            return Ok(Some(event));
        }
        let line = self.buffer.split();
        self.scanned = 0;
        decode_line(&line)
    }
}

/// Pulls events out of a transport body, reading only as far as the caller consumes.
pub struct FrameReader {
    body: ByteStream,
    decoder: FrameDecoder,
    exhausted: bool,
}

impl FrameReader {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            exhausted: false,
        }
    }

    pub async fn next_event(&mut self) -> FrameResult<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.decoder.next_event()? {
                return Ok(Some(event));
            }
            if self.exhausted {
                return Ok(None);
            }

            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk.context(ReadBodySnafu {
                        stage: "frame-read-chunk",
                    })?;
                    self.decoder.push(&chunk);
                }
                None => {
                    self.exhausted = true;
                    return self.decoder.finish();
                }
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> FrameResult<Option<StreamEvent>> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let Ok(line) = std::str::from_utf8(raw) else {
        tracing::debug!(len = raw.len(), "skipping stream line with invalid utf-8");
        return Ok(None);
    };

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim().is_empty() || payload.trim() == DONE_SENTINEL {
        return Ok(None);
    }

    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(StreamEvent::Unknown) => {
            tracing::debug!(line = %payload, "ignoring stream event with unknown type");
            Ok(None)
        }
        Ok(event) => Ok(Some(event)),
        Err(source) if source.classify() == Category::Data => {
            Err(source).context(MalformedEventSnafu {
                stage: "frame-decode-event",
                line: payload.to_string(),
            })
        }
        Err(source) => {
            tracing::debug!(error = %source, "skipping undecodable stream line");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::transport::TransportResult;

    fn drain(decoder: &mut FrameDecoder) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event().expect("decode") {
            events.push(event);
        }
        events
    }

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Content {
            content: text.to_string(),
        }
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"data: {\"type\":\"content\",");
        assert!(drain(&mut decoder).is_empty());

        decoder.push(b"\"content\":\"He\"}\ndata: {\"type\":\"content\",\"content\":\"llo\"}\n");
        assert_eq!(drain(&mut decoder), vec![content("He"), content("llo")]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let line = "data: {\"type\":\"content\",\"content\":\"héllo\"}\n".as_bytes();
        let split = line
            .iter()
            .position(|byte| *byte == 0xC3)
            .expect("line has a two-byte character")
            + 1;

        let mut decoder = FrameDecoder::new();
        decoder.push(&line[..split]);
        assert!(drain(&mut decoder).is_empty());
        decoder.push(&line[split..]);
        assert_eq!(drain(&mut decoder), vec![content("héllo")]);
    }

    #[test]
    fn done_sentinel_comments_and_crlf_are_handled() {
        let mut decoder = FrameDecoder::new();
        decoder.push(
            b": keep-alive\r\n\
              event: message\r\n\
              data: {\"type\":\"content\",\"content\":\"a\"}\r\n\
              data: [DONE]\r\n\
              \r\n\
              data:{\"type\":\"complete\"}\r\n",
        );
        assert_eq!(
            drain(&mut decoder),
            vec![content("a"), StreamEvent::Complete {}]
        );
    }

    #[test]
    fn syntax_noise_is_swallowed() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"data: {not json\ndata: {\"type\":\"content\",\"content\":\"ok\"}\n");
        assert_eq!(drain(&mut decoder), vec![content("ok")]);
    }

    #[test]
    fn structural_errors_propagate() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"data: {\"type\":\"content\",\"content\":7}\n");
        let error = decoder.next_event().expect_err("wrong field type");
        assert!(matches!(error, FrameError::MalformedEvent { .. }));
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"data: {\"type\":\"usage\",\"tokens\":4}\ndata: {\"type\":\"complete\"}\n");
        assert_eq!(drain(&mut decoder), vec![StreamEvent::Complete {}]);
    }

    #[test]
    fn unterminated_last_line_is_flushed_on_finish() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"data: {\"type\":\"complete\"}");
        assert!(drain(&mut decoder).is_empty());
        assert_eq!(
            decoder.finish().expect("flush"),
            Some(StreamEvent::Complete {})
        );
        assert_eq!(decoder.finish().expect("flush again"), None);
    }

    #[test]
    fn a_burst_of_lines_decodes_in_order() {
        let mut decoder = FrameDecoder::new();
        let burst = (0..2_000)
            .map(|index| format!("data: {{\"type\":\"content\",\"content\":\"{index}\"}}\n"))
            .collect::<String>();
        decoder.push(burst.as_bytes());

        let events = drain(&mut decoder);
        assert_eq!(events.len(), 2_000);
        assert_eq!(events[0], content("0"));
        assert_eq!(events[1_999], content("1999"));
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn partial_line_fed_byte_by_byte_is_decoded_once() {
        let mut decoder = FrameDecoder::new();
        for byte in b"data: {\"type\":\"content\",\"content\":\"slow\"}" {
            decoder.push(&[*byte]);
            assert!(drain(&mut decoder).is_empty());
        }
        decoder.push(b"\n");
        assert_eq!(drain(&mut decoder), vec![content("slow")]);
    }

    #[test]
    fn unterminated_lines_are_capped() {
        let mut decoder = FrameDecoder::with_max_line_bytes(16);
        decoder.push(b"data: 0123456789");
        assert!(drain(&mut decoder).is_empty());

        decoder.push(b"abcdef");
        let error = decoder.next_event().expect_err("line over the cap");
        assert!(matches!(error, FrameError::LineTooLong { limit: 16, .. }));
    }

    #[tokio::test]
    async fn reader_pulls_events_across_body_chunks() {
        let chunks: Vec<TransportResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"content\",\"con")),
            Ok(Bytes::from_static(b"tent\":\"x\"}\ndata: {\"type\":\"comp")),
            Ok(Bytes::from_static(b"lete\"}")),
        ];
        let mut reader = FrameReader::new(stream::iter(chunks).boxed());

        assert_eq!(reader.next_event().await.expect("first"), Some(content("x")));
        assert_eq!(
            reader.next_event().await.expect("second"),
            Some(StreamEvent::Complete {})
        );
        assert_eq!(reader.next_event().await.expect("end"), None);
    }

    #[tokio::test]
    async fn body_failures_surface_as_read_errors() {
        let chunks: Vec<TransportResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"content\",\"content\":\"x\"}\n")),
            Err(TransportError::Disconnected {
                stage: "test-body",
            }),
        ];
        let mut reader = FrameReader::new(stream::iter(chunks).boxed());

        assert_eq!(reader.next_event().await.expect("first"), Some(content("x")));
        let error = reader.next_event().await.expect_err("body fails");
        assert!(matches!(error, FrameError::ReadBody { .. }));
    }
}
