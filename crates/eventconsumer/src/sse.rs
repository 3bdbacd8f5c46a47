//! Server-sent-event frame parsing, modeled as an explicit state machine
//! over a buffered byte reader rather than relying on any language's
//! built-in async iteration (§9 "Coroutine-style SSE parsing").
//!
//! Upstream format (§6): lines beginning with `data: ` carry a JSON
//! payload; a blank line terminates the frame. Anything else is a
//! protocol error — the caller's retry loop treats it as grounds to
//! release the mutex and let a healthy peer take over.

use kilnforge_core::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const DATA_PREFIX: &str = "data: ";

/// The parser's current position within one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SseState {
    /// Waiting for the next `data: ` line.
    Idle,
    /// Accumulated at least one `data: ` line; waiting for the blank line
    /// that terminates the frame.
    AccumulatingData,
}

/// Reads one frame at a time from an upstream SSE body.
///
/// A "frame" here is the accumulated `data: ` payload of one event,
/// exactly as `runevents.go`'s `bufio.Reader` loop assembled it: multiple
/// `data: ` lines concatenate (newline-joined) until a blank line flushes
/// them as one frame.
pub struct SseReader<R> {
    reader: R,
    state: SseState,
    buffer: String,
}

impl<R: AsyncBufRead + Unpin> SseReader<R> {
    /// Wrap a buffered reader over an SSE response body.
    pub fn new(reader: R) -> Self {
        SseReader {
            reader,
            state: SseState::Idle,
            buffer: String::new(),
        }
    }

    /// Read the next complete frame, or `Ok(None)` at end of stream with
    /// no partial frame pending.
    ///
    /// Returns `Err(Error::Corruption)` — a protocol error in §6/§9's
    /// terms — on any line that is neither `data: ...` nor blank while
    /// accumulating, or on invalid UTF-8.
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            let mut line = String::new();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(Error::Io)?;

            if bytes_read == 0 {
                // End of stream. A frame still being accumulated with no
                // terminating blank line is itself a protocol error —
                // the upstream closed mid-event.
                return match self.state {
                    SseState::Idle => Ok(None),
                    SseState::AccumulatingData => Err(Error::Corruption(
                        "upstream closed mid-frame, no terminating blank line".into(),
                    )),
                };
            }

            let trimmed = line.trim_end_matches(['\n', '\r']);

            match self.state {
                SseState::Idle => {
                    if trimmed.is_empty() {
                        // Blank lines between events are not an error.
                        continue;
                    }
                    if let Some(data) = trimmed.strip_prefix(DATA_PREFIX) {
                        self.buffer.push_str(data);
                        self.state = SseState::AccumulatingData;
                    } else {
                        return Err(Error::Corruption(format!(
                            "expected a `data: ` line, got {trimmed:?}"
                        )));
                    }
                }
                SseState::AccumulatingData => {
                    if trimmed.is_empty() {
                        // FrameReady: hand the accumulated buffer back and
                        // return to Idle for the next frame.
                        let frame = std::mem::take(&mut self.buffer);
                        self.state = SseState::Idle;
                        return Ok(Some(frame));
                    }
                    if let Some(data) = trimmed.strip_prefix(DATA_PREFIX) {
                        self.buffer.push('\n');
                        self.buffer.push_str(data);
                    } else {
                        return Err(Error::Corruption(format!(
                            "expected a `data: ` continuation or blank line, got {trimmed:?}"
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(body: &str) -> SseReader<Cursor<Vec<u8>>> {
        SseReader::new(Cursor::new(body.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn single_frame() {
        let mut r = reader("data: {\"a\":1}\n\n");
        assert_eq!(r.next_frame().await.unwrap(), Some("{\"a\":1}".to_string()));
        assert_eq!(r.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn multiple_frames() {
        let mut r = reader("data: one\n\ndata: two\n\n");
        assert_eq!(r.next_frame().await.unwrap(), Some("one".to_string()));
        assert_eq!(r.next_frame().await.unwrap(), Some("two".to_string()));
        assert_eq!(r.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn multi_line_data_joins_with_newline() {
        let mut r = reader("data: line1\ndata: line2\n\n");
        assert_eq!(
            r.next_frame().await.unwrap(),
            Some("line1\nline2".to_string())
        );
    }

    #[tokio::test]
    async fn unexpected_line_is_protocol_error() {
        let mut r = reader("event: ping\n\n");
        assert!(r.next_frame().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn truncated_frame_at_eof_is_protocol_error() {
        let mut r = reader("data: partial\n");
        assert!(r.next_frame().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn leading_blank_lines_are_ignored() {
        let mut r = reader("\n\ndata: ok\n\n");
        assert_eq!(r.next_frame().await.unwrap(), Some("ok".to_string()));
    }
}
