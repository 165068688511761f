//! SSE (Server-Sent Events) line buffering and completion-chunk parsing
//!
//! Completion servers send partial chunks that split a `data:` line across network
//! packets. [`SseLineStream`] accumulates bytes until a full line (terminated by `\n`)
//! is available, and [`parse_line`] decodes one line of an OpenAI-style completion stream.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::backend::Usage;

/// Longest line accepted before the stream is failed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SseError<E> {
    #[error("{0}")]
    Body(E),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// A stream wrapper that yields complete lines.
///
/// Each item is one line without its terminator (`\n` or `\r\n`). A trailing partial line
/// is flushed when the inner stream ends. A line longer than the limit ends the stream with
/// [`SseError::LineTooLong`].
pub struct SseLineStream<S> {
    inner: S,
    buffer: BytesMut,
    max_line: usize,
    failed: bool,
}

impl<S> SseLineStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_max_line(inner, MAX_LINE_BYTES)
    }

    pub fn with_max_line(inner: S, max_line: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            max_line,
            failed: false,
        }
    }
}

impl<S, E> Stream for SseLineStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, SseError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.failed {
            return Poll::Ready(None);
        }

        loop {
            let newline = this.buffer.iter().position(|&b| b == b'\n');
            if newline.unwrap_or(this.buffer.len()) > this.max_line {
                this.failed = true;
                this.buffer.clear();
                return Poll::Ready(Some(Err(SseError::LineTooLong(this.max_line))));
            }
            if let Some(pos) = newline {
                let mut line = this.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return Poll::Ready(Some(Ok(line.freeze())));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(SseError::Body(e))));
                }
                Poll::Ready(None) => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    let remaining = this.buffer.split().freeze();
                    return Poll::Ready(Some(Ok(remaining)));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

/// One decoded line of a completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// An incremental fragment. Any field may be empty.
    Chunk {
        content: String,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
    /// The `[DONE]` sentinel.
    Done,
    /// Blank lines, comments, and non-data fields such as `event:` or `id:`.
    Ignored,
    /// A `data:` payload that is neither a completion chunk nor a generic token object.
    Unrecognized(String),
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one line. The `data:` prefix is matched case-insensitively.
pub fn parse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("data:"))
        .map(|_| line[5..].trim())
    else {
        return SseLine::Ignored;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }

    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(data)
        && let Some(choice) = chunk.choices.into_iter().next()
    {
        let content = choice
            .delta
            .and_then(|d| d.content)
            .or(choice.text)
            .unwrap_or_default();
        return SseLine::Chunk {
            content,
            finish_reason: choice.finish_reason.filter(|r| !r.is_empty()),
            usage: chunk.usage,
        };
    }

    // Some servers stream bare token objects instead of completion chunks
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(data)
        && let Some(serde_json::Value::String(content)) = map.get("content")
        && !content.is_empty()
    {
        return SseLine::Chunk {
            content: content.clone(),
            finish_reason: None,
            usage: None,
        };
    }

    SseLine::Unrecognized(line.to_string())
}
