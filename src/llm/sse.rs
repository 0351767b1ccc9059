//! Server-sent event decoding for provider streams.
//!
//! Bytes are buffered until a full line is available, so payloads split
//! across network reads (including multi-byte characters) decode correctly.
//! Only `data:` lines are handed to the provider-specific parser.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{RagError, RagResult};

/// What a provider parser made of one `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Skip,
    /// Completion marker; nothing after it is read.
    Done,
}

struct Decoder<S, F> {
    body: Pin<Box<S>>,
    parse: F,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    error: Option<RagError>,
    completed: bool,
    finished: bool,
    idle_timeout: Option<Duration>,
}

impl<S, F> Decoder<S, F>
where
    F: FnMut(&str) -> RagResult<Frame>,
{
    fn feed_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        match (self.parse)(payload) {
            Ok(Frame::Text(text)) => {
                if !text.is_empty() {
                    self.pending.push_back(text);
                }
            }
            Ok(Frame::Skip) => {}
            Ok(Frame::Done) => {
                self.completed = true;
                self.finished = true;
            }
            Err(e) => {
                self.error = Some(e);
                self.finished = true;
            }
        }
    }

    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.feed_line(&line);
        }
    }
}

/// Decode an SSE body into text fragments.
///
/// Yields fragments in order. A transport error, a parser error, a read gap
/// longer than `idle_timeout`, or (when `require_terminator` is set) a body
/// that ends before [`Frame::Done`] produces one final `Err` item. Dropping
/// the returned stream drops `body`.
pub fn decode<S, B, E, F>(
    body: S,
    parse: F,
    require_terminator: bool,
    idle_timeout: Option<Duration>,
) -> BoxStream<'static, RagResult<String>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
    F: FnMut(&str) -> RagResult<Frame> + Send + 'static,
{
    let decoder = Decoder {
        body: Box::pin(body),
        parse,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        error: None,
        completed: false,
        finished: false,
        idle_timeout,
    };

    stream::unfold(decoder, move |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((Ok(text), st));
            }
            if let Some(err) = st.error.take() {
                return Some((Err(err), st));
            }
            if st.finished {
                return None;
            }

            let next = match st.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, st.body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        st.error = Some(RagError::Provider(format!(
                            "stream idle for more than {:?}",
                            idle
                        )));
                        st.finished = true;
                        continue;
                    }
                },
                None => st.body.next().await,
            };

            match next {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(bytes.as_ref());
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.error = Some(RagError::Provider(format!("stream interrupted: {}", e)));
                    st.finished = true;
                }
                None => {
                    if !st.buffer.is_empty() {
                        let rest = std::mem::take(&mut st.buffer);
                        st.feed_line(&rest);
                    }
                    if !st.completed && st.error.is_none() && require_terminator {
                        st.error = Some(RagError::Provider(
                            "stream ended before the completion marker".to_string(),
                        ));
                    }
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}
