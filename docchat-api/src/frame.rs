//! Decoding of the chat stream body into application events
//!
//! The backend sends server-sent-event style frames:
//!
//! ```text
//! data: {"token": "Hi"}
//!
//! data: {"sources": [{"document": "a.pdf", "relevance": 0.8}], "done": true}
//!
//! ```
//!
//! Network chunks are not aligned to frames, so bytes are buffered until a
//! full line is available and lines are collected until the blank line that
//! closes the frame.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use crate::api::{Source, StreamPayload};
use crate::client::BoxedStream;

const DATA_PREFIX: &str = "data:";

/// A decoded stream event.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Fragment to append to the in-flight assistant message.
    Token(String),
    /// Citation list for the answer.
    Sources(Vec<Source>),
    /// Terminal: the stream failed.
    Error(String),
    /// Terminal: the stream completed, carrying the last sources seen.
    Done { sources: Option<Vec<Source>> },
}

/// Incremental frame decoder.
///
/// Produces exactly one terminal event over its lifetime; input after the
/// terminal event is ignored.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline
    scanned: usize,
    data_lines: Vec<String>,
    last_sources: Option<Vec<Source>>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one raw chunk and return the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            self.accept_line(line, &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        self.scanned = self.buffer.len();
        events
    }

    /// Signal end of input. Flushes a trailing frame that had no separator
    /// and produces the implicit completion if no terminal frame was seen.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            self.accept_line(&line, &mut events);
        }
        if !self.finished {
            self.dispatch_frame(&mut events);
        }
        if !self.finished {
            tracing::debug!("Stream ended without a terminal frame; treating as complete");
            self.finished = true;
            events.push(StreamEvent::Done {
                sources: self.last_sources.clone(),
            });
        }
        events
    }

    /// Signal a transport failure mid-stream.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.buffer.clear();
        self.scanned = 0;
        self.data_lines.clear();
        vec![StreamEvent::Error(message.into())]
    }

    fn accept_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            self.dispatch_frame(events);
            return;
        }
        // Comment lines (keep-alives)
        if line.starts_with(':') {
            return;
        }
        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            let data = data.strip_prefix(' ').unwrap_or(data);
            self.data_lines.push(data.to_string());
        }
        // Other SSE fields (event:, id:, retry:) carry nothing for us
    }

    fn dispatch_frame(&mut self, events: &mut Vec<StreamEvent>) {
        if self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();

        let trimmed = data.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed == "[DONE]" {
            self.finished = true;
            events.push(StreamEvent::Done {
                sources: self.last_sources.clone(),
            });
            return;
        }

        let payload = match serde_json::from_str::<StreamPayload>(trimmed) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(frame = trimmed, error = %e, "Skipping malformed stream frame");
                return;
            }
        };

        if let Some(sources) = payload.sources {
            let sources: Vec<Source> = sources.into_iter().map(Source::normalized).collect();
            self.last_sources = Some(sources.clone());
            events.push(StreamEvent::Sources(sources));
        }
        if let Some(token) = payload.token {
            if !token.is_empty() {
                events.push(StreamEvent::Token(token));
            }
        }
        if let Some(error) = payload.error {
            self.finished = true;
            events.push(StreamEvent::Error(error));
        } else if payload.done.unwrap_or(false) {
            self.finished = true;
            events.push(StreamEvent::Done {
                sources: self.last_sources.clone(),
            });
        }
    }
}

struct DecodeState<S> {
    chunks: Pin<Box<S>>,
    decoder: FrameDecoder,
    queued: VecDeque<StreamEvent>,
    exhausted: bool,
}

/// Turn a raw chunk stream into a lazy, finite event stream that always
/// ends with exactly one terminal event.
pub fn decode_stream<S, E>(chunks: S) -> BoxedStream<StreamEvent>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = DecodeState {
        chunks: Box::pin(chunks),
        decoder: FrameDecoder::new(),
        queued: VecDeque::new(),
        exhausted: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queued.pop_front() {
                return Some((event, state));
            }
            if state.exhausted {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(&bytes);
                    state.queued.extend(events);
                }
                Some(Err(e)) => {
                    let events = state.decoder.fail(e.to_string());
                    state.queued.extend(events);
                    state.exhausted = true;
                }
                None => {
                    let events = state.decoder.finish();
                    state.queued.extend(events);
                    state.exhausted = true;
                }
            }
            if state.decoder.is_finished() {
                state.exhausted = true;
            }
        }
    }))
}
