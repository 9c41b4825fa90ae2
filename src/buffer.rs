//! Append-only generation buffer shared between one producer and any number of readers.
//!
//! The producer never waits on readers. Each reader keeps its own cursor and is
//! woken through a `watch` channel. A retry truncates the buffer back to the start
//! of the stage; readers positioned past that point receive a `Rewind`.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::llm::Frame;

#[derive(Debug, Default)]
struct State {
    text: String,
    /// Byte offsets the buffer was truncated to, in order.
    truncations: Vec<usize>,
    closed: bool,
}

#[derive(Clone)]
pub struct StreamBuffer {
    state: Arc<RwLock<State>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            version: Arc::new(version),
        }
    }

    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.state.write().unwrap_or_else(PoisonError::into_inner).text.push_str(text);
        self.bump();
    }

    /// Length in bytes; also the mark for a later [`Self::truncate`].
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> String {
        self.state.read().unwrap_or_else(PoisonError::into_inner).text.clone()
    }

    pub fn slice_from(&self, mark: usize) -> String {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.text.get(mark..).unwrap_or_default().to_string()
    }

    /// Drop everything after `mark`.
    pub fn truncate(&self, mark: usize) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if mark >= state.text.len() {
                return;
            }
            state.text.truncate(mark);
            state.truncations.push(mark);
        }
        self.bump();
    }

    /// No more text will be appended; readers finish once they have drained it.
    pub fn close(&self) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.bump();
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// A reader starting at the beginning of the buffer.
    pub fn reader(&self) -> BufferReader {
        BufferReader {
            state: self.state.clone(),
            version: self.version.subscribe(),
            cursor: 0,
            seen_truncations: 0,
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Text(String),
    /// The buffer was reset; discard everything after byte offset `to`.
    Rewind { to: usize },
}

pub struct BufferReader {
    state: Arc<RwLock<State>>,
    version: watch::Receiver<u64>,
    cursor: usize,
    seen_truncations: usize,
}

impl BufferReader {
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Next unread text, or `None` once the buffer is closed and fully read.
    pub async fn next(&mut self) -> Option<ReaderEvent> {
        loop {
            self.version.borrow_and_update();
            if let Some(event) = self.poll() {
                return Some(event);
            }
            if self.state.read().unwrap_or_else(PoisonError::into_inner).closed {
                return None;
            }
            if self.version.changed().await.is_err() {
                return self.poll();
            }
        }
    }

    fn poll(&mut self) -> Option<ReaderEvent> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        if state.truncations.len() > self.seen_truncations {
            let lowest = state.truncations[self.seen_truncations..].iter().copied().min().unwrap_or(self.cursor);
            self.seen_truncations = state.truncations.len();
            if lowest < self.cursor {
                self.cursor = lowest;
                return Some(ReaderEvent::Rewind { to: lowest });
            }
        }

        if state.text.len() > self.cursor {
            let text = state.text[self.cursor..].to_string();
            self.cursor = state.text.len();
            return Some(ReaderEvent::Text(text));
        }
        None
    }
}

/// Reassembles frames into sequence order before they reach the buffer.
#[derive(Debug)]
pub struct Resequencer {
    next: u64,
    parked: BTreeMap<u64, String>,
}

impl Default for Resequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Resequencer {
    pub fn new() -> Self {
        Self {
            next: 1,
            parked: BTreeMap::new(),
        }
    }

    /// Accept a frame; returns the text that is now contiguous, if any.
    pub fn push(&mut self, frame: Frame) -> Option<String> {
        if frame.seq < self.next || self.parked.contains_key(&frame.seq) {
            warn!(seq = frame.seq, "duplicate frame dropped");
            return None;
        }
        self.parked.insert(frame.seq, frame.text);

        let mut ready = String::new();
        while let Some(text) = self.parked.remove(&self.next) {
            ready.push_str(&text);
            self.next += 1;
        }
        (!ready.is_empty()).then_some(ready)
    }

    /// Release whatever is still parked, in sequence order, skipping gaps.
    pub fn flush(&mut self) -> Option<String> {
        if self.parked.is_empty() {
            return None;
        }
        warn!(expected = self.next, parked = self.parked.len(), "stream ended with missing frames");
        let parked = std::mem::take(&mut self.parked);
        if let Some(last) = parked.keys().next_back() {
            self.next = last + 1;
        }
        Some(parked.into_values().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reveal {
    Text(String),
    Rewind { to: usize },
}

/// Consumer-side pacing: reveals buffered text a few characters per tick.
pub struct Typewriter {
    reader: BufferReader,
    chars_per_tick: usize,
    interval: Duration,
    pending: String,
    revealed: usize,
    drained: bool,
}

impl Typewriter {
    pub fn new(reader: BufferReader, chars_per_tick: usize, interval: Duration) -> Self {
        Self {
            reader,
            chars_per_tick: chars_per_tick.max(1),
            interval,
            pending: String::new(),
            revealed: 0,
            drained: false,
        }
    }

    /// Bytes revealed so far.
    pub fn revealed(&self) -> usize {
        self.revealed
    }

    pub async fn next(&mut self) -> Option<Reveal> {
        if self.pending.is_empty() && !self.drained {
            match self.reader.next().await {
                Some(ReaderEvent::Text(text)) => self.pending = text,
                Some(ReaderEvent::Rewind { to }) => {
                    self.pending.clear();
                    self.revealed = to;
                    return Some(Reveal::Rewind { to });
                }
                None => self.drained = true,
            }
        }
        if self.pending.is_empty() {
            return None;
        }

        tokio::time::sleep(self.interval).await;
        let split = self
            .pending
            .char_indices()
            .nth(self.chars_per_tick)
            .map_or(self.pending.len(), |(i, _)| i);
        let rest = self.pending.split_off(split);
        let piece = std::mem::replace(&mut self.pending, rest);
        self.revealed += piece.len();
        Some(Reveal::Text(piece))
    }
}
