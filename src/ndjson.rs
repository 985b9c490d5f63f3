//! Incremental NDJSON decoding for chunked HTTP bodies.
//!
//! Chunks may split lines, and multi-byte characters, at any byte offset.
//! Complete lines are parsed as they arrive; malformed lines are skipped.

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;

/// How a decode loop ended. Neither case is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Completed,
    Cancelled,
}

/// Line reassembly state for a single response body.
///
/// Build one per request. `finish` consumes the decoder, so a drained
/// decoder cannot be fed again.
pub struct NdjsonDecoder<T> {
    buffer: String,
    // Trailing bytes of a multi-byte character still waiting for the rest.
    pending: Vec<u8>,
    skipped: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> NdjsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            pending: Vec::new(),
            skipped: 0,
            _marker: PhantomData,
        }
    }

    /// Feeds one chunk and returns every value whose line is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<T> {
        // The carried-over tail never holds a newline, so only new text is searched.
        let scanned = self.buffer.len();
        self.decode_utf8(chunk);

        let Some(last_newline) = self.buffer[scanned..].rfind('\n') else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(scanned + last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);

        complete
            .split('\n')
            .filter_map(|line| self.parse_line(line))
            .collect()
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(mut self) -> Option<T> {
        let last = self.flush();
        tracing::debug!(skipped = self.skipped, "ndjson stream finished");
        last
    }

    /// Number of malformed lines dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn flush(&mut self) -> Option<T> {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.buffer.push(char::REPLACEMENT_CHARACTER);
        }
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(&rest)
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid = start + err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
    }

    fn parse_line(&mut self, line: &str) -> Option<T> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(err) => {
                self.skipped += 1;
                tracing::debug!(error = %err, len = line.len(), "skipping malformed ndjson line");
                None
            }
        }
    }
}

impl<T: DeserializeOwned> Default for NdjsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads `stream` to the end, handing each decoded value to `on_event` in
/// line order.
///
/// The stream is owned by the loop and dropped on every exit path. Firing
/// `cancel` ends the loop with [`DecodeOutcome::Cancelled`], even while a
/// read or an `on_event` call is pending; values still queued from the
/// current chunk are not delivered. Read errors are returned as-is.
pub async fn decode_stream<S, B, E, T, F, Fut>(
    stream: S,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<DecodeOutcome, E>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    T: DeserializeOwned,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = NdjsonDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(skipped = decoder.skipped(), "ndjson stream cancelled");
                return Ok(DecodeOutcome::Cancelled);
            }
            next = stream.next() => next,
        };

        let Some(chunk) = next else {
            break;
        };

        for event in decoder.push(chunk?.as_ref()) {
            if cancel.is_cancelled() || !dispatch(cancel, on_event(event)).await {
                return Ok(DecodeOutcome::Cancelled);
            }
        }
    }

    if let Some(event) = decoder.finish() {
        if cancel.is_cancelled() || !dispatch(cancel, on_event(event)).await {
            return Ok(DecodeOutcome::Cancelled);
        }
    }

    Ok(DecodeOutcome::Completed)
}

// Awaits one callback, giving up if the token fires first. False means
// cancelled.
async fn dispatch(cancel: &CancellationToken, delivery: impl Future<Output = ()>) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = delivery => true,
    }
}
