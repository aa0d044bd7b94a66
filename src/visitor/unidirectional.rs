//! Unidirectional echo visitors.
//!
//! An incoming unidirectional stream is buffered in full by
//! `UnidirectionalEchoReadVisitor`. Its payload is handed to the session
//! when the fin arrives, and the session later opens an outgoing stream
//! driven by `UnidirectionalEchoWriteVisitor` to send it back.

use super::{ReadCompletion, StreamVisitor};
use crate::transport::{write_into_stream, Stream, StreamErrorCode};
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Receiving,
    Completed,
    /// Payload cap exceeded; data is drained and dropped.
    Overflowed,
}

/// Buffers an incoming unidirectional stream and completes once with the
/// whole payload.
#[derive(Debug)]
pub struct UnidirectionalEchoReadVisitor {
    buffer: BytesMut,
    max_payload: Option<usize>,
    state: ReadState,
}

impl UnidirectionalEchoReadVisitor {
    /// Reader with no payload cap.
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Reader that gives up on payloads larger than `max_payload` bytes.
    pub fn with_limit(max_payload: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_payload,
            state: ReadState::Receiving,
        }
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReadState::Completed
    }
}

impl Default for UnidirectionalEchoReadVisitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamVisitor for UnidirectionalEchoReadVisitor {
    fn on_can_read(&mut self, stream: &mut dyn Stream) -> Option<ReadCompletion> {
        match self.state {
            ReadState::Receiving => {}
            ReadState::Completed => {
                trace!(stream_id = %stream.id(), "Read notification after completion");
                return None;
            }
            ReadState::Overflowed => {
                let mut scratch = BytesMut::new();
                stream.read(&mut scratch);
                return None;
            }
        }

        let result = stream.read(&mut self.buffer);
        debug!(
            stream_id = %stream.id(),
            bytes = result.bytes_read,
            buffered = self.buffer.len(),
            "Read on unidirectional stream"
        );

        if let Some(limit) = self.max_payload {
            if self.buffer.len() > limit {
                warn!(
                    stream_id = %stream.id(),
                    buffered = self.buffer.len(),
                    limit,
                    "Unidirectional payload too large, dropping echo"
                );
                self.buffer = BytesMut::new();
                self.state = ReadState::Overflowed;
                return None;
            }
        }

        if !result.fin {
            return None;
        }

        debug!(
            stream_id = %stream.id(),
            bytes = self.buffer.len(),
            "Finished receiving unidirectional stream, queueing echo"
        );
        self.state = ReadState::Completed;
        Some(ReadCompletion {
            stream_id: stream.id(),
            payload: std::mem::take(&mut self.buffer).freeze(),
        })
    }

    fn on_can_write(&mut self, stream: &mut dyn Stream) {
        unreachable!(
            "write notification on read-only unidirectional stream {}",
            stream.id()
        );
    }

    fn on_reset_stream_received(&mut self, _stream: &mut dyn Stream, _code: StreamErrorCode) {}

    fn on_stop_sending_received(&mut self, _stream: &mut dyn Stream, _code: StreamErrorCode) {}

    fn on_write_side_in_data_recvd_state(&mut self, _stream: &mut dyn Stream) {}
}

/// Sends one payload on a fresh outgoing unidirectional stream, then the fin.
#[derive(Debug)]
pub struct UnidirectionalEchoWriteVisitor {
    /// Unwritten suffix of the payload.
    payload: Bytes,
    fin_sent: bool,
}

impl UnidirectionalEchoWriteVisitor {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            fin_sent: false,
        }
    }

    /// Bytes still waiting for stream credit.
    pub fn remaining(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_finished(&self) -> bool {
        self.fin_sent
    }
}

impl StreamVisitor for UnidirectionalEchoWriteVisitor {
    fn on_can_read(&mut self, stream: &mut dyn Stream) -> Option<ReadCompletion> {
        unreachable!(
            "read notification on write-only unidirectional stream {}",
            stream.id()
        );
    }

    /// Write what the stream accepts; once nothing is left, send the fin.
    ///
    /// A payload that was empty from the start still gets its fin, so an
    /// empty incoming stream is echoed as an empty stream instead of an
    /// outgoing stream that never finishes.
    fn on_can_write(&mut self, stream: &mut dyn Stream) {
        if self.fin_sent {
            return;
        }

        if let Err(e) = write_into_stream(stream, &mut self.payload) {
            if !e.is_blocked() {
                warn!(stream_id = %stream.id(), error = %e, "Failed to write into stream");
            }
            return;
        }

        // Nothing is left unflushed, so the fin cannot be refused.
        let fin = stream.send_fin();
        self.fin_sent = true;
        debug!(stream_id = %stream.id(), "Finished sending unidirectional echo");

        if let Err(e) = &fin {
            error!(stream_id = %stream.id(), error = %e, "Transport refused fin after flush");
        }
        debug_assert!(fin.is_ok(), "fin refused on stream {}", stream.id());
    }

    fn on_reset_stream_received(&mut self, _stream: &mut dyn Stream, _code: StreamErrorCode) {}

    fn on_stop_sending_received(&mut self, _stream: &mut dyn Stream, _code: StreamErrorCode) {}

    fn on_write_side_in_data_recvd_state(&mut self, _stream: &mut dyn Stream) {}
}
