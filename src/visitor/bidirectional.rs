//! Bidirectional echo visitor.
//!
//! Everything read from the stream is written back on the same stream.
//! The fin is echoed once all buffered data has been flushed.
//!
//! ## Backpressure
//!
//! A write may accept only a prefix of the buffer. The unwritten suffix
//! stays buffered and is retried on the next writable notification, so no
//! byte is ever dropped or written twice.
//!
//! ## Termination
//!
//! - RESET_STREAM from the peer is answered with a fin, not a reset: the
//!   write side finishes cleanly while the read side was aborted.
//! - STOP_SENDING from the peer suppresses every later write.

use super::{ReadCompletion, StreamVisitor};
use crate::transport::{write_into_stream, Stream, StreamErrorCode};
use bytes::BytesMut;
use tracing::{debug, trace};

/// Observable progress of the write side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoState {
    /// Nothing buffered, no fin pending.
    Idle,
    /// Data buffered, peer still sending.
    Buffering,
    /// Data buffered and the fin must follow it.
    Draining,
    /// Buffer flushed, fin not yet accepted by the stream.
    FinPending,
    /// Fin sent, or the peer stopped us from sending.
    ClosedOut,
}

/// Echoes a bidirectional stream back to its sender.
#[derive(Debug, Default)]
pub struct BidirectionalEchoVisitor {
    buffer: BytesMut,
    send_fin: bool,
    fin_sent: bool,
    stop_sending_received: bool,
}

impl BidirectionalEchoVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write-side state.
    pub fn state(&self) -> EchoState {
        if self.fin_sent || self.stop_sending_received {
            EchoState::ClosedOut
        } else if self.buffer.is_empty() {
            if self.send_fin {
                EchoState::FinPending
            } else {
                EchoState::Idle
            }
        } else if self.send_fin {
            EchoState::Draining
        } else {
            EchoState::Buffering
        }
    }

    /// Bytes read but not yet written back.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

impl StreamVisitor for BidirectionalEchoVisitor {
    fn on_can_read(&mut self, stream: &mut dyn Stream) -> Option<ReadCompletion> {
        let result = stream.read(&mut self.buffer);
        debug!(
            stream_id = %stream.id(),
            bytes = result.bytes_read,
            fin = result.fin,
            buffered = self.buffer.len(),
            "Read on bidirectional stream"
        );
        if result.fin {
            self.send_fin = true;
        }
        self.on_can_write(stream);
        None
    }

    fn on_can_write(&mut self, stream: &mut dyn Stream) {
        if self.stop_sending_received {
            return;
        }

        if !self.buffer.is_empty() {
            if let Err(e) = write_into_stream(stream, &mut self.buffer) {
                if e.is_blocked() {
                    trace!(
                        stream_id = %stream.id(),
                        remaining = self.buffer.len(),
                        "Bidirectional echo blocked"
                    );
                } else {
                    debug!(stream_id = %stream.id(), error = %e, "Bidirectional echo write failed");
                }
                return;
            }
            debug!(stream_id = %stream.id(), "Flushed bidirectional echo");
        }

        if self.send_fin && !self.fin_sent {
            match stream.send_fin() {
                Ok(()) => {
                    self.fin_sent = true;
                    debug!(stream_id = %stream.id(), "Sent fin on bidirectional stream");
                }
                Err(e) => {
                    debug!(stream_id = %stream.id(), error = %e, "Failed to send fin");
                }
            }
        }
    }

    fn on_reset_stream_received(&mut self, stream: &mut dyn Stream, code: StreamErrorCode) {
        debug!(stream_id = %stream.id(), code, "Reset received, finishing write side");
        self.send_fin = true;
        self.on_can_write(stream);
    }

    fn on_stop_sending_received(&mut self, stream: &mut dyn Stream, code: StreamErrorCode) {
        debug!(stream_id = %stream.id(), code, "Stop sending received");
        self.stop_sending_received = true;
    }

    fn on_write_side_in_data_recvd_state(&mut self, _stream: &mut dyn Stream) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visitor::testing::ScriptedStream;

    #[test]
    fn test_echo_with_fin() {
        let mut stream = ScriptedStream::bidirectional();
        let mut visitor = BidirectionalEchoVisitor::new();

        stream.push(b"hello ");
        assert!(visitor.on_can_read(&mut stream).is_none());
        assert_eq!(visitor.state(), EchoState::Idle);

        stream.push_fin(b"world");
        visitor.on_can_read(&mut stream);

        assert_eq!(stream.written, b"hello world");
        assert!(stream.fin_sent);
        assert_eq!(visitor.state(), EchoState::ClosedOut);
    }

    #[test]
    fn test_partial_write_keeps_suffix() {
        let mut stream = ScriptedStream::bidirectional();
        stream.window = Some(4);
        let mut visitor = BidirectionalEchoVisitor::new();

        stream.push(b"ABCDEFGH");
        visitor.on_can_read(&mut stream);

        assert_eq!(stream.written, b"ABCD");
        assert_eq!(visitor.pending(), b"EFGH");
        assert_eq!(visitor.state(), EchoState::Buffering);

        stream.window = None;
        visitor.on_can_write(&mut stream);
        assert_eq!(stream.written, b"ABCDEFGH");
        assert_eq!(visitor.state(), EchoState::Idle);
    }

    #[test]
    fn test_fin_waits_for_flush_and_is_sent_once() {
        let mut stream = ScriptedStream::bidirectional();
        stream.window = Some(0);
        let mut visitor = BidirectionalEchoVisitor::new();

        stream.push_fin(b"abc");
        visitor.on_can_read(&mut stream);
        assert_eq!(visitor.state(), EchoState::Draining);
        assert_eq!(stream.fin_calls, 0);

        stream.window = None;
        visitor.on_can_write(&mut stream);
        visitor.on_can_write(&mut stream);
        visitor.on_can_write(&mut stream);

        assert_eq!(stream.written, b"abc");
        assert_eq!(stream.fin_calls, 1);
        assert_eq!(visitor.state(), EchoState::ClosedOut);
    }

    #[test]
    fn test_failed_fin_is_retried() {
        let mut stream = ScriptedStream::bidirectional();
        stream.fail_fin = true;
        let mut visitor = BidirectionalEchoVisitor::new();

        stream.push_fin(b"");
        visitor.on_can_read(&mut stream);
        assert_eq!(visitor.state(), EchoState::FinPending);

        stream.fail_fin = false;
        visitor.on_can_write(&mut stream);
        assert!(stream.fin_sent);
        assert_eq!(visitor.state(), EchoState::ClosedOut);
    }

    #[test]
    fn test_reset_is_answered_with_single_fin() {
        let mut stream = ScriptedStream::bidirectional();
        let mut visitor = BidirectionalEchoVisitor::new();

        visitor.on_reset_stream_received(&mut stream, 42);
        assert!(stream.fin_sent);
        assert_eq!(stream.fin_calls, 1);

        visitor.on_can_write(&mut stream);
        visitor.on_can_write(&mut stream);
        assert_eq!(stream.fin_calls, 1);
        assert_eq!(stream.write_calls, 0);
        assert!(stream.written.is_empty());
    }

    #[test]
    fn test_stop_sending_suppresses_writes() {
        let mut stream = ScriptedStream::bidirectional();
        stream.window = Some(0);
        let mut visitor = BidirectionalEchoVisitor::new();

        stream.push_fin(b"never echoed");
        visitor.on_can_read(&mut stream);
        let attempts = stream.write_calls;

        visitor.on_stop_sending_received(&mut stream, 3);
        assert_eq!(visitor.state(), EchoState::ClosedOut);

        stream.window = None;
        for _ in 0..3 {
            visitor.on_can_write(&mut stream);
        }

        assert_eq!(stream.write_calls, attempts);
        assert_eq!(stream.fin_calls, 0);
        assert!(stream.written.is_empty());
        assert_eq!(visitor.pending(), b"never echoed");
    }

    #[test]
    fn test_chunked_echo_fidelity_property() {
        use proptest::collection::vec;
        use proptest::prelude::*;

        proptest!(|(
            data in vec(any::<u8>(), 0..512),
            cuts in vec(0usize..512, 0..8),
            windows in vec(0usize..64, 1..16)
        )| {
            let mut cuts = cuts;
            cuts.retain(|&cut| cut <= data.len());
            cuts.sort_unstable();

            let mut stream = ScriptedStream::bidirectional();
            let mut visitor = BidirectionalEchoVisitor::new();
            let mut windows = windows.iter().cycle();

            let mut start = 0;
            for &cut in &cuts {
                stream.push(&data[start..cut]);
                stream.window = windows.next().copied();
                visitor.on_can_read(&mut stream);
                start = cut;
            }
            stream.push_fin(&data[start..]);
            stream.window = windows.next().copied();
            visitor.on_can_read(&mut stream);

            stream.window = None;
            visitor.on_can_write(&mut stream);
            visitor.on_can_write(&mut stream);

            assert_eq!(&stream.written, &data);
            assert!(stream.fin_sent);
            assert_eq!(stream.fin_calls, 1);
        });
    }
}
