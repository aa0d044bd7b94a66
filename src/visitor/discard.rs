//! Visitor that drops everything it reads.

use super::{ReadCompletion, StreamVisitor};
use crate::transport::{Stream, StreamErrorCode};
use bytes::BytesMut;
use tracing::trace;

/// Drains incoming data without retaining it. Never writes.
#[derive(Debug, Default)]
pub struct DiscardVisitor;

impl DiscardVisitor {
    pub fn new() -> Self {
        Self
    }
}

impl StreamVisitor for DiscardVisitor {
    fn on_can_read(&mut self, stream: &mut dyn Stream) -> Option<ReadCompletion> {
        let mut scratch = BytesMut::new();
        let result = stream.read(&mut scratch);
        trace!(
            stream_id = %stream.id(),
            bytes = result.bytes_read,
            fin = result.fin,
            "Discarded stream data"
        );
        None
    }

    fn on_can_write(&mut self, _stream: &mut dyn Stream) {}

    fn on_reset_stream_received(&mut self, _stream: &mut dyn Stream, _code: StreamErrorCode) {}

    fn on_stop_sending_received(&mut self, _stream: &mut dyn Stream, _code: StreamErrorCode) {}

    fn on_write_side_in_data_recvd_state(&mut self, _stream: &mut dyn Stream) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visitor::testing::ScriptedStream;

    #[test]
    fn test_discard_drains_without_writing() {
        let mut stream = ScriptedStream::bidirectional();
        stream.push_fin(b"ignored payload");
        let mut visitor = DiscardVisitor::new();

        assert!(visitor.on_can_read(&mut stream).is_none());
        assert!(stream.inbound.is_empty());

        visitor.on_can_write(&mut stream);
        visitor.on_reset_stream_received(&mut stream, 1);
        visitor.on_stop_sending_received(&mut stream, 2);
        visitor.on_write_side_in_data_recvd_state(&mut stream);

        assert_eq!(stream.write_calls, 0);
        assert_eq!(stream.fin_calls, 0);
    }
}
