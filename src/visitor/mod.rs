//! Per-stream visitors.
//!
//! Exactly one visitor is bound to a stream when it is accepted or opened,
//! and it lives until the transport reports terminal closure. Visitors
//! never hold the stream handle: the dispatcher lends it for each call.
//!
//! ## Variants
//! - `DiscardVisitor`: drains and drops incoming data
//! - `BidirectionalEchoVisitor`: writes back what it reads on the same stream
//! - `UnidirectionalEchoReadVisitor`: buffers a whole incoming stream
//! - `UnidirectionalEchoWriteVisitor`: sends one payload and closes

mod bidirectional;
mod discard;
mod unidirectional;

pub use bidirectional::{BidirectionalEchoVisitor, EchoState};
pub use discard::DiscardVisitor;
pub use unidirectional::{UnidirectionalEchoReadVisitor, UnidirectionalEchoWriteVisitor};

use crate::transport::{Stream, StreamErrorCode, StreamId};
use bytes::Bytes;

/// A fully received unidirectional stream, waiting to be echoed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCompletion {
    /// Stream the payload arrived on.
    pub stream_id: StreamId,
    /// Every byte received before the fin.
    pub payload: Bytes,
}

/// Reactions to per-stream transport notifications.
pub trait StreamVisitor {
    /// Data or the fin can be read.
    ///
    /// Returns a completion when the visitor finished collecting a payload
    /// that the session should echo.
    fn on_can_read(&mut self, stream: &mut dyn Stream) -> Option<ReadCompletion>;

    /// The stream can accept more data.
    fn on_can_write(&mut self, stream: &mut dyn Stream);

    /// The peer reset its write side.
    fn on_reset_stream_received(&mut self, stream: &mut dyn Stream, code: StreamErrorCode);

    /// The peer no longer wants data on our write side.
    fn on_stop_sending_received(&mut self, stream: &mut dyn Stream, code: StreamErrorCode);

    /// All data we wrote, fin included, has been acknowledged.
    fn on_write_side_in_data_recvd_state(&mut self, stream: &mut dyn Stream);
}
