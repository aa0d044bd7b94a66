//! Transport session and stream abstractions.
//!
//! The echo endpoint never implements the transport protocol itself. It
//! talks to a multiplexed session through the traits in this module:
//!
//! - `Stream`: one flow-controlled byte channel (read, write, fin)
//! - `Session`: stream admission, outgoing stream credit and datagrams
//! - `EventSource`: the readiness notifications the dispatcher reacts to
//!
//! All operations are non-blocking. Flow-control backpressure is reported
//! as `StreamError::Blocked`, never by blocking the caller.

pub mod memory;

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Application error code carried by RESET_STREAM and STOP_SENDING.
pub type StreamErrorCode = u32;

/// Application error code carried by a session close.
pub type SessionErrorCode = u32;

/// Unique identifier for a stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Check if this is a client-initiated stream.
    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    /// Check if this is a server-initiated stream.
    pub fn is_server_initiated(&self) -> bool {
        !self.is_client_initiated()
    }

    /// Check if this is a bidirectional stream.
    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }

    /// Check if this is a unidirectional stream.
    pub fn is_unidirectional(&self) -> bool {
        !self.is_bidirectional()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directionality of a stream as seen from this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Both ends read and write.
    Bidirectional,
    /// Opened by the peer; this endpoint only reads.
    IncomingUnidirectional,
    /// Opened by this endpoint; this endpoint only writes.
    OutgoingUnidirectional,
}

impl StreamKind {
    /// Whether this endpoint may read from the stream.
    pub fn can_read(self) -> bool {
        !matches!(self, StreamKind::OutgoingUnidirectional)
    }

    /// Whether this endpoint may write to the stream.
    pub fn can_write(self) -> bool {
        !matches!(self, StreamKind::IncomingUnidirectional)
    }
}

/// Outcome of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadResult {
    /// Bytes appended to the caller's buffer.
    pub bytes_read: usize,
    /// The peer's final marker has been consumed.
    pub fin: bool,
}

/// Errors returned by stream writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Flow-control credit is exhausted; retry on the next writable event.
    #[error("stream is not currently accepting data")]
    Blocked,

    /// The stream has no write side at this endpoint.
    #[error("stream {0} is not writable")]
    NotWritable(StreamId),

    /// The peer asked us to stop sending; the write side is gone.
    #[error("stream {0} write side is closed")]
    WriteClosed(StreamId),

    /// The final marker was already sent.
    #[error("stream {0} already sent its final marker")]
    FinAlreadySent(StreamId),
}

impl StreamError {
    /// Backpressure rather than a failure.
    pub fn is_blocked(&self) -> bool {
        matches!(self, StreamError::Blocked)
    }
}

/// Outcome of a best-effort datagram send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramStatus {
    /// Sent or queued by the transport.
    Sent,
    /// Larger than the session's maximum datagram size; dropped.
    TooLarge,
    /// The session is gone; dropped.
    SessionClosed,
}

/// One multiplexed stream, lent to a visitor for the duration of a call.
pub trait Stream {
    /// Transport-assigned identifier.
    fn id(&self) -> StreamId;

    /// Directionality from this endpoint's point of view.
    fn kind(&self) -> StreamKind;

    /// Append every currently readable byte to `buf`.
    fn read(&mut self, buf: &mut BytesMut) -> ReadResult;

    /// Write a prefix of `data`, returning how many bytes were accepted.
    ///
    /// Accepting fewer bytes than offered (including zero) is backpressure,
    /// not an error.
    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError>;

    /// Send the final marker on the write side.
    fn send_fin(&mut self) -> Result<(), StreamError>;
}

/// Write as much of `buf` as the stream accepts.
///
/// `buf` is advanced by exactly the accepted prefix, so the unwritten
/// suffix stays in place for the next writable notification. Returns
/// `StreamError::Blocked` when anything remains.
pub fn write_into_stream<B: Buf>(stream: &mut dyn Stream, buf: &mut B) -> Result<(), StreamError> {
    while buf.has_remaining() {
        let written = stream.write(buf.chunk())?;
        if written == 0 {
            return Err(StreamError::Blocked);
        }
        buf.advance(written);
    }
    Ok(())
}

/// A transport session, lent to the session visitor for the duration of a call.
pub trait Session {
    /// Next peer-opened bidirectional stream, if any.
    fn accept_incoming_bidirectional_stream(&mut self) -> Option<StreamId>;

    /// Next peer-opened unidirectional stream, if any.
    fn accept_incoming_unidirectional_stream(&mut self) -> Option<StreamId>;

    /// Open an outgoing bidirectional stream; `None` without credit.
    fn open_outgoing_bidirectional_stream(&mut self) -> Option<StreamId>;

    /// Open an outgoing unidirectional stream; `None` without credit.
    fn open_outgoing_unidirectional_stream(&mut self) -> Option<StreamId>;

    fn can_open_outgoing_bidirectional_stream(&self) -> bool;

    fn can_open_outgoing_unidirectional_stream(&self) -> bool;

    /// Best-effort datagram send. Never retried by the caller.
    fn send_or_queue_datagram(&mut self, data: Bytes) -> DatagramStatus;

    /// Live handle for `id`, or `None` once the transport destroyed it.
    fn stream(&mut self, id: StreamId) -> Option<&mut dyn Stream>;
}

/// Notifications delivered by the transport's dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established and usable.
    SessionReady,

    /// Session terminated; every stream is gone.
    SessionClosed {
        code: SessionErrorCode,
        message: String,
    },

    /// At least one peer bidirectional stream is waiting to be accepted.
    IncomingBidirectionalStreamAvailable,

    /// At least one peer unidirectional stream is waiting to be accepted.
    IncomingUnidirectionalStreamAvailable,

    /// Datagram received (unreliable, unordered).
    DatagramReceived(Bytes),

    /// Credit for a new outgoing bidirectional stream is available.
    CanCreateNewOutgoingBidirectionalStream,

    /// Credit for a new outgoing unidirectional stream is available.
    CanCreateNewOutgoingUnidirectionalStream,

    /// New data (or the final marker) can be read.
    StreamReadable(StreamId),

    /// The stream can accept more data.
    StreamWritable(StreamId),

    /// The peer abruptly terminated its write side.
    ResetStreamReceived {
        stream_id: StreamId,
        code: StreamErrorCode,
    },

    /// The peer no longer wants data on our write side.
    StopSendingReceived {
        stream_id: StreamId,
        code: StreamErrorCode,
    },

    /// Everything we wrote, including the fin, was acknowledged.
    WriteSideInDataRecvdState(StreamId),

    /// Terminal: the stream handle is about to be destroyed.
    StreamClosed(StreamId),
}

/// Source of transport notifications, polled by the dispatcher.
pub trait EventSource {
    fn poll_event(&mut self) -> Option<TransportEvent>;
}
