//! In-memory loopback transport.
//!
//! A deterministic, single-threaded `Session` whose peer is driven
//! directly through method calls. Used by the test suite and by the
//! loopback run of the binary.
//!
//! ## Credit Model
//!
//! - Each stream has a byte send window. Writes accept at most the
//!   remaining window; `grant_stream_window` raises it and queues a
//!   writable notification.
//! - Outgoing streams are limited per directionality. `grant_outgoing_*`
//!   raises the limit and queues the matching capacity notification.
//!
//! ## Stream Lifecycle
//!
//! A stream is finished once its read side consumed the fin (or was reset)
//! and its write side sent the fin (or got STOP_SENDING). When the event
//! queue runs dry the session sweeps its streams: a sent fin is
//! acknowledged with `WriteSideInDataRecvdState`, then a finished stream
//! gets `StreamClosed`. The handle is destroyed when that event is polled;
//! the bytes the endpoint wrote stay available through `transcript`.

use super::{
    DatagramStatus, EventSource, ReadResult, Session, SessionErrorCode, Stream, StreamError,
    StreamErrorCode, StreamId, StreamKind, TransportEvent,
};
use bytes::{Bytes, BytesMut};
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Limits applied by the loopback transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Initial byte send window of every stream.
    pub initial_stream_window: usize,
    /// Outgoing bidirectional streams the peer allows up front.
    pub outgoing_bidirectional_streams: u64,
    /// Outgoing unidirectional streams the peer allows up front.
    pub outgoing_unidirectional_streams: u64,
    /// Largest datagram the session will send.
    pub max_datagram_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            initial_stream_window: 64 * 1024,
            outgoing_bidirectional_streams: 1,
            outgoing_unidirectional_streams: 16,
            max_datagram_size: 1200,
        }
    }
}

/// Everything the endpoint wrote on one stream, as the peer saw it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub data: BytesMut,
    pub fin: bool,
}

#[derive(Debug)]
struct MemoryStream {
    id: StreamId,
    kind: StreamKind,
    /// Peer data not yet read by the endpoint.
    inbound: BytesMut,
    inbound_fin: bool,
    fin_consumed: bool,
    reset: Option<StreamErrorCode>,
    stop_sending: Option<StreamErrorCode>,
    outbound: Transcript,
    send_window: usize,
    /// Handed to the endpoint (accepted or opened locally).
    accepted: bool,
    ack_queued: bool,
    close_queued: bool,
}

impl MemoryStream {
    fn new(id: StreamId, kind: StreamKind, send_window: usize, accepted: bool) -> Self {
        Self {
            id,
            kind,
            inbound: BytesMut::new(),
            inbound_fin: false,
            fin_consumed: false,
            reset: None,
            stop_sending: None,
            outbound: Transcript::default(),
            send_window,
            accepted,
            ack_queued: false,
            close_queued: false,
        }
    }

    fn read_finished(&self) -> bool {
        !self.kind.can_read() || self.fin_consumed || self.reset.is_some()
    }

    fn write_finished(&self) -> bool {
        !self.kind.can_write() || self.outbound.fin || self.stop_sending.is_some()
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        if !self.kind.can_write() {
            return Err(StreamError::NotWritable(self.id));
        }
        if self.stop_sending.is_some() {
            return Err(StreamError::WriteClosed(self.id));
        }
        if self.outbound.fin {
            return Err(StreamError::FinAlreadySent(self.id));
        }
        Ok(())
    }
}

impl Stream for MemoryStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn read(&mut self, buf: &mut BytesMut) -> ReadResult {
        if !self.kind.can_read() || self.reset.is_some() {
            return ReadResult::default();
        }

        let bytes_read = self.inbound.len();
        buf.extend_from_slice(&self.inbound);
        self.inbound.clear();

        if self.inbound_fin {
            self.fin_consumed = true;
        }

        ReadResult {
            bytes_read,
            fin: self.inbound_fin,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StreamError> {
        self.check_writable()?;

        let n = data.len().min(self.send_window);
        self.outbound.data.extend_from_slice(&data[..n]);
        self.send_window -= n;
        Ok(n)
    }

    fn send_fin(&mut self) -> Result<(), StreamError> {
        self.check_writable()?;
        self.outbound.fin = true;
        Ok(())
    }
}

/// Slab-backed stream storage with lookup by stream id.
///
/// Provides O(1) insert, lookup, and remove operations.
#[derive(Debug, Default)]
struct StreamTable {
    slots: Slab<MemoryStream>,
    index: HashMap<StreamId, usize>,
}

impl StreamTable {
    fn insert(&mut self, stream: MemoryStream) {
        let id = stream.id;
        let key = self.slots.insert(stream);
        self.index.insert(id, key);
    }

    fn get(&self, id: StreamId) -> Option<&MemoryStream> {
        self.index.get(&id).and_then(|&key| self.slots.get(key))
    }

    fn get_mut(&mut self, id: StreamId) -> Option<&mut MemoryStream> {
        let key = *self.index.get(&id)?;
        self.slots.get_mut(key)
    }

    fn remove(&mut self, id: StreamId) -> Option<MemoryStream> {
        let key = self.index.remove(&id)?;
        self.slots.try_remove(key)
    }

    fn drain(&mut self) -> impl Iterator<Item = MemoryStream> + '_ {
        self.index.clear();
        self.slots.drain()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// In-memory session with a scriptable peer.
pub struct MemorySession {
    settings: TransportSettings,
    streams: StreamTable,
    /// Transcripts of streams whose handles were destroyed.
    finished: HashMap<StreamId, Transcript>,
    events: VecDeque<TransportEvent>,
    pending_bidirectional: VecDeque<StreamId>,
    pending_unidirectional: VecDeque<StreamId>,
    next_peer_bidirectional: u64,
    next_peer_unidirectional: u64,
    next_local_bidirectional: u64,
    next_local_unidirectional: u64,
    bidirectional_credit: u64,
    unidirectional_credit: u64,
    opened_bidirectional: Vec<StreamId>,
    opened_unidirectional: Vec<StreamId>,
    datagrams: Vec<Bytes>,
    closed: bool,
}

impl MemorySession {
    /// Create a session with the given limits. Nothing is queued until
    /// `establish` is called.
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            bidirectional_credit: settings.outgoing_bidirectional_streams,
            unidirectional_credit: settings.outgoing_unidirectional_streams,
            settings,
            streams: StreamTable::default(),
            finished: HashMap::new(),
            events: VecDeque::new(),
            pending_bidirectional: VecDeque::new(),
            pending_unidirectional: VecDeque::new(),
            next_peer_bidirectional: 0,
            next_peer_unidirectional: 0,
            next_local_bidirectional: 0,
            next_local_unidirectional: 0,
            opened_bidirectional: Vec::new(),
            opened_unidirectional: Vec::new(),
            datagrams: Vec::new(),
            closed: false,
        }
    }

    /// Queue the session-ready notification.
    pub fn establish(&mut self) {
        debug!("Loopback session established");
        self.events.push_back(TransportEvent::SessionReady);
    }

    /// Peer opens a bidirectional stream.
    pub fn peer_open_bidirectional(&mut self) -> StreamId {
        let id = StreamId(self.next_peer_bidirectional << 2);
        self.next_peer_bidirectional += 1;
        if !self.closed {
            let window = self.settings.initial_stream_window;
            self.streams
                .insert(MemoryStream::new(id, StreamKind::Bidirectional, window, false));
            self.pending_bidirectional.push_back(id);
            self.events
                .push_back(TransportEvent::IncomingBidirectionalStreamAvailable);
        }
        id
    }

    /// Peer opens a unidirectional stream.
    pub fn peer_open_unidirectional(&mut self) -> StreamId {
        let id = StreamId((self.next_peer_unidirectional << 2) | 0x2);
        self.next_peer_unidirectional += 1;
        if !self.closed {
            self.streams.insert(MemoryStream::new(
                id,
                StreamKind::IncomingUnidirectional,
                0,
                false,
            ));
            self.pending_unidirectional.push_back(id);
            self.events
                .push_back(TransportEvent::IncomingUnidirectionalStreamAvailable);
        }
        id
    }

    /// Peer sends `data` (and optionally its fin) on a stream it can write.
    ///
    /// Returns false if the stream is gone or has no peer write side.
    pub fn peer_send(&mut self, id: StreamId, data: &[u8], fin: bool) -> bool {
        let Some(stream) = self.streams.get_mut(id) else {
            trace!(stream_id = %id, "Peer send on unknown stream");
            return false;
        };
        if !stream.kind.can_read() || stream.inbound_fin || stream.reset.is_some() {
            return false;
        }

        stream.inbound.extend_from_slice(data);
        stream.inbound_fin = fin;
        if stream.accepted {
            self.events.push_back(TransportEvent::StreamReadable(id));
        }
        true
    }

    /// Peer resets its write side, discarding unread data.
    pub fn peer_reset(&mut self, id: StreamId, code: StreamErrorCode) -> bool {
        let Some(stream) = self.streams.get_mut(id) else {
            return false;
        };
        if !stream.kind.can_read() || stream.fin_consumed || stream.reset.is_some() {
            return false;
        }

        stream.reset = Some(code);
        stream.inbound.clear();
        if stream.accepted {
            self.events.push_back(TransportEvent::ResetStreamReceived {
                stream_id: id,
                code,
            });
        }
        true
    }

    /// Peer sends STOP_SENDING for our write side.
    pub fn peer_stop_sending(&mut self, id: StreamId, code: StreamErrorCode) -> bool {
        let Some(stream) = self.streams.get_mut(id) else {
            return false;
        };
        if !stream.kind.can_write() || stream.stop_sending.is_some() {
            return false;
        }

        stream.stop_sending = Some(code);
        if stream.accepted {
            self.events.push_back(TransportEvent::StopSendingReceived {
                stream_id: id,
                code,
            });
        }
        true
    }

    /// Peer sends a datagram.
    pub fn peer_send_datagram(&mut self, data: impl Into<Bytes>) {
        if !self.closed {
            self.events
                .push_back(TransportEvent::DatagramReceived(data.into()));
        }
    }

    /// Peer extends the byte send window of a stream.
    pub fn grant_stream_window(&mut self, id: StreamId, bytes: usize) -> bool {
        let Some(stream) = self.streams.get_mut(id) else {
            return false;
        };
        stream.send_window += bytes;
        if stream.accepted && stream.kind.can_write() && !stream.write_finished() {
            self.events.push_back(TransportEvent::StreamWritable(id));
        }
        true
    }

    /// Peer allows `count` more outgoing bidirectional streams.
    pub fn grant_outgoing_bidirectional_streams(&mut self, count: u64) {
        if self.closed || count == 0 {
            return;
        }
        self.bidirectional_credit += count;
        self.events
            .push_back(TransportEvent::CanCreateNewOutgoingBidirectionalStream);
    }

    /// Peer allows `count` more outgoing unidirectional streams.
    pub fn grant_outgoing_unidirectional_streams(&mut self, count: u64) {
        if self.closed || count == 0 {
            return;
        }
        self.unidirectional_credit += count;
        self.events
            .push_back(TransportEvent::CanCreateNewOutgoingUnidirectionalStream);
    }

    /// Terminate the session. Pending notifications are discarded and every
    /// stream handle is destroyed.
    pub fn close(&mut self, code: SessionErrorCode, message: impl Into<String>) {
        if self.closed {
            return;
        }
        self.closed = true;

        for stream in self.streams.drain() {
            self.finished.insert(stream.id, stream.outbound);
        }
        self.pending_bidirectional.clear();
        self.pending_unidirectional.clear();
        self.events.clear();
        self.events.push_back(TransportEvent::SessionClosed {
            code,
            message: message.into(),
        });
    }

    /// What the endpoint wrote on `id`, live or destroyed.
    pub fn transcript(&self, id: StreamId) -> Option<&Transcript> {
        self.streams
            .get(id)
            .map(|stream| &stream.outbound)
            .or_else(|| self.finished.get(&id))
    }

    /// Outgoing bidirectional streams, in open order.
    pub fn outgoing_bidirectional_streams(&self) -> &[StreamId] {
        &self.opened_bidirectional
    }

    /// Outgoing unidirectional streams, in open order.
    pub fn outgoing_unidirectional_streams(&self) -> &[StreamId] {
        &self.opened_unidirectional
    }

    /// Datagrams the endpoint sent.
    pub fn datagrams_sent(&self) -> &[Bytes] {
        &self.datagrams
    }

    /// Whether the handle for `id` still exists.
    pub fn is_live(&self, id: StreamId) -> bool {
        self.streams.get(id).is_some()
    }

    /// Number of live stream handles.
    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn sweep(&mut self) {
        for (_, stream) in self.streams.slots.iter_mut() {
            if !stream.accepted {
                continue;
            }
            if stream.outbound.fin && !stream.ack_queued {
                stream.ack_queued = true;
                self.events
                    .push_back(TransportEvent::WriteSideInDataRecvdState(stream.id));
            }
            if stream.read_finished() && stream.write_finished() && !stream.close_queued {
                stream.close_queued = true;
                self.events
                    .push_back(TransportEvent::StreamClosed(stream.id));
            }
        }
    }

    fn destroy(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.remove(id) {
            trace!(stream_id = %id, written = stream.outbound.data.len(), "Stream destroyed");
            self.finished.insert(id, stream.outbound);
        }
    }

    /// Hand a peer stream to the endpoint. Buffered data is picked up by
    /// the priming read; a reset or stop-sending that arrived earlier is
    /// replayed as its notification.
    fn accept(&mut self, id: StreamId) -> StreamId {
        let Some(stream) = self.streams.get_mut(id) else {
            return id;
        };
        stream.accepted = true;

        if let Some(code) = stream.reset {
            self.events
                .push_back(TransportEvent::ResetStreamReceived { stream_id: id, code });
        }
        if let Some(code) = stream.stop_sending {
            self.events
                .push_back(TransportEvent::StopSendingReceived { stream_id: id, code });
        }
        id
    }
}

impl Session for MemorySession {
    fn accept_incoming_bidirectional_stream(&mut self) -> Option<StreamId> {
        let id = self.pending_bidirectional.pop_front()?;
        Some(self.accept(id))
    }

    fn accept_incoming_unidirectional_stream(&mut self) -> Option<StreamId> {
        let id = self.pending_unidirectional.pop_front()?;
        Some(self.accept(id))
    }

    fn open_outgoing_bidirectional_stream(&mut self) -> Option<StreamId> {
        if !self.can_open_outgoing_bidirectional_stream() {
            return None;
        }
        self.bidirectional_credit -= 1;

        let id = StreamId((self.next_local_bidirectional << 2) | 0x1);
        self.next_local_bidirectional += 1;
        let window = self.settings.initial_stream_window;
        self.streams
            .insert(MemoryStream::new(id, StreamKind::Bidirectional, window, true));
        self.opened_bidirectional.push(id);
        Some(id)
    }

    fn open_outgoing_unidirectional_stream(&mut self) -> Option<StreamId> {
        if !self.can_open_outgoing_unidirectional_stream() {
            return None;
        }
        self.unidirectional_credit -= 1;

        let id = StreamId((self.next_local_unidirectional << 2) | 0x3);
        self.next_local_unidirectional += 1;
        let window = self.settings.initial_stream_window;
        self.streams.insert(MemoryStream::new(
            id,
            StreamKind::OutgoingUnidirectional,
            window,
            true,
        ));
        self.opened_unidirectional.push(id);
        Some(id)
    }

    fn can_open_outgoing_bidirectional_stream(&self) -> bool {
        !self.closed && self.bidirectional_credit > 0
    }

    fn can_open_outgoing_unidirectional_stream(&self) -> bool {
        !self.closed && self.unidirectional_credit > 0
    }

    fn send_or_queue_datagram(&mut self, data: Bytes) -> DatagramStatus {
        if self.closed {
            return DatagramStatus::SessionClosed;
        }
        if data.len() > self.settings.max_datagram_size {
            return DatagramStatus::TooLarge;
        }
        self.datagrams.push(data);
        DatagramStatus::Sent
    }

    fn stream(&mut self, id: StreamId) -> Option<&mut dyn Stream> {
        self.streams
            .get_mut(id)
            .map(|stream| stream as &mut dyn Stream)
    }
}

impl EventSource for MemorySession {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        if self.events.is_empty() && !self.closed {
            self.sweep();
        }

        let event = self.events.pop_front()?;
        if let TransportEvent::StreamClosed(id) = event {
            self.destroy(id);
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(session: &mut MemorySession) -> Vec<TransportEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    #[test]
    fn test_stream_numbering() {
        let mut session = MemorySession::new(TransportSettings::default());

        let peer_bidi = session.peer_open_bidirectional();
        let peer_uni = session.peer_open_unidirectional();
        let local_bidi = session.open_outgoing_bidirectional_stream().unwrap();
        let local_uni = session.open_outgoing_unidirectional_stream().unwrap();

        assert!(peer_bidi.is_client_initiated() && peer_bidi.is_bidirectional());
        assert!(peer_uni.is_client_initiated() && peer_uni.is_unidirectional());
        assert!(local_bidi.is_server_initiated() && local_bidi.is_bidirectional());
        assert!(local_uni.is_server_initiated() && local_uni.is_unidirectional());
    }

    #[test]
    fn test_outgoing_stream_credit() {
        let mut session = MemorySession::new(TransportSettings {
            outgoing_unidirectional_streams: 1,
            ..TransportSettings::default()
        });

        assert!(session.can_open_outgoing_unidirectional_stream());
        assert!(session.open_outgoing_unidirectional_stream().is_some());
        assert!(!session.can_open_outgoing_unidirectional_stream());
        assert!(session.open_outgoing_unidirectional_stream().is_none());

        session.grant_outgoing_unidirectional_streams(1);
        assert_eq!(
            session.poll_event(),
            Some(TransportEvent::CanCreateNewOutgoingUnidirectionalStream)
        );
        assert!(session.open_outgoing_unidirectional_stream().is_some());
        assert_eq!(session.outgoing_unidirectional_streams().len(), 2);
    }

    #[test]
    fn test_send_window_limits_writes() {
        let mut session = MemorySession::new(TransportSettings {
            initial_stream_window: 3,
            ..TransportSettings::default()
        });
        let id = session.open_outgoing_unidirectional_stream().unwrap();

        let stream = session.stream(id).unwrap();
        assert_eq!(stream.write(b"hello").unwrap(), 3);
        assert_eq!(stream.write(b"lo").unwrap(), 0);

        assert!(session.grant_stream_window(id, 10));
        assert_eq!(session.poll_event(), Some(TransportEvent::StreamWritable(id)));
        assert_eq!(session.stream(id).unwrap().write(b"lo").unwrap(), 2);
        assert_eq!(&session.transcript(id).unwrap().data[..], b"hello");
    }

    #[test]
    fn test_incoming_data_before_accept_is_buffered() {
        let mut session = MemorySession::new(TransportSettings::default());
        let id = session.peer_open_unidirectional();
        assert!(session.peer_send(id, b"early", true));

        // Only the availability notification, no readable event yet.
        assert_eq!(
            drain(&mut session),
            vec![TransportEvent::IncomingUnidirectionalStreamAvailable]
        );

        assert_eq!(session.accept_incoming_unidirectional_stream(), Some(id));
        let mut buf = BytesMut::new();
        let result = session.stream(id).unwrap().read(&mut buf);
        assert_eq!(result, ReadResult { bytes_read: 5, fin: true });
        assert_eq!(&buf[..], b"early");
    }

    #[test]
    fn test_finished_stream_is_acknowledged_then_destroyed() {
        let mut session = MemorySession::new(TransportSettings::default());
        let id = session.open_outgoing_unidirectional_stream().unwrap();

        let stream = session.stream(id).unwrap();
        stream.write(b"bye").unwrap();
        stream.send_fin().unwrap();
        assert_eq!(stream.send_fin(), Err(StreamError::FinAlreadySent(id)));

        assert_eq!(
            drain(&mut session),
            vec![
                TransportEvent::WriteSideInDataRecvdState(id),
                TransportEvent::StreamClosed(id),
            ]
        );
        assert!(!session.is_live(id));
        assert!(session.stream(id).is_none());

        let transcript = session.transcript(id).unwrap();
        assert_eq!(&transcript.data[..], b"bye");
        assert!(transcript.fin);
    }

    #[test]
    fn test_stop_sending_closes_write_side() {
        let mut session = MemorySession::new(TransportSettings::default());
        let id = session.open_outgoing_bidirectional_stream().unwrap();

        assert!(session.peer_stop_sending(id, 7));
        assert_eq!(
            session.poll_event(),
            Some(TransportEvent::StopSendingReceived { stream_id: id, code: 7 })
        );
        assert_eq!(
            session.stream(id).unwrap().write(b"x"),
            Err(StreamError::WriteClosed(id))
        );
    }

    #[test]
    fn test_termination_before_accept_is_replayed() {
        let mut session = MemorySession::new(TransportSettings::default());
        let id = session.peer_open_bidirectional();
        assert!(session.peer_reset(id, 5));
        assert!(session.peer_stop_sending(id, 6));

        assert_eq!(
            drain(&mut session),
            vec![TransportEvent::IncomingBidirectionalStreamAvailable]
        );

        assert_eq!(session.accept_incoming_bidirectional_stream(), Some(id));
        assert_eq!(
            session.poll_event(),
            Some(TransportEvent::ResetStreamReceived { stream_id: id, code: 5 })
        );
        assert_eq!(
            session.poll_event(),
            Some(TransportEvent::StopSendingReceived { stream_id: id, code: 6 })
        );
    }

    #[test]
    fn test_write_on_incoming_unidirectional_is_rejected() {
        let mut session = MemorySession::new(TransportSettings::default());
        let id = session.peer_open_unidirectional();
        session.accept_incoming_unidirectional_stream();

        assert_eq!(
            session.stream(id).unwrap().write(b"x"),
            Err(StreamError::NotWritable(id))
        );
    }

    #[test]
    fn test_datagram_limits() {
        let mut session = MemorySession::new(TransportSettings {
            max_datagram_size: 4,
            ..TransportSettings::default()
        });

        assert_eq!(
            session.send_or_queue_datagram(Bytes::from_static(b"ok")),
            DatagramStatus::Sent
        );
        assert_eq!(
            session.send_or_queue_datagram(Bytes::from_static(b"too long")),
            DatagramStatus::TooLarge
        );
        assert_eq!(session.datagrams_sent().len(), 1);
    }

    #[test]
    fn test_close_destroys_streams_and_discards_events() {
        let mut session = MemorySession::new(TransportSettings::default());
        let id = session.peer_open_bidirectional();
        session.peer_send_datagram(&b"ping"[..]);

        session.close(0, "done");

        assert!(session.is_closed());
        assert_eq!(session.live_streams(), 0);
        assert!(session.accept_incoming_bidirectional_stream().is_none());
        assert!(session.transcript(id).is_some());
        assert_eq!(
            drain(&mut session),
            vec![TransportEvent::SessionClosed {
                code: 0,
                message: "done".to_string(),
            }]
        );
        assert_eq!(
            session.send_or_queue_datagram(Bytes::from_static(b"x")),
            DatagramStatus::SessionClosed
        );
    }
}
