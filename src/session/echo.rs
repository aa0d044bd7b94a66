//! Echo session visitor.
//!
//! Admission policy for an echo endpoint:
//!
//! - Incoming bidirectional streams are echoed on the same stream (or
//!   discarded, if configured).
//! - Incoming unidirectional streams are buffered in full; each payload is
//!   sent back on a new outgoing unidirectional stream once stream credit
//!   allows, in completion order.
//! - Datagrams are answered with a fixed acknowledgment, best effort.
//! - One outgoing bidirectional echo stream is opened per session.

use super::{PendingEchoQueue, SessionContext, SessionVisitor};
use crate::transport::{DatagramStatus, SessionErrorCode};
use crate::visitor::{
    BidirectionalEchoVisitor, DiscardVisitor, ReadCompletion, StreamVisitor,
    UnidirectionalEchoReadVisitor, UnidirectionalEchoWriteVisitor,
};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Visitor bound to incoming bidirectional streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncomingBidirectional {
    #[default]
    Echo,
    Discard,
}

/// Behavior knobs of the echo session.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Reply sent for every received datagram.
    pub datagram_ack: Bytes,
    pub incoming_bidirectional: IncomingBidirectional,
    /// Open the single outgoing bidirectional echo stream.
    pub greeting_stream: bool,
    /// Cap on a buffered unidirectional payload; `None` is unbounded.
    pub max_unidirectional_payload: Option<usize>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            datagram_ack: Bytes::from_static(b"who am I"),
            incoming_bidirectional: IncomingBidirectional::Echo,
            greeting_stream: true,
            max_unidirectional_payload: None,
        }
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStats {
    pub bidirectional_accepted: u64,
    pub unidirectional_accepted: u64,
    pub unidirectional_echoes_opened: u64,
    pub datagrams_answered: u64,
    pub datagrams_dropped: u64,
}

/// Session visitor that wires every stream to an echo visitor.
#[derive(Debug)]
pub struct EchoSessionVisitor {
    options: EndpointOptions,
    echo_stream_opened: bool,
    streams_to_echo_back: PendingEchoQueue,
    stats: EchoStats,
}

impl EchoSessionVisitor {
    pub fn new(options: EndpointOptions) -> Self {
        Self {
            options,
            echo_stream_opened: false,
            streams_to_echo_back: PendingEchoQueue::new(),
            stats: EchoStats::default(),
        }
    }

    pub fn stats(&self) -> EchoStats {
        self.stats
    }

    /// Payloads still waiting for an outgoing stream.
    pub fn pending_echoes(&self) -> &PendingEchoQueue {
        &self.streams_to_echo_back
    }

    pub fn echo_stream_opened(&self) -> bool {
        self.echo_stream_opened
    }

    fn open_echo_stream(&mut self, ctx: &mut SessionContext<'_, '_>) {
        if self.echo_stream_opened || !self.options.greeting_stream {
            return;
        }

        let Some(stream_id) = ctx.session().open_outgoing_bidirectional_stream() else {
            debug!("No credit for the outgoing bidirectional echo stream");
            return;
        };
        self.echo_stream_opened = true;
        ctx.bind(stream_id, Box::new(BidirectionalEchoVisitor::new()));
        ctx.notify_can_write(stream_id);
        info!(stream_id = %stream_id, "Opened outgoing bidirectional echo stream");
    }

    /// Move queued payloads onto new outgoing streams while credit lasts.
    fn try_sending_unidirectional_streams(&mut self, ctx: &mut SessionContext<'_, '_>) {
        while !self.streams_to_echo_back.is_empty()
            && ctx.session().can_open_outgoing_unidirectional_stream()
        {
            let Some(payload) = self.streams_to_echo_back.pop_front() else {
                break;
            };
            let Some(stream_id) = ctx.session().open_outgoing_unidirectional_stream() else {
                warn!("Transport refused an outgoing unidirectional stream despite credit");
                self.streams_to_echo_back.push_front(payload);
                break;
            };

            debug!(
                stream_id = %stream_id,
                bytes = payload.len(),
                queued = self.streams_to_echo_back.len(),
                queued_bytes = self.streams_to_echo_back.queued_bytes(),
                "Echoing unidirectional stream back"
            );
            ctx.bind(
                stream_id,
                Box::new(UnidirectionalEchoWriteVisitor::new(payload)),
            );
            ctx.notify_can_write(stream_id);
            self.stats.unidirectional_echoes_opened += 1;
        }
    }
}

impl Default for EchoSessionVisitor {
    fn default() -> Self {
        Self::new(EndpointOptions::default())
    }
}

impl SessionVisitor for EchoSessionVisitor {
    fn on_session_ready(&mut self, ctx: &mut SessionContext<'_, '_>) {
        info!("Session ready");
        if ctx.session().can_open_outgoing_bidirectional_stream() {
            self.open_echo_stream(ctx);
        }
    }

    fn on_session_closed(&mut self, code: SessionErrorCode, message: &str) {
        info!(
            code,
            message,
            pending_echoes = self.streams_to_echo_back.len(),
            pending_bytes = self.streams_to_echo_back.queued_bytes(),
            peak_pending_echoes = self.streams_to_echo_back.high_water_mark(),
            "Session closed"
        );
    }

    fn on_incoming_bidirectional_stream_available(&mut self, ctx: &mut SessionContext<'_, '_>) {
        info!("Incoming bidirectional stream available");
        while let Some(stream_id) = ctx.session().accept_incoming_bidirectional_stream() {
            debug!(stream_id = %stream_id, "Accepted bidirectional stream");
            let visitor: Box<dyn StreamVisitor> = match self.options.incoming_bidirectional {
                IncomingBidirectional::Echo => Box::new(BidirectionalEchoVisitor::new()),
                IncomingBidirectional::Discard => Box::new(DiscardVisitor::new()),
            };
            ctx.bind(stream_id, visitor);
            self.stats.bidirectional_accepted += 1;
            ctx.notify_can_read(stream_id);
        }
    }

    fn on_incoming_unidirectional_stream_available(&mut self, ctx: &mut SessionContext<'_, '_>) {
        info!("Incoming unidirectional stream available");
        while let Some(stream_id) = ctx.session().accept_incoming_unidirectional_stream() {
            debug!(stream_id = %stream_id, "Accepted unidirectional stream");
            let limit = self.options.max_unidirectional_payload;
            ctx.bind(
                stream_id,
                Box::new(UnidirectionalEchoReadVisitor::with_limit(limit)),
            );
            self.stats.unidirectional_accepted += 1;
            if let Some(completion) = ctx.notify_can_read(stream_id) {
                self.on_unidirectional_payload(ctx, completion);
            }
        }
    }

    fn on_datagram_received(&mut self, ctx: &mut SessionContext<'_, '_>, datagram: &[u8]) {
        info!(bytes = datagram.len(), "Datagram received");
        let status = ctx
            .session()
            .send_or_queue_datagram(self.options.datagram_ack.clone());
        if status == DatagramStatus::Sent {
            self.stats.datagrams_answered += 1;
        } else {
            debug!(?status, "Datagram reply dropped");
            self.stats.datagrams_dropped += 1;
        }
    }

    fn on_can_create_new_outgoing_bidirectional_stream(
        &mut self,
        ctx: &mut SessionContext<'_, '_>,
    ) {
        self.open_echo_stream(ctx);
    }

    fn on_can_create_new_outgoing_unidirectional_stream(
        &mut self,
        ctx: &mut SessionContext<'_, '_>,
    ) {
        self.try_sending_unidirectional_streams(ctx);
    }

    fn on_unidirectional_payload(
        &mut self,
        ctx: &mut SessionContext<'_, '_>,
        completion: ReadCompletion,
    ) {
        debug!(
            stream_id = %completion.stream_id,
            bytes = completion.payload.len(),
            "Queueing unidirectional echo"
        );
        self.streams_to_echo_back.push_back(completion.payload);
        self.try_sending_unidirectional_streams(ctx);
    }
}
