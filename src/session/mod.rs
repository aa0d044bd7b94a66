//! Session-level visitor and the context it acts through.
//!
//! The session visitor decides which stream visitor each new stream gets,
//! answers datagrams, and owns the queue of unidirectional payloads that
//! wait for an outgoing stream. It never touches stream visitors directly:
//! `SessionContext` binds them and forwards the priming notifications.

mod echo;
mod queue;

pub use echo::{EchoSessionVisitor, EchoStats, EndpointOptions, IncomingBidirectional};
pub use queue::PendingEchoQueue;

use crate::runtime::VisitorRegistry;
use crate::transport::{Session, SessionErrorCode, Stream, StreamId};
use crate::visitor::{ReadCompletion, StreamVisitor};
use tracing::trace;

/// Reactions to session-level transport notifications.
pub trait SessionVisitor {
    fn on_session_ready(&mut self, ctx: &mut SessionContext<'_, '_>);

    /// The session is gone; no context is available any more.
    fn on_session_closed(&mut self, code: SessionErrorCode, message: &str);

    fn on_incoming_bidirectional_stream_available(&mut self, ctx: &mut SessionContext<'_, '_>);

    fn on_incoming_unidirectional_stream_available(&mut self, ctx: &mut SessionContext<'_, '_>);

    fn on_datagram_received(&mut self, ctx: &mut SessionContext<'_, '_>, datagram: &[u8]);

    fn on_can_create_new_outgoing_bidirectional_stream(&mut self, ctx: &mut SessionContext<'_, '_>);

    fn on_can_create_new_outgoing_unidirectional_stream(
        &mut self,
        ctx: &mut SessionContext<'_, '_>,
    );

    /// A stream visitor finished collecting a payload.
    fn on_unidirectional_payload(
        &mut self,
        ctx: &mut SessionContext<'_, '_>,
        completion: ReadCompletion,
    );
}

/// Session handle plus the stream visitor table, lent for one notification.
pub struct SessionContext<'a, 's> {
    session: &'a mut (dyn Session + 's),
    registry: &'a mut VisitorRegistry,
}

impl<'a, 's> SessionContext<'a, 's> {
    pub fn new(session: &'a mut (dyn Session + 's), registry: &'a mut VisitorRegistry) -> Self {
        Self { session, registry }
    }

    /// The transport session.
    pub fn session(&mut self) -> &mut (dyn Session + 's) {
        &mut *self.session
    }

    /// Bind `visitor` to a stream for the rest of its lifetime.
    ///
    /// Returns false if the stream already has a visitor.
    pub fn bind(&mut self, stream_id: StreamId, visitor: Box<dyn StreamVisitor>) -> bool {
        self.registry.bind(stream_id, visitor)
    }

    /// Run the bound visitor's read handler.
    pub fn notify_can_read(&mut self, stream_id: StreamId) -> Option<ReadCompletion> {
        self.visit(stream_id, |visitor, stream| visitor.on_can_read(stream))
            .flatten()
    }

    /// Run the bound visitor's write handler.
    pub fn notify_can_write(&mut self, stream_id: StreamId) {
        self.visit(stream_id, |visitor, stream| visitor.on_can_write(stream));
    }

    /// Call `f` with the visitor and live handle of `stream_id`.
    ///
    /// Returns `None` when either is missing: the stream has no visitor yet,
    /// or the transport already destroyed it.
    pub fn visit<R>(
        &mut self,
        stream_id: StreamId,
        f: impl FnOnce(&mut (dyn StreamVisitor + 'static), &mut dyn Stream) -> R,
    ) -> Option<R> {
        let Some(visitor) = self.registry.get_mut(stream_id) else {
            trace!(stream_id = %stream_id, "No visitor bound to stream");
            return None;
        };
        let Some(stream) = self.session.stream(stream_id) else {
            trace!(stream_id = %stream_id, "Stream handle already destroyed");
            return None;
        };
        Some(f(visitor.as_mut(), stream))
    }
}
