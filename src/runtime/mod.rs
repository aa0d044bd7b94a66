//! Single-threaded event dispatch for one transport session.
//!
//! Readiness model: the transport reports what happened, the dispatcher
//! routes each notification either to the session visitor or to the
//! visitor bound to the stream. Handlers run to completion; the next
//! event is the only re-entry point, so no locking is needed.
//!
//! ## Routing
//!
//! - Session events go to the `SessionVisitor`.
//! - Stream events go to the stream's bound visitor, with the live handle
//!   lent for the duration of the call. Events for streams without a
//!   visitor, or whose handle is already gone, are dropped.
//! - A payload completed by a stream visitor is handed back to the session
//!   visitor in the same turn.
//! - `StreamClosed` unbinds the visitor. `SessionClosed` unbinds all of
//!   them; every later event is ignored.

mod loopback;
mod registry;

pub use loopback::{run_loopback, LoopbackError, LoopbackReport};
pub use registry::VisitorRegistry;

use crate::session::{SessionContext, SessionVisitor};
use crate::transport::{EventSource, Session, TransportEvent};
use tracing::{debug, trace};

/// Routes transport events for one session.
pub struct Dispatcher<V> {
    visitor: V,
    registry: VisitorRegistry,
    closed: bool,
}

impl<V: SessionVisitor> Dispatcher<V> {
    pub fn new(visitor: V) -> Self {
        Self {
            visitor,
            registry: VisitorRegistry::new(),
            closed: false,
        }
    }

    pub fn visitor(&self) -> &V {
        &self.visitor
    }

    pub fn registry(&self) -> &VisitorRegistry {
        &self.registry
    }

    /// Whether `SessionClosed` was dispatched.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle a single event.
    pub fn dispatch(&mut self, session: &mut dyn Session, event: TransportEvent) {
        if self.closed {
            trace!(?event, "Ignoring event after session close");
            return;
        }

        let mut ctx = SessionContext::new(session, &mut self.registry);
        match event {
            TransportEvent::SessionReady => self.visitor.on_session_ready(&mut ctx),
            TransportEvent::SessionClosed { code, message } => {
                self.visitor.on_session_closed(code, &message);
                let dropped = self.registry.len();
                self.registry.clear();
                self.closed = true;
                debug!(dropped, "Released stream visitors");
            }
            TransportEvent::IncomingBidirectionalStreamAvailable => {
                self.visitor.on_incoming_bidirectional_stream_available(&mut ctx)
            }
            TransportEvent::IncomingUnidirectionalStreamAvailable => {
                self.visitor.on_incoming_unidirectional_stream_available(&mut ctx)
            }
            TransportEvent::DatagramReceived(datagram) => {
                self.visitor.on_datagram_received(&mut ctx, &datagram)
            }
            TransportEvent::CanCreateNewOutgoingBidirectionalStream => {
                self.visitor.on_can_create_new_outgoing_bidirectional_stream(&mut ctx)
            }
            TransportEvent::CanCreateNewOutgoingUnidirectionalStream => {
                self.visitor.on_can_create_new_outgoing_unidirectional_stream(&mut ctx)
            }
            TransportEvent::StreamReadable(stream_id) => {
                if let Some(completion) = ctx.notify_can_read(stream_id) {
                    self.visitor.on_unidirectional_payload(&mut ctx, completion);
                }
            }
            TransportEvent::StreamWritable(stream_id) => ctx.notify_can_write(stream_id),
            TransportEvent::ResetStreamReceived { stream_id, code } => {
                ctx.visit(stream_id, |visitor, stream| {
                    visitor.on_reset_stream_received(stream, code)
                });
            }
            TransportEvent::StopSendingReceived { stream_id, code } => {
                ctx.visit(stream_id, |visitor, stream| {
                    visitor.on_stop_sending_received(stream, code)
                });
            }
            TransportEvent::WriteSideInDataRecvdState(stream_id) => {
                ctx.visit(stream_id, |visitor, stream| {
                    visitor.on_write_side_in_data_recvd_state(stream)
                });
            }
            TransportEvent::StreamClosed(stream_id) => {
                if self.registry.remove(stream_id).is_some() {
                    trace!(stream_id = %stream_id, "Stream visitor released");
                }
            }
        }
    }

    /// Dispatch events until the transport has none left.
    ///
    /// Returns the number of events handled.
    pub fn run_until_idle<T: Session + EventSource>(&mut self, transport: &mut T) -> usize {
        let mut handled = 0;
        while let Some(event) = transport.poll_event() {
            self.dispatch(transport, event);
            handled += 1;
        }
        handled
    }
}
