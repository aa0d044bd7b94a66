//! Loopback run of the echo endpoint.
//!
//! Drives an `EchoSessionVisitor` over the in-memory transport, playing
//! the peer: a chunked bidirectional echo, a batch of unidirectional
//! echoes squeezed through limited stream credit, and one datagram. Every
//! transcript is checked against what the peer sent.

use super::Dispatcher;
use crate::config::Config;
use crate::session::{EchoSessionVisitor, EchoStats, IncomingBidirectional};
use crate::transport::memory::MemorySession;
use crate::transport::StreamId;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on window grants while waiting for one echo to drain.
const MAX_FLUSH_ROUNDS: usize = 1 << 16;

/// Loopback verification failures.
#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("stream {0} has no transcript")]
    MissingTranscript(StreamId),

    #[error("stream {stream_id} echoed {actual} bytes, expected {expected}")]
    EchoMismatch {
        stream_id: StreamId,
        expected: usize,
        actual: usize,
    },

    #[error("stream {0} echo was not finished")]
    MissingFin(StreamId),

    #[error("expected {expected} unidirectional echoes, got {actual}")]
    UnidirectionalCount { expected: usize, actual: usize },

    #[error("datagram was not acknowledged")]
    MissingDatagramAck,
}

/// Outcome of a successful loopback run.
#[derive(Debug, Clone)]
pub struct LoopbackReport {
    /// Bytes echoed on bidirectional streams.
    pub bidirectional_bytes: usize,
    pub unidirectional_echoes: usize,
    pub datagram_acks: usize,
    /// Most unidirectional payloads waiting for credit at once.
    pub peak_pending_echoes: usize,
    pub events: usize,
    pub stats: EchoStats,
}

struct Loopback {
    session: MemorySession,
    dispatcher: Dispatcher<EchoSessionVisitor>,
    window: usize,
    events: usize,
}

impl Loopback {
    fn run(&mut self) {
        self.events += self.dispatcher.run_until_idle(&mut self.session);
    }

    /// Peer sends `data` on `id` in chunks, the last one carrying the fin.
    fn send_chunked(&mut self, id: StreamId, data: &[u8], chunk_size: usize) {
        if data.is_empty() {
            self.session.peer_send(id, data, true);
            self.run();
            return;
        }

        let mut chunks = data.chunks(chunk_size.max(1)).peekable();
        while let Some(chunk) = chunks.next() {
            self.session.peer_send(id, chunk, chunks.peek().is_none());
            self.run();
        }
    }

    /// Keep granting send window until the endpoint finished `id`.
    fn flush(&mut self, id: StreamId) {
        for _ in 0..MAX_FLUSH_ROUNDS {
            let finished = self.session.transcript(id).map_or(true, |t| t.fin);
            if finished || !self.session.grant_stream_window(id, self.window) {
                return;
            }
            self.run();
        }
    }

    /// Grant one outgoing unidirectional stream at a time until the
    /// endpoint has nothing queued.
    fn drain_pending_echoes(&mut self) {
        let mut flushed = 0;
        while !self.dispatcher.visitor().pending_echoes().is_empty() {
            self.session.grant_outgoing_unidirectional_streams(1);
            self.run();
            flushed = self.flush_unidirectional(flushed);
        }
        self.flush_unidirectional(flushed);
    }

    fn flush_unidirectional(&mut self, from: usize) -> usize {
        let opened = self.session.outgoing_unidirectional_streams().to_vec();
        for &id in &opened[from..] {
            self.flush(id);
        }
        opened.len()
    }

    fn peak_pending_echoes(&self) -> usize {
        self.dispatcher.visitor().pending_echoes().high_water_mark()
    }
}

fn check_echo(session: &MemorySession, id: StreamId, expected: &[u8]) -> Result<(), LoopbackError> {
    let transcript = session
        .transcript(id)
        .ok_or(LoopbackError::MissingTranscript(id))?;
    if transcript.data[..] != *expected {
        return Err(LoopbackError::EchoMismatch {
            stream_id: id,
            expected: expected.len(),
            actual: transcript.data.len(),
        });
    }
    if !transcript.fin {
        return Err(LoopbackError::MissingFin(id));
    }
    debug!(stream_id = %id, bytes = expected.len(), "Echo verified");
    Ok(())
}

/// Run one loopback session with `config` and verify every echo.
pub fn run_loopback(config: &Config) -> Result<LoopbackReport, LoopbackError> {
    let options = config.endpoint_options();
    let echo_bidirectional = options.incoming_bidirectional == IncomingBidirectional::Echo;
    let datagram_ack = options.datagram_ack.clone();

    let mut lo = Loopback {
        session: MemorySession::new(config.transport_settings()),
        dispatcher: Dispatcher::new(EchoSessionVisitor::new(options)),
        window: config.stream_window.max(1),
        events: 0,
    };
    lo.session.establish();
    lo.run();

    let message = config.message.as_bytes();
    let mut bidirectional_bytes = 0;

    // Peer-initiated bidirectional stream
    let incoming = lo.session.peer_open_bidirectional();
    lo.send_chunked(incoming, message, config.chunk_size);
    if echo_bidirectional {
        lo.flush(incoming);
        check_echo(&lo.session, incoming, message)?;
        bidirectional_bytes += message.len();
    }

    // Endpoint-initiated echo stream, when it was opened
    if let Some(&greeting) = lo.session.outgoing_bidirectional_streams().first() {
        lo.send_chunked(greeting, message, config.chunk_size);
        lo.flush(greeting);
        check_echo(&lo.session, greeting, message)?;
        bidirectional_bytes += message.len();
    }

    // Unidirectional echoes
    let payloads: Vec<Bytes> = (0..config.unidirectional_streams)
        .map(|i| Bytes::from(format!("{} #{}", config.message, i)))
        .collect();
    for payload in &payloads {
        let id = lo.session.peer_open_unidirectional();
        lo.session.peer_send(id, payload, true);
    }
    lo.run();
    lo.drain_pending_echoes();

    let echoes = lo.session.outgoing_unidirectional_streams().to_vec();
    if echoes.len() != payloads.len() {
        return Err(LoopbackError::UnidirectionalCount {
            expected: payloads.len(),
            actual: echoes.len(),
        });
    }
    for (id, payload) in echoes.iter().zip(&payloads) {
        check_echo(&lo.session, *id, payload)?;
    }

    // Datagram
    lo.session.peer_send_datagram(Bytes::copy_from_slice(message));
    lo.run();
    if lo.session.datagrams_sent().last() != Some(&datagram_ack) {
        return Err(LoopbackError::MissingDatagramAck);
    }

    lo.session.close(0, "loopback complete");
    lo.run();

    let report = LoopbackReport {
        bidirectional_bytes,
        unidirectional_echoes: echoes.len(),
        datagram_acks: lo.session.datagrams_sent().len(),
        peak_pending_echoes: lo.peak_pending_echoes(),
        events: lo.events,
        stats: lo.dispatcher.visitor().stats(),
    };
    info!(
        events = report.events,
        unidirectional_echoes = report.unidirectional_echoes,
        "Loopback session verified"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BidirectionalMode;

    fn config() -> Config {
        Config {
            message: "hello loopback".to_string(),
            unidirectional_streams: 5,
            chunk_size: 3,
            stream_window: 4,
            unidirectional_credit: 1,
            ..Config::default()
        }
    }

    #[test]
    fn test_loopback_verifies_all_paths() {
        let report = run_loopback(&config()).unwrap();

        assert_eq!(report.bidirectional_bytes, 2 * "hello loopback".len());
        assert_eq!(report.unidirectional_echoes, 5);
        assert_eq!(report.datagram_acks, 1);
        assert!(report.peak_pending_echoes >= 1);
        assert_eq!(report.stats.unidirectional_accepted, 5);
        assert_eq!(report.stats.unidirectional_echoes_opened, 5);
    }

    #[test]
    fn test_loopback_discard_mode() {
        let config = Config {
            bidirectional: BidirectionalMode::Discard,
            greeting_stream: false,
            ..config()
        };
        let report = run_loopback(&config).unwrap();

        assert_eq!(report.bidirectional_bytes, 0);
        assert_eq!(report.unidirectional_echoes, 5);
    }

    #[test]
    fn test_loopback_detects_dropped_echoes() {
        let config = Config {
            max_unidirectional_payload: Some(4),
            ..config()
        };
        let err = run_loopback(&config).unwrap_err();

        assert!(matches!(
            err,
            LoopbackError::UnidirectionalCount {
                expected: 5,
                actual: 0
            }
        ));
    }

    #[test]
    fn test_loopback_oversized_ack_is_reported() {
        let config = Config {
            datagram_ack: "x".repeat(64),
            max_datagram_size: 16,
            ..config()
        };
        let err = run_loopback(&config).unwrap_err();
        assert!(matches!(err, LoopbackError::MissingDatagramAck));
    }
}
