//! Consumer surface of a streaming session: the callback boundary and the
//! non-blocking handle used to feed the request body.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{Command, Shared, StreamError};

/// Callback boundary implemented by stream consumers.
///
/// All three callbacks run on the session's own worker thread, never on the
/// thread that started the session, and never concurrently with each other.
/// Keep them fast: they share the thread with socket I/O.
pub trait SyncDataHandler: Send + Sync {
    /// The request head reached the wire; body data may now be submitted.
    fn on_ready(&self);

    /// One inbound body chunk, in arrival order. Return `false` to stop
    /// receiving further chunks; the session still runs to completion.
    fn on_data_received(&self, data: &str) -> bool;

    /// Terminal notification, invoked exactly once per session. `None`
    /// means the stream completed cleanly.
    fn on_finished(&self, error: Option<StreamError>);
}

/// Lifecycle states of a streaming session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    AwaitingReady = 2,
    Streaming = 3,
    Finishing = 4,
    Closed = 5,
}

impl SessionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::AwaitingReady,
            3 => Self::Streaming,
            4 => Self::Finishing,
            _ => Self::Closed,
        }
    }
}

/// Why a write-side call was not accepted.
///
/// These are per-call outcomes; none of them terminate the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum WriteRejected {
    /// The session is not in a state that accepts writes: not yet ready,
    /// or already closed.
    #[error("no active stream connection")]
    NotConnected,

    /// The request body was already closed by [`SyncStreamSession::stop_streaming`].
    #[error("request body already closed")]
    BodyClosed,

    /// Too many bytes are queued but not yet written. Retry after the
    /// transport drains; the session itself is unaffected.
    #[error("transport write queue is full")]
    Backpressure,
}

/// Handle to a live streaming session.
///
/// Every method is non-blocking: work is handed to the session worker or
/// rejected immediately. Handles are cheap to clone and safe to share
/// across threads; dropping the last one closes the request body and lets
/// the session finish on its own.
#[derive(Clone, Debug)]
pub struct SyncStreamSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SyncStreamSession {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<Command>, shared: Arc<Shared>) -> Self {
        Self { cmd_tx, shared }
    }

    /// Submits one request-body chunk.
    ///
    /// Accepted chunks reach the wire in submission order, each framed as
    /// one HTTP chunk. Empty payloads are accepted and produce no wire
    /// bytes. Rejections leave the session running; see [`WriteRejected`].
    pub fn write_data(&self, data: impl Into<Bytes>) -> Result<(), WriteRejected> {
        let data = data.into();
        match self.state() {
            SessionState::Streaming => {}
            SessionState::Finishing => return Err(WriteRejected::BodyClosed),
            _ => return Err(WriteRejected::NotConnected),
        }
        if data.is_empty() {
            return Ok(());
        }
        if !self.shared.below_watermark() {
            debug!(event = "write_rejected", reason = "backpressure", len = data.len());
            return Err(WriteRejected::Backpressure);
        }

        let len = data.len();
        self.shared.add_pending(len);
        if self.cmd_tx.send(Command::Write(data)).is_err() {
            self.shared.sub_pending(len);
            return Err(WriteRejected::NotConnected);
        }
        Ok(())
    }

    /// Asks the worker to push any queued request bytes onto the wire.
    pub fn flush(&self) -> Result<(), WriteRejected> {
        match self.state() {
            SessionState::Streaming | SessionState::Finishing => {}
            _ => return Err(WriteRejected::NotConnected),
        }
        self.cmd_tx
            .send(Command::Flush)
            .map_err(|_| WriteRejected::NotConnected)
    }

    /// Closes the request body by queueing the terminating chunk.
    ///
    /// The connection stays up until the response side completes, so data
    /// keeps arriving after this call. Safe to call at any time and any
    /// number of times.
    pub fn stop_streaming(&self) {
        let _ = self.cmd_tx.send(Command::FinishBody);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether a `write_data` call would currently be accepted.
    pub fn is_writable(&self) -> bool {
        self.state() == SessionState::Streaming && self.shared.below_watermark()
    }

    /// Whether the session has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::{SessionState, SyncStreamSession, WriteRejected};
    use crate::client::{Command, Shared};

    const TEST_WATERMARK: usize = 8;

    fn session_with_state(
        state: SessionState,
    ) -> (SyncStreamSession, mpsc::UnboundedReceiver<Command>, Arc<Shared>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(TEST_WATERMARK));
        shared.set_state(state);
        let session = SyncStreamSession::new(cmd_tx, Arc::clone(&shared));
        (session, cmd_rx, shared)
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::AwaitingReady,
            SessionState::Streaming,
            SessionState::Finishing,
            SessionState::Closed,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn write_before_ready_is_rejected() {
        let (session, mut cmd_rx, _) = session_with_state(SessionState::Connecting);
        assert_eq!(
            session.write_data(Bytes::from_static(b"early")),
            Err(WriteRejected::NotConnected)
        );
        assert!(cmd_rx.try_recv().is_err(), "rejected write must enqueue nothing");
    }

    #[test]
    fn write_after_close_is_rejected() {
        let (session, _cmd_rx, _) = session_with_state(SessionState::Closed);
        assert_eq!(
            session.write_data(Bytes::from_static(b"late")),
            Err(WriteRejected::NotConnected)
        );
    }

    #[test]
    fn write_while_finishing_reports_body_closed() {
        let (session, _cmd_rx, _) = session_with_state(SessionState::Finishing);
        assert_eq!(
            session.write_data(Bytes::from_static(b"x")),
            Err(WriteRejected::BodyClosed)
        );
    }

    #[test]
    fn empty_write_is_accepted_without_commands() {
        let (session, mut cmd_rx, shared) = session_with_state(SessionState::Streaming);
        session.write_data(Bytes::new()).expect("empty write should be accepted");
        assert!(cmd_rx.try_recv().is_err());
        assert_eq!(shared.pending_out(), 0);
    }

    #[test]
    fn accepted_writes_enqueue_in_submission_order() {
        let (session, mut cmd_rx, shared) = session_with_state(SessionState::Streaming);
        session.write_data(Bytes::from_static(b"one")).expect("first write");
        session.write_data(Bytes::from_static(b"two")).expect("second write");
        assert_eq!(shared.pending_out(), 6);

        for expected in [&b"one"[..], &b"two"[..]] {
            match cmd_rx.try_recv().expect("queued command") {
                Command::Write(data) => assert_eq!(&data[..], expected),
                other => panic!("unexpected command: {other:?}"),
            }
        }
    }

    #[test]
    fn writes_above_the_watermark_report_backpressure() {
        let (session, _cmd_rx, shared) = session_with_state(SessionState::Streaming);
        session
            .write_data(Bytes::from_static(b"12345678"))
            .expect("write below watermark");
        assert_eq!(
            session.write_data(Bytes::from_static(b"x")),
            Err(WriteRejected::Backpressure)
        );
        assert!(!session.is_writable());

        shared.sub_pending(TEST_WATERMARK);
        assert!(session.is_writable());
        session
            .write_data(Bytes::from_static(b"x"))
            .expect("write accepted once drained");
    }

    #[test]
    fn flush_requires_an_active_connection() {
        let (session, _cmd_rx, _) = session_with_state(SessionState::Idle);
        assert_eq!(session.flush(), Err(WriteRejected::NotConnected));

        let (session, mut cmd_rx, _) = session_with_state(SessionState::Streaming);
        session.flush().expect("flush while streaming");
        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Flush)));
    }

    #[test]
    fn stop_streaming_is_idempotent_and_never_panics() {
        let (session, cmd_rx, _) = session_with_state(SessionState::Streaming);
        session.stop_streaming();
        session.stop_streaming();
        drop(cmd_rx);
        // Receiver gone: stop must still be a quiet no-op.
        session.stop_streaming();
    }

    #[test]
    fn write_after_worker_exit_is_rejected() {
        let (session, cmd_rx, shared) = session_with_state(SessionState::Streaming);
        drop(cmd_rx);
        assert_eq!(
            session.write_data(Bytes::from_static(b"gone")),
            Err(WriteRejected::NotConnected)
        );
        assert_eq!(shared.pending_out(), 0, "failed send must roll back accounting");
    }
}
