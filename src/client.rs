//! Stream transport: connection establishment and the per-session worker.
//!
//! Each session owns one connection and one dedicated worker thread. The
//! worker drives all socket I/O through a single duplex loop and is the
//! only place consumer callbacks run, so upload and download never block
//! each other and callbacks never overlap.

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::endpoint::{self, Endpoint, EndpointError};
use crate::proto::{self, ResponseEvent, ResponseParser};
use crate::session::{SessionState, SyncDataHandler, SyncStreamSession};

// Bounded so a stalled peer cannot wedge teardown.
const BEST_EFFORT_CLOSE_TIMEOUT: Duration = Duration::from_millis(250);

/// Default tuning for stream sessions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncStreamDefaults;

impl SyncStreamDefaults {
    /// Time allowed for the TCP connect, and separately for the TLS
    /// handshake.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Accepted-but-unwritten request bytes above which `write_data`
    /// reports backpressure.
    pub const WRITE_HIGH_WATERMARK: usize = 64 * 1024;
}

/// Tunable options for a stream client.
#[derive(Clone, Debug)]
pub struct SyncStreamOptions {
    pub connect_timeout: Duration,
    pub write_high_watermark: usize,
}

impl Default for SyncStreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SyncStreamDefaults::CONNECT_TIMEOUT,
            write_high_watermark: SyncStreamDefaults::WRITE_HIGH_WATERMARK,
        }
    }
}

/// Terminal session failures, delivered once through
/// [`SyncDataHandler::on_finished`].
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream URL could not be decomposed into an endpoint.
    #[error("error constructing url: {0}")]
    MalformedEndpoint(#[from] EndpointError),

    /// TCP connect failed or exceeded the connect timeout.
    #[error("error connecting to server: {0}")]
    ConnectFailed(#[source] io::Error),

    /// The TLS handshake with the server failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(#[source] io::Error),

    /// The request head never made it onto the wire.
    #[error("error sending request head: {0}")]
    RequestSendFailed(#[source] io::Error),

    /// An accepted body chunk could not be written.
    #[error("error writing data: {0}")]
    ChunkWriteFailed(#[source] io::Error),

    /// The server answered outside the 2xx class. The response body is
    /// still delivered before this surfaces.
    #[error("server responded with status {0}")]
    BadStatus(u16),

    /// The connection broke while the response was in flight.
    #[error("error mid flight: {0}")]
    MidFlight(#[source] io::Error),
}

/// Work items a session handle queues for its worker.
#[derive(Debug)]
pub(crate) enum Command {
    Write(Bytes),
    Flush,
    FinishBody,
}

/// State shared between session handles and the worker.
#[derive(Debug)]
pub(crate) struct Shared {
    state: AtomicU8,
    pending_out: AtomicUsize,
    write_high_watermark: usize,
}

impl Shared {
    pub(crate) fn new(write_high_watermark: usize) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            pending_out: AtomicUsize::new(0),
            write_high_watermark,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn pending_out(&self) -> usize {
        self.pending_out.load(Ordering::SeqCst)
    }

    pub(crate) fn add_pending(&self, bytes: usize) {
        self.pending_out.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn sub_pending(&self, bytes: usize) {
        self.pending_out.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn below_watermark(&self) -> bool {
        self.pending_out() < self.write_high_watermark
    }
}

/// Entry point for opening streaming sessions.
#[derive(Clone)]
pub struct SyncStreamClient {
    token: SecretString,
    options: SyncStreamOptions,
}

impl SyncStreamClient {
    /// Creates a client with default options.
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            options: SyncStreamOptions::default(),
        }
    }

    /// Creates a client with explicit options.
    pub fn with_options(token: SecretString, options: SyncStreamOptions) -> Self {
        Self { token, options }
    }

    /// Overrides the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    /// Opens a session to `url` and starts streaming.
    ///
    /// Returns immediately with a non-blocking handle. Connection progress,
    /// inbound data, and the terminal outcome are all delivered through
    /// `handler` on the session's worker thread; failures of any phase,
    /// including a malformed `url`, arrive as `on_finished(Some(_))`.
    pub fn start_streaming<H>(&self, url: impl Into<String>, handler: Arc<H>) -> SyncStreamSession
    where
        H: SyncDataHandler + 'static,
    {
        let url = url.into();
        let token = self.token.clone();
        let connect_timeout = self.options.connect_timeout;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(self.options.write_high_watermark));
        let session = SyncStreamSession::new(cmd_tx, Arc::clone(&shared));

        let worker = SessionWorker {
            shared: Arc::clone(&shared),
            handler: Arc::clone(&handler),
            cmd_rx,
            shut_down: false,
            body_closed: false,
            deliver: true,
            pending_error: None,
        };

        debug!(event = "session_starting", url = %url);
        let spawned = thread::Builder::new()
            .name("syncstream-session".to_string())
            .spawn(move || worker.run_blocking(url, token, connect_timeout));
        if let Err(error) = spawned {
            // No worker thread exists to carry the callback, so this one
            // case reports on the calling thread.
            shared.set_state(SessionState::Closed);
            handler.on_finished(Some(StreamError::ConnectFailed(error)));
        }

        session
    }
}

struct SessionWorker<H> {
    shared: Arc<Shared>,
    handler: Arc<H>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shut_down: bool,
    body_closed: bool,
    deliver: bool,
    pending_error: Option<StreamError>,
}

impl<H: SyncDataHandler> SessionWorker<H> {
    fn run_blocking(mut self, url: String, token: SecretString, connect_timeout: Duration) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => return self.finish(Some(StreamError::ConnectFailed(error))),
        };
        runtime.block_on(self.run(url, token, connect_timeout));
    }

    async fn run(mut self, url: String, token: SecretString, connect_timeout: Duration) {
        self.shared.set_state(SessionState::Connecting);

        let endpoint = match endpoint::resolve(&url) {
            Ok(endpoint) => endpoint,
            Err(error) => return self.finish(Some(StreamError::MalformedEndpoint(error))),
        };
        debug!(
            event = "connecting",
            host = %endpoint.host,
            port = endpoint.port,
            secure = endpoint.scheme.is_secure(),
        );

        let tcp = match timeout(
            connect_timeout,
            TcpStream::connect((endpoint.connect_host(), endpoint.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return self.finish(Some(StreamError::ConnectFailed(error))),
            Err(_) => {
                return self.finish(Some(StreamError::ConnectFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {} ms", connect_timeout.as_millis()),
                ))))
            }
        };

        if endpoint.scheme.is_secure() {
            let server_name = match ServerName::try_from(endpoint.connect_host().to_string()) {
                Ok(name) => name,
                Err(error) => {
                    return self.finish(Some(StreamError::TlsHandshakeFailed(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        error,
                    ))))
                }
            };
            let tls = match timeout(connect_timeout, tls_connector().connect(server_name, tcp))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    return self.finish(Some(StreamError::TlsHandshakeFailed(error)))
                }
                Err(_) => {
                    return self.finish(Some(StreamError::TlsHandshakeFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "tls handshake timed out",
                    ))))
                }
            };
            self.run_duplex(tls, &endpoint, &token).await;
        } else {
            self.run_duplex(tcp, &endpoint, &token).await;
        }
    }

    async fn run_duplex<S>(&mut self, io: S, endpoint: &Endpoint, token: &SecretString)
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut rd, mut wr) = tokio::io::split(io);

        let head = proto::encode_request_head(endpoint, token.expose_secret());
        if let Err(error) = wr.write_all(&head).await {
            return self.fail(&mut wr, StreamError::RequestSendFailed(error)).await;
        }
        self.shared.set_state(SessionState::AwaitingReady);
        if let Err(error) = wr.flush().await {
            return self.fail(&mut wr, StreamError::RequestSendFailed(error)).await;
        }

        self.shared.set_state(SessionState::Streaming);
        debug!(event = "ready", target = %endpoint.target);
        self.handler.on_ready();

        let mut parser = ResponseParser::new();
        let mut outbuf = BytesMut::new();
        let mut scratch = [0u8; 8192];
        let mut flush_requested = false;
        let mut cmd_open = true;

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv(), if cmd_open => {
                    match maybe_cmd {
                        Some(Command::Write(data)) => self.enqueue_chunk(&mut outbuf, data),
                        Some(Command::Flush) => flush_requested = true,
                        Some(Command::FinishBody) => {
                            self.close_request_body(&mut outbuf, &mut flush_requested);
                        }
                        None => {
                            // Every handle is gone; nothing more can be
                            // written, so close the body and drain.
                            cmd_open = false;
                            self.close_request_body(&mut outbuf, &mut flush_requested);
                        }
                    }
                }
                outcome = pump_outbound(&mut wr, &mut outbuf), if !outbuf.is_empty() || flush_requested => {
                    match outcome {
                        Ok(Outbound::Wrote(written)) => self.shared.sub_pending(written),
                        Ok(Outbound::Flushed) => flush_requested = false,
                        Err(error) => {
                            self.fail(&mut wr, StreamError::ChunkWriteFailed(error)).await;
                            break;
                        }
                    }
                }
                read = rd.read(&mut scratch) => {
                    match read {
                        Ok(0) => {
                            debug!(event = "peer_closed");
                            self.graceful_finish();
                            break;
                        }
                        Ok(n) => {
                            let mut events = Vec::new();
                            let parsed = parser.feed(&scratch[..n], &mut events);
                            let body_done = self.apply_events(events);
                            match parsed {
                                Ok(()) => {
                                    if body_done {
                                        self.graceful_finish();
                                        break;
                                    }
                                }
                                Err(error) => {
                                    let error =
                                        io::Error::new(io::ErrorKind::InvalidData, error);
                                    self.fail(&mut wr, StreamError::MidFlight(error)).await;
                                    break;
                                }
                            }
                        }
                        Err(error) => {
                            self.fail(&mut wr, StreamError::MidFlight(error)).await;
                            break;
                        }
                    }
                }
            }
        }
        debug!(event = "session_closing");
    }

    fn enqueue_chunk(&mut self, outbuf: &mut BytesMut, data: Bytes) {
        if self.body_closed {
            // Lost the race with stop_streaming: the terminator is already
            // queued, so the chunk is dropped.
            debug!(event = "write_dropped_after_body_close", len = data.len());
            self.shared.sub_pending(data.len());
            return;
        }
        let frame = proto::encode_chunk(&data);
        self.shared.add_pending(frame.len() - data.len());
        outbuf.extend_from_slice(&frame);
    }

    fn close_request_body(&mut self, outbuf: &mut BytesMut, flush_requested: &mut bool) {
        if self.body_closed {
            return;
        }
        debug!(event = "request_body_closing");
        self.body_closed = true;
        self.shared.add_pending(proto::LAST_CHUNK.len());
        outbuf.extend_from_slice(proto::LAST_CHUNK);
        *flush_requested = true;
        self.shared.set_state(SessionState::Finishing);
    }

    // Returns true once the response body is complete.
    fn apply_events(&mut self, events: Vec<ResponseEvent>) -> bool {
        for event in events {
            match event {
                ResponseEvent::Status { code } => {
                    debug!(event = "response_status", code);
                    if !(200..300).contains(&code) {
                        warn!(event = "bad_response_status", code);
                        self.pending_error = Some(StreamError::BadStatus(code));
                    }
                }
                ResponseEvent::Chunk(data) => {
                    debug!(event = "content_received", len = data.len());
                    if !self.deliver {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&data);
                    if !self.handler.on_data_received(&text) {
                        debug!(event = "delivery_stopped_by_consumer");
                        self.deliver = false;
                    }
                }
                ResponseEvent::End => {
                    debug!(event = "end_of_content");
                    return true;
                }
            }
        }
        false
    }

    fn graceful_finish(&mut self) {
        let error = self.pending_error.take();
        self.finish(error);
    }

    // Terminal failure path: report first, then make a bounded best-effort
    // attempt to close the request body. An earlier recorded error wins
    // over the one that ended the loop.
    async fn fail<S>(&mut self, wr: &mut WriteHalf<S>, error: StreamError)
    where
        S: AsyncWrite,
    {
        if self.shut_down {
            return;
        }
        let error = self.pending_error.take().unwrap_or(error);
        self.finish(Some(error));
        if !self.body_closed {
            self.body_closed = true;
            let attempt = async {
                let _ = wr.write_all(proto::LAST_CHUNK).await;
                let _ = wr.flush().await;
            };
            let _ = timeout(BEST_EFFORT_CLOSE_TIMEOUT, attempt).await;
        }
    }

    fn finish(&mut self, error: Option<StreamError>) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        match &error {
            Some(error) => warn!(event = "stream_finished", error = %error),
            None => debug!(event = "stream_finished"),
        }
        self.shared.set_state(SessionState::Closed);
        self.handler.on_finished(error);
    }
}

enum Outbound {
    Wrote(usize),
    Flushed,
}

// One unit of write-side progress: drain queued bytes first, flush only
// once the queue is empty.
async fn pump_outbound<S>(wr: &mut WriteHalf<S>, outbuf: &mut BytesMut) -> io::Result<Outbound>
where
    S: AsyncWrite,
{
    if !outbuf.is_empty() {
        let written = wr.write_buf(outbuf).await?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed for writing",
            ));
        }
        Ok(Outbound::Wrote(written))
    } else {
        wr.flush().await?;
        Ok(Outbound::Flushed)
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
