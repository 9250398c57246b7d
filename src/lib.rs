//! Full-duplex streaming HTTP client for long-lived sync sessions.
//!
//! One session holds one HTTP/1.1 connection on which the request body is
//! uploaded as chunks while the response body is consumed concurrently.
//! The crate is organized by role:
//! - `client`: connection establishment and the per-session worker.
//! - `session`: consumer callback boundary and the non-blocking handle.
//! - `proto`: request framing and incremental response parsing.
//! - `endpoint`: stream URL decomposition.

/// Stream client, session worker, and the session error taxonomy.
pub mod client;
/// Stream URL decomposition.
pub mod endpoint;
/// HTTP/1.1 chunked request framing and response parsing.
pub mod proto;
/// Consumer callback boundary and the session handle.
pub mod session;
