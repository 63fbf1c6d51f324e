//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Examples
//!
//! ```no_run
//! use weft::{limits::{ConnLimits, ReqLimits, ServerLimits}, Router, Server};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listen([127, 0, 0, 1], 8080)
//!         .handler(Router::builder().build())
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             request_timeout: Some(Duration::from_secs(5)),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 32,
//!             buf_max_size: 16 * 1024 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing, and overload behavior.
///
/// # Connection management
///
/// Accepted sockets go into an admission queue. A fixed pool of worker tasks
/// (created once at startup, each owning pre-allocated request/response
/// buffers) continuously drains the queue. If the queue is full, dedicated
/// responders immediately answer new connections with `503`.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent active connections being processed (default: `100`).
    ///
    /// Exactly this many worker tasks are created at startup and reused for
    /// the lifetime of the server.
    pub max_connections: usize,

    /// Maximum number of TCP connections waiting in the admission queue (default: `250`).
    ///
    /// When the queue is full, new connections receive an immediate HTTP
    /// `503` response.
    pub max_pending_connections: usize,

    /// Listen backlog passed to the OS socket (default: `64`).
    ///
    /// Only used when the listener is created by the builder from an address;
    /// a pre-bound listener keeps its own backlog.
    pub socket_backlog: u32,

    /// Strategy for worker task waiting behavior (default: `Sleep(50µs)`)
    ///
    /// Controls how worker tasks wait when the admission queue is empty.
    /// Affects latency, CPU usage, and throughput characteristics.
    pub wait_strategy: WaitStrategy,

    /// Dedicated handlers for queue overflow responses (default: `1`).
    ///
    /// Set to 0 to silently close overflow connections (not recommended for
    /// production HTTP servers).
    pub count_503_handlers: usize,

    /// Format for error responses (default: `true`)
    ///
    /// If `true`, protocol errors are answered with a small JSON body; if
    /// `false`, with an empty body and the status line only.
    pub json_errors: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            socket_backlog: 64,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,
        }
    }
}

/// Strategy for worker task waiting when no connections are available
///
/// Different strategies optimize for different workload patterns.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]. Minimal latency,
    /// near-full CPU load on an idle server.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`] with the given interval.
    Sleep(Duration),
}

/// Connection-level limits and timeouts
///
/// Default values balance performance, resource usage, and security.
/// Only change if you understand the consequences.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle keep-alive timeout (default: `120 seconds`, `None` disables).
    ///
    /// Applies while the connection is waiting for the first byte of the next
    /// request. Expiry closes the connection and frees its resources.
    pub keepalive_timeout: Option<Duration>,

    /// Active-request timeout (default: `20 seconds`, `None` disables).
    ///
    /// Applies to every read performed after the first byte of a request has
    /// arrived, including streamed body chunks. The primary defense against
    /// slowloris-style trickle requests.
    pub request_timeout: Option<Duration>,

    /// Maximum duration to wait for writing data to socket (default: `3 seconds`)
    ///
    /// If data can't be written in time, the connection is terminated.
    /// Applies to individual write operations.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    ///
    /// Connection closes after processing this many requests. Combined with
    /// `connection_lifetime`, ensures connections don't live indefinitely.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// Final safety net that guarantees no connection lives longer than this
    /// duration, regardless of traffic.
    pub connection_lifetime: Duration,
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            keepalive_timeout: Some(Duration::from_secs(120)),
            request_timeout: Some(Duration::from_secs(20)),
            socket_write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),
        }
    }
}

/// HTTP request parsing limits and buffer allocation strategy
///
/// Each connection owns one read buffer that starts at
/// [`buf_size`](Self::buf_size) and may grow up to
/// [`buf_max_size`](Self::buf_max_size) while a request (head plus buffered
/// body) is being accumulated. Bodies larger than the buffered cap are
/// delivered in streamed mode, bounded by [`stream_max_size`](Self::stream_max_size).
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Initial read buffer capacity in bytes (default: `1024`).
    pub buf_size: usize,

    /// Maximum buffered request size in bytes, head and body combined
    /// (default: `8 MiB`).
    ///
    /// A request whose buffered body would exceed this limit is either
    /// switched to streamed delivery or rejected with `413`.
    pub buf_max_size: usize,

    /// Maximum size of a streamed (chunked or oversized) body in bytes
    /// (default: `50 MiB`). `None` disables streamed bodies entirely:
    /// chunked requests are rejected with `501`.
    pub stream_max_size: Option<usize>,

    /// Maximum number of headers per request (default: `127`).
    pub header_count: usize,

    /// Maximum length of any single head line in bytes, request line included
    /// (default: `8192`).
    pub token_max_len: usize,

    /// Maximum number of query parameters (default: `64`).
    pub query_parts: usize,

    /// Maximum number of form fields, url-encoded or multipart
    /// (default: `64`).
    pub form_parts: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            buf_size: 1024,
            buf_max_size: 8 * 1024 * 1024,
            stream_max_size: Some(50 * 1024 * 1024),
            header_count: 127,
            token_max_len: 8192,
            query_parts: 64,
            form_parts: 64,
        }
    }
}

impl ReqLimits {
    /// Largest head (request line + headers + terminator) this configuration
    /// can accept. Used to bound the buffer while the head is incomplete.
    #[inline(always)]
    pub(crate) fn max_head_size(&self) -> usize {
        // +1 line for the request line, +2 for the final CRLF
        (self.header_count + 1) * (self.token_max_len + 2) + 2
    }
}

/// Configuration for response processing and memory allocation limits.
///
/// # Buffer Management
///
/// Response buffers are created once per worker with `default_capacity` and
/// reused across requests; a buffer that grew beyond `max_capacity` is
/// replaced with a fresh one after the response is flushed.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`)
    pub default_capacity: usize,
    /// Maximum retained buffer capacity for responses (default: `8192 B`)
    pub max_capacity: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,
        }
    }
}
