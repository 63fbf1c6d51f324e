//! Server construction, the accept loop, and the connection worker pool.

use crate::{
    errors::{Error, ErrorKind},
    http::{request::Request, response::Response},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    route::router::RouteResult,
    server::{
        connection::{writer, HttpConnection},
        tls::{build_acceptor, MaybeTls, TlsMaterial},
    },
    session::{MemorySessionStore, SessionStore},
    Version,
};
use crossbeam::queue::SegQueue;
use std::{
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};
use tokio_rustls::TlsAcceptor;

/// The server-level dispatch callback: one per server, invoked for every
/// parsed request.
///
/// [`Router`](crate::Router) implements this trait, so a built route tree
/// plugs in directly; a custom implementation can be used instead for
/// hand-rolled dispatch.
///
/// # Examples
///
/// ```no_run
/// use weft::{route_fn, Route, RouteResult, Router, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() {
///     let mut routes = Router::builder();
///     routes
///         .route(Route::new("/ping").handler(route_fn(|_req, resp| {
///             resp.status(StatusCode::Ok).body("pong");
///             RouteResult::Processed
///         })))
///         .unwrap();
///
///     Server::builder()
///         .listen([127, 0, 0, 1], 8080)
///         .handler(routes.build())
///         .build()
///         .unwrap()
///         .launch()
///         .await;
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Processes one request and reports how dispatch ended.
    ///
    /// A [`RouteResult::NotProcessed`] return is turned into `404 Not Found`
    /// by the connection engine; short-circuit results become their status.
    fn handle(
        &self,
        request: &mut Request<'_>,
        response: &mut Response,
    ) -> impl Future<Output = RouteResult> + Send;
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

/// An HTTP(S) server: listening socket, admission queue, and a fixed pool
/// of connection workers with pre-allocated buffers.
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder<H: Handler>() -> ServerBuilder<H> {
        ServerBuilder {
            listener: None,
            listen_addr: None,
            tls: None,
            handler: None,
            session_store: None,

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            response_limits: None,
        }
    }

    /// Address of the listening socket. With port 0 this reports the port
    /// the OS actually picked.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop, feeding the worker pool until the future is
    /// dropped.
    pub async fn launch(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "server listening");
        }

        loop {
            let Ok(value) = self.listener.accept().await else {
                continue;
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => self.error_queue.push(value),
            }
        }
    }
}

#[inline]
async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
    loop {
        if let Some(value) = queue.pop() {
            return value;
        }

        match wait {
            WaitStrategy::Yield => yield_now().await,
            WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
        }
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H: Handler> {
    listener: Option<TcpListener>,
    listen_addr: Option<(IpAddr, u16)>,
    tls: Option<(TlsMaterial, TlsMaterial)>,
    handler: Option<Arc<H>>,
    session_store: Option<Arc<dyn SessionStore>>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl<H: Handler> ServerBuilder<H> {
    /// Uses a pre-bound TCP listener. Overrides [`listen`](Self::listen).
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Binds to `host:port` at build time, with the configured socket
    /// backlog. Defaults to `0.0.0.0:8080` when neither this nor
    /// [`listener`](Self::listener) is given.
    #[inline(always)]
    pub fn listen(mut self, host: impl Into<IpAddr>, port: u16) -> Self {
        self.listen_addr = Some((host.into(), port));
        self
    }

    /// Enables TLS termination with the given certificate chain and private
    /// key (PEM, each from a file or an in-memory buffer).
    #[inline(always)]
    pub fn tls(mut self, certs: TlsMaterial, private_key: TlsMaterial) -> Self {
        self.tls = Some((certs, private_key));
        self
    }

    /// Sets the request handler. **Required.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Plugs in a session store. Defaults to
    /// [`MemorySessionStore`](crate::MemorySessionStore).
    #[inline(always)]
    pub fn session_store(mut self, store: impl SessionStore) -> Self {
        self.session_store = Some(Arc::new(store));
        self
    }

    /// Configures concurrency and admission-queue limits.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures connection timeouts and lifetime limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing and body-size limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffer limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder, binds the listener if needed, builds the TLS
    /// acceptor, and spawns the worker pool.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when no handler was set; all configuration failures (bind,
    /// TLS material) are returned as [`Error`].
    #[track_caller]
    pub fn build(self) -> Result<Server, Error> {
        let handler = self
            .handler
            .expect("The `handler` method must be called to create");

        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        let req_limits = self.request_limits.unwrap_or_default();
        let resp_limits = self.response_limits.unwrap_or_default();

        let listener = match self.listener {
            Some(listener) => listener,
            None => {
                let (host, port) = self
                    .listen_addr
                    .unwrap_or((IpAddr::from([0, 0, 0, 0]), 8080));
                bind_listener(SocketAddr::new(host, port), server_limits.socket_backlog)?
            }
        };

        let acceptor = match &self.tls {
            Some((certs, key)) => Some(build_acceptor(certs, key)?),
            None => None,
        };

        let session_store = self
            .session_store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let stream_queue: TcpQueue = Arc::new(SegQueue::new());
        let error_queue: TcpQueue = Arc::new(SegQueue::new());

        for _ in 0..server_limits.max_connections {
            spawn_worker(
                &stream_queue,
                acceptor.clone(),
                &handler,
                &session_store,
                &server_limits,
                &conn_limits,
                &req_limits,
                &resp_limits,
            );
        }

        if server_limits.count_503_handlers != 0 {
            for _ in 0..server_limits.count_503_handlers {
                spawn_alarmist(&error_queue, &server_limits, &conn_limits);
            }
        } else {
            spawn_quiet_alarmist(&error_queue, &server_limits);
        }

        Ok(Server {
            listener,
            stream_queue,
            error_queue,
            server_limits,
        })
    }
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn spawn_worker<H: Handler>(
    queue: &TcpQueue,
    acceptor: Option<TlsAcceptor>,
    handler: &Arc<H>,
    session_store: &Arc<dyn SessionStore>,
    server_limits: &ServerLimits,
    conn_limits: &ConnLimits,
    req_limits: &ReqLimits,
    resp_limits: &RespLimits,
) {
    let queue = queue.clone();
    let wait = server_limits.wait_strategy.clone();
    let mut conn = HttpConnection::new(
        handler.clone(),
        session_store.clone(),
        conn_limits.clone(),
        req_limits.clone(),
        resp_limits.clone(),
        server_limits.json_errors,
    );

    tokio::spawn(async move {
        loop {
            let (stream, client_addr) = get_stream(&queue, &wait).await;

            let Ok(server_addr) = stream.local_addr() else {
                continue;
            };

            let mut stream = match &acceptor {
                None => MaybeTls::Plain(stream),
                Some(acceptor) => {
                    let deadline = conn
                        .conn_limits
                        .request_timeout
                        .unwrap_or(Duration::from_secs(20));
                    match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => MaybeTls::Tls(Box::new(tls_stream)),
                        Ok(Err(err)) => {
                            tracing::debug!(client = %client_addr, error = %err, "TLS handshake failed");
                            continue;
                        }
                        Err(_) => {
                            tracing::debug!(client = %client_addr, "TLS handshake timed out");
                            continue;
                        }
                    }
                }
            };

            if let Err(err) = conn.run(&mut stream, client_addr, server_addr).await {
                tracing::debug!(client = %client_addr, error = %err, "connection closed on I/O error");
            }
        }
    });
}

#[inline]
fn spawn_alarmist(queue: &TcpQueue, server_limits: &ServerLimits, conn_limits: &ConnLimits) {
    let queue = queue.clone();
    let wait = server_limits.wait_strategy.clone();
    let json_errors = server_limits.json_errors;
    let write_timeout = conn_limits.socket_write_timeout;

    tokio::spawn(async move {
        loop {
            let (stream, _) = get_stream(&queue, &wait).await;

            let mut stream = MaybeTls::Plain(stream);
            let _ = writer::send_error(
                &mut stream,
                ErrorKind::ServiceUnavailable.as_http(Version::Http11, json_errors),
                write_timeout,
            )
            .await;
        }
    });
}

#[inline]
fn spawn_quiet_alarmist(queue: &TcpQueue, server_limits: &ServerLimits) {
    let queue = queue.clone();
    let wait = server_limits.wait_strategy.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = get_stream(&queue, &wait).await;

            drop(stream);
        }
    });
}

/// Binds a listener with an explicit backlog and `SO_REUSEADDR`.
fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, Error> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(TcpListener::from_std(socket.into())?)
}
