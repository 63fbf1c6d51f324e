//! Per-connection protocol engine.
//!
//! One `HttpConnection` is owned by one worker task and reused across many
//! client sockets; its buffers are allocated once. For each request the
//! engine moves through the states: read head (incrementally, resumable
//! across partial reads) -> read or prepare body -> dispatch -> write
//! response -> keep-alive bookkeeping. Every protocol error is contained
//! here: the offending connection gets a best-effort canned response and is
//! closed, other connections are unaffected.

use crate::{
    errors::ErrorKind,
    http::{
        body::{Body, BodyReader},
        multipart,
        query::Query,
        request::{FormKind, Head, HeadParser, Request},
        response::Response,
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    route::router::RouteResult,
    server::{server_impl::Handler, tls::MaybeTls},
    session::{render_cookie, CookieOpts, SessionCtx, SessionStore, SESSION_COOKIE_NAME},
    StatusCode, Version,
};
use std::{io, net::SocketAddr, sync::Arc, time::Instant};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

enum BodyMode {
    Empty,
    Buffered(usize),
    Streamed,
}

pub(crate) struct HttpConnection<H: Handler> {
    handler: Arc<H>,
    session_store: Arc<dyn SessionStore>,

    connection: Connection,
    parser: HeadParser,
    body_buf: Vec<u8>,
    pub(crate) response: Response,

    pub(crate) conn_limits: ConnLimits,
    req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) json_errors: bool,
}

impl<H: Handler> HttpConnection<H> {
    pub(crate) fn new(
        handler: Arc<H>,
        session_store: Arc<dyn SessionStore>,
        conn_limits: ConnLimits,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
        json_errors: bool,
    ) -> Self {
        Self {
            handler,
            session_store,

            connection: Connection::new(),
            parser: HeadParser::new(&req_limits),
            body_buf: Vec::new(),
            response: Response::new(&resp_limits),

            conn_limits,
            req_limits,
            resp_limits,
            json_errors,
        }
    }

    /// Serves one client socket until it is done, closed, or errored.
    pub(crate) async fn run(
        &mut self,
        stream: &mut MaybeTls,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), io::Error> {
        let outcome = self.impl_run(stream, client_addr, server_addr).await;

        match outcome {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(err)) => Err(err.0),
            Err(err) => {
                tracing::debug!(client = %client_addr, error = %err, "protocol error");
                writer::send_error(
                    stream,
                    err.as_http(self.response.version, self.json_errors),
                    self.conn_limits.socket_write_timeout,
                )
                .await
            }
        }
    }

    async fn impl_run(
        &mut self,
        stream: &mut MaybeTls,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), ErrorKind> {
        self.connection.reset();
        self.parser.reset();

        while !self.is_expired() {
            self.response.reset(&self.resp_limits);
            self.body_buf.clear();

            let Some(head_end) = self.read_head(stream).await? else {
                // Peer closed cleanly between requests
                break;
            };

            let head = self.parser.parse_head(head_end, &self.req_limits)?;
            self.parser.consume(head_end);
            self.response.version = head.version;
            self.response.keep_alive = head.keep_alive;

            let mode = self.body_mode(&head)?;
            if head.expect_continue && !matches!(mode, BodyMode::Empty) {
                writer::send_error(stream, CONTINUE_RESPONSE, self.conn_limits.socket_write_timeout)
                    .await?;
            }
            if let BodyMode::Buffered(length) = mode {
                self.read_body_buffered(stream, length).await?;
            }

            let (form, form_files, form_kind) = self.parse_form(&head)?;
            let session = SessionCtx::new(
                self.session_store.clone(),
                head.cookie(SESSION_COOKIE_NAME),
            );

            let body = match mode {
                BodyMode::Empty => Body::Empty,
                BodyMode::Buffered(_) => Body::Buffered(&self.body_buf),
                BodyMode::Streamed => Body::Streamed(BodyReader::new(
                    &mut *stream,
                    &mut self.parser.buf,
                    head.content_length,
                    self.req_limits.stream_max_size.unwrap_or(usize::MAX),
                    self.conn_limits.request_timeout,
                )),
            };

            let mut request = Request {
                head: &head,
                body,
                form,
                form_files,
                form_kind,
                unmatched: 0,
                submatches: Vec::new(),
                session,
                client_addr,
                server_addr,
            };

            let result = self.handler.handle(&mut request, &mut self.response).await;

            let body_unfinished = request.body_unfinished();
            let fresh_sid = request.session.fresh_sid().map(str::to_string);
            drop(request);

            self.finish_response(result);

            if let Some(sid) = fresh_sid {
                let opts = CookieOpts::new().path("/").http_only(true);
                let cookie = render_cookie(SESSION_COOKIE_NAME, &sid, &opts);
                self.response.insert_late_header("set-cookie", &cookie);
            }

            if body_unfinished || matches!(result, RouteResult::ConnectionClose) {
                // An unread streamed body would misframe the next request
                if self.response.keep_alive {
                    self.response.keep_alive = false;
                    // HTTP/1.1 defaults to keep-alive, so the finalized
                    // response must be told about the close
                    if head.version == Version::Http11 {
                        self.response.insert_late_header("connection", "close");
                    }
                }
            }

            writer::write_bytes(
                stream,
                self.response.buffer(),
                self.conn_limits.socket_write_timeout,
            )
            .await?;

            if !self.response.keep_alive {
                break;
            }

            self.connection.request_count += 1;
        }

        Ok(())
    }

    /// Maps the dispatch outcome onto the response, synthesizing a minimal
    /// one when the handler did not finalize a body itself.
    fn finish_response(&mut self, result: RouteResult) {
        if self.response.is_complete() {
            return;
        }

        let status = match result {
            RouteResult::NotProcessed => StatusCode::NotFound,
            RouteResult::Processed | RouteResult::ConnectionClose => StatusCode::Ok,
            short_circuit => short_circuit
                .status()
                .unwrap_or(StatusCode::InternalServerError),
        };
        self.response.finalize_with_status(status);
    }

    /// Reads until a complete head is buffered.
    ///
    /// Returns `None` on a clean peer close between requests. The idle
    /// keep-alive timeout applies while waiting for the first byte of a
    /// request; once any byte of the request has arrived the active-request
    /// timeout takes over.
    async fn read_head(&mut self, stream: &mut MaybeTls) -> Result<Option<usize>, ErrorKind> {
        loop {
            if let Some(end) = self.parser.find_head(&self.req_limits)? {
                return Ok(Some(end));
            }
            if self.parser.buf.len() > self.req_limits.max_head_size() {
                return Err(ErrorKind::TooManyHeaders);
            }

            let timeout = match self.parser.has_buffered() {
                true => self.conn_limits.request_timeout,
                false => self.conn_limits.keepalive_timeout,
            };

            let read = writer::read_with_timeout(stream, &mut self.parser.buf, timeout).await?;
            if read == 0 {
                if self.parser.has_buffered() {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                return Ok(None);
            }
        }
    }

    /// Selects the body delivery contract for this request.
    fn body_mode(&self, head: &Head) -> Result<BodyMode, ErrorKind> {
        if head.chunked {
            return match self.req_limits.stream_max_size {
                Some(_) => Ok(BodyMode::Streamed),
                None => Err(ErrorKind::StreamingDisabled),
            };
        }

        match head.content_length {
            None | Some(0) => Ok(BodyMode::Empty),
            Some(length) if length <= self.req_limits.buf_max_size => {
                Ok(BodyMode::Buffered(length))
            }
            Some(length) => match self.req_limits.stream_max_size {
                Some(max) if length <= max => Ok(BodyMode::Streamed),
                _ => Err(ErrorKind::BodyTooLarge),
            },
        }
    }

    async fn read_body_buffered(
        &mut self,
        stream: &mut MaybeTls,
        length: usize,
    ) -> Result<(), ErrorKind> {
        while self.body_buf.len() < length {
            if !self.parser.buf.is_empty() {
                let need = length - self.body_buf.len();
                let take = need.min(self.parser.buf.len());
                self.body_buf.extend_from_slice(&self.parser.buf[..take]);
                self.parser.consume(take);
                continue;
            }

            let read = writer::read_with_timeout(
                stream,
                &mut self.parser.buf,
                self.conn_limits.request_timeout,
            )
            .await?;
            if read == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }

        Ok(())
    }

    /// Decodes form parameters when the content-type carries a supported
    /// form encoding and the body was buffered.
    #[allow(clippy::type_complexity)]
    fn parse_form(
        &self,
        head: &Head,
    ) -> Result<(Vec<(String, String)>, Vec<multipart::FormPart>, FormKind), ErrorKind> {
        let none = (Vec::new(), Vec::new(), FormKind::None);

        let Some(content_type) = head.header("content-type") else {
            return Ok(none);
        };

        if content_type.starts_with("application/x-www-form-urlencoded") {
            let mut fields = Vec::new();
            if !self.body_buf.is_empty() {
                Query::parse_into(&mut fields, &self.body_buf, self.req_limits.form_parts)
                    .map_err(|_| ErrorKind::InvalidForm)?;
            }
            return Ok((fields, Vec::new(), FormKind::UrlEncoded));
        }

        if content_type.starts_with("multipart/form-data") {
            let boundary =
                multipart::parse_boundary(content_type).ok_or(ErrorKind::InvalidForm)?;
            let parts = multipart::parse(&self.body_buf, &boundary, self.req_limits.form_parts)?;

            let mut fields = Vec::new();
            let mut files = Vec::new();
            for part in parts {
                if part.is_file() {
                    files.push(part);
                } else {
                    let value = part.text().ok_or(ErrorKind::InvalidForm)?.to_string();
                    fields.push((part.name().to_string(), value));
                }
            }
            return Ok((fields, files, FormKind::Multipart));
        }

        Ok(none)
    }

    #[inline(always)]
    fn is_expired(&self) -> bool {
        self.connection.request_count >= self.conn_limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime
    }
}

#[derive(Debug)]
struct Connection {
    created: Instant,
    request_count: usize,
}

impl Connection {
    #[inline(always)]
    fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
        }
    }

    #[inline(always)]
    fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
    }
}

pub(crate) mod writer {
    use crate::server::tls::MaybeTls;
    use std::{io, time::Duration};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[inline(always)]
    pub(crate) async fn write_bytes(
        stream: &mut MaybeTls,
        response: &[u8],
        timeout: Duration,
    ) -> Result<(), io::Error> {
        tokio::time::timeout(timeout, async {
            stream.write_all(response).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))?
    }

    #[inline(always)]
    pub(crate) async fn send_error(
        stream: &mut MaybeTls,
        response: &'static [u8],
        timeout: Duration,
    ) -> Result<(), io::Error> {
        write_bytes(stream, response, timeout).await
    }

    #[inline(always)]
    pub(crate) async fn read_with_timeout(
        stream: &mut MaybeTls,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<usize, io::Error> {
        let read = stream.read_buf(buf);
        match timeout {
            Some(duration) => tokio::time::timeout(duration, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))?,
            None => read.await,
        }
    }
}
