//! Request head parsing and the per-request context handed to handlers.
//!
//! # Input data requirements
//!
//! The request head (request line and headers) must be `UTF-8`; the parser
//! rejects anything else so header and path accessors can safely hand out
//! `&str`. Bodies are raw bytes. Line terminators must be exactly `CRLF`.
//!
//! ## First line
//!
//! ```text
//! [METHOD] SP [PATH] SP "HTTP/" [VERSION] CRLF
//! ```
//!
//! `[PATH]` is percent-decoded before routing; the optional query component
//! after `?` is split off and decoded into ordered key/value pairs.
//!
//! ## Headers
//!
//! ```text
//! [NAME]: [VALUE] CRLF
//! ```
//!
//! The parser extracts semantics from `Content-Length`, `Connection`,
//! `Transfer-Encoding`, `Expect` and `Cookie`; all headers remain visible
//! through [`Request::header`].

use crate::{
    errors::{Error, ErrorKind},
    http::{
        body::Body,
        multipart::FormPart,
        query::{self, Query},
        types::{slice_to_usize, Header},
    },
    limits::ReqLimits,
    route::router::RouteId,
    session::SessionCtx,
    Method, Version,
};
use memchr::memchr;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Parsed request head: everything before the body.
#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    /// Percent-decoded path, query string excluded.
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: Vec<Header>,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) expect_continue: bool,
}

impl Head {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Finds a cookie by name across all `Cookie` headers.
    pub(crate) fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
            .flat_map(|h| h.value.split(';'))
            .find_map(|pair| {
                let (key, value) = pair.trim().split_once('=')?;
                (key == name).then(|| value.to_string())
            })
    }

    #[cfg(test)]
    pub(crate) fn for_test(method: Method, target: &str) -> Head {
        let (path, query_raw) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let mut query = Vec::new();
        if let Some(raw) = query_raw {
            Query::parse_into(&mut query, raw.as_bytes(), 64).unwrap();
        }

        Head {
            method,
            version: Version::Http11,
            keep_alive: true,
            path: path.to_string(),
            query,
            headers: Vec::new(),
            content_length: None,
            chunked: false,
            expect_continue: false,
        }
    }
}

/// Incremental head parser over a single pre-allocated buffer.
///
/// Bytes are appended as the socket yields them; [`find_head`](Self::find_head)
/// resumes scanning exactly where the previous attempt stopped, so a request
/// fragmented across any number of reads parses identically to one that
/// arrives whole. Size limits are enforced while scanning, before the head is
/// complete.
#[derive(Debug)]
pub(crate) struct HeadParser {
    pub(crate) buf: Vec<u8>,
    scanned: usize,
    line_start: usize,
    lines: usize,
}

impl HeadParser {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            buf: Vec::with_capacity(limits.buf_size),
            scanned: 0,
            line_start: 0,
            lines: 0,
        }
    }

    /// Drops all buffered data. Used when a connection is handed to a new
    /// client.
    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.reset_scan();
    }

    #[inline(always)]
    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.line_start = 0;
        self.lines = 0;
    }

    /// Returns `true` if pipelined bytes from a previous read are waiting.
    #[inline(always)]
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Removes `count` consumed bytes from the front of the buffer and
    /// rewinds the scan state for the next request.
    #[inline(always)]
    pub(crate) fn consume(&mut self, count: usize) {
        self.buf.drain(..count);
        self.reset_scan();
    }

    /// Scans for the end of the head, resuming at the previous position.
    ///
    /// Returns the offset just past the terminating blank line once the full
    /// head has arrived, `None` when more bytes are needed. Line-length and
    /// line-count limits are enforced on the fly.
    pub(crate) fn find_head(&mut self, limits: &ReqLimits) -> Result<Option<usize>, ErrorKind> {
        while let Some(found) = memchr(b'\n', &self.buf[self.scanned..]) {
            let nl = self.scanned + found;
            self.scanned = nl + 1;

            if nl == 0 || self.buf[nl - 1] != b'\r' {
                return Err(ErrorKind::InvalidHeader);
            }

            let line_len = nl - 1 - self.line_start;
            self.check_line_len(line_len, limits)?;

            if line_len == 0 {
                if self.lines == 0 {
                    // Blank line before the request line
                    return Err(ErrorKind::InvalidHeader);
                }
                return Ok(Some(nl + 1));
            }

            self.lines += 1;
            // Request line + headers
            if self.lines > limits.header_count + 1 {
                return Err(ErrorKind::TooManyHeaders);
            }
            self.line_start = nl + 1;
        }

        self.scanned = self.buf.len();

        // The unterminated tail is still subject to the line-length cap
        // (+1 tolerates a trailing CR awaiting its LF)
        let pending = self.buf.len() - self.line_start;
        if pending > limits.token_max_len + 1 {
            self.check_line_len(pending, limits)?;
        }

        Ok(None)
    }

    #[inline(always)]
    fn check_line_len(&self, len: usize, limits: &ReqLimits) -> Result<(), ErrorKind> {
        if len > limits.token_max_len {
            return Err(match self.lines {
                0 => ErrorKind::UriTooLong,
                _ => ErrorKind::HeaderTooLong,
            });
        }
        Ok(())
    }

    /// Parses a complete head (everything below `head_end`).
    pub(crate) fn parse_head(
        &self,
        head_end: usize,
        limits: &ReqLimits,
    ) -> Result<Head, ErrorKind> {
        let head = &self.buf[..head_end];

        simdutf8::basic::from_utf8(head).map_err(|_| ErrorKind::InvalidEncoding)?;

        let line_end = memchr(b'\n', head).ok_or(ErrorKind::InvalidVersion)?;
        let first_line = &head[..line_end - 1]; // strip CR

        let (method, method_len) = Method::from_bytes(first_line)?;
        let (path, query) = Self::parse_target(&first_line[method_len..], limits)?;

        let space = first_line[method_len..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or(ErrorKind::InvalidVersion)?;
        let (version, mut keep_alive) =
            Version::from_bytes(&first_line[method_len + space + 1..])?;

        let mut parsed = Head {
            method,
            version,
            keep_alive,
            path,
            query,
            headers: Vec::new(),
            content_length: None,
            chunked: false,
            expect_continue: false,
        };

        let mut cursor = line_end + 1;
        while cursor < head_end {
            let line_end = cursor + memchr(b'\n', &head[cursor..]).ok_or(ErrorKind::InvalidHeader)?;
            let line = &head[cursor..line_end - 1];
            cursor = line_end + 1;

            if line.is_empty() {
                break;
            }
            Self::parse_header(line, &mut parsed)?;
        }

        if parsed.chunked && parsed.content_length.is_some() {
            // Ambiguous framing is a smuggling vector, never guess
            return Err(ErrorKind::InvalidContentLength);
        }

        if let Some(connection) = parsed.header("connection") {
            keep_alive = match () {
                _ if connection.eq_ignore_ascii_case("keep-alive") => true,
                _ if connection.eq_ignore_ascii_case("close") => false,
                _ => return Err(ErrorKind::InvalidConnection),
            };
            parsed.keep_alive = keep_alive;
        }

        Ok(parsed)
    }

    fn parse_target(
        rest: &[u8],
        limits: &ReqLimits,
    ) -> Result<(String, Vec<(String, String)>), ErrorKind> {
        let end = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or(ErrorKind::InvalidUrl)?;
        let target = &rest[..end];

        if target.first() != Some(&b'/') {
            return Err(ErrorKind::InvalidUrl);
        }

        let (raw_path, raw_query) = match memchr(b'?', target) {
            Some(pos) => (&target[..pos], Some(&target[pos + 1..])),
            None => (target, None),
        };

        let path = query::decode_path(raw_path).ok_or(ErrorKind::InvalidUrl)?;
        if path.bytes().any(|b| b.is_ascii_control()) {
            return Err(ErrorKind::InvalidUrl);
        }

        let mut pairs = Vec::new();
        if let Some(raw) = raw_query {
            if !raw.is_empty() {
                Query::parse_into(&mut pairs, raw, limits.query_parts)
                    .map_err(|_| ErrorKind::InvalidUrl)?;
            }
        }

        Ok((path, pairs))
    }

    fn parse_header(line: &[u8], head: &mut Head) -> Result<(), ErrorKind> {
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let name = &line[..colon];

        if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(ErrorKind::InvalidHeader);
        }

        // Head was UTF-8 validated up front
        let name = std::str::from_utf8(name).map_err(|_| ErrorKind::InvalidHeader)?;
        let value = std::str::from_utf8(&line[colon + 1..])
            .map_err(|_| ErrorKind::InvalidHeader)?
            .trim();

        if name.eq_ignore_ascii_case("content-length") {
            let length =
                slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?;
            if head.content_length.is_some_and(|known| known != length) {
                return Err(ErrorKind::InvalidContentLength);
            }
            head.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if !value.eq_ignore_ascii_case("chunked") {
                return Err(ErrorKind::InvalidHeader);
            }
            head.chunked = true;
        } else if name.eq_ignore_ascii_case("expect") {
            if !value.eq_ignore_ascii_case("100-continue") {
                return Err(ErrorKind::InvalidExpect);
            }
            head.expect_continue = true;
        }

        head.headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}

// REQUEST

/// Kind of form payload decoded into [`Request::form_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    /// No recognized form content-type.
    None,
    /// `application/x-www-form-urlencoded`
    UrlEncoded,
    /// `multipart/form-data`
    Multipart,
}

/// A captured span from a route pattern's regex group.
///
/// Spans index into the request's decoded path and are tagged with the route
/// that produced them; they are only reachable through the owning
/// [`Request`], so a submatch can never outlive its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submatch {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) route: RouteId,
}

impl Submatch {
    /// The route whose pattern captured this span.
    #[inline(always)]
    pub fn route(&self) -> RouteId {
        self.route
    }
}

/// The per-request context passed to handlers.
///
/// Owned by its connection; handlers borrow it for the duration of one
/// dispatch and cannot retain it. Submatches and the unmatched-path suffix
/// are filled in by the router as it descends the route tree.
pub struct Request<'c> {
    pub(crate) head: &'c Head,
    pub(crate) body: Body<'c>,
    pub(crate) form: Vec<(String, String)>,
    pub(crate) form_files: Vec<FormPart>,
    pub(crate) form_kind: FormKind,
    pub(crate) unmatched: usize,
    pub(crate) submatches: Vec<Submatch>,
    pub(crate) session: SessionCtx,
    pub(crate) client_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
}

impl<'c> Request<'c> {
    pub(crate) const UNKNOWN_CLIENT: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    pub(crate) const DEFAULT_SERVER: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.head.method
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.head.version
    }

    /// Decoded request path, without the query string.
    #[inline(always)]
    pub fn path(&self) -> &'c str {
        &self.head.path
    }

    /// Rest of the path not yet consumed by prefix routes above the current
    /// one. Starts as the full path and shrinks during dispatch.
    #[inline(always)]
    pub fn path_unmatched(&self) -> &'c str {
        &self.head.path[self.unmatched..]
    }

    /// Returns the first query parameter with the given key.
    #[inline(always)]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.head
            .query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All query parameters in request order, duplicates included.
    #[inline(always)]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.head.query
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    /// Uses linear search.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// All request headers in arrival order.
    #[inline(always)]
    pub fn headers(&self) -> &[Header] {
        &self.head.headers
    }

    /// Returns a cookie value by name.
    #[inline(always)]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.head.cookie(name)
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.head.content_length
    }

    #[inline(always)]
    pub const fn client_addr(&self) -> &SocketAddr {
        &self.client_addr
    }

    #[inline(always)]
    pub const fn server_addr(&self) -> &SocketAddr {
        &self.server_addr
    }

    /// The request body: empty, fully buffered, or streamed.
    #[inline(always)]
    pub fn body(&self) -> &Body<'c> {
        &self.body
    }

    /// Mutable body access, needed to pull chunks from a streamed body.
    #[inline(always)]
    pub fn body_mut(&mut self) -> &mut Body<'c> {
        &mut self.body
    }

    /// Which form encoding was decoded, if any.
    #[inline(always)]
    pub const fn form_kind(&self) -> FormKind {
        self.form_kind
    }

    /// Returns the first form field with the given name.
    #[inline(always)]
    pub fn form(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All decoded form fields in submission order.
    #[inline(always)]
    pub fn form_params(&self) -> &[(String, String)] {
        &self.form
    }

    /// Uploaded files from a multipart form.
    #[inline(always)]
    pub fn form_files(&self) -> &[FormPart] {
        &self.form_files
    }

    /// Number of accumulated submatches.
    #[inline(always)]
    pub fn submatch_count(&self) -> usize {
        self.submatches.len()
    }

    /// Returns submatch `index` as a path slice. Submatches are ordered
    /// oldest-first: captures from routes higher in the tree come before
    /// captures from their descendants.
    #[inline(always)]
    pub fn submatch(&self, index: usize) -> Option<&str> {
        let sm = self.submatches.get(index)?;
        self.head.path.get(sm.start..sm.end)
    }

    /// Returns the metadata record for submatch `index`.
    #[inline(always)]
    pub fn submatch_info(&self, index: usize) -> Option<&Submatch> {
        self.submatches.get(index)
    }

    // Session facade: synchronous pass-throughs into the configured store.

    /// Returns an owned copy of a session value.
    #[inline(always)]
    pub fn session_get(&self, key: &str) -> Option<String> {
        self.session.get(key)
    }

    /// Stores a session value, creating the session (and queueing its
    /// cookie) on first use.
    #[inline(always)]
    pub fn session_put(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.session.put(key, value)
    }

    /// Removes a session value.
    #[inline(always)]
    pub fn session_del(&self, key: &str) {
        self.session.del(key)
    }

    /// Removes the whole session.
    #[inline(always)]
    pub fn session_clear(&mut self) {
        self.session.clear()
    }

    /// True when a streamed body exists and has not been read to its end.
    #[inline(always)]
    pub(crate) fn body_unfinished(&self) -> bool {
        match &self.body {
            Body::Streamed(reader) => !reader.is_finished(),
            _ => false,
        }
    }
}

#[cfg(test)]
impl<'c> Request<'c> {
    pub(crate) fn for_test(head: &'c Head) -> Request<'c> {
        use crate::session::MemorySessionStore;
        use std::sync::Arc;

        Request {
            head,
            body: Body::Empty,
            form: Vec::new(),
            form_files: Vec::new(),
            form_kind: FormKind::None,
            unmatched: 0,
            submatches: Vec::new(),
            session: SessionCtx::new(Arc::new(MemorySessionStore::new()), None),
            client_addr: Request::UNKNOWN_CLIENT,
            server_addr: Request::DEFAULT_SERVER,
        }
    }
}


#[cfg(test)]
mod parse_head_tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Head, ErrorKind> {
        parse_limited(raw, &ReqLimits::default())
    }

    fn parse_limited(raw: &[u8], limits: &ReqLimits) -> Result<Head, ErrorKind> {
        let mut parser = HeadParser::new(limits);
        parser.buf.extend_from_slice(raw);
        let end = parser
            .find_head(limits)?
            .expect("test input must contain a full head");
        parser.parse_head(end, limits)
    }

    #[test]
    fn minimal_get() {
        let head = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.path, "/");
        assert!(head.keep_alive);
        assert!(head.query.is_empty());
        assert!(head.headers.is_empty());
    }

    #[test]
    fn path_decoding_and_query() {
        let head = parse(b"GET /caf%C3%A9/x?q=a+b&lang=fr HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.path, "/café/x");
        assert_eq!(
            head.query,
            vec![
                ("q".to_string(), "a b".to_string()),
                ("lang".to_string(), "fr".to_string()),
            ]
        );
    }

    #[test]
    fn header_semantics() {
        let raw = b"POST /submit HTTP/1.1\r\n\
            Host: example.com\r\n\
            Content-Length: 5\r\n\
            Connection: close\r\n\
            \r\n";
        let head = parse(raw).unwrap();

        assert_eq!(head.content_length, Some(5));
        assert!(!head.keep_alive);
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header("HOST"), Some("example.com"));
        assert_eq!(head.header("content-length"), Some("5"));
    }

    #[test]
    fn http10_defaults_to_close() {
        let head = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!head.keep_alive);

        let head = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(head.keep_alive);
    }

    #[test]
    fn chunked_and_expect() {
        let raw = b"PUT /up HTTP/1.1\r\n\
            Transfer-Encoding: chunked\r\n\
            Expect: 100-continue\r\n\
            \r\n";
        let head = parse(raw).unwrap();
        assert!(head.chunked);
        assert!(head.expect_continue);
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn cookie_lookup() {
        let raw = b"GET / HTTP/1.1\r\n\
            Cookie: a=1; sessionid=abc; b=2\r\n\
            \r\n";
        let head = parse(raw).unwrap();
        assert_eq!(head.cookie("sessionid"), Some("abc".to_string()));
        assert_eq!(head.cookie("b"), Some("2".to_string()));
        assert_eq!(head.cookie("missing"), None);
    }

    #[test]
    fn protocol_errors() {
        #[rustfmt::skip]
        let cases: [(&[u8], ErrorKind); 10] = [
            (b"BREW / HTTP/1.1\r\n\r\n",                        ErrorKind::InvalidMethod),
            (b"GET no-slash HTTP/1.1\r\n\r\n",                  ErrorKind::InvalidUrl),
            (b"GET /bad%zz HTTP/1.1\r\n\r\n",                   ErrorKind::InvalidUrl),
            (b"GET / HTTP/9.9\r\n\r\n",                         ErrorKind::InvalidVersion),
            (b"GET / HTTP/2\r\n\r\n",                           ErrorKind::UnsupportedVersion),
            (b"GET / HTTP/1.1\r\nNoColon\r\n\r\n",              ErrorKind::InvalidHeader),
            (b"GET / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",   ErrorKind::InvalidContentLength),
            (b"GET / HTTP/1.1\r\nConnection: upgrade\r\n\r\n",  ErrorKind::InvalidConnection),
            (b"GET / HTTP/1.1\r\nExpect: later\r\n\r\n",        ErrorKind::InvalidExpect),
            (b"GET / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n", ErrorKind::InvalidHeader),
        ];

        for (raw, expected) in cases {
            assert_eq!(
                parse(raw).unwrap_err(),
                expected,
                "input: {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn conflicting_framing_rejected() {
        let raw = b"POST / HTTP/1.1\r\n\
            Content-Length: 5\r\n\
            Transfer-Encoding: chunked\r\n\
            \r\n";
        assert_eq!(parse(raw).unwrap_err(), ErrorKind::InvalidContentLength);

        let raw = b"POST / HTTP/1.1\r\n\
            Content-Length: 5\r\n\
            Content-Length: 6\r\n\
            \r\n";
        assert_eq!(parse(raw).unwrap_err(), ErrorKind::InvalidContentLength);
    }

    #[test]
    fn non_utf8_head_rejected() {
        let raw = b"GET / HTTP/1.1\r\nX-Bin: \xff\xfe\r\n\r\n";
        assert_eq!(parse(raw).unwrap_err(), ErrorKind::InvalidEncoding);
    }

    #[test]
    fn query_limit_enforced() {
        let mut limits = ReqLimits::default();
        limits.query_parts = 2;
        assert_eq!(
            parse_limited(b"GET /?a=1&b=2&c=3 HTTP/1.1\r\n\r\n", &limits).unwrap_err(),
            ErrorKind::InvalidUrl
        );
    }
}
