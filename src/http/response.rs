//! Zero-allocation-minded HTTP response builder.

use crate::{
    http::types::{StatusCode, Version},
    limits::RespLimits,
    session::{render_cookie, CookieOpts},
};
use std::borrow::Cow;

/// HTTP response builder for constructing server responses.
///
/// Build responses by chaining methods in strict order:
/// [`status()`](Response::status) -> headers/cookies -> one body method.
/// Content-length is calculated automatically; the `connection` header is
/// derived from [`close()`](Response::close) and the protocol version.
///
/// Instances are created by the server, reused across requests on a
/// connection, and passed to handlers as `&mut Response`.
///
/// # Examples
/// ```ignore
/// resp.status(StatusCode::Ok)
///     .header("content-type", "text/html")
///     .body("<h1>Hello World</h1>");
/// ```
///
/// # Panics
/// Ordering violations panic in `debug` mode only; in `release` mode the
/// checks are omitted for performance.
#[derive(Debug)]
pub struct Response {
    buffer: Vec<u8>,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    cookies: Vec<String>,
    posit_length: usize,
    start_body: usize,
    head_insert: usize,
    state: ResponseState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResponseState {
    Clean,
    Headers,
    Complete,
}

impl Response {
    #[inline(always)]
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            buffer: Vec::with_capacity(limits.default_capacity),
            version: Version::Http11,
            keep_alive: true,
            cookies: Vec::new(),
            posit_length: 0,
            start_body: 0,
            head_insert: 0,
            state: ResponseState::Clean,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self, limits: &RespLimits) {
        if self.buffer.capacity() > limits.max_capacity {
            self.buffer = Vec::with_capacity(limits.default_capacity);
        } else {
            self.buffer.clear();
        }

        self.version = Version::Http11;
        self.keep_alive = true;
        self.cookies.clear();
        self.posit_length = 0;
        self.start_body = 0;
        self.head_insert = 0;
        self.state = ResponseState::Clean;
    }

    #[inline(always)]
    pub(crate) fn buffer(&self) -> &Vec<u8> {
        &self.buffer
    }

    #[inline(always)]
    pub(crate) fn is_complete(&self) -> bool {
        self.state == ResponseState::Complete
    }

    /// Writes a complete minimal response in one step. Used by the engine
    /// when a handler signals a status without building a body.
    pub(crate) fn finalize_with_status(&mut self, status: StatusCode) {
        debug_assert!(self.state != ResponseState::Complete);

        if self.state == ResponseState::Clean {
            self.status(status);
        }
        self.body("");
    }

    /// Inserts an extra header line into an already finalized response.
    ///
    /// Needed for the session cookie: the session may be created inside the
    /// handler after the body was finalized.
    pub(crate) fn insert_late_header(&mut self, name: &str, value: &str) {
        debug_assert!(self.state == ResponseState::Complete);

        let mut line = Vec::with_capacity(name.len() + value.len() + 4);
        line.extend_from_slice(name.as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        line.extend_from_slice(b"\r\n");

        self.buffer
            .splice(self.head_insert..self.head_insert, line);
    }
}

impl Response {
    /// Sets the HTTP status code for the response.
    ///
    /// # Examples
    /// ```ignore
    /// resp.status(StatusCode::NotFound)
    ///     .body(r#"{"status": "not found", "code": 404}"#);
    /// ```
    ///
    /// # Panics
    /// Panics in `debug` mode when called more than once or after a body
    /// method.
    #[inline]
    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Clean,
            "Must be first and called only once"
        );

        self.buffer
            .extend_from_slice(status.into_first_line(self.version));
        self.state = ResponseState::Headers;
        self
    }

    /// Adds a header to the response.
    ///
    /// PLEASE DO NOT ADD THE FOLLOWING HEADERS:
    /// - `content-length` - calculated automatically
    /// - `connection` - use [`close()`](Response::close)
    /// - `set-cookie` - use [`cookie()`](Response::cookie)
    ///
    /// # Examples
    /// ```ignore
    /// resp.status(StatusCode::Ok)
    ///     .header("content-type", "text/plain")  // &str, &str
    ///     .header("x-custom-id", 128)            // &str, i32
    ///     .body("Done");
    /// ```
    ///
    /// # Panics
    /// Panics in `debug` mode when called before
    /// [`status()`](Response::status) or after a body method.
    #[inline]
    #[track_caller]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before any body method"
        );

        name.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b": ");
        value.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    /// Appends a `Set-Cookie` header built from the given options.
    ///
    /// Cookies may be queued at any point before a body method finalizes the
    /// response, in any order relative to [`header()`](Response::header)
    /// calls.
    ///
    /// # Examples
    /// ```ignore
    /// use weft::CookieOpts;
    ///
    /// resp.status(StatusCode::Ok)
    ///     .cookie("theme", "dark", &CookieOpts::new().path("/").validity_sec(86400))
    ///     .body("saved");
    /// ```
    #[inline]
    #[track_caller]
    pub fn cookie(&mut self, name: &str, value: &str, opts: &CookieOpts) -> &mut Self {
        debug_assert!(
            self.state != ResponseState::Complete,
            "Must be called before any body method"
        );

        self.cookies.push(render_cookie(name, value, opts));
        self
    }

    /// Forces the connection to close after this response.
    ///
    /// # Panics
    /// Panics in `debug` mode when called after a body method.
    #[inline]
    #[track_caller]
    pub fn close(&mut self) -> &mut Self {
        debug_assert!(
            self.state != ResponseState::Complete,
            "Must be called before any finalizing method",
        );

        self.keep_alive = false;
        self
    }

    /// Sets the response body and finalizes the response.
    ///
    /// # Side Effects
    /// - Flushes queued `Set-Cookie` headers
    /// - Adds a `connection` header if necessary
    /// - Calculates and sets the `content-length` header
    ///
    /// After this call the response is complete and cannot be modified.
    ///
    /// # Panics
    /// Panics in `debug` mode when called before
    /// [`status()`](Response::status) or twice.
    #[inline]
    #[track_caller]
    pub fn body<T: WriteBuffer>(&mut self, data: T) {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        self.begin_body();
        data.write_to(&mut self.buffer);
        self.end_body();
    }

    /// Writes the response body via closure and finalizes the response.
    ///
    /// # Examples
    /// ```ignore
    /// use std::io::Write;
    ///
    /// resp.status(StatusCode::Ok)
    ///     .header("content-type", "application/json")
    ///     .body_with(|writer| {
    ///         write!(writer, r#"{{"status": "ok", "n": {}}}"#, 7).unwrap();
    ///     });
    /// ```
    #[inline]
    #[track_caller]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        self.begin_body();
        f(&mut BodyWriter(&mut self.buffer));
        self.end_body();
    }
}

impl Response {
    #[inline(always)]
    fn begin_body(&mut self) {
        for i in 0..self.cookies.len() {
            self.buffer.extend_from_slice(b"set-cookie: ");
            self.buffer.extend_from_slice(self.cookies[i].as_bytes());
            self.buffer.extend_from_slice(b"\r\n");
        }
        self.cookies.clear();

        if let Some(value) = self.connection_header() {
            self.header("connection", value);
        }

        self.head_insert = self.buffer.len();
        self.buffer.extend_from_slice(b"content-length: ");
        self.posit_length = self.buffer.len();
        self.buffer.extend_from_slice(b"0000000000\r\n\r\n");
        self.start_body = self.buffer.len();
    }

    #[inline(always)]
    fn end_body(&mut self) {
        let body_len = self.buffer.len() - self.start_body;
        let digits = Self::number_to_bytes(body_len as u64);

        let target_range = self.posit_length..self.posit_length + 10;
        self.buffer[target_range].copy_from_slice(&digits[10..20]);
        self.state = ResponseState::Complete;
    }

    #[inline(always)]
    const fn connection_header(&self) -> Option<&'static [u8]> {
        match (self.version, self.keep_alive) {
            (Version::Http11, true) => None,
            (Version::Http11, false) => Some(b"close"),
            (Version::Http10, true) => Some(b"keep-alive"),
            (Version::Http10, false) => Some(b"close"),
        }
    }

    #[inline]
    const fn number_to_bytes(mut n: u64) -> [u8; 20] {
        let mut buffer = [b'0'; 20];
        let mut i = 20;

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        buffer
    }
}

/// Writer for constructing the HTTP response body.
/// Used in [`body_with`](Response::body_with).
#[derive(Debug)]
pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

impl BodyWriter<'_> {
    /// Appends content to the response body.
    #[inline]
    pub fn write<T: WriteBuffer>(&mut self, value: T) {
        value.write_to(self.0);
    }
}

impl std::io::Write for BodyWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Trait for writing data to the [`Response`] buffer.
///
/// Implemented for common string, byte and integer types. Floating-point
/// numbers are deliberately left out to avoid locale and precision surprises
/// in protocol output.
///
/// # Example
/// ```
/// use weft::WriteBuffer;
///
/// struct MyString(String);
///
/// impl WriteBuffer for MyString {
///     fn write_to(&self, buffer: &mut Vec<u8>) {
///         buffer.extend_from_slice(self.0.as_bytes())
///     }
/// }
/// ```
pub trait WriteBuffer {
    /// Writes the value's representation directly to the buffer.
    fn write_to(&self, buffer: &mut Vec<u8>);
}

impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
    #[inline]
    fn write_to(&self, buffer: &mut Vec<u8>) {
        T::write_to(*self, buffer);
    }
}

macro_rules! impl_write_buffer {
    (str => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                buffer.extend_from_slice(self.as_bytes());
            }
        })*
    };
    (bytes => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                buffer.extend_from_slice(self);
            }
        })*
    };
    (unsigned => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                let digits = Response::number_to_bytes(*self as u64);
                let start = digits.iter().position(|&b| b != b'0').unwrap_or(19);
                buffer.extend_from_slice(&digits[start..]);
            }
        })*
    };
    (signed => $($t:ty),*) => {
        $(impl WriteBuffer for $t {
            #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                if *self < 0 {
                    buffer.push(b'-');
                }
                ((self.unsigned_abs()) as u64).write_to(buffer);
            }
        })*
    };
}

impl_write_buffer! { str => str, String, Cow<'_, str> }
impl_write_buffer! { bytes => [u8], Vec<u8> }
impl_write_buffer! { unsigned => u8, u16, u32, u64, usize }
impl_write_buffer! { signed => i8, i16, i32, i64, isize }

impl<const N: usize> WriteBuffer for [u8; N] {
    #[inline]
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self);
    }
}

impl WriteBuffer for bool {
    #[inline]
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(match self {
            true => b"true",
            false => b"false",
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::from_utf8;

    fn resp() -> Response {
        Response::new(&RespLimits::default())
    }

    fn text(resp: &Response) -> &str {
        from_utf8(resp.buffer()).unwrap()
    }

    #[test]
    fn simple_response() {
        let mut resp = resp();
        resp.status(StatusCode::Ok)
            .header("content-type", "text/plain")
            .body("Hello");

        assert_eq!(
            text(&resp),
            "HTTP/1.1 200 OK\r\n\
             content-type: text/plain\r\n\
             content-length: 0000000005\r\n\r\nHello"
        );
        assert!(resp.is_complete());
    }

    #[test]
    fn connection_header_matrix() {
        let cases = [
            (Version::Http11, false, ""),
            (Version::Http11, true, "connection: close\r\n"),
            (Version::Http10, false, "connection: keep-alive\r\n"),
            (Version::Http10, true, "connection: close\r\n"),
        ];

        for (version, is_close, header) in cases {
            let mut resp = resp();
            resp.version = version;

            if is_close {
                resp.close();
                assert!(!resp.keep_alive);
            }

            resp.status(StatusCode::Ok).body("");
            assert_eq!(
                text(&resp),
                format!(
                    "{}{header}content-length: 0000000000\r\n\r\n",
                    from_utf8(StatusCode::Ok.into_first_line(version)).unwrap()
                )
            );
        }
    }

    #[test]
    fn body_with_writer() {
        use std::io::Write;

        let mut resp = resp();
        resp.status(StatusCode::Ok).body_with(|w| {
            w.write("n=");
            w.write(42u32);
            write!(w, ", neg={}", -7).unwrap();
        });

        assert!(text(&resp).ends_with("\r\n\r\nn=42, neg=-7"));
        assert!(text(&resp).contains("content-length: 0000000012\r\n"));
    }

    #[test]
    fn cookies_flushed_with_body() {
        let mut resp = resp();
        resp.status(StatusCode::Ok)
            .cookie("theme", "dark", &CookieOpts::new().path("/"))
            .header("content-type", "text/plain")
            .cookie("lang", "en", &CookieOpts::new())
            .body("x");

        let raw = text(&resp);
        assert!(raw.contains("set-cookie: theme=dark; Path=/\r\n"));
        assert!(raw.contains("set-cookie: lang=en\r\n"));
        // Cookies land in the header section, before the blank line
        let head_end = raw.find("\r\n\r\n").unwrap();
        assert!(raw.find("set-cookie").unwrap() < head_end);
    }

    #[test]
    fn late_header_insertion() {
        let mut resp = resp();
        resp.status(StatusCode::Ok)
            .header("content-type", "text/plain")
            .body("hi");

        resp.insert_late_header("set-cookie", "sessionid=abc; HttpOnly");

        let raw = text(&resp);
        let head_end = raw.find("\r\n\r\n").unwrap();
        let cookie_at = raw.find("set-cookie: sessionid=abc; HttpOnly\r\n").unwrap();
        assert!(cookie_at < head_end);
        assert!(raw.ends_with("\r\n\r\nhi"));
        // content-length still parses and matches
        assert!(raw.contains("content-length: 0000000002\r\n"));
    }

    #[test]
    fn finalize_with_status_from_clean() {
        let mut resp = resp();
        resp.finalize_with_status(StatusCode::NotFound);
        assert!(text(&resp).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(resp.is_complete());
    }

    #[test]
    fn finalize_with_status_keeps_started_head() {
        let mut resp = resp();
        resp.status(StatusCode::Forbidden)
            .header("x-reason", "nope");
        resp.finalize_with_status(StatusCode::Forbidden);

        let raw = text(&resp);
        assert!(raw.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(raw.contains("x-reason: nope\r\n"));
    }

    #[test]
    fn buffer_reset_respects_capacity_limit() {
        let limits = RespLimits {
            default_capacity: 16,
            max_capacity: 64,
        };
        let mut resp = Response::new(&limits);
        resp.status(StatusCode::Ok).body("x".repeat(256));
        assert!(resp.buffer.capacity() > 64);

        resp.reset(&limits);
        assert!(resp.buffer.capacity() <= 64);
        assert!(!resp.is_complete());
        assert!(resp.keep_alive);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Must be first and called only once")]
    fn double_status_panics() {
        let mut resp = resp();
        resp.status(StatusCode::Ok);
        resp.status(StatusCode::Found);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Must be called after status()")]
    fn header_before_status_panics() {
        resp().header("name", "value");
    }

    #[test]
    fn number_rendering() {
        let mut buf = Vec::new();
        0usize.write_to(&mut buf);
        buf.push(b' ');
        10203u32.write_to(&mut buf);
        buf.push(b' ');
        (-42i64).write_to(&mut buf);
        assert_eq!(buf, b"0 10203 -42");
    }
}
