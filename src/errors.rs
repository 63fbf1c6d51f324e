use crate::Version;
use std::{error, fmt, io};
use thiserror::Error;

/// Errors surfaced synchronously by the registration and configuration APIs.
///
/// Pattern-compilation failures are reported at route-registration time, so a
/// malformed route never makes it into a serving tree. Configuration failures
/// are reported before the listening socket is bound.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request carried a form content-type but the payload did not parse.
    #[error("invalid (unparseable) form data")]
    InvalidFormData,

    /// A parent [`RouteId`](crate::RouteId) was issued by a different
    /// [`RouterBuilder`](crate::RouterBuilder).
    #[error("parent route belongs to a different router context")]
    ForeignParentRoute,

    /// Invalid regular expression.
    #[error("invalid regular expression")]
    RegexpInvalid,

    /// Invalid regular expression: expected `]` at end of character set.
    #[error("invalid regular expression: expected ']' at end of character set")]
    RegexpCharset,

    /// Invalid regular expression: expected `)` at end of subexpression.
    #[error("invalid regular expression: expected ')' at end of subexpression")]
    RegexpSubexp,

    /// Invalid regular expression: expected `}` at end of submatch bound.
    #[error("invalid regular expression: expected '}}' at end of submatch")]
    RegexpSubmatch,

    /// Illegal instruction in a compiled regular expression (please report
    /// this bug).
    #[error("illegal instruction in compiled regular expression")]
    RegexpEngine,

    /// Route method mask is empty or carries unknown bits.
    #[error("unsupported HTTP method mask")]
    UnsupportedHttpMethod,

    /// Route nesting exceeds the supported depth
    /// ([`MAX_ROUTE_DEPTH`](crate::MAX_ROUTE_DEPTH)).
    #[error("exceeds the max number of nested routes: 127")]
    MaxNestedRoutes,

    /// TLS certificate or key material could not be loaded.
    #[error("invalid TLS material: {0}")]
    Tls(String),

    /// A session store operation failed.
    #[error("session store failure: {0}")]
    SessionStore(String),

    /// I/O failure while creating the server.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-connection protocol errors.
///
/// These never escape the connection engine: each is answered with a
/// best-effort canned response and the offending connection is closed.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,

    InvalidUrl,
    UriTooLong,

    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    HeaderTooLong,
    InvalidContentLength,
    InvalidConnection,
    InvalidEncoding,
    InvalidExpect,

    BodyTooLarge,
    InvalidChunk,
    StreamingDisabled,
    InvalidForm,

    RequestTimeout,
    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(
            &self,
            version: Version,
            json: bool,
        ) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "55"
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;

        InvalidUrl: "400 Bad Request", "51"
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        UriTooLong: "414 URI Too Long", "46"
            => r#"{"error":"URI too long","code":"URI_TOO_LONG"}"#;

        InvalidVersion: "400 Bad Request", "57"
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidHeader: "400 Bad Request", "57"
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: "431 Request Header Fields Too Large", "54"
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeaderTooLong: "431 Request Header Fields Too Large", "52"
            => r#"{"error":"Header too long","code":"HEADER_TOO_LONG"}"#;
        InvalidContentLength: "400 Bad Request", "66"
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidConnection: "400 Bad Request", "65"
            => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;
        InvalidEncoding: "400 Bad Request", "58"
            => r#"{"error":"Request is not UTF-8","code":"INVALID_ENCODING"}"#;
        InvalidExpect: "417 Expectation Failed", "59"
            => r#"{"error":"Unsupported expectation","code":"INVALID_EXPECT"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        InvalidChunk: "400 Bad Request", "57"
            => r#"{"error":"Malformed chunked body","code":"INVALID_CHUNK"}"#;
        StreamingDisabled: "501 Not Implemented", "64"
            => r#"{"error":"Streamed bodies disabled","code":"STREAMING_DISABLED"}"#;
        InvalidForm: "400 Bad Request", "51"
            => r#"{"error":"Invalid form data","code":"INVALID_FORM"}"#;

        RequestTimeout: "408 Request Timeout", "54"
            => r#"{"error":"Request timed out","code":"REQUEST_TIMEOUT"}"#;
        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        Io: "503 Service Unavailable", "48"
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            ErrorKind::RequestTimeout
        } else {
            ErrorKind::Io(IoError(err))
        }
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
