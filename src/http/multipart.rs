//! `multipart/form-data` parsing.
//!
//! Format ([RFC 7578](https://datatracker.ietf.org/doc/html/rfc7578)):
//!
//! ```text
//! --boundary\r\n
//! Content-Disposition: form-data; name="field1"\r\n
//! \r\n
//! value1\r\n
//! --boundary\r\n
//! Content-Disposition: form-data; name="file"; filename="example.txt"\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! file contents...\r\n
//! --boundary--\r\n
//! ```

use crate::errors::ErrorKind;
use memchr::memmem;

/// One decoded part of a `multipart/form-data` body.
///
/// Plain fields carry no filename; file uploads keep their raw bytes plus
/// the client-supplied filename and content type.
#[derive(Debug, Clone, PartialEq)]
pub struct FormPart {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) data: Vec<u8>,
}

impl FormPart {
    /// Field name from the `Content-Disposition` header.
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client-supplied filename, present only for file uploads.
    #[inline(always)]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Part `Content-Type`, if the client sent one.
    #[inline(always)]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Raw part payload.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` for file uploads (parts with a filename).
    #[inline(always)]
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    /// Payload as text, if it is valid UTF-8.
    #[inline(always)]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Extracts the boundary token from a `Content-Type` header value.
pub(crate) fn parse_boundary(content_type: &str) -> Option<String> {
    let rest = content_type
        .trim_start()
        .strip_prefix("multipart/form-data")?;

    for param in rest.split(';') {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if value.is_empty() || value.len() > 70 {
                return None;
            }
            return Some(value.to_string());
        }
    }

    None
}

/// Parses a buffered multipart body into its parts.
///
/// The whole body is already in memory (bounded by the buffered-body limit),
/// so this is a straight scan for boundary delimiters.
pub(crate) fn parse(
    body: &[u8],
    boundary: &str,
    max_parts: usize,
) -> Result<Vec<FormPart>, ErrorKind> {
    let delim = format!("--{boundary}");
    let delim = delim.as_bytes();

    // Preamble before the first delimiter is ignored
    let mut cursor = memmem::find(body, delim).ok_or(ErrorKind::InvalidForm)? + delim.len();
    let mut parts = Vec::new();

    loop {
        match body.get(cursor..cursor + 2) {
            Some(b"--") => return Ok(parts), // closing delimiter
            Some(b"\r\n") => cursor += 2,
            _ => return Err(ErrorKind::InvalidForm),
        }

        if parts.len() >= max_parts {
            return Err(ErrorKind::InvalidForm);
        }

        let rest = &body[cursor..];
        let headers_end = memmem::find(rest, b"\r\n\r\n").ok_or(ErrorKind::InvalidForm)?;
        let headers = std::str::from_utf8(&rest[..headers_end]).map_err(|_| ErrorKind::InvalidForm)?;
        let data_start = cursor + headers_end + 4;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;

        for line in headers.split("\r\n") {
            let (header, value) = line.split_once(':').ok_or(ErrorKind::InvalidForm)?;
            let value = value.trim();

            if header.eq_ignore_ascii_case("content-disposition") {
                if !value
                    .split(';')
                    .next()
                    .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("form-data"))
                {
                    return Err(ErrorKind::InvalidForm);
                }
                name = quoted_param(value, "name");
                filename = quoted_param(value, "filename");
            } else if header.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }

        let name = name.ok_or(ErrorKind::InvalidForm)?;

        // Part data runs until the next CRLF + delimiter
        let tail = &body[data_start..];
        let mut search = Vec::with_capacity(delim.len() + 2);
        search.extend_from_slice(b"\r\n");
        search.extend_from_slice(delim);

        let data_len = memmem::find(tail, &search).ok_or(ErrorKind::InvalidForm)?;
        parts.push(FormPart {
            name,
            filename,
            content_type,
            data: tail[..data_len].to_vec(),
        });

        cursor = data_start + data_len + search.len();
    }
}

/// Extracts a quoted parameter (`name="value"`) from a header value.
fn quoted_param(value: &str, param: &str) -> Option<String> {
    for piece in value.split(';') {
        let piece = piece.trim();
        if let Some(rest) = piece.strip_prefix(param) {
            let rest = rest.strip_prefix('=')?;
            let rest = rest.strip_prefix('"')?;
            let end = rest.find('"')?;
            return Some(rest[..end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XbOuNd\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\
        \r\n\
        hello world\r\n\
        --XbOuNd\r\n\
        Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n\
        Content-Type: application/octet-stream\r\n\
        \r\n\
        \x00\x01\x02\r\n\
        --XbOuNd--\r\n";

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            parse_boundary("multipart/form-data; boundary=XbOuNd"),
            Some("XbOuNd".to_string())
        );
        assert_eq!(
            parse_boundary("multipart/form-data; charset=utf-8; boundary=\"q w\""),
            Some("q w".to_string())
        );
        assert_eq!(parse_boundary("multipart/form-data"), None);
        assert_eq!(parse_boundary("application/x-www-form-urlencoded"), None);
        assert_eq!(parse_boundary("multipart/form-data; boundary="), None);
    }

    #[test]
    fn two_parts() {
        let parts = parse(BODY, "XbOuNd", 16).unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name(), "title");
        assert!(!parts[0].is_file());
        assert_eq!(parts[0].text(), Some("hello world"));

        assert_eq!(parts[1].name(), "upload");
        assert_eq!(parts[1].filename(), Some("a.bin"));
        assert_eq!(parts[1].content_type(), Some("application/octet-stream"));
        assert_eq!(parts[1].data(), &[0, 1, 2]);
    }

    #[test]
    fn part_limit() {
        assert_eq!(parse(BODY, "XbOuNd", 1), Err(ErrorKind::InvalidForm));
    }

    #[test]
    fn data_containing_dashes() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"f\"\r\n\
            \r\n\
            --not-the-boundary--\r\n\
            --B--\r\n";
        let parts = parse(body, "B", 16).unwrap();
        assert_eq!(parts[0].text(), Some("--not-the-boundary--"));
    }

    #[test]
    fn malformed_bodies() {
        let cases: &[&[u8]] = &[
            b"",
            b"no delimiter at all",
            b"--XbOuNd\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\nunterminated",
            b"--XbOuNd\r\nNoColonHere\r\n\r\nv\r\n--XbOuNd--\r\n",
            // Missing name parameter
            b"--XbOuNd\r\nContent-Disposition: form-data\r\n\r\nv\r\n--XbOuNd--\r\n",
            // Wrong disposition kind
            b"--XbOuNd\r\nContent-Disposition: attachment; name=\"x\"\r\n\r\nv\r\n--XbOuNd--\r\n",
        ];

        for body in cases {
            assert_eq!(
                parse(body, "XbOuNd", 16),
                Err(ErrorKind::InvalidForm),
                "accepted malformed body {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }
}
