//! URL query / form-urlencoded parsing with percent-decoding.

use crate::http::types::hex_digit;
use memchr::memchr;
use std::{error, fmt};

/// Parser for `key=value&key=value` data: URL query strings and
/// `application/x-www-form-urlencoded` bodies.
///
/// Pair order is preserved and duplicate keys are allowed; values are
/// percent-decoded and `+` decodes to a space.
///
/// # Examples
/// ```
/// use weft::query::Query;
///
/// let pairs = Query::parse(b"name=john%20doe&age=25&city", 10).unwrap();
/// assert_eq!(pairs.len(), 3);
/// assert_eq!(pairs[0], ("name".into(), "john doe".into()));
/// assert_eq!(pairs[1], ("age".into(), "25".into()));
/// assert_eq!(pairs[2], ("city".into(), "".into()));
///
/// // Handle limits
/// assert!(Query::parse(b"a=1&b=2", 1).is_err());
/// ```
pub struct Query;

impl Query {
    /// Parses a query string into an ordered list of decoded pairs.
    ///
    /// A leading `?` is accepted and skipped, so `?a=1` and `a=1` are
    /// equivalent.
    #[inline(always)]
    pub fn parse(query: &[u8], limit: usize) -> Result<Vec<(String, String)>, Error> {
        let mut result = Vec::new();
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses a query string, appending decoded pairs to an existing vector.
    ///
    /// Allows reusing an allocation across requests. Returns
    /// [`Error::OverLimit`] once the vector holds `limit` pairs and more
    /// input remains.
    #[inline]
    pub fn parse_into(
        result: &mut Vec<(String, String)>,
        query: &[u8],
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first().ok_or(Error::Empty)? {
            b'?' => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            if result.len() >= limit {
                return Err(Error::OverLimit(limit));
            }

            // Find next '&' or end of string
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            // Find '=' within current parameter segment
            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            let key = decode(&data[start..split_index]).ok_or(Error::Encoding)?;
            let value = match split_index < end {
                true => decode(&data[split_index + 1..end]).ok_or(Error::Encoding)?,
                false => String::new(), // No value (key only)
            };

            result.push((key, value));
            start = end + 1;
        }

        Ok(())
    }
}

/// Percent-decodes a query/form component. `+` becomes a space.
///
/// Returns `None` on truncated escapes, non-hex escape digits, or when the
/// decoded bytes are not valid UTF-8.
pub(crate) fn decode(src: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'%' => {
                let hi = hex_digit(*src.get(i + 1)?)?;
                let lo = hex_digit(*src.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

/// Percent-decodes a URL path component. `+` is preserved (it is only a
/// space in query/form data).
pub(crate) fn decode_path(src: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'%' => {
                let hi = hex_digit(*src.get(i + 1)?)?;
                let lo = hex_digit(*src.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

/// Error types that can occur during query parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The number of parameters exceeded the specified limit.
    OverLimit(usize),

    /// The query string is empty or contains only a `?` character.
    Empty,

    /// A percent-escape was malformed or the decoded data is not UTF-8.
    Encoding,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => {
                write!(f, "Query parameter limit exceeded: limit={}", limit)
            }
            Error::Empty => {
                write!(f, "Query string is empty or contains no parameters")
            }
            Error::Encoding => {
                write!(f, "Query contains a malformed percent-escape")
            }
        }
    }
}
