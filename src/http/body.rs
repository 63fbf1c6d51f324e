//! Request body delivery: buffered slices and streamed chunk readers.
//!
//! Two mutually exclusive contracts:
//!
//! - **Buffered**: the connection engine accumulates the whole body (bounded
//!   by the buffered-size limit) before the handler runs; the handler sees
//!   one contiguous slice.
//! - **Streamed**: used for chunked transfer encoding and bodies larger than
//!   the buffered cap. The handler is invoked once headers are parsed and
//!   pulls data with [`BodyReader::next_chunk`]; the engine reads from the
//!   socket only between pulls, so memory stays bounded by one chunk buffer
//!   regardless of body size.

use crate::{errors::ErrorKind, server::tls::MaybeTls};
use std::{io, time::Duration};
use tokio::io::AsyncReadExt;

/// The request body as seen by handlers.
pub enum Body<'c> {
    /// No body.
    Empty,
    /// Fully buffered body bytes.
    Buffered(&'c [u8]),
    /// Body delivered incrementally; pull chunks via [`BodyReader`].
    Streamed(BodyReader<'c>),
}

impl<'c> Body<'c> {
    /// Returns the buffered bytes, or `None` for empty/streamed bodies.
    #[inline(always)]
    pub fn bytes(&self) -> Option<&'c [u8]> {
        match self {
            Body::Buffered(bytes) => Some(*bytes),
            _ => None,
        }
    }

    /// Returns `true` for streamed bodies.
    #[inline(always)]
    pub fn is_streamed(&self) -> bool {
        matches!(self, Body::Streamed(_))
    }

    /// Returns the streamed-body reader, if this body is streamed.
    #[inline(always)]
    pub fn reader(&mut self) -> Option<&mut BodyReader<'c>> {
        match self {
            Body::Streamed(reader) => Some(reader),
            _ => None,
        }
    }
}

// CHUNK DECODING

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    /// Reading hex size digits.
    Size,
    /// Skipping a chunk extension up to CR.
    Ext,
    /// CR of the size line seen, expecting LF.
    SizeLf,
    /// Reading chunk payload, `n` bytes left.
    Data(usize),
    /// Payload finished, expecting CR.
    DataCr,
    /// Expecting LF after payload CR.
    DataLf,
    /// After the last (zero-size) chunk: trailer section.
    Trailer,
    /// Skipping a trailer header line up to LF.
    TrailerLine,
    /// Final CR seen, expecting terminating LF.
    FinalLf,
    /// Message complete.
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Consumes any fragmentation of the wire bytes; the concatenation of the
/// produced payload equals the original body regardless of how reads were
/// split.
#[derive(Debug)]
pub(crate) struct ChunkDecoder {
    state: ChunkState,
    size: usize,
}

impl ChunkDecoder {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decodes as much of `input` as possible, appending payload bytes to
    /// `out`. Returns the number of input bytes consumed and whether the
    /// body terminator has been reached.
    pub(crate) fn decode(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(usize, bool), ErrorKind> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ChunkState::Size => match input[pos] {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = crate::http::types::hex_digit(input[pos]).unwrap() as usize;
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(digit))
                            .ok_or(ErrorKind::InvalidChunk)?;
                        pos += 1;
                    }
                    b';' => {
                        self.state = ChunkState::Ext;
                        pos += 1;
                    }
                    b'\r' => {
                        self.state = ChunkState::SizeLf;
                        pos += 1;
                    }
                    _ => return Err(ErrorKind::InvalidChunk),
                },
                ChunkState::Ext => {
                    if input[pos] == b'\r' {
                        self.state = ChunkState::SizeLf;
                    }
                    pos += 1;
                }
                ChunkState::SizeLf => {
                    if input[pos] != b'\n' {
                        return Err(ErrorKind::InvalidChunk);
                    }
                    pos += 1;
                    self.state = match self.size {
                        0 => ChunkState::Trailer,
                        n => ChunkState::Data(n),
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;

                    self.state = match remaining - take {
                        0 => ChunkState::DataCr,
                        left => ChunkState::Data(left),
                    };
                }
                ChunkState::DataCr => {
                    if input[pos] != b'\r' {
                        return Err(ErrorKind::InvalidChunk);
                    }
                    pos += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(ErrorKind::InvalidChunk);
                    }
                    pos += 1;
                    self.size = 0;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => match input[pos] {
                    b'\r' => {
                        self.state = ChunkState::FinalLf;
                        pos += 1;
                    }
                    _ => self.state = ChunkState::TrailerLine,
                },
                ChunkState::TrailerLine => {
                    if input[pos] == b'\n' {
                        self.state = ChunkState::Trailer;
                    }
                    pos += 1;
                }
                ChunkState::FinalLf => {
                    if input[pos] != b'\n' {
                        return Err(ErrorKind::InvalidChunk);
                    }
                    pos += 1;
                    self.state = ChunkState::Done;
                    return Ok((pos, true));
                }
                ChunkState::Done => return Ok((pos, true)),
            }
        }

        Ok((pos, self.state == ChunkState::Done))
    }
}

// BODY READER

enum Framing {
    /// Fixed-length body, bytes remaining.
    Length(usize),
    Chunked(ChunkDecoder),
}

/// Pull-based reader for streamed request bodies.
///
/// Borrowed from the connection for the duration of one request; each call
/// to [`next_chunk`](Self::next_chunk) may read from the socket, so the
/// engine never buffers ahead of the handler.
pub struct BodyReader<'c> {
    io: &'c mut MaybeTls,
    /// Connection read buffer; may already hold body bytes that arrived
    /// with the head.
    buf: &'c mut Vec<u8>,
    framing: Framing,
    chunk: Vec<u8>,
    /// Payload bytes still allowed by the streamed-size limit.
    budget: usize,
    read_timeout: Option<Duration>,
    finished: bool,
}

impl<'c> BodyReader<'c> {
    pub(crate) fn new(
        io: &'c mut MaybeTls,
        buf: &'c mut Vec<u8>,
        content_length: Option<usize>,
        budget: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        let framing = match content_length {
            Some(length) => Framing::Length(length),
            None => Framing::Chunked(ChunkDecoder::new()),
        };

        Self {
            finished: matches!(framing, Framing::Length(0)),
            io,
            buf,
            framing,
            chunk: Vec::new(),
            budget,
            read_timeout,
        }
    }

    /// Returns `true` once the body has been fully delivered.
    #[inline(always)]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Delivers the next chunk of body data, reading from the socket as
    /// needed. Returns `None` when the body is complete.
    ///
    /// # Errors
    ///
    /// `InvalidData` for malformed chunked framing or a body exceeding the
    /// streamed-size limit, `TimedOut` when the active-request timeout
    /// expires, `UnexpectedEof` if the peer disconnects mid-body.
    pub async fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        if self.finished {
            return Ok(None);
        }
        self.chunk.clear();

        loop {
            if !self.buf.is_empty() {
                match &mut self.framing {
                    Framing::Length(remaining) => {
                        let take = (*remaining).min(self.buf.len());
                        self.chunk.extend_from_slice(&self.buf[..take]);
                        self.buf.drain(..take);
                        *remaining -= take;
                        if *remaining == 0 {
                            self.finished = true;
                        }
                    }
                    Framing::Chunked(decoder) => {
                        let (consumed, done) = decoder
                            .decode(self.buf, &mut self.chunk)
                            .map_err(|_| invalid_data("malformed chunked body"))?;
                        self.buf.drain(..consumed);
                        if done {
                            self.finished = true;
                        }
                    }
                }

                if !self.chunk.is_empty() {
                    self.budget = self
                        .budget
                        .checked_sub(self.chunk.len())
                        .ok_or_else(|| invalid_data("streamed body exceeds limit"))?;
                    return Ok(Some(&self.chunk));
                }
                if self.finished {
                    return Ok(None);
                }
            }

            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-body",
                ));
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let read = self.io.read_buf(self.buf);
        match self.read_timeout {
            Some(duration) => tokio::time::timeout(duration, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))?,
            None => read.await,
        }
    }
}

#[inline(always)]
fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod decoder_tests {
    use super::*;

    const WIRE: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
    const PAYLOAD: &[u8] = b"Wikipedia in\r\n\r\nchunks.";

    #[test]
    fn whole_message() {
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();

        let (consumed, done) = decoder.decode(WIRE, &mut out).unwrap();
        assert_eq!(consumed, WIRE.len());
        assert!(done);
        assert_eq!(out, PAYLOAD);
    }

    // Any fragmentation of the wire bytes must reconstruct the same
    // payload, in order, without loss or duplication.
    #[test]
    fn any_fragmentation_reassembles() {
        for step in 1..WIRE.len() {
            let mut decoder = ChunkDecoder::new();
            let mut out = Vec::new();
            let mut done = false;

            for piece in WIRE.chunks(step) {
                let (consumed, finished) = decoder.decode(piece, &mut out).unwrap();
                assert_eq!(consumed, piece.len());
                done = finished;
            }

            assert!(done, "step={step}");
            assert_eq!(out, PAYLOAD, "step={step}");
        }
    }

    #[test]
    fn extensions_and_trailers_skipped() {
        let wire = b"3;name=val\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();

        let (consumed, done) = decoder.decode(wire, &mut out).unwrap();
        assert_eq!(consumed, wire.len());
        assert!(done);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn hex_sizes() {
        let wire = b"A\r\n0123456789\r\n0\r\n\r\n";
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();

        decoder.decode(wire, &mut out).unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn malformed_framing() {
        let cases: &[&[u8]] = &[
            b"Z\r\n",          // not a hex digit
            b"4\rX",           // CR not followed by LF
            b"1\r\naXX",       // payload not followed by CRLF
            b"FFFFFFFFFFFFFFFFFF\r\n", // size overflow
        ];

        for wire in cases {
            let mut decoder = ChunkDecoder::new();
            let mut out = Vec::new();
            assert_eq!(
                decoder.decode(wire, &mut out),
                Err(ErrorKind::InvalidChunk),
                "accepted {:?}",
                String::from_utf8_lossy(wire)
            );
        }
    }

    #[test]
    fn consumed_stops_at_message_end() {
        let mut wire = WIRE.to_vec();
        wire.extend_from_slice(b"GET /next HTTP/1.1\r\n");

        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        let (consumed, done) = decoder.decode(&wire, &mut out).unwrap();

        assert!(done);
        // Pipelined bytes after the terminator are left untouched
        assert_eq!(consumed, WIRE.len());
        assert_eq!(&wire[consumed..], b"GET /next HTTP/1.1\r\n");
    }
}

#[cfg(test)]
mod reader_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect(reader: &mut BodyReader<'_>) -> io::Result<Vec<u8>> {
        let mut all = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            all.extend_from_slice(chunk);
        }
        Ok(all)
    }

    #[tokio::test]
    async fn fixed_length_across_reads() {
        let (mut client, server) = tokio::io::duplex(8);
        let mut io = MaybeTls::Mem(server);
        let mut buf = b"he".to_vec(); // bytes that arrived with the head

        let writer = tokio::spawn(async move {
            client.write_all(b"llo world").await.unwrap();
        });

        let mut reader = BodyReader::new(&mut io, &mut buf, Some(11), 1024, None);
        assert_eq!(collect(&mut reader).await.unwrap(), b"hello world");
        assert!(reader.is_finished());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn chunked_stream_reassembles() {
        let (mut client, server) = tokio::io::duplex(4);
        let mut io = MaybeTls::Mem(server);
        let mut buf = Vec::new();

        let writer = tokio::spawn(async move {
            let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
            // Deliberately awkward write sizes
            for piece in wire.chunks(3) {
                client.write_all(piece).await.unwrap();
            }
        });

        let mut reader = BodyReader::new(&mut io, &mut buf, None, 1024, None);
        assert_eq!(collect(&mut reader).await.unwrap(), b"Wikipedia");
        assert!(reader.is_finished());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn pipelined_bytes_preserved_after_body() {
        let (_client, server) = tokio::io::duplex(8);
        let mut io = MaybeTls::Mem(server);
        // Body and the next request arrived together
        let mut buf = b"3\r\nabc\r\n0\r\n\r\nGET /next HTTP/1.1\r\n\r\n".to_vec();

        let mut reader = BodyReader::new(&mut io, &mut buf, None, 1024, None);
        assert_eq!(collect(&mut reader).await.unwrap(), b"abc");

        assert_eq!(buf, b"GET /next HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn budget_enforced() {
        let (_client, server) = tokio::io::duplex(8);
        let mut io = MaybeTls::Mem(server);
        let mut buf = b"8\r\nabcdefgh\r\n0\r\n\r\n".to_vec();

        let mut reader = BodyReader::new(&mut io, &mut buf, None, 4, None);
        let err = collect(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_mid_body_is_an_error() {
        let (client, server) = tokio::io::duplex(8);
        let mut io = MaybeTls::Mem(server);
        let mut buf = b"hel".to_vec();
        drop(client);

        let mut reader = BodyReader::new(&mut io, &mut buf, Some(10), 1024, None);
        // First chunk drains the buffered part
        assert_eq!(
            reader.next_chunk().await.unwrap(),
            Some(b"hel".as_slice())
        );
        let err = reader.next_chunk().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn zero_length_body_is_immediately_finished() {
        let (_client, server) = tokio::io::duplex(8);
        let mut io = MaybeTls::Mem(server);
        let mut buf = Vec::new();

        let mut reader = BodyReader::new(&mut io, &mut buf, Some(0), 1024, None);
        assert!(reader.is_finished());
        assert_eq!(reader.next_chunk().await.unwrap(), None);
    }
}
