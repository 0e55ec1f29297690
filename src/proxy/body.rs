/**
 * Copyright (c) 2025-2026 Wiretap, Inc.
 *
 * This file is part of Wiretap
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::headers::HeaderTable;

const READ_CHUNK_SIZE: usize = 64 * 1024;

fn protocol_error(message: impl Into<String>) -> tokio::io::Error {
    tokio::io::Error::new(tokio::io::ErrorKind::InvalidData, message.into())
}

/// how a message body is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

fn content_length(headers: &HeaderTable) -> Option<u64> {
    headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn is_chunked(headers: &HeaderTable) -> bool {
    headers
        .get("transfer-encoding")
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

/// framing of a request body, requests never read until close
pub fn request_body_mode(headers: &HeaderTable) -> BodyMode {
    if is_chunked(headers) {
        return BodyMode::Chunked;
    }
    match content_length(headers) {
        Some(0) | None => BodyMode::None,
        Some(n) => BodyMode::ContentLength(n),
    }
}

/// framing of a response body given the request method and status
pub fn response_body_mode(method: &str, status: u16, headers: &HeaderTable) -> BodyMode {
    if method.eq_ignore_ascii_case("HEAD") {
        return BodyMode::None;
    }
    match status {
        100..=199 | 204 | 304 => return BodyMode::None,
        _ => {}
    }
    if is_chunked(headers) {
        return BodyMode::Chunked;
    }
    match content_length(headers) {
        Some(0) => BodyMode::None,
        Some(n) => BodyMode::ContentLength(n),
        None => BodyMode::UntilClose,
    }
}

/// bounded capture of a streamed body
///
/// keeps at most `cap` bytes and a truncation flag; the relay stream is
/// never affected by the cap.
#[derive(Debug)]
pub struct CaptureSink {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
    total: u64,
}

impl CaptureSink {
    pub fn new(cap: usize) -> Self {
        CaptureSink {
            data: Vec::new(),
            cap,
            truncated: false,
            total: 0,
        }
    }

    /// capture everything, used when a rule needs the whole body
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if self.truncated {
            return;
        }
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.data.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// captured bytes and the truncation flag, empty capture becomes absent
    pub fn into_parts(self) -> (Option<Vec<u8>>, bool) {
        if self.data.is_empty() {
            (None, self.truncated)
        } else {
            (Some(self.data), self.truncated)
        }
    }
}

// chunked transfer scanner
//
// the raw bytes are forwarded untouched; this only tracks structure to
// find the end of the message and to hand payload bytes to the capture
// sink.
enum ChunkState {
    Size,
    Data(u64),
    DataEnd(u8),
    Trailer,
    Done,
}

struct ChunkScanner {
    state: ChunkState,
    line: Vec<u8>,
}

impl ChunkScanner {
    fn new() -> Self {
        ChunkScanner {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    fn parse_size_line(line: &[u8]) -> tokio::io::Result<u64> {
        let text = std::str::from_utf8(line)
            .map_err(|_| protocol_error("non-utf8 chunk size line"))?;
        let size_part = text
            .trim_end_matches(['\r', '\n'])
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        u64::from_str_radix(size_part, 16)
            .map_err(|_| protocol_error(format!("bad chunk size {size_part:?}")))
    }

    /// scan as much of `input` as possible
    ///
    /// returns how many bytes belong to this message and whether the
    /// message is complete; never consumes past the terminator, pipelined
    /// bytes stay untouched.
    fn feed(&mut self, input: &[u8], sink: &mut CaptureSink) -> tokio::io::Result<(usize, bool)> {
        let mut consumed = 0;
        while consumed < input.len() {
            match self.state {
                ChunkState::Size => {
                    let byte = input[consumed];
                    self.line.push(byte);
                    consumed += 1;
                    if byte == b'\n' {
                        let size = Self::parse_size_line(&self.line)?;
                        self.line.clear();
                        self.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    } else if self.line.len() > 1024 {
                        return Err(protocol_error("chunk size line too long"));
                    }
                }
                ChunkState::Data(remaining) => {
                    let available = input.len() - consumed;
                    let take = available.min(remaining as usize);
                    sink.push(&input[consumed..consumed + take]);
                    consumed += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd(2)
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd(remaining) => {
                    let available = input.len() - consumed;
                    let take = available.min(remaining as usize);
                    consumed += take;
                    let left = remaining - take as u8;
                    self.state = if left == 0 {
                        ChunkState::Size
                    } else {
                        ChunkState::DataEnd(left)
                    };
                }
                ChunkState::Trailer => {
                    let byte = input[consumed];
                    self.line.push(byte);
                    consumed += 1;
                    if byte == b'\n' {
                        let blank = self.line == b"\r\n" || self.line == b"\n";
                        self.line.clear();
                        if blank {
                            self.state = ChunkState::Done;
                            return Ok((consumed, true));
                        }
                    } else if self.line.len() > 8 * 1024 {
                        return Err(protocol_error("trailer line too long"));
                    }
                }
                ChunkState::Done => return Ok((consumed, true)),
            }
        }
        Ok((consumed, matches!(self.state, ChunkState::Done)))
    }
}

/// relay one message body from `src` to `dst`
///
/// `buf` is the session read buffer holding any bytes already read past
/// the head; on return it holds only bytes past this body. every relayed
/// payload byte also goes through the capture sink.
pub async fn relay_body<R, W>(
    src: &mut R,
    dst: &mut W,
    buf: &mut BytesMut,
    mode: BodyMode,
    sink: &mut CaptureSink,
) -> tokio::io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match mode {
        BodyMode::None => Ok(()),
        BodyMode::ContentLength(length) => {
            let mut remaining = length;
            while remaining > 0 {
                if buf.is_empty() {
                    buf.reserve(READ_CHUNK_SIZE);
                    let n = src.read_buf(buf).await?;
                    if n == 0 {
                        return Err(tokio::io::Error::new(
                            tokio::io::ErrorKind::UnexpectedEof,
                            "connection closed mid body",
                        ));
                    }
                }
                let take = (buf.len() as u64).min(remaining) as usize;
                sink.push(&buf[..take]);
                dst.write_all(&buf[..take]).await?;
                buf.advance(take);
                remaining -= take as u64;
            }
            dst.flush().await
        }
        BodyMode::Chunked => {
            let mut scanner = ChunkScanner::new();
            loop {
                if buf.is_empty() {
                    buf.reserve(READ_CHUNK_SIZE);
                    let n = src.read_buf(buf).await?;
                    if n == 0 {
                        return Err(tokio::io::Error::new(
                            tokio::io::ErrorKind::UnexpectedEof,
                            "connection closed mid chunked body",
                        ));
                    }
                }
                let (consumed, done) = scanner.feed(&buf[..], sink)?;
                dst.write_all(&buf[..consumed]).await?;
                buf.advance(consumed);
                if done {
                    return dst.flush().await;
                }
            }
        }
        BodyMode::UntilClose => {
            loop {
                if buf.is_empty() {
                    buf.reserve(READ_CHUNK_SIZE);
                    let n = src.read_buf(buf).await?;
                    if n == 0 {
                        return dst.flush().await;
                    }
                }
                sink.push(&buf[..]);
                dst.write_all(&buf[..]).await?;
                let consumed = buf.len();
                buf.advance(consumed);
            }
        }
    }
}

/// drain one message body into memory, nothing is forwarded
///
/// used when an interceptor might rewrite the request; the raw bytes come
/// back for forwarding later.
pub async fn read_full_body<R>(
    src: &mut R,
    buf: &mut BytesMut,
    mode: BodyMode,
) -> tokio::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut sink = CaptureSink::unbounded();
    let mut discard = tokio::io::sink();
    relay_body(src, &mut discard, buf, mode, &mut sink).await?;
    let (body, _) = sink.into_parts();
    Ok(body.unwrap_or_default())
}

#[cfg(test)]
mod framing {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderTable {
        let mut t = HeaderTable::new();
        for (n, v) in pairs {
            t.append(*n, *v);
        }
        t
    }

    #[test]
    fn request_mode_prefers_chunked_over_length() {
        assert_eq!(request_body_mode(&headers(&[])), BodyMode::None);
        assert_eq!(
            request_body_mode(&headers(&[("Content-Length", "10")])),
            BodyMode::ContentLength(10)
        );
        assert_eq!(
            request_body_mode(&headers(&[
                ("Transfer-Encoding", "chunked"),
                ("Content-Length", "10")
            ])),
            BodyMode::Chunked
        );
        assert_eq!(
            request_body_mode(&headers(&[("Content-Length", "0")])),
            BodyMode::None
        );
    }

    #[test]
    fn response_mode_handles_bodyless_statuses() {
        let empty = headers(&[]);
        assert_eq!(response_body_mode("HEAD", 200, &empty), BodyMode::None);
        assert_eq!(response_body_mode("GET", 204, &empty), BodyMode::None);
        assert_eq!(response_body_mode("GET", 304, &empty), BodyMode::None);
        assert_eq!(response_body_mode("GET", 200, &empty), BodyMode::UntilClose);
        assert_eq!(
            response_body_mode("GET", 200, &headers(&[("Content-Length", "5")])),
            BodyMode::ContentLength(5)
        );
    }

    #[test]
    fn capture_sink_truncates_at_the_cap_only() {
        let mut sink = CaptureSink::new(5);
        sink.push(b"abc");
        sink.push(b"defg");
        assert_eq!(sink.total(), 7);
        let (data, truncated) = sink.into_parts();
        assert_eq!(data.as_deref(), Some(&b"abcde"[..]));
        assert!(truncated);

        let sink = CaptureSink::new(5);
        let (data, truncated) = sink.into_parts();
        assert_eq!(data, None);
        assert!(!truncated);
    }

    #[tokio::test]
    async fn content_length_relay_is_byte_exact_past_the_cap() {
        let payload = vec![b'x'; 100];
        let mut src = std::io::Cursor::new(payload.clone());
        let mut dst = Vec::new();
        let mut buf = BytesMut::new();
        let mut sink = CaptureSink::new(10);
        relay_body(
            &mut src,
            &mut dst,
            &mut buf,
            BodyMode::ContentLength(100),
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(dst, payload);
        assert_eq!(sink.total(), 100);
        let (data, truncated) = sink.into_parts();
        assert_eq!(data.unwrap().len(), 10);
        assert!(truncated);
    }

    #[tokio::test]
    async fn chunked_relay_forwards_raw_frames_and_captures_payload() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nNEXT".to_vec();
        let mut src = std::io::Cursor::new(wire.clone());
        let mut dst = Vec::new();
        let mut buf = BytesMut::new();
        let mut sink = CaptureSink::new(1024);
        relay_body(&mut src, &mut dst, &mut buf, BodyMode::Chunked, &mut sink)
            .await
            .unwrap();

        // raw frames forwarded, pipelined bytes left alone
        assert_eq!(dst, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let leftover_in_buf = buf.len();
        let leftover_in_cursor = wire.len() - src.position() as usize;
        assert_eq!(leftover_in_buf + leftover_in_cursor, 4);

        let (data, truncated) = sink.into_parts();
        assert_eq!(data.as_deref(), Some(&b"Wikipedia"[..]));
        assert!(!truncated);
    }

    #[tokio::test]
    async fn chunked_relay_handles_split_reads() {
        // feed the scanner byte by byte through a tiny duplex pipe
        let (mut client, mut server) = tokio::io::duplex(1);
        let wire = b"3\r\nabc\r\n0\r\n\r\n".to_vec();
        let writer = tokio::spawn(async move {
            for byte in wire {
                client.write_all(&[byte]).await.unwrap();
            }
            client.shutdown().await.unwrap();
        });

        let mut dst = Vec::new();
        let mut buf = BytesMut::new();
        let mut sink = CaptureSink::new(1024);
        relay_body(&mut server, &mut dst, &mut buf, BodyMode::Chunked, &mut sink)
            .await
            .unwrap();
        writer.await.unwrap();

        let (data, _) = sink.into_parts();
        assert_eq!(data.as_deref(), Some(&b"abc"[..]));
        assert_eq!(dst, b"3\r\nabc\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn read_full_body_returns_everything() {
        let mut src = std::io::Cursor::new(b"hello world".to_vec());
        let mut buf = BytesMut::new();
        let body = read_full_body(&mut src, &mut buf, BodyMode::ContentLength(11))
            .await
            .unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn until_close_relays_to_eof() {
        let mut src = std::io::Cursor::new(b"tail".to_vec());
        let mut dst = Vec::new();
        let mut buf = BytesMut::new();
        let mut sink = CaptureSink::new(1024);
        relay_body(&mut src, &mut dst, &mut buf, BodyMode::UntilClose, &mut sink)
            .await
            .unwrap();
        assert_eq!(dst, b"tail");
    }
}
