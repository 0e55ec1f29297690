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

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::headers::HeaderTable;

const INIT_BUFFER_SIZE: usize = 4 * 1024;
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS_COUNT: usize = 256;
const BUILD_HEAD_BUFFER: usize = 512;

const CRLF: &[u8; 2] = b"\r\n";
const HEADER_DELIMITER: &[u8; 2] = b": ";

fn protocol_error(message: impl Into<String>) -> tokio::io::Error {
    tokio::io::Error::new(tokio::io::ErrorKind::InvalidData, message.into())
}

/// a parsed request line plus its header table, casing preserved
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version_minor: u8,
    pub headers: HeaderTable,
}

/// a parsed status line plus its header table
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: HeaderTable,
}

impl RequestHead {
    pub fn http_version(&self) -> &'static str {
        match self.version_minor {
            0 => "HTTP/1.0",
            _ => "HTTP/1.1",
        }
    }

    /// serialize the head for the wire, insertion order and casing intact
    pub fn encode(&self) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(BUILD_HEAD_BUFFER);
        buffer.put_slice(self.method.as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(self.target.as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(self.http_version().as_bytes());
        buffer.put_slice(CRLF);
        encode_headers(&self.headers, &mut buffer);
        buffer.put_slice(CRLF);
        buffer
    }
}

impl ResponseHead {
    pub fn http_version(&self) -> &'static str {
        match self.version_minor {
            0 => "HTTP/1.0",
            _ => "HTTP/1.1",
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(BUILD_HEAD_BUFFER);
        buffer.put_slice(self.http_version().as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(self.status.to_string().as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(self.reason.as_bytes());
        buffer.put_slice(CRLF);
        encode_headers(&self.headers, &mut buffer);
        buffer.put_slice(CRLF);
        buffer
    }
}

fn encode_headers(headers: &HeaderTable, buffer: &mut BytesMut) {
    for (name, value) in headers.iter() {
        buffer.put_slice(name.as_bytes());
        buffer.put_slice(HEADER_DELIMITER);
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(CRLF);
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> tokio::io::Result<HeaderTable> {
    let mut table = HeaderTable::with_capacity(raw.len());
    for header in raw {
        if header.name.is_empty() {
            continue;
        }
        let value = std::str::from_utf8(header.value)
            .map_err(|_| protocol_error(format!("non-utf8 value for header {}", header.name)))?;
        table.append(header.name, value);
    }
    Ok(table)
}

/// read one request head from the stream
///
/// `buf` is the session read buffer; bytes past the head stay in it as the
/// body prefix. a clean EOF between requests yields None.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> tokio::io::Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin + Send,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
            let mut request = httparse::Request::new(&mut headers);
            match request.parse(&buf[..]) {
                Ok(httparse::Status::Complete(head_size)) => {
                    let head = RequestHead {
                        method: request.method.unwrap_or("").to_string(),
                        target: request.path.unwrap_or("").to_string(),
                        version_minor: request.version.unwrap_or(1) as u8,
                        headers: collect_headers(request.headers)?,
                    };
                    buf.advance(head_size);
                    return Ok(Some(head));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(protocol_error(e.to_string())),
            }
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(protocol_error(format!(
                "request head larger than {MAX_HEAD_SIZE}"
            )));
        }
        if buf.capacity() == buf.len() {
            buf.reserve(INIT_BUFFER_SIZE);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(tokio::io::Error::new(
                tokio::io::ErrorKind::UnexpectedEof,
                "connection closed mid request head",
            ));
        }
    }
}

/// read one response head from the upstream stream
pub async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> tokio::io::Result<ResponseHead>
where
    S: AsyncRead + Unpin + Send,
{
    let mut parser_config = httparse::ParserConfig::default();
    parser_config.allow_spaces_after_header_name_in_responses(true);
    parser_config.allow_obsolete_multiline_headers_in_responses(true);

    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
            let mut response = httparse::Response::new(&mut headers);
            match parser_config.parse_response(&mut response, &buf[..]) {
                Ok(httparse::Status::Complete(head_size)) => {
                    let head = ResponseHead {
                        status: response.code.unwrap_or(502),
                        reason: response.reason.unwrap_or("").to_string(),
                        version_minor: response.version.unwrap_or(1) as u8,
                        headers: collect_headers(response.headers)?,
                    };
                    buf.advance(head_size);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(protocol_error(e.to_string())),
            }
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(protocol_error(format!(
                "response head larger than {MAX_HEAD_SIZE}"
            )));
        }
        if buf.capacity() == buf.len() {
            buf.reserve(INIT_BUFFER_SIZE);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(tokio::io::Error::new(
                tokio::io::ErrorKind::UnexpectedEof,
                "connection closed mid response head",
            ));
        }
    }
}

/// write a head buffer out in one go
pub async fn write_head<S>(stream: &mut S, head: BytesMut) -> tokio::io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    stream.write_all(&head).await?;
    stream.flush().await
}
