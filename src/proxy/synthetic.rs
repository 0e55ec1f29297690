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

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::codec::ResponseHead;
use crate::headers::HeaderTable;
use crate::intercept::MockResponse;

pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn reason_for(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// a daemon-originated response, used for gateway failures and mocks
pub fn build(status: u16, reason: Option<&str>, extra: &HeaderTable, body: &[u8]) -> ResponseHead {
    let mut headers = HeaderTable::new();
    headers.append("Date", httpdate::fmt_http_date(std::time::SystemTime::now()));
    headers.append("Server", "wiretap");
    if !extra.contains("content-type") {
        headers.append("Content-Type", "text/plain; charset=utf-8");
    }
    for (name, value) in extra.iter() {
        headers.append(name, value);
    }
    headers.set("Content-Length", body.len().to_string());

    ResponseHead {
        status,
        reason: reason
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| reason_for(status))
            .to_string(),
        version_minor: 1,
        headers,
    }
}

/// a plain diagnostic response, 502 and 504 style
pub fn diagnostic(status: u16, message: &str) -> (ResponseHead, Vec<u8>) {
    let body = format!("wiretap: {message}\n").into_bytes();
    let head = build(status, None, &HeaderTable::new(), &body);
    (head, body)
}

/// materialize a mock rule verdict into a wire response
pub fn from_mock(mock: &MockResponse) -> (ResponseHead, Vec<u8>) {
    let mut extra = HeaderTable::new();
    for (name, value) in &mock.headers {
        extra.append(name.clone(), value.clone());
    }
    let body = mock.body.clone().into_bytes();
    let head = build(mock.status, None, &extra, &body);
    (head, body)
}

/// write a full synthetic response to the peer
pub async fn write<S>(stream: &mut S, head: &ResponseHead, body: &[u8]) -> tokio::io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    stream.write_all(&head.encode()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

#[cfg(test)]
mod synthesis {
    use super::*;

    #[test]
    fn diagnostic_carries_status_and_body() {
        let (head, body) = diagnostic(502, "connect refused");
        assert_eq!(head.status, 502);
        assert_eq!(head.reason, "Bad Gateway");
        assert_eq!(head.headers.get("content-length").unwrap(), body.len().to_string());
        assert!(String::from_utf8(body).unwrap().contains("connect refused"));
    }

    #[test]
    fn mock_headers_override_the_content_type() {
        let mock = MockResponse {
            status: 418,
            headers: std::collections::BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: "{}".to_string(),
        };
        let (head, body) = from_mock(&mock);
        assert_eq!(head.status, 418);
        assert_eq!(head.reason, "I'm a teapot");
        assert_eq!(head.headers.get("content-type"), Some("application/json"));
        assert_eq!(body, b"{}");
    }
}
