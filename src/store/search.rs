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

use rusqlite::Connection;

use crate::error::Result;
use crate::store::filter::{is_binary, RequestFilter, SearchTarget};
use crate::store::requests::{self, REQUEST_COLUMNS};
use crate::store::types::RequestSummary;

/// substring search over decoded bodies, newest first
///
/// binary bodies are skipped entirely; truncated bodies match on what was
/// captured.
pub fn bodies(
    conn: &Connection,
    query: &str,
    target: SearchTarget,
    limit: u64,
    filter: &RequestFilter,
) -> Result<Vec<RequestSummary>> {
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests ORDER BY order_seq DESC"
    ))?;
    // raw blobs ride along separately, the summary mapping is lossy text
    let mut blob_stmt =
        conn.prepare("SELECT req_body, resp_body FROM requests WHERE id = ?1")?;

    let rows = stmt.query_map([], requests::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let full = row?;
        if !requests::matches_filter(filter, &full) {
            continue;
        }
        let (req_body, resp_body): (Option<Vec<u8>>, Option<Vec<u8>>) =
            blob_stmt.query_row([&full.id], |r| Ok((r.get(0)?, r.get(1)?)))?;

        let request_hit = matches!(target, SearchTarget::Request | SearchTarget::Either)
            && body_contains(
                req_body.as_deref(),
                full.request_headers.get("content-type"),
                query,
            );
        let response_hit = !request_hit
            && matches!(target, SearchTarget::Response | SearchTarget::Either)
            && body_contains(
                resp_body.as_deref(),
                full.response_headers
                    .as_ref()
                    .and_then(|h| h.get("content-type")),
                query,
            );

        if request_hit || response_hit {
            out.push(requests::summarize(&full));
            if out.len() as u64 >= limit {
                break;
            }
        }
    }
    Ok(out)
}

fn body_contains(body: Option<&[u8]>, content_type: Option<&str>, query: &str) -> bool {
    let Some(body) = body else {
        return false;
    };
    if is_binary(content_type, body) {
        return false;
    }
    match std::str::from_utf8(body) {
        Ok(text) => text.contains(query),
        Err(_) => false,
    }
}
