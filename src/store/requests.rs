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

use rusqlite::{Connection, OptionalExtension, Transaction};

use crate::error::{Result, WiretapError};
use crate::headers::HeaderTable;
use crate::store::filter::RequestFilter;
use crate::store::types::{
    CapturedRequest, ChangeKind, InterceptionKind, NewRequest, RequestSummary, ResponseRecord,
};
use crate::store::{append_change, bump_change_seq, next_order_seq};

pub const REQUEST_COLUMNS: &str = "id, session_id, ts_ms, method, url, host, path, \
     req_headers, req_body, req_truncated, status, resp_headers, resp_body, resp_truncated, \
     duration_ms, intercepted_by, intercept_kind, replay_of, saved, order_seq, change_seq";

pub struct InsertOutcome {
    pub change_seq: i64,
    pub order_seq: i64,
    pub evicted: Vec<String>,
}

fn encode_headers(headers: &HeaderTable) -> Result<String> {
    serde_json::to_string(headers).map_err(|e| WiretapError::Storage(e.to_string()))
}

fn decode_headers(raw: &str) -> HeaderTable {
    serde_json::from_str(raw).unwrap_or_default()
}

/// empty blobs are stored as absent
fn body_param(body: &Option<Vec<u8>>) -> Option<&[u8]> {
    body.as_deref().filter(|b| !b.is_empty())
}

/// insert a freshly arrived request and enforce the unsaved retention cap
///
/// eviction rides in the same transaction and shares the insert's cursor.
pub fn insert(conn: &mut Connection, new: &NewRequest, max_unsaved: u64) -> Result<InsertOutcome> {
    let tx = conn.transaction()?;
    let change_seq = bump_change_seq(&tx)?;
    let order_seq = next_order_seq(&tx)?;

    tx.execute(
        "INSERT INTO requests (id, session_id, ts_ms, method, url, host, path, \
         req_headers, req_body, req_truncated, replay_of, saved, order_seq, change_seq) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13)",
        rusqlite::params![
            new.id,
            new.session_id,
            new.ts_ms,
            new.method,
            new.url,
            new.host,
            new.path,
            encode_headers(&new.headers)?,
            body_param(&new.body),
            new.body_truncated,
            new.replay_of,
            order_seq,
            change_seq,
        ],
    )?;
    append_change(&tx, change_seq, &new.id, order_seq, ChangeKind::Created)?;

    let evicted = evict_over_cap(&tx, change_seq, max_unsaved)?;
    tx.commit()?;
    Ok(InsertOutcome {
        change_seq,
        order_seq,
        evicted,
    })
}

/// oldest-unsaved-first eviction beyond the cap, saved rows are untouchable
fn evict_over_cap(tx: &Transaction, change_seq: i64, max_unsaved: u64) -> Result<Vec<String>> {
    let unsaved: i64 =
        tx.query_row("SELECT COUNT(*) FROM requests WHERE saved = 0", [], |r| {
            r.get(0)
        })?;
    let over = unsaved - max_unsaved as i64;
    if over <= 0 {
        return Ok(Vec::new());
    }

    let mut stmt = tx.prepare(
        "SELECT id, order_seq FROM requests WHERE saved = 0 ORDER BY order_seq ASC LIMIT ?1",
    )?;
    let doomed: Vec<(String, i64)> = stmt
        .query_map([over], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut evicted = Vec::with_capacity(doomed.len());
    for (id, order_seq) in doomed {
        tx.execute("DELETE FROM requests WHERE id = ?1", [&id])?;
        append_change(tx, change_seq, &id, order_seq, ChangeKind::Deleted)?;
        evicted.push(id);
    }
    Ok(evicted)
}

/// patch the response half onto an existing record
pub fn record_response(conn: &mut Connection, id: &str, resp: &ResponseRecord) -> Result<bool> {
    let tx = conn.transaction()?;
    let change_seq = bump_change_seq(&tx)?;
    let updated = tx.execute(
        "UPDATE requests SET status = ?2, resp_headers = ?3, resp_body = ?4, \
         resp_truncated = ?5, duration_ms = ?6, change_seq = ?7 WHERE id = ?1",
        rusqlite::params![
            id,
            resp.status,
            encode_headers(&resp.headers)?,
            body_param(&resp.body),
            resp.body_truncated,
            resp.duration_ms,
            change_seq,
        ],
    )?;
    if updated == 0 {
        // evicted or cleared while in flight, nothing to patch
        return Ok(false);
    }
    let order_seq = order_seq_of(&tx, id)?;
    append_change(&tx, change_seq, id, order_seq, ChangeKind::Responded)?;
    tx.commit()?;
    Ok(true)
}

/// patch the streamed request body onto an existing record
pub fn record_request_body(
    conn: &mut Connection,
    id: &str,
    body: &Option<Vec<u8>>,
    truncated: bool,
) -> Result<bool> {
    let tx = conn.transaction()?;
    let change_seq = bump_change_seq(&tx)?;
    let updated = tx.execute(
        "UPDATE requests SET req_body = ?2, req_truncated = ?3, change_seq = ?4 WHERE id = ?1",
        rusqlite::params![id, body_param(body), truncated, change_seq],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    let order_seq = order_seq_of(&tx, id)?;
    append_change(&tx, change_seq, id, order_seq, ChangeKind::Mutated)?;
    tx.commit()?;
    Ok(true)
}

/// stamp interceptor attribution on a record
pub fn record_interception(
    conn: &mut Connection,
    id: &str,
    name: &str,
    kind: InterceptionKind,
) -> Result<bool> {
    let tx = conn.transaction()?;
    let change_seq = bump_change_seq(&tx)?;
    let updated = tx.execute(
        "UPDATE requests SET intercepted_by = ?2, intercept_kind = ?3, change_seq = ?4 \
         WHERE id = ?1",
        rusqlite::params![id, name, kind.as_str(), change_seq],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    let order_seq = order_seq_of(&tx, id)?;
    append_change(&tx, change_seq, id, order_seq, ChangeKind::Mutated)?;
    tx.commit()?;
    Ok(true)
}

/// flip the bookmark flag
pub fn set_saved(conn: &mut Connection, id: &str, saved: bool) -> Result<bool> {
    let tx = conn.transaction()?;
    let change_seq = bump_change_seq(&tx)?;
    let updated = tx.execute(
        "UPDATE requests SET saved = ?2, change_seq = ?3 WHERE id = ?1",
        rusqlite::params![id, saved, change_seq],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    let order_seq = order_seq_of(&tx, id)?;
    append_change(&tx, change_seq, id, order_seq, ChangeKind::Mutated)?;
    tx.commit()?;
    Ok(true)
}

/// delete every unsaved row, bookmarked rows survive
pub fn clear_unsaved(conn: &mut Connection) -> Result<u64> {
    let tx = conn.transaction()?;
    let mut stmt =
        tx.prepare("SELECT id, order_seq FROM requests WHERE saved = 0 ORDER BY order_seq ASC")?;
    let doomed: Vec<(String, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    if doomed.is_empty() {
        return Ok(0);
    }

    let change_seq = bump_change_seq(&tx)?;
    for (id, order_seq) in &doomed {
        tx.execute("DELETE FROM requests WHERE id = ?1", [id])?;
        append_change(&tx, change_seq, id, *order_seq, ChangeKind::Deleted)?;
    }
    tx.commit()?;
    Ok(doomed.len() as u64)
}

fn order_seq_of(tx: &Transaction, id: &str) -> Result<i64> {
    let order: i64 = tx.query_row("SELECT order_seq FROM requests WHERE id = ?1", [id], |r| {
        r.get(0)
    })?;
    Ok(order)
}

pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CapturedRequest> {
    let req_headers: String = row.get(7)?;
    let req_body: Option<Vec<u8>> = row.get(8)?;
    let resp_headers: Option<String> = row.get(11)?;
    let resp_body: Option<Vec<u8>> = row.get(12)?;
    let kind: Option<String> = row.get(16)?;
    Ok(CapturedRequest {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp_ms: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        host: row.get(5)?,
        path: row.get(6)?,
        request_headers: decode_headers(&req_headers),
        request_body: req_body.map(|b| String::from_utf8_lossy(&b).into_owned()),
        request_body_truncated: row.get(9)?,
        response_status: row.get(10)?,
        response_headers: resp_headers.as_deref().map(decode_headers),
        response_body: resp_body.map(|b| String::from_utf8_lossy(&b).into_owned()),
        response_body_truncated: row.get(13)?,
        duration_ms: row.get(14)?,
        intercepted_by: row.get(15)?,
        interception_type: kind.as_deref().and_then(InterceptionKind::parse),
        replay_of: row.get(17)?,
        saved: row.get(18)?,
        order_seq: row.get(19)?,
        change_seq: row.get(20)?,
    })
}

pub fn summarize(full: &CapturedRequest) -> RequestSummary {
    RequestSummary {
        id: full.id.clone(),
        session_id: full.session_id.clone(),
        timestamp_ms: full.timestamp_ms,
        method: full.method.clone(),
        url: full.url.clone(),
        host: full.host.clone(),
        path: full.path.clone(),
        response_status: full.response_status,
        duration_ms: full.duration_ms,
        intercepted_by: full.intercepted_by.clone(),
        interception_type: full.interception_type,
        replay_of: full.replay_of.clone(),
        saved: full.saved,
        order_seq: full.order_seq,
        deleted: false,
    }
}

pub fn matches_filter(filter: &RequestFilter, full: &CapturedRequest) -> bool {
    filter.matches(
        &full.method,
        &full.url,
        &full.host,
        &full.path,
        full.response_status,
        &full.request_headers,
        full.response_headers.as_ref(),
    )
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<CapturedRequest>> {
    let row = conn
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
            [id],
            from_row,
        )
        .optional()?;
    Ok(row)
}

/// newest-first listing with the filter applied
pub fn list(
    conn: &Connection,
    limit: u64,
    filter: &RequestFilter,
) -> Result<Vec<CapturedRequest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests ORDER BY order_seq DESC"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let full = row?;
        if matches_filter(filter, &full) {
            out.push(full);
            if out.len() as u64 >= limit {
                break;
            }
        }
    }
    Ok(out)
}

/// raw captured request body, bytes as they were stored
pub fn body_bytes(conn: &Connection, id: &str) -> Result<Option<Vec<u8>>> {
    let body: Option<Option<Vec<u8>>> = conn
        .query_row("SELECT req_body FROM requests WHERE id = ?1", [id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(body.flatten())
}

pub fn count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |r| r.get(0))?;
    Ok(n as u64)
}
