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

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::store::types::Session;

fn generate_token() -> String {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

pub fn register(
    conn: &Connection,
    label: Option<String>,
    pid: Option<i64>,
    source: Option<String>,
    now_ms: i64,
) -> Result<Session> {
    let session = Session {
        id: ulid::Ulid::new().to_string(),
        token: generate_token(),
        label,
        pid,
        source,
        created_at_ms: now_ms,
    };
    conn.execute(
        "INSERT INTO sessions (id, token, label, pid, source, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            session.id,
            session.token,
            session.label,
            session.pid,
            session.source,
            session.created_at_ms,
        ],
    )?;
    Ok(session)
}

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        token: row.get(1)?,
        label: row.get(2)?,
        pid: row.get(3)?,
        source: row.get(4)?,
        created_at_ms: row.get(5)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT id, token, label, pid, source, created_at_ms
             FROM sessions WHERE id = ?1",
            [id],
            from_row,
        )
        .optional()?;
    Ok(session)
}

/// check a bearer token presented through the internal headers
pub fn token_matches(conn: &Connection, id: &str, token: &str) -> Result<bool> {
    Ok(get(conn, id)?.map(|s| s.token == token).unwrap_or(false))
}

/// the most recently registered session, used to attribute env-only clients
pub fn latest(conn: &Connection) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            "SELECT id, token, label, pid, source, created_at_ms
             FROM sessions ORDER BY created_at_ms DESC, id DESC LIMIT 1",
            [],
            from_row,
        )
        .optional()?;
    Ok(session)
}

pub fn count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
    Ok(n as u64)
}
