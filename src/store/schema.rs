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

/// schema bootstrap, idempotent
///
/// WAL mode lets control-plane readers overlap the single writer.
pub fn init(conn: &Connection) -> Result<()> {
    // journal_mode answers with the resulting mode, read it as a query
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO meta (key, value) VALUES ('change_seq', 0);
        INSERT OR IGNORE INTO meta (key, value) VALUES ('order_seq', 0);
        INSERT OR IGNORE INTO meta (key, value) VALUES ('compacted_below', 0);

        CREATE TABLE IF NOT EXISTS sessions (
            id            TEXT PRIMARY KEY,
            token         TEXT NOT NULL,
            label         TEXT,
            pid           INTEGER,
            source        TEXT,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS requests (
            id              TEXT PRIMARY KEY,
            session_id      TEXT,
            ts_ms           INTEGER NOT NULL,
            method          TEXT NOT NULL,
            url             TEXT NOT NULL,
            host            TEXT NOT NULL,
            path            TEXT NOT NULL,
            req_headers     TEXT NOT NULL,
            req_body        BLOB,
            req_truncated   INTEGER NOT NULL DEFAULT 0,
            status          INTEGER,
            resp_headers    TEXT,
            resp_body       BLOB,
            resp_truncated  INTEGER NOT NULL DEFAULT 0,
            duration_ms     INTEGER,
            intercepted_by  TEXT,
            intercept_kind  TEXT,
            replay_of       TEXT,
            saved           INTEGER NOT NULL DEFAULT 0,
            order_seq       INTEGER NOT NULL UNIQUE,
            change_seq      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_requests_order ON requests (order_seq DESC);
        CREATE INDEX IF NOT EXISTS idx_requests_change ON requests (change_seq);
        CREATE INDEX IF NOT EXISTS idx_requests_saved ON requests (saved, order_seq);

        CREATE TABLE IF NOT EXISTS changelog (
            change_seq INTEGER NOT NULL,
            request_id TEXT NOT NULL,
            order_seq  INTEGER NOT NULL,
            kind       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_changelog_seq ON changelog (change_seq);
        CREATE INDEX IF NOT EXISTS idx_changelog_request ON changelog (request_id);
        "#,
    )?;
    Ok(())
}
