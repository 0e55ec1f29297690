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
use crate::store::filter::RequestFilter;
use crate::store::requests::{self, REQUEST_COLUMNS};
use crate::store::types::{DeltaPage, RequestSummary};
use crate::store::{meta_get, meta_set};

/// one changed row, live or tombstone, keyed by its latest change
struct ChangedRow {
    change_seq: i64,
    summary: Option<RequestSummary>,
    advances_only: bool,
}

/// poll for everything that changed after the caller's cursor
///
/// rows are grouped by the change cursor that last touched them; a page
/// never splits a group, so every committed change is observed exactly
/// once across successive polls. deleted rows surface as tombstones.
pub fn poll(
    conn: &Connection,
    after_change_seq: i64,
    limit: u64,
    filter: &RequestFilter,
) -> Result<DeltaPage> {
    let compacted_below = meta_get(conn, "compacted_below")?;
    if after_change_seq > 0 && after_change_seq < compacted_below {
        // the log no longer reaches back that far
        return Ok(DeltaPage {
            entries: Vec::new(),
            cursor: after_change_seq,
            has_more: false,
            resync: true,
        });
    }

    let mut changed: Vec<ChangedRow> = Vec::new();

    // live rows carry their latest change on the row itself
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests WHERE change_seq > ?1"
    ))?;
    let rows = stmt.query_map([after_change_seq], requests::from_row)?;
    for row in rows {
        let full = row?;
        let matches = requests::matches_filter(filter, &full);
        changed.push(ChangedRow {
            change_seq: full.change_seq,
            summary: matches.then(|| requests::summarize(&full)),
            advances_only: !matches,
        });
    }
    drop(stmt);

    // deleted rows only survive in the changelog
    let mut stmt = conn.prepare(
        "SELECT request_id, order_seq, MAX(change_seq) FROM changelog \
         WHERE kind = 'deleted' AND change_seq > ?1 GROUP BY request_id",
    )?;
    let tombstones = stmt.query_map([after_change_seq], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
    })?;
    for row in tombstones {
        let (id, order_seq, change_seq) = row?;
        changed.push(ChangedRow {
            change_seq,
            summary: Some(RequestSummary::deleted(id, order_seq)),
            advances_only: false,
        });
    }
    drop(stmt);

    changed.sort_by_key(|c| c.change_seq);

    // walk change groups until the limit is met, never splitting a group
    let mut entries: Vec<RequestSummary> = Vec::new();
    let mut cursor = after_change_seq;
    let mut has_more = false;
    let mut index = 0;
    while index < changed.len() {
        let group_seq = changed[index].change_seq;
        if entries.len() as u64 >= limit {
            has_more = true;
            break;
        }
        while index < changed.len() && changed[index].change_seq == group_seq {
            let row = &mut changed[index];
            if let Some(summary) = row.summary.take() {
                entries.push(summary);
            } else {
                debug_assert!(row.advances_only);
            }
            index += 1;
        }
        cursor = group_seq;
    }

    // newest first for presentation
    entries.sort_by(|a, b| b.order_seq.cmp(&a.order_seq));

    Ok(DeltaPage {
        entries,
        cursor,
        has_more,
        resync: false,
    })
}

/// coalesce changelog entries older than the retention window
///
/// watchers whose cursor predates the new floor receive a resync sentinel
/// on their next poll.
pub fn compact(conn: &mut Connection, keep_recent: u64) -> Result<u64> {
    let tx = conn.transaction()?;
    let head = meta_get(&tx, "change_seq")?;
    let floor = head - keep_recent as i64;
    if floor <= 0 {
        return Ok(0);
    }
    let removed = tx.execute("DELETE FROM changelog WHERE change_seq < ?1", [floor])?;
    if removed > 0 {
        let current = meta_get(&tx, "compacted_below")?;
        if floor > current {
            meta_set(&tx, "compacted_below", floor)?;
        }
        tx.commit()?;
    }
    Ok(removed as u64)
}
