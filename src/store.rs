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

pub mod delta;
pub mod filter;
pub mod requests;
pub mod schema;
pub mod search;
pub mod sessions;
pub mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{Result, WiretapError};
pub use filter::{RequestFilter, SearchTarget};
pub use requests::InsertOutcome;
pub use types::{
    CapturedRequest, ChangeKind, DeltaPage, InterceptionKind, NewRequest, RequestSummary,
    ResponseRecord, Session, ORPHAN_SESSION_ID,
};

/// wall clock in milliseconds, UX only, never used for ordering
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn meta_get(conn: &Connection, key: &str) -> Result<i64> {
    let value: i64 = conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))?;
    Ok(value)
}

pub(crate) fn meta_set(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute("UPDATE meta SET value = ?2 WHERE key = ?1", rusqlite::params![key, value])?;
    Ok(())
}

/// advance the global change cursor, one bump per write transaction
pub(crate) fn bump_change_seq(conn: &Connection) -> Result<i64> {
    let seq: i64 = conn.query_row(
        "UPDATE meta SET value = value + 1 WHERE key = 'change_seq' RETURNING value",
        [],
        |r| r.get(0),
    )?;
    Ok(seq)
}

/// allocate the next insertion order number
pub(crate) fn next_order_seq(conn: &Connection) -> Result<i64> {
    let seq: i64 = conn.query_row(
        "UPDATE meta SET value = value + 1 WHERE key = 'order_seq' RETURNING value",
        [],
        |r| r.get(0),
    )?;
    Ok(seq)
}

pub(crate) fn append_change(
    conn: &Connection,
    change_seq: i64,
    request_id: &str,
    order_seq: i64,
    kind: ChangeKind,
) -> Result<()> {
    conn.execute(
        "INSERT INTO changelog (change_seq, request_id, order_seq, kind) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![change_seq, request_id, order_seq, kind.as_str()],
    )?;
    Ok(())
}

struct StoreInner {
    conn: Mutex<Connection>,
    max_unsaved: u64,
}

/// the single-writer datastore handle
///
/// cheap to clone, every mutation runs on the blocking pool holding the
/// connection lock, which serializes writes without starving the runtime.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(path: &Path, max_unsaved: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        Ok(Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                max_unsaved,
            }),
        })
    }

    pub fn open_in_memory(max_unsaved: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                max_unsaved,
            }),
        })
    }

    async fn exec<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| WiretapError::Storage(format!("storage task: {e}")))?
    }

    pub async fn register_session(
        &self,
        label: Option<String>,
        pid: Option<i64>,
        source: Option<String>,
    ) -> Result<Session> {
        self.exec(move |c| sessions::register(c, label, pid, source, now_ms()))
            .await
    }

    pub async fn session_token_matches(&self, id: String, token: String) -> Result<bool> {
        self.exec(move |c| sessions::token_matches(c, &id, &token))
            .await
    }

    pub async fn latest_session(&self) -> Result<Option<Session>> {
        self.exec(|conn: &mut Connection| sessions::latest(conn)).await
    }

    pub async fn session_count(&self) -> Result<u64> {
        self.exec(|conn: &mut Connection| sessions::count(conn)).await
    }

    pub async fn request_count(&self) -> Result<u64> {
        self.exec(|conn: &mut Connection| requests::count(conn)).await
    }

    pub async fn insert_request(&self, new: NewRequest) -> Result<InsertOutcome> {
        let max = self.inner.max_unsaved;
        self.exec(move |c| requests::insert(c, &new, max)).await
    }

    pub async fn record_request_body(
        &self,
        id: String,
        body: Option<Vec<u8>>,
        truncated: bool,
    ) -> Result<bool> {
        self.exec(move |c| requests::record_request_body(c, &id, &body, truncated))
            .await
    }

    pub async fn record_response(&self, id: String, resp: ResponseRecord) -> Result<bool> {
        self.exec(move |c| requests::record_response(c, &id, &resp))
            .await
    }

    pub async fn record_interception(
        &self,
        id: String,
        name: String,
        kind: InterceptionKind,
    ) -> Result<bool> {
        self.exec(move |c| requests::record_interception(c, &id, &name, kind))
            .await
    }

    pub async fn set_saved(&self, id: String, saved: bool) -> Result<bool> {
        self.exec(move |c| requests::set_saved(c, &id, saved)).await
    }

    pub async fn clear_requests(&self) -> Result<u64> {
        self.exec(requests::clear_unsaved).await
    }

    pub async fn get_request(&self, id: String) -> Result<Option<CapturedRequest>> {
        self.exec(move |c| requests::get(c, &id)).await
    }

    pub async fn request_body_bytes(&self, id: String) -> Result<Option<Vec<u8>>> {
        self.exec(move |c| requests::body_bytes(c, &id)).await
    }

    pub async fn list_requests(
        &self,
        limit: u64,
        filter: RequestFilter,
    ) -> Result<Vec<CapturedRequest>> {
        self.exec(move |c| requests::list(c, limit, &filter)).await
    }

    pub async fn delta(
        &self,
        after_change_seq: i64,
        limit: u64,
        filter: RequestFilter,
    ) -> Result<DeltaPage> {
        self.exec(move |c| delta::poll(c, after_change_seq, limit, &filter))
            .await
    }

    pub async fn search_bodies(
        &self,
        query: String,
        target: SearchTarget,
        limit: u64,
        filter: RequestFilter,
    ) -> Result<Vec<RequestSummary>> {
        self.exec(move |c| search::bodies(c, &query, target, limit, &filter))
            .await
    }

    pub async fn compact_changelog(&self, keep_recent: u64) -> Result<u64> {
        self.exec(move |c| delta::compact(c, keep_recent)).await
    }
}

const STORAGE_RETRY_ATTEMPTS: u32 = 3;
const STORAGE_RETRY_BASE: Duration = Duration::from_millis(20);

/// run a storage operation with the standard retry policy
///
/// only storage failures are retried; after the attempts are exhausted the
/// last error is returned and the caller decides whether to proceed
/// without persistence.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..STORAGE_RETRY_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(STORAGE_RETRY_BASE * 4u32.pow(attempt - 1)).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ WiretapError::Storage(_)) => last = Some(err),
            Err(other) => return Err(other),
        }
    }
    Err(last.unwrap_or_else(|| WiretapError::Storage("retries exhausted".into())))
}
