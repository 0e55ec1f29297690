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

use serde::{Deserialize, Serialize};

use crate::headers::HeaderTable;

/// the synthetic session id for traffic that arrived without a valid session
pub const ORPHAN_SESSION_ID: &str = "unknown";

/// a group of processes launched from one activation
///
/// the token is a bearer secret handed to the activating shell, never
/// included in captured records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub label: Option<String>,
    pub pid: Option<i64>,
    pub source: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptionKind {
    Mocked,
    Modified,
}

impl InterceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptionKind::Mocked => "mocked",
            InterceptionKind::Modified => "modified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mocked" => Some(InterceptionKind::Mocked),
            "modified" => Some(InterceptionKind::Modified),
            _ => None,
        }
    }
}

/// changelog entry kinds, the lifecycle of one captured request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Responded,
    Mutated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Responded => "responded",
            ChangeKind::Mutated => "mutated",
            ChangeKind::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ChangeKind::Created),
            "responded" => Some(ChangeKind::Responded),
            "mutated" => Some(ChangeKind::Mutated),
            "deleted" => Some(ChangeKind::Deleted),
            _ => None,
        }
    }
}

/// everything the proxy knows about a request at arrival time
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub id: String,
    pub session_id: Option<String>,
    pub ts_ms: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub headers: HeaderTable,
    pub body: Option<Vec<u8>>,
    pub body_truncated: bool,
    pub replay_of: Option<String>,
}

/// the response half, patched onto an existing record
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: HeaderTable,
    pub body: Option<Vec<u8>>,
    pub body_truncated: bool,
    pub duration_ms: i64,
}

/// one fully captured HTTP transaction
///
/// bodies are exposed to control clients as lossy UTF-8 text; the raw
/// bytes stay in the store for searching.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub id: String,
    pub session_id: Option<String>,
    pub timestamp_ms: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub request_headers: HeaderTable,
    pub request_body: Option<String>,
    pub request_body_truncated: bool,
    pub response_status: Option<u16>,
    pub response_headers: Option<HeaderTable>,
    pub response_body: Option<String>,
    pub response_body_truncated: bool,
    pub duration_ms: Option<i64>,
    pub intercepted_by: Option<String>,
    pub interception_type: Option<InterceptionKind>,
    pub replay_of: Option<String>,
    pub saved: bool,
    pub order_seq: i64,
    pub change_seq: i64,
}

/// the listing shape delivered to watchers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: String,
    pub session_id: Option<String>,
    pub timestamp_ms: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub response_status: Option<u16>,
    pub duration_ms: Option<i64>,
    pub intercepted_by: Option<String>,
    pub interception_type: Option<InterceptionKind>,
    pub replay_of: Option<String>,
    pub saved: bool,
    pub order_seq: i64,
    pub deleted: bool,
}

impl RequestSummary {
    /// tombstone for a row that no longer exists
    pub fn deleted(id: String, order_seq: i64) -> Self {
        RequestSummary {
            id,
            session_id: None,
            timestamp_ms: 0,
            method: String::new(),
            url: String::new(),
            host: String::new(),
            path: String::new(),
            response_status: None,
            duration_ms: None,
            intercepted_by: None,
            interception_type: None,
            replay_of: None,
            saved: false,
            order_seq,
            deleted: true,
        }
    }
}

/// one page of delta polling
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPage {
    pub entries: Vec<RequestSummary>,
    pub cursor: i64,
    pub has_more: bool,
    /// the caller's cursor predates the compaction floor, re-fetch from zero
    pub resync: bool,
}
