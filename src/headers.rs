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

/// internal correlation headers injected by the runtime shims
/// the proxy consumes these and strips them before dispatching upstream
pub const SESSION_ID_HEADER: &str = "x-wiretap-session-id";
pub const SESSION_TOKEN_HEADER: &str = "x-wiretap-session-token";
pub const RUNTIME_HEADER: &str = "x-wiretap-runtime";
pub const REPLAY_TOKEN_HEADER: &str = "x-wiretap-replay";

/// an ordered header map preserving the casing the peer sent
///
/// lookups are ascii-case-insensitive, iteration yields insertion order.
/// this is what ends up in captured records, so order must be stable for
/// deterministic output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderTable(Vec<(String, String)>);

impl HeaderTable {
    pub fn new() -> Self {
        HeaderTable(Vec::new())
    }

    pub fn with_capacity(n: usize) -> Self {
        HeaderTable(Vec::with_capacity(n))
    }

    /// append a header without touching existing entries of the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// replace every entry of the same name with a single one
    /// the replacement takes the slot of the first occurrence
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut kept = false;
        self.0.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if kept {
                    return false;
                }
                kept = true;
                *v = value.clone();
            }
            true
        });
        if !kept {
            self.0.push((name.to_string(), value));
        }
    }

    /// first value for a name, case-insensitive
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// every value for a name, in insertion order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// remove all entries with the given name, returning the first value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut first = None;
        self.0.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if first.is_none() {
                    first = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        first
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for HeaderTable {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        HeaderTable(iter.into_iter().collect())
    }
}

/// the correlation values a client smuggled in through internal headers
#[derive(Debug, Default, Clone)]
pub struct InternalHeaders {
    pub session_id: Option<String>,
    pub session_token: Option<String>,
    pub runtime: Option<String>,
    pub replay_token: Option<String>,
}

/// pull the four internal headers out of a request header table
/// the table no longer carries them afterwards, so nothing leaks upstream
pub fn strip_internal_headers(headers: &mut HeaderTable) -> InternalHeaders {
    InternalHeaders {
        session_id: headers.remove(SESSION_ID_HEADER),
        session_token: headers.remove(SESSION_TOKEN_HEADER),
        runtime: headers.remove(RUNTIME_HEADER),
        replay_token: headers.remove(REPLAY_TOKEN_HEADER),
    }
}
