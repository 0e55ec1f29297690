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

use thiserror::Error;

/// every failure that can cross the control socket
/// each variant maps to one stable wire code
#[derive(Debug, Error)]
pub enum WiretapError {
    #[error("no daemon is running for this data directory")]
    NotRunning,

    #[error("version mismatch: client {client}, server {server}")]
    VersionMismatch { client: String, server: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("interceptor error: {0}")]
    Interceptor(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WiretapError {
    /// the stable code written into response envelopes
    pub fn code(&self) -> &'static str {
        match self {
            WiretapError::NotRunning => "not_running",
            WiretapError::VersionMismatch { .. } => "version_mismatch",
            WiretapError::NotFound(_) => "not_found",
            WiretapError::InvalidArgument(_) => "invalid_argument",
            WiretapError::Timeout(_) => "timeout",
            WiretapError::Upstream(_) => "upstream_error",
            WiretapError::Interceptor(_) => "interceptor_error",
            WiretapError::Storage(_) => "storage_error",
            WiretapError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for WiretapError {
    fn from(e: rusqlite::Error) -> Self {
        WiretapError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for WiretapError {
    fn from(e: std::io::Error) -> Self {
        WiretapError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for WiretapError {
    fn from(e: serde_json::Error) -> Self {
        WiretapError::InvalidArgument(e.to_string())
    }
}

pub type Result<T, E = WiretapError> = std::result::Result<T, E>;

#[cfg(test)]
mod error_codes {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let cases = vec![
            (WiretapError::NotRunning, "not_running"),
            (
                WiretapError::VersionMismatch {
                    client: "1".into(),
                    server: "2".into(),
                },
                "version_mismatch",
            ),
            (WiretapError::NotFound("x".into()), "not_found"),
            (WiretapError::InvalidArgument("x".into()), "invalid_argument"),
            (WiretapError::Timeout("x".into()), "timeout"),
            (WiretapError::Upstream("x".into()), "upstream_error"),
            (WiretapError::Interceptor("x".into()), "interceptor_error"),
            (WiretapError::Storage("x".into()), "storage_error"),
            (WiretapError::Internal("x".into()), "internal"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }
}
