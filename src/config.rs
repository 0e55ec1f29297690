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

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

/// user configuration from config.json in the data directory
///
/// every key is optional, unknown keys are ignored, a broken file is
/// treated as absent so a stray edit can never keep the daemon down.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// consumer hint only, the daemon never polls itself
    pub poll_interval: u64,
    /// cap on unsaved captured requests before eviction kicks in
    pub max_stored_requests: u64,
    /// per-body capture cap in bytes, forwarding is never truncated
    pub body_capture_limit: usize,
    /// hard budget for one interceptor invocation
    pub interceptor_timeout_ms: u64,
    /// how long an issued replay token stays valid
    pub replay_token_ttl_ms: u64,
    /// kill-and-replace a live daemon whose version differs
    pub auto_restart: bool,
    /// total deadline for one proxied exchange
    pub request_deadline_ms: u64,
    /// skip upstream certificate verification, for origins behind
    /// self-signed or corporate-MITM chains
    pub upstream_tls_insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval: 250,
            max_stored_requests: 10_000,
            body_capture_limit: 1024 * 1024,
            interceptor_timeout_ms: 1_000,
            replay_token_ttl_ms: 5 * 60 * 1_000,
            auto_restart: true,
            request_deadline_ms: 60_000,
            upstream_tls_insecure: false,
        }
    }
}

impl Config {
    /// load configuration from the given file, falling back to defaults
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Config::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("ignoring malformed {}: {}", path.display(), e);
                Config::default()
            }
        }
    }
}
