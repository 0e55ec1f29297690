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

use serde::Deserialize;

use crate::headers::HeaderTable;

/// predicate over captured requests, the conjunction of all present parts
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestFilter {
    /// match any of these methods, case-insensitive
    pub methods: Option<Vec<String>>,
    /// inclusive status range
    pub status_min: Option<u16>,
    pub status_max: Option<u16>,
    /// free-text substring over method, url, host, path, status and headers
    pub text: Option<String>,
}

impl RequestFilter {
    pub fn is_empty(&self) -> bool {
        self.methods.is_none()
            && self.status_min.is_none()
            && self.status_max.is_none()
            && self.text.is_none()
    }

    /// evaluate against one row's filterable fields
    pub fn matches(
        &self,
        method: &str,
        url: &str,
        host: &str,
        path: &str,
        status: Option<u16>,
        request_headers: &HeaderTable,
        response_headers: Option<&HeaderTable>,
    ) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                return false;
            }
        }
        if let Some(min) = self.status_min {
            match status {
                Some(s) if s >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.status_max {
            match status {
                Some(s) if s <= max => {}
                _ => return false,
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_ascii_lowercase();
            let status_text = status.map(|s| s.to_string()).unwrap_or_default();
            let mut haystacks: Vec<&str> = vec![method, url, host, path, &status_text];
            let mut header_lines = Vec::new();
            for (n, v) in request_headers.iter() {
                header_lines.push(format!("{n}: {v}"));
            }
            if let Some(headers) = response_headers {
                for (n, v) in headers.iter() {
                    header_lines.push(format!("{n}: {v}"));
                }
            }
            haystacks.extend(header_lines.iter().map(String::as_str));
            if !haystacks
                .iter()
                .any(|h| h.to_ascii_lowercase().contains(&needle))
            {
                return false;
            }
        }
        true
    }
}

/// which captured body a search runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTarget {
    Request,
    Response,
    Either,
}

impl Default for SearchTarget {
    fn default() -> Self {
        SearchTarget::Either
    }
}

/// binary content rule: undecodable UTF-8, or a content-type that is
/// neither text/* nor one of the structured-text subtypes
pub fn is_binary(content_type: Option<&str>, body: &[u8]) -> bool {
    if std::str::from_utf8(body).is_err() {
        return true;
    }
    let Some(content_type) = content_type else {
        return false;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let Some((top, sub)) = mime.split_once('/') else {
        return false;
    };
    if top == "text" {
        return false;
    }
    // structured text disguised under application/* and friends
    let sub = sub.strip_prefix("x-").unwrap_or(sub);
    let sub = sub.rsplit('+').next().unwrap_or(sub);
    !matches!(sub, "json" | "xml" | "javascript" | "www-form-urlencoded" | "x-www-form-urlencoded")
}
