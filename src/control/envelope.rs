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
use serde_json::Value;

use crate::error::WiretapError;
use crate::events::PushEvent;

/// typed error body carried on failed responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&WiretapError> for ErrorBody {
    fn from(e: &WiretapError) -> Self {
        ErrorBody {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// one line on the control socket
///
/// requests and responses correlate through the client-chosen id; events
/// carry a method-like tag and no id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    pub fn response(id: Option<String>, payload: Value) -> Self {
        Envelope {
            id,
            kind: "response".to_string(),
            method: None,
            payload,
            error: None,
        }
    }

    pub fn error_response(id: Option<String>, error: &WiretapError) -> Self {
        Envelope {
            id,
            kind: "response".to_string(),
            method: None,
            payload: Value::Null,
            error: Some(ErrorBody::from(error)),
        }
    }

    pub fn event(event: &PushEvent) -> Self {
        Envelope {
            id: None,
            kind: "event".to_string(),
            method: Some(event.tag().to_string()),
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
            error: None,
        }
    }

    /// wire form, one envelope per line
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}
