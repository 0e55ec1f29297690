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

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::error::{Result, WiretapError};
use crate::events::PushEvent;
use crate::headers::REPLAY_TOKEN_HEADER;
use crate::proxy::codec::RequestHead;
use crate::state::SharedState;
use crate::store::{CapturedRequest, RequestFilter, SearchTarget};

fn params<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| WiretapError::InvalidArgument(format!("bad payload: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RegisterSessionParams {
    label: Option<String>,
    ppid: Option<i64>,
    source: Option<String>,
}

impl Default for RegisterSessionParams {
    fn default() -> Self {
        RegisterSessionParams {
            label: None,
            ppid: None,
            source: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaParams {
    #[serde(default)]
    after_change_seq: i64,
    #[serde(default = "default_delta_limit")]
    limit: u64,
    #[serde(default)]
    filter: RequestFilter,
}

fn default_delta_limit() -> u64 {
    200
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default = "default_list_limit")]
    limit: u64,
    #[serde(default)]
    filter: RequestFilter,
}

fn default_list_limit() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    query: String,
    #[serde(default)]
    target: SearchTarget,
    #[serde(default = "default_list_limit")]
    limit: u64,
    #[serde(default)]
    filter: RequestFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplayParams {
    id: String,
    #[serde(default)]
    initiator: Option<String>,
}

/// dispatch one control method
///
/// every outcome serializes to the response payload; errors carry the
/// stable code taxonomy.
pub async fn dispatch(state: &SharedState, method: &str, payload: Value) -> Result<Value> {
    match method {
        "ping" => Ok(json!({ "ok": true, "version": crate::VERSION })),

        "status" => {
            let sessions = state.store.session_count().await?;
            let requests = state.store.request_count().await?;
            Ok(json!({
                "proxyPort": state.proxy_port(),
                "sessionCount": sessions,
                "requestCount": requests,
                "version": crate::VERSION,
            }))
        }

        "registerSession" => {
            let p: RegisterSessionParams = params(payload)?;
            let session = state
                .store
                .register_session(p.label, p.ppid, p.source)
                .await?;
            state.set_active_session(session.id.clone());
            info!("registered session {}", session.id);
            Ok(json!({ "id": session.id, "token": session.token }))
        }

        "listRequestsSummaryDelta" => {
            let p: DeltaParams = params(payload)?;
            let page = state
                .store
                .delta(p.after_change_seq, p.limit, p.filter)
                .await?;
            Ok(serde_json::to_value(page)
                .map_err(|e| WiretapError::Internal(e.to_string()))?)
        }

        "listRequests" => {
            let p: ListParams = params(payload)?;
            let requests = state.store.list_requests(p.limit, p.filter).await?;
            Ok(json!({ "requests": requests }))
        }

        "getRequest" => {
            let p: IdParams = params(payload)?;
            let request = state
                .store
                .get_request(p.id.clone())
                .await?
                .ok_or(WiretapError::NotFound(p.id))?;
            Ok(serde_json::to_value(request)
                .map_err(|e| WiretapError::Internal(e.to_string()))?)
        }

        "searchBodies" => {
            let p: SearchParams = params(payload)?;
            let summaries = state
                .store
                .search_bodies(p.query, p.target, p.limit, p.filter)
                .await?;
            Ok(json!({ "summaries": summaries }))
        }

        "saveRequest" => {
            let p: IdParams = params(payload)?;
            if !state.store.set_saved(p.id.clone(), true).await? {
                return Err(WiretapError::NotFound(p.id));
            }
            Ok(json!({ "ok": true }))
        }

        "unsaveRequest" => {
            let p: IdParams = params(payload)?;
            if !state.store.set_saved(p.id.clone(), false).await? {
                return Err(WiretapError::NotFound(p.id));
            }
            Ok(json!({ "ok": true }))
        }

        "clearRequests" => {
            let removed = state.store.clear_requests().await?;
            Ok(json!({ "removed": removed }))
        }

        "replayRequest" => {
            let p: ReplayParams = params(payload)?;
            replay_request(state, p).await
        }

        "listInterceptors" => {
            let interceptors = state.registry.list();
            Ok(json!({ "interceptors": interceptors }))
        }

        "reloadInterceptors" => {
            let counts = state.registry.load();
            state.events.publish(PushEvent::Reload {
                loaded: counts.loaded,
                failed: counts.failed,
            });
            Ok(serde_json::to_value(counts)
                .map_err(|e| WiretapError::Internal(e.to_string()))?)
        }

        other => Err(WiretapError::InvalidArgument(format!(
            "unknown method {other:?}"
        ))),
    }
}

/// re-issue a captured request through the proxy
///
/// the new record id is allocated up front via the replay ticket; the
/// actual dispatch runs in the background so slow upstreams cannot stall
/// the control connection.
async fn replay_request(state: &SharedState, p: ReplayParams) -> Result<Value> {
    let original = state
        .store
        .get_request(p.id.clone())
        .await?
        .ok_or_else(|| WiretapError::NotFound(p.id.clone()))?;
    let body = state.store.request_body_bytes(p.id.clone()).await?;

    let port = state.proxy_port();
    if port == 0 {
        return Err(WiretapError::Internal("proxy listener not bound".into()));
    }

    let (token, new_id) = state.replay.issue(&original.id);
    if let Some(initiator) = &p.initiator {
        info!("replaying {} as {} for {initiator}", original.id, new_id);
    } else {
        info!("replaying {} as {}", original.id, new_id);
    }

    tokio::spawn(async move {
        if let Err(e) = dispatch_replay(original, body, token, port).await {
            warn!("replay dispatch failed: {e}");
        }
    });

    Ok(json!({ "id": new_id }))
}

/// the daemon acting as its own proxy client
async fn dispatch_replay(
    original: CapturedRequest,
    body: Option<Vec<u8>>,
    token: String,
    port: u16,
) -> tokio::io::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let mut headers = original.request_headers.clone();
    headers.set(REPLAY_TOKEN_HEADER, token);
    headers.set("Connection", "close");
    headers.remove("transfer-encoding");
    let body = body.unwrap_or_default();
    if body.is_empty() {
        headers.remove("content-length");
    } else {
        headers.set("Content-Length", body.len().to_string());
    }

    // absolute-form reaches the proxy for both schemes
    let head = RequestHead {
        method: original.method.clone(),
        target: original.url.clone(),
        version_minor: 1,
        headers,
    };
    stream.write_all(&head.encode()).await?;
    if !body.is_empty() {
        stream.write_all(&body).await?;
    }
    stream.flush().await?;

    // drain the response so the capture completes
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink).await?;
    Ok(())
}
