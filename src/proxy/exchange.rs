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

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};
use ulid::Ulid;

use super::body::{self, BodyMode, CaptureSink};
use super::codec::{self, RequestHead, ResponseHead};
use super::synthetic;
use super::upstream;
use crate::headers::{strip_internal_headers, HeaderTable, InternalHeaders};
use crate::intercept::{Outcome, ScriptRequest};
use crate::state::SharedState;
use crate::store::{
    self, InterceptionKind, NewRequest, ResponseRecord, ORPHAN_SESSION_ID,
};

/// a resolved request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
    /// origin-form request target for the upstream wire
    pub path_query: String,
    /// path only, query stripped, for the captured record
    pub path: String,
    /// full url for the captured record
    pub url: String,
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

fn split_authority(authority: &str, scheme: &str) -> Result<(String, u16), String> {
    if let Some(rest) = authority.strip_prefix('[') {
        // bracketed ipv6 authority
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(format!("bad authority {authority:?}"));
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| format!("bad port in {authority:?}"))?,
            None => default_port(scheme),
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("bad port in {authority:?}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port(scheme))),
    }
}

/// resolve the request line target against its context
///
/// absolute-form carries everything; origin-form borrows the authority
/// from the CONNECT tunnel or the Host header.
pub fn parse_target(
    raw_target: &str,
    host_header: Option<&str>,
    tunnel_authority: Option<&str>,
    default_scheme: &'static str,
) -> Result<Target, String> {
    let (scheme, authority, path_query): (&'static str, String, String) =
        if let Some(rest) = raw_target.strip_prefix("http://") {
            let (authority, pq) = match rest.find('/') {
                Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
                None => (rest.to_string(), "/".to_string()),
            };
            ("http", authority, pq)
        } else if let Some(rest) = raw_target.strip_prefix("https://") {
            let (authority, pq) = match rest.find('/') {
                Some(i) => (rest[..i].to_string(), rest[i..].to_string()),
                None => (rest.to_string(), "/".to_string()),
            };
            ("https", authority, pq)
        } else if raw_target.starts_with('/') {
            let authority = tunnel_authority
                .map(str::to_string)
                .or_else(|| host_header.map(str::to_string))
                .ok_or_else(|| "origin-form request without a host".to_string())?;
            (default_scheme, authority, raw_target.to_string())
        } else {
            return Err(format!("unsupported request target {raw_target:?}"));
        };

    if authority.is_empty() {
        return Err(format!("empty authority in {raw_target:?}"));
    }
    let (host, port) = split_authority(&authority, scheme)?;
    let path = path_query
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
    let url = if port == default_port(scheme) {
        format!("{scheme}://{host}{path_query}")
    } else {
        format!("{scheme}://{host}:{port}{path_query}")
    };

    Ok(Target {
        scheme,
        host,
        port,
        path_query,
        path,
        url,
    })
}

fn wants_close(headers: &HeaderTable) -> bool {
    headers
        .get("connection")
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false)
}

/// connection-upgrade requests get a duplex tunnel after the 101
fn is_upgrade_request(headers: &HeaderTable) -> bool {
    let connection_upgrade = headers
        .get("connection")
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    connection_upgrade && headers.contains("upgrade")
}

fn expects_continue(headers: &HeaderTable) -> bool {
    headers
        .get("expect")
        .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

fn client_keepalive(head: &RequestHead) -> bool {
    match head.version_minor {
        0 => head
            .headers
            .get("connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false),
        _ => !wants_close(&head.headers),
    }
}

/// who this request belongs to
///
/// a valid id+token pair wins; a pair that fails validation is recorded as
/// orphan traffic; env-only clients fall back to the active session.
async fn attribute_session(state: &SharedState, internal: &InternalHeaders) -> String {
    match (&internal.session_id, &internal.session_token) {
        (Some(id), Some(token)) => {
            let valid = state
                .store
                .session_token_matches(id.clone(), token.clone())
                .await
                .unwrap_or(false);
            if valid {
                id.clone()
            } else {
                warn!("rejecting session header with bad token");
                ORPHAN_SESSION_ID.to_string()
            }
        }
        (Some(_), None) => ORPHAN_SESSION_ID.to_string(),
        _ => state
            .active_session()
            .unwrap_or_else(|| ORPHAN_SESSION_ID.to_string()),
    }
}

fn script_request(head: &RequestHead, target: &Target, raw_body: &[u8]) -> ScriptRequest {
    let mut headers = BTreeMap::new();
    for (name, value) in head.headers.iter() {
        headers
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| value.to_string());
    }
    ScriptRequest {
        method: head.method.clone(),
        url: target.url.clone(),
        host: target.host.clone(),
        path: target.path.clone(),
        headers,
        body: String::from_utf8_lossy(raw_body).into_owned(),
    }
}

/// cap a fully buffered body down to the capture limit
fn capped(body: &[u8], cap: usize) -> (Option<Vec<u8>>, bool) {
    if body.is_empty() {
        return (None, false);
    }
    if body.len() > cap {
        (Some(body[..cap].to_vec()), true)
    } else {
        (Some(body.to_vec()), false)
    }
}

enum PhaseError {
    Upstream(String),
    Io(tokio::io::Error),
}

impl From<tokio::io::Error> for PhaseError {
    fn from(e: tokio::io::Error) -> Self {
        PhaseError::Io(e)
    }
}

struct PhaseOutput {
    response: ResponseHead,
    body: Option<Vec<u8>>,
    body_truncated: bool,
    keepalive: bool,
}

/// insert with the standard retry policy, giving up means the exchange
/// continues uncaptured
async fn persist_insert(state: &SharedState, new: &NewRequest) -> bool {
    let result = store::with_retry(|| {
        let store = state.store.clone();
        let new = new.clone();
        async move { store.insert_request(new).await.map(|_| ()) }
    })
    .await;
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("giving up persisting request {}: {e}", new.id);
            false
        }
    }
}

async fn persist_response(state: &SharedState, id: &str, record: ResponseRecord) {
    let result = store::with_retry(|| {
        let store = state.store.clone();
        let id = id.to_string();
        let record = record.clone();
        async move { store.record_response(id, record).await.map(|_| ()) }
    })
    .await;
    if let Err(e) = result {
        error!("giving up persisting response for {id}: {e}");
    }
}

async fn persist_request_body(state: &SharedState, id: &str, body: Option<Vec<u8>>, truncated: bool) {
    if body.is_none() {
        return;
    }
    if let Err(e) = state
        .store
        .record_request_body(id.to_string(), body, truncated)
        .await
    {
        error!("persisting request body for {id}: {e}");
    }
}

/// handle one request/response exchange on an accepted stream
///
/// this is the capture contract: record at arrival, strip internal
/// headers, consult replay and interceptors, dispatch upstream, stream
/// both bodies through capped capture sinks, patch the record with the
/// response. returns whether the connection can serve another exchange.
pub async fn handle_exchange<D>(
    state: &SharedState,
    downstream: &mut D,
    buf: &mut BytesMut,
    head: RequestHead,
    default_scheme: &'static str,
    tunnel_authority: Option<&str>,
) -> tokio::io::Result<bool>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let ts_ms = store::now_ms();
    let cap = state.body_capture_limit();

    let mut head = head;
    let internal = strip_internal_headers(&mut head.headers);

    let target = match parse_target(
        &head.target,
        head.headers.get("host"),
        tunnel_authority,
        default_scheme,
    ) {
        Ok(target) => target,
        Err(message) => {
            let (response, payload) = synthetic::diagnostic(400, &message);
            synthetic::write(downstream, &response, &payload).await?;
            return Ok(false);
        }
    };

    let session_id = attribute_session(state, &internal).await;
    let claim = internal
        .replay_token
        .as_deref()
        .and_then(|token| state.replay.consume(token));
    let (id, replay_of) = match claim {
        Some(claim) => {
            debug!("request {} replays {}", claim.new_id, claim.original_id);
            (claim.new_id, Some(claim.original_id))
        }
        None => (Ulid::new().to_string(), None),
    };
    let new = NewRequest {
        id: id.clone(),
        session_id: Some(session_id),
        ts_ms,
        method: head.method.clone(),
        url: target.url.clone(),
        host: target.host.clone(),
        path: target.path.clone(),
        headers: head.headers.clone(),
        body: None,
        body_truncated: false,
        replay_of,
    };
    let persisted = persist_insert(state, &new).await;

    let body_mode = body::request_body_mode(&head.headers);
    let keep_client = client_keepalive(&head);

    // answer Expect locally so clients release their body; the origin
    // never sees the Expect header, interim 1xx are skipped on read
    if expects_continue(&head.headers) {
        use tokio::io::AsyncWriteExt;
        downstream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        downstream.flush().await?;
        head.headers.remove("expect");
    }

    // interceptor dispatch needs the whole body up front; without any
    // loaded rules the body streams straight through
    let mut buffered_body: Option<Vec<u8>> = None;
    let mut forward_head = head.clone();
    let mut forward_target = target.clone();
    let mut interception: Option<(String, InterceptionKind)> = None;
    let mut mock_response: Option<(ResponseHead, Vec<u8>)> = None;

    if !state.registry.is_empty() {
        let raw_body = body::read_full_body(downstream, buf, body_mode).await?;
        if persisted {
            let (captured, truncated) = capped(&raw_body, cap);
            persist_request_body(state, &id, captured, truncated).await;
        }

        let script_req = script_request(&head, &target, &raw_body);
        match state.registry.dispatch(&script_req).await {
            Some((name, Outcome::Mock(mock))) => {
                interception = Some((name, InterceptionKind::Mocked));
                mock_response = Some(synthetic::from_mock(&mock));
            }
            Some((name, Outcome::Modify(patch))) => {
                interception = Some((name, InterceptionKind::Modified));
                if let Some(method) = patch.method {
                    forward_head.method = method;
                }
                if let Some(url) = &patch.url {
                    match parse_target(url, None, None, forward_target.scheme) {
                        Ok(new_target) => forward_target = new_target,
                        Err(message) => warn!("ignoring bad rewrite url {url:?}: {message}"),
                    }
                }
                if let Some(patched) = patch.headers {
                    for (name, value) in patched {
                        forward_head.headers.set(&name, value);
                    }
                }
                let body_bytes = patch
                    .body
                    .map(String::into_bytes)
                    .unwrap_or(raw_body);
                buffered_body = Some(body_bytes);
            }
            None | Some((_, Outcome::Decline)) => {
                buffered_body = Some(raw_body);
            }
        }

        // a buffered body is forwarded de-chunked with an exact length
        if mock_response.is_none() {
            let length = buffered_body.as_ref().map(Vec::len).unwrap_or(0);
            forward_head.headers.remove("transfer-encoding");
            if length > 0 || body_mode != BodyMode::None {
                forward_head.headers.set("content-length", length.to_string());
            }
        }
    }

    if let Some((name, kind)) = &interception {
        if persisted {
            if let Err(e) = state
                .store
                .record_interception(id.clone(), name.clone(), *kind)
                .await
            {
                error!("persisting interception for {id}: {e}");
            }
        }
    }

    // mocks never touch the network
    if let Some((response, payload)) = mock_response {
        synthetic::write(downstream, &response, &payload).await?;
        if persisted {
            let (captured, truncated) = capped(&payload, cap);
            persist_response(
                state,
                &id,
                ResponseRecord {
                    status: response.status,
                    headers: response.headers.clone(),
                    body: captured,
                    body_truncated: truncated,
                    duration_ms: started.elapsed().as_millis() as i64,
                },
            )
            .await;
        }
        return Ok(keep_client);
    }

    // upgrades outlive the per-exchange deadline; after the 101 the
    // connection is an opaque duplex pipe, not request/response traffic
    if interception.is_none() && body_mode == BodyMode::None && is_upgrade_request(&head.headers) {
        return upgrade_phase(
            state,
            downstream,
            buf,
            &id,
            persisted,
            &forward_head,
            &forward_target,
            started,
            cap,
        )
        .await;
    }

    let deadline = state.request_deadline();
    let phase = tokio::time::timeout(
        deadline,
        upstream_phase(
            state,
            downstream,
            buf,
            &id,
            persisted,
            &forward_head,
            &forward_target,
            body_mode,
            buffered_body,
            cap,
        ),
    )
    .await;

    match phase {
        Ok(Ok(output)) => {
            if persisted {
                persist_response(
                    state,
                    &id,
                    ResponseRecord {
                        status: output.response.status,
                        headers: output.response.headers.clone(),
                        body: output.body,
                        body_truncated: output.body_truncated,
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                )
                .await;
            }
            Ok(keep_client && output.keepalive)
        }
        Ok(Err(PhaseError::Upstream(message))) => {
            warn!("upstream failure for {}: {message}", target.url);
            let (response, payload) = synthetic::diagnostic(502, &message);
            if persisted {
                persist_response(
                    state,
                    &id,
                    ResponseRecord {
                        status: 502,
                        headers: response.headers.clone(),
                        body: Some(payload.clone()),
                        body_truncated: false,
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                )
                .await;
            }
            synthetic::write(downstream, &response, &payload).await?;
            Ok(false)
        }
        Ok(Err(PhaseError::Io(e))) => Err(e),
        Err(_elapsed) => {
            let message = format!("exceeded the {}ms request deadline", deadline.as_millis());
            let (response, payload) = synthetic::diagnostic(504, &message);
            if persisted {
                persist_response(
                    state,
                    &id,
                    ResponseRecord {
                        status: 504,
                        headers: response.headers.clone(),
                        body: Some(payload.clone()),
                        body_truncated: false,
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                )
                .await;
            }
            // best effort, the client may have observed a partial response
            let _ = synthetic::write(downstream, &response, &payload).await;
            Ok(false)
        }
    }
}

/// dispatch upstream and stream the response back
#[allow(clippy::too_many_arguments)]
async fn upstream_phase<D>(
    state: &SharedState,
    downstream: &mut D,
    buf: &mut BytesMut,
    id: &str,
    persisted: bool,
    forward_head: &RequestHead,
    target: &Target,
    body_mode: BodyMode,
    buffered_body: Option<Vec<u8>>,
    cap: usize,
) -> Result<PhaseOutput, PhaseError>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    use tokio::io::AsyncWriteExt;

    let mut origin = upstream::connect(
        &target.host,
        target.port,
        target.scheme == "https",
        state.config.upstream_tls_insecure,
    )
    .await
    .map_err(|e| PhaseError::Upstream(e.message))?;

    // upstream sees an origin-form request line and never our headers
    let mut wire_head = forward_head.clone();
    wire_head.target = target.path_query.clone();
    if !wire_head.headers.contains("host") {
        wire_head.headers.set("Host", target.host.clone());
    }
    codec::write_head(&mut origin, wire_head.encode()).await?;

    match buffered_body {
        Some(bytes) => {
            if !bytes.is_empty() {
                origin.write_all(&bytes).await?;
                origin.flush().await?;
            }
        }
        None => {
            let mut sink = CaptureSink::new(cap);
            body::relay_body(downstream, &mut origin, buf, body_mode, &mut sink).await?;
            if persisted {
                let (captured, truncated) = sink.into_parts();
                persist_request_body(state, id, captured, truncated).await;
            }
        }
    }

    let mut origin_buf = BytesMut::new();
    let mut response = loop {
        let head = codec::read_response_head(&mut origin, &mut origin_buf)
            .await
            .map_err(|e| PhaseError::Upstream(format!("reading response: {e}")))?;
        // interim responses are dropped, the final head follows
        match head.status {
            100..=199 if head.status != 101 => continue,
            _ => break head,
        }
    };
    strip_internal_headers(&mut response.headers);

    codec::write_head(downstream, response.encode()).await?;

    let response_mode = body::response_body_mode(&forward_head.method, response.status, &response.headers);
    let mut sink = CaptureSink::new(cap);
    body::relay_body(&mut origin, downstream, &mut origin_buf, response_mode, &mut sink)
        .await?;

    // an unsolicited 101 leaves the connection in an unknown protocol
    let keepalive = response.status != 101
        && response_mode != BodyMode::UntilClose
        && !wants_close(&response.headers);
    let (captured, truncated) = sink.into_parts();
    Ok(PhaseOutput {
        response,
        body: captured,
        body_truncated: truncated,
        keepalive,
    })
}

/// dispatch an upgrade request and, on 101, relay bytes both ways
///
/// the capture record completes at the switch, frames inside the upgraded
/// tunnel are opaque to the store.
#[allow(clippy::too_many_arguments)]
async fn upgrade_phase<D>(
    state: &SharedState,
    downstream: &mut D,
    buf: &mut BytesMut,
    id: &str,
    persisted: bool,
    forward_head: &RequestHead,
    target: &Target,
    started: Instant,
    cap: usize,
) -> tokio::io::Result<bool>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    use tokio::io::AsyncWriteExt;

    let connected = upstream::connect(
        &target.host,
        target.port,
        target.scheme == "https",
        state.config.upstream_tls_insecure,
    )
    .await;
    let mut origin = match connected {
        Ok(origin) => origin,
        Err(e) => {
            let (response, payload) = synthetic::diagnostic(502, &e.message);
            if persisted {
                persist_response(
                    state,
                    id,
                    ResponseRecord {
                        status: 502,
                        headers: response.headers.clone(),
                        body: Some(payload.clone()),
                        body_truncated: false,
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                )
                .await;
            }
            synthetic::write(downstream, &response, &payload).await?;
            return Ok(false);
        }
    };

    let mut wire_head = forward_head.clone();
    wire_head.target = target.path_query.clone();
    if !wire_head.headers.contains("host") {
        wire_head.headers.set("Host", target.host.clone());
    }
    codec::write_head(&mut origin, wire_head.encode()).await?;

    let mut origin_buf = BytesMut::new();
    let mut response = match codec::read_response_head(&mut origin, &mut origin_buf).await {
        Ok(response) => response,
        Err(e) => {
            let (response, payload) =
                synthetic::diagnostic(502, &format!("reading response: {e}"));
            if persisted {
                persist_response(
                    state,
                    id,
                    ResponseRecord {
                        status: 502,
                        headers: response.headers.clone(),
                        body: Some(payload.clone()),
                        body_truncated: false,
                        duration_ms: started.elapsed().as_millis() as i64,
                    },
                )
                .await;
            }
            synthetic::write(downstream, &response, &payload).await?;
            return Ok(false);
        }
    };
    strip_internal_headers(&mut response.headers);
    codec::write_head(downstream, response.encode()).await?;

    if response.status != 101 {
        // origin refused the switch, a regular response follows
        let response_mode =
            body::response_body_mode(&forward_head.method, response.status, &response.headers);
        let mut sink = CaptureSink::new(cap);
        body::relay_body(&mut origin, downstream, &mut origin_buf, response_mode, &mut sink)
            .await?;
        if persisted {
            let (captured, truncated) = sink.into_parts();
            persist_response(
                state,
                id,
                ResponseRecord {
                    status: response.status,
                    headers: response.headers.clone(),
                    body: captured,
                    body_truncated: truncated,
                    duration_ms: started.elapsed().as_millis() as i64,
                },
            )
            .await;
        }
        return Ok(false);
    }

    if persisted {
        persist_response(
            state,
            id,
            ResponseRecord {
                status: 101,
                headers: response.headers.clone(),
                body: None,
                body_truncated: false,
                duration_ms: started.elapsed().as_millis() as i64,
            },
        )
        .await;
    }

    // bytes either side raced ahead of the switch
    if !origin_buf.is_empty() {
        downstream.write_all(&origin_buf).await?;
        downstream.flush().await?;
    }
    if !buf.is_empty() {
        origin.write_all(&buf).await?;
        origin.flush().await?;
        buf.clear();
    }

    debug!("duplex tunnel open for {}", target.url);
    let _ = tokio::io::copy_bidirectional(downstream, &mut origin).await;
    Ok(false)
}
