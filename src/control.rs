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

pub mod envelope;
pub mod methods;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, WiretapError};
use crate::state::SharedState;
use envelope::Envelope;

/// per-method deadline, the client sees a timeout error past this
const METHOD_DEADLINE: Duration = Duration::from_secs(10);

/// the unix-socket control surface
///
/// authorization is the 0600 socket mode, there is no in-band auth.
pub struct ControlServer {
    state: SharedState,
    listener: UnixListener,
}

impl ControlServer {
    pub fn bind(state: SharedState) -> Result<Self> {
        let path = state.paths.control_socket();
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| WiretapError::Internal(format!("removing stale socket: {e}")))?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| WiretapError::Internal(format!("binding {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| WiretapError::Internal(format!("chmod {}: {e}", path.display())))?;
        }

        info!("control socket at {}", path.display());
        Ok(ControlServer { state, listener })
    }

    /// accept until shutdown; client tasks die with their connections
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut clients: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = self.state.clone();
                        clients.spawn(async move {
                            if let Err(e) = serve_client(state, stream).await {
                                debug!("control connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("control accept failed: {e}"),
                },
            }
        }
        drop(self.listener);
        clients.shutdown().await;
    }
}

/// one control connection: serve requests, push events in between
async fn serve_client(state: SharedState, stream: UnixStream) -> tokio::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&state, &line).await;
                let mut writer = writer.lock().await;
                writer.write_all(response.encode_line().as_bytes()).await?;
                writer.flush().await?;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let envelope = Envelope::event(&event);
                        let mut writer = writer.lock().await;
                        writer.write_all(envelope.encode_line().as_bytes()).await?;
                        writer.flush().await?;
                    }
                    // lagged consumers just miss events, they can re-poll
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn handle_line(state: &SharedState, line: &str) -> Envelope {
    let request: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Envelope::error_response(
                None,
                &WiretapError::InvalidArgument(format!("bad envelope: {e}")),
            );
        }
    };

    if request.kind != "request" {
        return Envelope::error_response(
            request.id,
            &WiretapError::InvalidArgument(format!("unexpected kind {:?}", request.kind)),
        );
    }
    let Some(method) = request.method.clone() else {
        return Envelope::error_response(
            request.id,
            &WiretapError::InvalidArgument("missing method".into()),
        );
    };

    let result = tokio::time::timeout(
        METHOD_DEADLINE,
        methods::dispatch(state, &method, request.payload),
    )
    .await;

    match result {
        Ok(Ok(payload)) => Envelope::response(request.id, payload),
        Ok(Err(error)) => Envelope::error_response(request.id, &error),
        Err(_elapsed) => Envelope::error_response(request.id, &WiretapError::Timeout(method)),
    }
}
