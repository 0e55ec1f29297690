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

pub mod body;
pub mod codec;
pub mod exchange;
pub mod stream;
pub mod synthetic;
pub mod tunnel;
pub mod upstream;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, WiretapError};
use crate::state::SharedState;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// the proxy listening surface
///
/// loopback only; the bound port lands in the port file for clients to
/// pick up through HTTP_PROXY.
pub struct ProxyServer {
    state: SharedState,
    listener: TcpListener,
}

impl ProxyServer {
    /// bind the listener, preferring the recorded port when available
    pub async fn bind(state: SharedState) -> Result<Self> {
        let preferred = std::fs::read_to_string(state.paths.preferred_port_file())
            .ok()
            .and_then(|raw| raw.trim().parse::<u16>().ok());

        let listener = match preferred {
            Some(port) => match TcpListener::bind(SocketAddr::new(LOOPBACK, port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    debug!("preferred port {port} unavailable ({e}), using ephemeral");
                    TcpListener::bind(SocketAddr::new(LOOPBACK, 0)).await?
                }
            },
            None => TcpListener::bind(SocketAddr::new(LOOPBACK, 0)).await?,
        };

        let port = listener.local_addr()?.port();
        std::fs::write(state.paths.port_file(), format!("{port}\n"))
            .map_err(|e| WiretapError::Internal(format!("writing port file: {e}")))?;
        state.set_proxy_port(port);
        info!("proxy listening on 127.0.0.1:{port}");

        Ok(ProxyServer { state, listener })
    }

    pub fn port(&self) -> u16 {
        self.state.proxy_port()
    }

    /// accept until shutdown, then drain within the grace window
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("accepted proxy connection from {peer}");
                        socket.set_nodelay(true).ok();
                        let state = self.state.clone();
                        connections.spawn(handle_connection(state, socket));
                    }
                    Err(e) => {
                        warn!("proxy accept failed: {e}");
                    }
                },
            }
        }

        drop(self.listener);
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("drain window elapsed, cancelling in-flight captures");
            connections.shutdown().await;
        }
    }
}

/// one accepted client connection, plain exchanges until CONNECT upgrades
/// it into a tunnel
async fn handle_connection(state: SharedState, mut socket: TcpStream) {
    let mut buf = BytesMut::new();
    loop {
        let head = match codec::read_request_head(&mut socket, &mut buf).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(e) => {
                debug!("dropping proxy connection: {e}");
                break;
            }
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            let authority = head.target.clone();
            if let Err(e) = tunnel::serve(&state, socket, &authority, buf).await {
                debug!("tunnel to {authority} failed: {e}");
            }
            return;
        }

        match exchange::handle_exchange(&state, &mut socket, &mut buf, head, "http", None).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                debug!("exchange failed: {e}");
                break;
            }
        }
    }
}
