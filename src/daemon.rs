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

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::envelope::Envelope;
use crate::control::ControlServer;
use crate::error::{Result, WiretapError};
use crate::paths::ProjectPaths;
use crate::proxy::ProxyServer;
use crate::state::{AppState, SharedState};

/// drain window for in-flight captures on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// how long a second start waits for a killed daemon to exit
const TAKEOVER_WAIT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const REPLAY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACTION_INTERVAL: Duration = Duration::from_secs(600);
const COMPACTION_KEEP_ENTRIES: u64 = 20_000;

/// a running daemon instance
pub struct Daemon {
    state: SharedState,
    shutdown_tx: watch::Sender<bool>,
    proxy_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
    pub proxy_port: u16,
}

/// what a start attempt resolved to
pub enum StartOutcome {
    Started(Daemon),
    /// a compatible daemon already owns this data directory
    AlreadyRunning { pid: i32, version: String },
}

/// findings about a previous instance
enum Existing {
    None,
    Compatible { pid: i32, version: String },
}

pub async fn start(paths: ProjectPaths) -> Result<StartOutcome> {
    paths
        .ensure()
        .map_err(|e| WiretapError::Internal(format!("creating data directory: {e}")))?;
    let config = Config::load(&paths.config_file());

    match probe_existing(&paths, &config).await? {
        Existing::Compatible { pid, version } => {
            return Ok(StartOutcome::AlreadyRunning { pid, version });
        }
        Existing::None => {}
    }

    let state = AppState::build(paths.clone(), config.clone())?;

    // control socket first so clients can handshake as soon as the pid
    // file appears, proxy second, rendezvous files last
    let control = ControlServer::bind(state.clone())?;
    let proxy = ProxyServer::bind(state.clone()).await?;
    let proxy_port = proxy.port();

    std::fs::write(paths.pid_file(), format!("{}\n", std::process::id()))
        .map_err(|e| WiretapError::Internal(format!("writing pid file: {e}")))?;

    let counts = state.registry.load();
    info!(
        "daemon v{} up: proxy port {proxy_port}, {} interceptors ({} broken)",
        crate::VERSION,
        counts.loaded + counts.failed,
        counts.failed
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));
    let proxy_task = tokio::spawn(proxy.run(shutdown_rx, SHUTDOWN_GRACE));
    let sweep_task = tokio::spawn(sweep_loop(state.clone()));

    Ok(StartOutcome::Started(Daemon {
        state,
        shutdown_tx,
        proxy_task,
        control_task,
        sweep_task,
        proxy_port,
    }))
}

impl Daemon {
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// block until SIGINT or SIGTERM, then tear down
    pub async fn run_until_signal(self) -> Result<()> {
        let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .map_err(|e| WiretapError::Internal(format!("installing SIGINT handler: {e}")))?;
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|e| WiretapError::Internal(format!("installing SIGTERM handler: {e}")))?;

        tokio::select! {
            _ = interrupt.recv() => info!("interrupt signalled"),
            _ = terminate.recv() => info!("termination signalled"),
        }
        self.shutdown().await
    }

    /// stop accepting, drain, flush, unlink the rendezvous files
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.sweep_task.abort();

        let drain = futures::future::join(self.control_task, self.proxy_task);
        if tokio::time::timeout(SHUTDOWN_GRACE * 2, drain).await.is_err() {
            warn!("shutdown drain did not settle, leaving tasks to the runtime");
        }

        let paths = &self.state.paths;
        for file in [paths.control_socket(), paths.pid_file(), paths.port_file()] {
            if let Err(e) = std::fs::remove_file(&file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot unlink {}: {e}", file.display());
                }
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}

/// background housekeeping: replay ticket expiry and changelog compaction
async fn sweep_loop(state: SharedState) {
    let mut replay_tick = tokio::time::interval(REPLAY_SWEEP_INTERVAL);
    let mut compact_tick = tokio::time::interval(COMPACTION_INTERVAL);
    loop {
        tokio::select! {
            _ = replay_tick.tick() => state.replay.sweep(),
            _ = compact_tick.tick() => {
                match state.store.compact_changelog(COMPACTION_KEEP_ENTRIES).await {
                    Ok(0) => {}
                    Ok(n) => info!("compacted {n} changelog entries"),
                    Err(e) => warn!("changelog compaction failed: {e}"),
                }
            }
        }
    }
}

/// figure out whether another instance owns this data directory
async fn probe_existing(paths: &ProjectPaths, config: &Config) -> Result<Existing> {
    let pid = match std::fs::read_to_string(paths.pid_file()) {
        Ok(raw) => match raw.trim().parse::<i32>() {
            Ok(pid) => pid,
            Err(_) => {
                remove_stale_files(paths);
                return Ok(Existing::None);
            }
        },
        Err(_) => return Ok(Existing::None),
    };

    if !pid_alive(pid) {
        info!("removing stale lock files of pid {pid}");
        remove_stale_files(paths);
        return Ok(Existing::None);
    }

    match handshake_version(&paths.control_socket()).await {
        Ok(version) if version == crate::VERSION => Ok(Existing::Compatible { pid, version }),
        Ok(version) => {
            if config.auto_restart {
                info!("replacing daemon v{version} (pid {pid}) with v{}", crate::VERSION);
                takeover(pid, paths).await?;
                Ok(Existing::None)
            } else {
                Err(WiretapError::VersionMismatch {
                    client: crate::VERSION.to_string(),
                    server: version,
                })
            }
        }
        Err(e) => {
            // alive pid but a dead control socket, the previous instance
            // never finished starting or is already half torn down
            warn!("pid {pid} alive but control socket unusable ({e}), taking over");
            takeover(pid, paths).await?;
            Ok(Existing::None)
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

async fn takeover(pid: i32, paths: &ProjectPaths) -> Result<()> {
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!("cannot signal pid {pid}: {e}");
    }
    let deadline = tokio::time::Instant::now() + TAKEOVER_WAIT;
    while pid_alive(pid) {
        if tokio::time::Instant::now() > deadline {
            return Err(WiretapError::Internal(format!(
                "pid {pid} did not exit within {}s",
                TAKEOVER_WAIT.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    remove_stale_files(paths);
    Ok(())
}

fn remove_stale_files(paths: &ProjectPaths) {
    for file in [paths.pid_file(), paths.port_file(), paths.control_socket()] {
        let _ = std::fs::remove_file(file);
    }
}

/// ping the control socket and read back the server version
async fn handshake_version(socket: &std::path::Path) -> std::result::Result<String, String> {
    let work = async {
        let mut stream = UnixStream::connect(socket)
            .await
            .map_err(|e| format!("connect: {e}"))?;
        let ping = Envelope {
            id: Some("handshake".to_string()),
            kind: "request".to_string(),
            method: Some("ping".to_string()),
            payload: serde_json::Value::Null,
            error: None,
        };
        stream
            .write_all(ping.encode_line().as_bytes())
            .await
            .map_err(|e| format!("send: {e}"))?;

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| format!("recv: {e}"))?
                .ok_or_else(|| "closed before responding".to_string())?;
            let envelope: Envelope =
                serde_json::from_str(&line).map_err(|e| format!("decode: {e}"))?;
            // events may interleave before our response
            if envelope.kind != "response" {
                continue;
            }
            return envelope.payload["version"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| "response without version".to_string());
        }
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, work)
        .await
        .map_err(|_| "handshake timed out".to_string())?
}
