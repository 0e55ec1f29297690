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

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ca::CertAuthority;
use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::intercept::InterceptorRegistry;
use crate::paths::ProjectPaths;
use crate::replay::ReplayTracker;
use crate::store::Store;

/// everything the proxy and control plane share
///
/// owned by the daemon, handed around as an Arc. components with their own
/// locking discipline live behind their own types.
pub struct AppState {
    pub config: Config,
    pub paths: ProjectPaths,
    pub store: Store,
    pub ca: Arc<CertAuthority>,
    pub registry: Arc<InterceptorRegistry>,
    pub replay: Arc<ReplayTracker>,
    pub events: EventBus,
    /// the session that attributes env-only clients, last one registered wins
    pub active_session: Mutex<Option<String>>,
    /// bound proxy port, zero until the listener is up
    pub proxy_port: AtomicU16,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// assemble the full core against one data directory
    ///
    /// opens storage and the CA eagerly, both failures are fatal here.
    pub fn build(paths: ProjectPaths, config: Config) -> Result<SharedState> {
        let events = EventBus::new();
        let store = Store::open(&paths.database_file(), config.max_stored_requests)?;
        let ca = Arc::new(CertAuthority::load_or_create(&paths)?);
        let registry = Arc::new(InterceptorRegistry::new(
            paths.interceptor_dir(),
            Duration::from_millis(config.interceptor_timeout_ms),
            events.clone(),
        ));
        let replay = Arc::new(ReplayTracker::new(Duration::from_millis(
            config.replay_token_ttl_ms,
        )));

        Ok(Arc::new(AppState {
            config,
            paths,
            store,
            ca,
            registry,
            replay,
            events,
            active_session: Mutex::new(None),
            proxy_port: AtomicU16::new(0),
        }))
    }

    pub fn set_proxy_port(&self, port: u16) {
        self.proxy_port.store(port, Ordering::SeqCst);
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port.load(Ordering::SeqCst)
    }

    pub fn set_active_session(&self, id: String) {
        *self.active_session.lock() = Some(id);
    }

    pub fn active_session(&self) -> Option<String> {
        self.active_session.lock().clone()
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.config.request_deadline_ms)
    }

    pub fn body_capture_limit(&self) -> usize {
        self.config.body_capture_limit
    }
}
