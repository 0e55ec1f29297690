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

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// unsolicited notifications pushed to every control connection
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PushEvent {
    /// an interceptor failed to load, crashed or timed out
    InterceptorError { name: String, message: String },
    /// the interceptor directory was reloaded
    Reload { loaded: usize, failed: usize },
}

impl PushEvent {
    /// the method-like tag carried on event envelopes
    pub fn tag(&self) -> &'static str {
        match self {
            PushEvent::InterceptorError { .. } => "interceptor-error",
            PushEvent::Reload { .. } => "reload",
        }
    }
}

/// fan-out bus between the daemon internals and control connections
///
/// senders never block: a slow consumer lags and drops, it cannot stall
/// the proxy path.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PushEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { tx }
    }

    pub fn publish(&self, event: PushEvent) {
        // no receivers is fine, nobody is watching
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
