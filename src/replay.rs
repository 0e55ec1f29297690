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

use std::time::{Duration, Instant};

use ahash::AHashMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;

const TOKEN_BYTES: usize = 32;

/// what a consumed token pays out
///
/// the record id for the re-issued request is allocated at issue time so
/// the control plane can hand it back before the replay lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayClaim {
    pub original_id: String,
    pub new_id: String,
}

struct Ticket {
    claim: ReplayClaim,
    issued_at: Instant,
}

/// short-lived correlation table for daemon-initiated replays
///
/// the control plane issues a token when it re-plays a captured request;
/// the proxy consumes it when the replayed request comes back through and
/// links the new record to the original. consume is read-and-remove, so a
/// token pays out at most once.
pub struct ReplayTracker {
    ttl: Duration,
    tickets: Mutex<AHashMap<String, Ticket>>,
}

impl ReplayTracker {
    pub fn new(ttl: Duration) -> Self {
        ReplayTracker {
            ttl,
            tickets: Mutex::new(AHashMap::new()),
        }
    }

    /// mint a token for a replay of `original_id`
    pub fn issue(&self, original_id: &str) -> (String, String) {
        let mut raw = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);
        let new_id = ulid::Ulid::new().to_string();

        let mut tickets = self.tickets.lock();
        Self::expire_locked(&mut tickets, self.ttl);
        tickets.insert(
            token.clone(),
            Ticket {
                claim: ReplayClaim {
                    original_id: original_id.to_string(),
                    new_id: new_id.clone(),
                },
                issued_at: Instant::now(),
            },
        );
        (token, new_id)
    }

    /// redeem a token
    pub fn consume(&self, token: &str) -> Option<ReplayClaim> {
        let mut tickets = self.tickets.lock();
        Self::expire_locked(&mut tickets, self.ttl);
        tickets.remove(token).map(|t| t.claim)
    }

    /// drop expired tickets, also called by the periodic sweep task
    pub fn sweep(&self) {
        let mut tickets = self.tickets.lock();
        Self::expire_locked(&mut tickets, self.ttl);
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }

    fn expire_locked(tickets: &mut AHashMap<String, Ticket>, ttl: Duration) {
        let now = Instant::now();
        tickets.retain(|_, ticket| now.duration_since(ticket.issued_at) < ttl);
    }
}
