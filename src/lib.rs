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

pub mod ca;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod events;
pub mod headers;
pub mod intercept;
pub mod paths;
pub mod proxy;
pub mod replay;
pub mod state;
pub mod store;

/// the daemon version, exchanged over the control socket handshake
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
