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

pub mod script;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rhai::Engine;
use serde::Serialize;
use tracing::{debug, warn};

pub use script::{MockResponse, Outcome, RequestPatch, ScriptRequest};

use crate::events::{EventBus, PushEvent};

/// one directory entry, loaded or broken
#[derive(Debug)]
pub struct Interceptor {
    pub name: String,
    pub path: PathBuf,
    pub error: Option<String>,
    script: Option<script::CompiledScript>,
}

/// the listing shape for the control plane
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorInfo {
    pub name: String,
    pub path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCounts {
    pub loaded: usize,
    pub failed: usize,
}

/// user-defined rule modules, loaded from the interceptors directory
///
/// loading is best-effort per entry and the published vector is swapped
/// atomically, the proxy never observes a half-reloaded registry.
pub struct InterceptorRegistry {
    dir: PathBuf,
    engine: Arc<Engine>,
    entries: ArcSwap<Vec<Arc<Interceptor>>>,
    budget: Duration,
    events: EventBus,
}

impl InterceptorRegistry {
    pub fn new(dir: PathBuf, budget: Duration, events: EventBus) -> Self {
        InterceptorRegistry {
            dir,
            engine: Arc::new(script::build_engine()),
            entries: ArcSwap::from_pointee(Vec::new()),
            budget,
            events,
        }
    }

    /// (re)load every rule file, alphabetical order is declared order
    pub fn load(&self) -> LoadCounts {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "rhai").unwrap_or(false))
                .collect(),
            Err(e) => {
                warn!("cannot read interceptor directory {}: {e}", self.dir.display());
                Vec::new()
            }
        };
        files.sort();

        let mut loaded = Vec::with_capacity(files.len());
        let mut counts = LoadCounts {
            loaded: 0,
            failed: 0,
        };
        for path in files {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            match script::compile(&self.engine, &path) {
                Ok(compiled) => {
                    counts.loaded += 1;
                    loaded.push(Arc::new(Interceptor {
                        name,
                        path,
                        error: None,
                        script: Some(compiled),
                    }));
                }
                Err(message) => {
                    counts.failed += 1;
                    warn!("interceptor {name} failed to load: {message}");
                    self.events.publish(PushEvent::InterceptorError {
                        name: name.clone(),
                        message: message.clone(),
                    });
                    loaded.push(Arc::new(Interceptor {
                        name,
                        path,
                        error: Some(message),
                        script: None,
                    }));
                }
            }
        }

        debug!(
            "interceptors loaded: {} ok, {} failed",
            counts.loaded, counts.failed
        );
        self.entries.store(Arc::new(loaded));
        counts
    }

    pub fn list(&self) -> Vec<InterceptorInfo> {
        self.entries
            .load()
            .iter()
            .map(|e| InterceptorInfo {
                name: e.name.clone(),
                path: e.path.display().to_string(),
                error: e.error.clone(),
            })
            .collect()
    }

    /// true when no rule could possibly fire, lets the proxy skip buffering
    pub fn is_empty(&self) -> bool {
        self.entries.load().iter().all(|e| e.script.is_none())
    }

    /// offer a request to every rule in declared order
    ///
    /// the first mock or modify wins. failures and timeouts count as a
    /// decline plus an error event, the request itself never fails.
    pub async fn dispatch(&self, req: &ScriptRequest) -> Option<(String, Outcome)> {
        let entries = self.entries.load_full();
        for entry in entries.iter() {
            if entry.script.is_none() {
                continue;
            }
            match self.invoke(entry.clone(), req.clone()).await {
                Ok(Outcome::Decline) => continue,
                Ok(outcome) => return Some((entry.name.clone(), outcome)),
                Err(message) => {
                    warn!("interceptor {} errored: {message}", entry.name);
                    self.events.publish(PushEvent::InterceptorError {
                        name: entry.name.clone(),
                        message,
                    });
                    continue;
                }
            }
        }
        None
    }

    /// one scripted invocation under the hard time budget
    async fn invoke(&self, entry: Arc<Interceptor>, req: ScriptRequest) -> Result<Outcome, String> {
        let engine = self.engine.clone();
        let budget = self.budget;
        let work = tokio::task::spawn_blocking(move || {
            let script = entry.script.as_ref().expect("checked by caller");
            script::run(&engine, script, &req)
        });
        match tokio::time::timeout(budget, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(format!("crashed: {join_error}")),
            Err(_) => Err(format!("timed out after {}ms", budget.as_millis())),
        }
    }
}
