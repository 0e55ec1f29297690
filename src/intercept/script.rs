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
use std::path::{Path, PathBuf};

use rhai::{Dynamic, Engine, Scope, AST};
use serde::{Deserialize, Serialize};

// runaway-script backstop, the wall-clock budget is enforced by the caller
const MAX_SCRIPT_OPERATIONS: u64 = 5_000_000;

/// build the shared evaluation engine
///
/// scripts get plain rhai with resource limits, no filesystem or process
/// surface is registered.
pub fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_SCRIPT_OPERATIONS);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(4 * 1024 * 1024);
    engine.set_max_array_size(64 * 1024);
    engine.set_max_map_size(64 * 1024);
    engine
}

/// the request view handed to matchers and handlers
///
/// header names are lowercased for predictable script access, the body is
/// lossy UTF-8 of the captured prefix.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRequest {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// a synthetic response produced by a mock rule
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Default for MockResponse {
    fn default() -> Self {
        MockResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

/// a rewrite of the outgoing request produced by a modify rule
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestPatch {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Mock(MockResponse),
    Modify(RequestPatch),
    Decline,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HandlerVerdict {
    mock: Option<MockResponse>,
    modify: Option<RequestPatch>,
}

/// one successfully compiled rule script
#[derive(Debug)]
pub struct CompiledScript {
    pub name: String,
    pub path: PathBuf,
    ast: AST,
}

/// compile a script and check it exposes the rule contract
pub fn compile(engine: &Engine, path: &Path) -> Result<CompiledScript, String> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let source =
        std::fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
    let ast = engine
        .compile(&source)
        .map_err(|e| format!("compiling {}: {e}", path.display()))?;

    for required in ["matches", "handle"] {
        let found = ast
            .iter_functions()
            .any(|f| f.name == required && f.params.len() == 1);
        if !found {
            return Err(format!(
                "{}: missing `fn {required}(req)`",
                path.display()
            ));
        }
    }

    Ok(CompiledScript {
        name,
        path: path.to_path_buf(),
        ast,
    })
}

/// run matcher then handler against one request
///
/// any evaluation failure is an error string for the registry to publish;
/// a unit return from the handler is a decline.
pub fn run(engine: &Engine, script: &CompiledScript, req: &ScriptRequest) -> Result<Outcome, String> {
    let dyn_req: Dynamic =
        rhai::serde::to_dynamic(req).map_err(|e| format!("{}: encoding request: {e}", script.name))?;

    let mut scope = Scope::new();
    let matched: bool = engine
        .call_fn(&mut scope, &script.ast, "matches", (dyn_req.clone(),))
        .map_err(|e| format!("{}: matches: {e}", script.name))?;
    if !matched {
        return Ok(Outcome::Decline);
    }

    let mut scope = Scope::new();
    let verdict: Dynamic = engine
        .call_fn(&mut scope, &script.ast, "handle", (dyn_req,))
        .map_err(|e| format!("{}: handle: {e}", script.name))?;
    if verdict.is_unit() {
        return Ok(Outcome::Decline);
    }

    let verdict: HandlerVerdict = rhai::serde::from_dynamic(&verdict)
        .map_err(|e| format!("{}: handler result: {e}", script.name))?;
    match (verdict.mock, verdict.modify) {
        (Some(mock), _) => Ok(Outcome::Mock(mock)),
        (None, Some(patch)) => Ok(Outcome::Modify(patch)),
        (None, None) => Ok(Outcome::Decline),
    }
}
