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

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// name of the per-project data directory
pub const DATA_DIR_NAME: &str = ".wiretap";

/// source control marker that also counts as a project root
const SCM_MARKER: &str = ".git";

/// runtime languages that get a generated override script directory
pub const RUNTIME_LANGS: &[&str] = &["node", "python", "ruby", "php"];

// process-wide redirect of the data directory
// set once by the entrypoint (WIRETAP_DIR) or by tests
static DATA_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// redirect every ProjectPaths resolution in this process to `dir`
pub fn set_data_dir_override(dir: Option<PathBuf>) {
    *DATA_DIR_OVERRIDE.write() = dir;
}

/// expand a leading `~` to the user home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            let rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                return home;
            }
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// the file name contract of one project data directory
///
/// resolution never touches the filesystem beyond directory-exists probes;
/// callers create files through `ensure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    data_dir: PathBuf,
}

impl ProjectPaths {
    /// use an explicit data directory, bypassing discovery
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        ProjectPaths {
            data_dir: data_dir.into(),
        }
    }

    /// locate the project data directory starting from `start`
    ///
    /// an override path replaces the walk entirely. otherwise walk upward
    /// looking for an existing data directory or a source control marker;
    /// when neither is found anywhere on the way up, fall back to home.
    pub fn resolve(start: &Path, override_dir: Option<&Path>) -> Self {
        if let Some(global) = DATA_DIR_OVERRIDE.read().clone() {
            return ProjectPaths::at(global);
        }
        if let Some(dir) = override_dir {
            let expanded = expand_tilde(&dir.to_string_lossy());
            return ProjectPaths::at(expanded);
        }

        let mut cursor = Some(start.to_path_buf());
        while let Some(dir) = cursor {
            if dir.join(DATA_DIR_NAME).is_dir() || dir.join(SCM_MARKER).is_dir() {
                return ProjectPaths::at(dir.join(DATA_DIR_NAME));
            }
            cursor = dir.parent().map(Path::to_path_buf);
        }

        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        ProjectPaths::at(home.join(DATA_DIR_NAME))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn port_file(&self) -> PathBuf {
        self.data_dir.join("proxy.port")
    }

    pub fn preferred_port_file(&self) -> PathBuf {
        self.data_dir.join("preferred.port")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.data_dir.join("control.sock")
    }

    pub fn database_file(&self) -> PathBuf {
        self.data_dir.join("requests.db")
    }

    pub fn ca_key_file(&self) -> PathBuf {
        self.data_dir.join("ca-key.pem")
    }

    pub fn ca_cert_file(&self) -> PathBuf {
        self.data_dir.join("ca.pem")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn log_file_name(&self) -> &'static str {
        "wiretap.log"
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(self.log_file_name())
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn interceptor_dir(&self) -> PathBuf {
        self.data_dir.join("interceptors")
    }

    pub fn browser_profile_dir(&self) -> PathBuf {
        self.data_dir.join("browser-profiles")
    }

    pub fn runtime_override_dir(&self, lang: &str) -> PathBuf {
        self.data_dir.join("overrides").join(lang)
    }

    /// create the data directory tree
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.interceptor_dir())?;
        std::fs::create_dir_all(self.browser_profile_dir())?;
        for lang in RUNTIME_LANGS {
            std::fs::create_dir_all(self.runtime_override_dir(lang))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod resolve {
    use super::*;

    #[test]
    fn walks_up_to_scm_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("project");
        let nested = root.join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();

        let paths = ProjectPaths::resolve(&nested, None);
        assert_eq!(paths.data_dir(), root.join(DATA_DIR_NAME).as_path());
    }

    #[test]
    fn existing_data_dir_wins_over_deeper_start() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("project");
        let nested = root.join("src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(root.join(DATA_DIR_NAME)).unwrap();

        let paths = ProjectPaths::resolve(&nested, None);
        assert_eq!(paths.data_dir(), root.join(DATA_DIR_NAME).as_path());
    }

    #[test]
    fn override_replaces_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let elsewhere = tmp.path().join("elsewhere");
        let paths = ProjectPaths::resolve(Path::new("/nonexistent/deep"), Some(&elsewhere));
        assert_eq!(paths.data_dir(), elsewhere.as_path());
    }

    #[test]
    fn named_paths_live_under_data_dir() {
        let paths = ProjectPaths::at("/tmp/wt");
        assert_eq!(paths.port_file(), PathBuf::from("/tmp/wt/proxy.port"));
        assert_eq!(paths.control_socket(), PathBuf::from("/tmp/wt/control.sock"));
        assert_eq!(paths.database_file(), PathBuf::from("/tmp/wt/requests.db"));
        assert_eq!(paths.ca_cert_file(), PathBuf::from("/tmp/wt/ca.pem"));
        assert_eq!(paths.pid_file(), PathBuf::from("/tmp/wt/daemon.pid"));
        assert_eq!(
            paths.runtime_override_dir("node"),
            PathBuf::from("/tmp/wt/overrides/node")
        );
    }

    #[test]
    fn ensure_creates_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::at(tmp.path().join(DATA_DIR_NAME));
        paths.ensure().unwrap();
        assert!(paths.interceptor_dir().is_dir());
        assert!(paths.browser_profile_dir().is_dir());
        assert!(paths.runtime_override_dir("python").is_dir());
    }
}
