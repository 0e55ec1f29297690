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

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use wiretap::daemon::{self, StartOutcome};
use wiretap::paths::ProjectPaths;

fn main() {
    let override_dir = std::env::var("WIRETAP_DIR").ok().map(PathBuf::from);
    let start_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let paths = ProjectPaths::resolve(&start_dir, override_dir.as_deref());

    if let Err(e) = paths.ensure() {
        eprintln!("wiretap: cannot create {}: {e}", paths.data_dir().display());
        std::process::exit(1);
    }

    // rotating file log in the data directory, stderr is kept quiet
    let appender =
        tracing_appender::rolling::daily(paths.data_dir(), paths.log_file_name());
    let (writer, _log_guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wiretap")
        .build()
        .expect("building the tokio runtime");

    let exit = runtime.block_on(async move {
        match daemon::start(paths).await {
            Ok(StartOutcome::Started(daemon)) => {
                info!("serving until signalled");
                match daemon.run_until_signal().await {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("wiretap: shutdown failed: {e}");
                        1
                    }
                }
            }
            Ok(StartOutcome::AlreadyRunning { pid, .. }) => {
                // a compatible daemon is already serving this project
                info!("daemon already running as pid {pid}");
                0
            }
            Err(e) => {
                eprintln!("wiretap: {e}");
                1
            }
        }
    });

    std::process::exit(exit);
}
