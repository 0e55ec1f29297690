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

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::codec;
use super::exchange;
use super::synthetic;
use crate::state::SharedState;

/// serve a CONNECT tunnel as a sequence of captured exchanges
///
/// the tunnel is established in plaintext, then TLS is terminated with a
/// leaf minted for the requested authority. everything inside is HTTP/1.1
/// and every request/response pair becomes its own record.
pub async fn serve<S>(
    state: &SharedState,
    mut raw: S,
    authority: &str,
    leftover: BytesMut,
) -> tokio::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = authority
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(authority)
        .trim_start_matches('[')
        .trim_end_matches(']');

    // a mint failure only fails this host
    let tls_config = match state.ca.server_config_for(host) {
        Ok(config) => config,
        Err(e) => {
            let (response, payload) =
                synthetic::diagnostic(502, &format!("cannot intercept {host}: {e}"));
            synthetic::write(&mut raw, &response, &payload).await?;
            return Ok(());
        }
    };

    if !leftover.is_empty() {
        // the client raced bytes ahead of our 200, nothing sane follows
        let (response, payload) = synthetic::diagnostic(400, "unexpected bytes after CONNECT");
        synthetic::write(&mut raw, &response, &payload).await?;
        return Ok(());
    }

    raw.write_all(synthetic::TUNNEL_ESTABLISHED).await?;
    raw.flush().await?;

    let mut tls = TlsAcceptor::from(tls_config).accept(raw).await?;
    let mut buf = BytesMut::new();

    loop {
        let head = match codec::read_request_head(&mut tls, &mut buf).await? {
            Some(head) => head,
            None => break,
        };
        let keepalive =
            exchange::handle_exchange(state, &mut tls, &mut buf, head, "https", Some(authority))
                .await?;
        if !keepalive {
            break;
        }
    }

    debug!("tunnel to {authority} closed");
    tls.shutdown().await.ok();
    Ok(())
}
