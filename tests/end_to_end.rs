// full-core scenarios: daemon components wired together against a scratch
// data directory and a local stub origin.

mod common;

use common::*;
use serde_json::json;
use wiretap::store::RequestFilter;

fn multi() -> tokio::runtime::Builder {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.worker_threads(4).enable_all();
    builder
}

/// scenario 1: plain HTTP GET through the proxy
#[test]
fn plain_http_get_is_captured() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        let request = build_request(
            "GET",
            &format!("http://127.0.0.1:{}/x", stub.port),
            &[],
            b"",
        );
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(200))
            }
        })
        .await;

        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/x");
        assert_eq!(record.url, format!("http://127.0.0.1:{}/x", stub.port));
        assert_eq!(record.response_body.as_deref(), Some("hello"));
        assert!(record.duration_ms.is_some());
        assert!(!record.request_body_truncated);
        assert!(!record.response_body_truncated);
    });
}

/// scenario 2: CONNECT, minted leaf, inner GET relayed over TLS
#[test]
fn tls_intercept_mints_leaf_and_captures() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|c| c.upstream_tls_insecure = true).await;
        let stub = start_stub_tls().await;

        let authority = format!("127.0.0.1:{}", stub.port);
        let inner = format!(
            "GET /y HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n"
        );
        let response = tls_via_connect(
            core.proxy_port,
            &authority,
            inner.as_bytes(),
            &core.paths.ca_cert_file(),
        )
        .await;
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"nope");

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(404))
            }
        })
        .await;
        assert_eq!(record.url, format!("https://{authority}/y"));
        assert_eq!(record.path, "/y");
    });
}

/// scenario 3: a mock rule answers without any upstream route
#[test]
fn mock_interceptor_short_circuits_upstream() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        install_interceptor(
            &core,
            "teapot.rhai",
            r#"
            fn matches(req) { req.method == "GET" && req.path == "/mock" }
            fn handle(req) { #{ mock: #{ status: 418, body: "teapot" } } }
            "#,
        );

        // port 1 is a closed route, a forwarded request would 502
        let request = build_request("GET", "http://127.0.0.1:1/mock", &[], b"");
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 418);
        assert_eq!(response.body, b"teapot");

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(418))
            }
        })
        .await;
        assert_eq!(record.intercepted_by.as_deref(), Some("teapot"));
        assert_eq!(
            record.interception_type,
            Some(wiretap::store::InterceptionKind::Mocked)
        );
    });
}

/// a modify rule rewrites the outgoing request, attribution is recorded
#[test]
fn modify_interceptor_patches_the_forwarded_request() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;
        install_interceptor(
            &core,
            "inject.rhai",
            r#"
            fn matches(req) { req.path == "/echo" }
            fn handle(req) {
                #{ modify: #{ headers: #{ "x-injected": "yes" }, body: "patched" } }
            }
            "#,
        );

        let request = build_request(
            "POST",
            &format!("http://127.0.0.1:{}/echo", stub.port),
            &[],
            b"original",
        );
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 200);

        let echoed = String::from_utf8_lossy(&response.body).to_string();
        assert!(echoed.contains("x-injected: yes"), "echo was: {echoed}");
        assert!(echoed.ends_with("patched"));

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter()
                    .find(|r| r.interception_type.is_some() && r.response_status.is_some())
            }
        })
        .await;
        assert_eq!(record.intercepted_by.as_deref(), Some("inject"));
        assert_eq!(
            record.interception_type,
            Some(wiretap::store::InterceptionKind::Modified)
        );
        // the captured request stays as the client sent it
        assert_eq!(record.request_body.as_deref(), Some("original"));
    });
}

/// scenario 4: replay re-issues through the proxy and links the records
#[test]
fn replay_reissues_and_links_to_the_original() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        let url = format!("http://127.0.0.1:{}/v1", stub.port);
        let request = build_request("POST", &url, &[], b"payload-1");
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 200);

        let store = core.state.store.clone();
        let original = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(200))
            }
        })
        .await;

        let mut control = ControlClient::connect(&core.control_path).await;
        let payload = control
            .expect_ok("replayRequest", json!({ "id": original.id, "initiator": "test" }))
            .await;
        let new_id = payload["id"].as_str().expect("new id").to_string();
        assert_ne!(new_id, original.id);

        let store = core.state.store.clone();
        let expected_id = new_id.clone();
        let replayed = wait_for(move || {
            let store = store.clone();
            let id = expected_id.clone();
            async move {
                let record = store.get_request(id).await.ok()??;
                record.response_status.is_some().then_some(record)
            }
        })
        .await;

        assert_eq!(replayed.replay_of.as_deref(), Some(original.id.as_str()));
        assert_eq!(replayed.method, "POST");
        assert_eq!(replayed.url, original.url);
        assert_eq!(replayed.request_body.as_deref(), Some("payload-1"));
        assert_eq!(stub.seen.lock().len(), 2);
    });
}

/// scenario 5: delta polling pages in order over the control socket
#[test]
fn delta_polling_pages_exactly_once() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        for i in 0..5 {
            let request = build_request(
                "GET",
                &format!("http://127.0.0.1:{}/seq{i}", stub.port),
                &[],
                b"",
            );
            let response = proxy_send(core.proxy_port, &request).await;
            assert_eq!(response.status, 200);
        }

        let store = core.state.store.clone();
        wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                (all.len() == 5 && all.iter().all(|r| r.response_status.is_some()))
                    .then_some(())
            }
        })
        .await;

        let mut control = ControlClient::connect(&core.control_path).await;
        let first = control
            .expect_ok(
                "listRequestsSummaryDelta",
                json!({ "afterChangeSeq": 0, "limit": 3 }),
            )
            .await;
        let entries = first["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(first["hasMore"], true);
        let paths: Vec<&str> = entries.iter().map(|e| e["path"].as_str().unwrap()).collect();
        assert_eq!(paths, vec!["/seq2", "/seq1", "/seq0"]);

        let second = control
            .expect_ok(
                "listRequestsSummaryDelta",
                json!({ "afterChangeSeq": first["cursor"], "limit": 3 }),
            )
            .await;
        let entries = second["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(second["hasMore"], false);
        let paths: Vec<&str> = entries.iter().map(|e| e["path"].as_str().unwrap()).collect();
        assert_eq!(paths, vec!["/seq4", "/seq3"]);
    });
}

/// scenario 6: clearRequests preserves bookmarks, deletions hit the log
#[test]
fn clear_preserves_bookmarks() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        for i in 0..10 {
            let request = build_request(
                "GET",
                &format!("http://127.0.0.1:{}/r{i}", stub.port),
                &[],
                b"",
            );
            proxy_send(core.proxy_port, &request).await;
        }

        let store = core.state.store.clone();
        let all = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(20, RequestFilter::default()).await.ok()?;
                (all.len() == 10 && all.iter().all(|r| r.response_status.is_some()))
                    .then_some(all)
            }
        })
        .await;

        let keep3 = all.iter().find(|r| r.path == "/r3").unwrap().id.clone();
        let keep7 = all.iter().find(|r| r.path == "/r7").unwrap().id.clone();

        let mut control = ControlClient::connect(&core.control_path).await;
        let page = control
            .expect_ok("listRequestsSummaryDelta", json!({ "afterChangeSeq": 0, "limit": 100 }))
            .await;
        let cursor = page["cursor"].clone();

        control.expect_ok("saveRequest", json!({ "id": keep3 })).await;
        control.expect_ok("saveRequest", json!({ "id": keep7 })).await;
        let cleared = control.expect_ok("clearRequests", json!({})).await;
        assert_eq!(cleared["removed"], 8);

        let remaining = control
            .expect_ok("listRequests", json!({ "limit": 100 }))
            .await;
        let remaining: Vec<&str> = remaining["requests"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["path"].as_str().unwrap())
            .collect();
        assert_eq!(remaining, vec!["/r7", "/r3"]);

        // the deletions show as tombstones past the old cursor
        let page = control
            .expect_ok(
                "listRequestsSummaryDelta",
                json!({ "afterChangeSeq": cursor, "limit": 100 }),
            )
            .await;
        let tombstones = page["entries"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["deleted"] == true)
            .count();
        assert_eq!(tombstones, 8);
    });
}

/// header sanitization: internal headers never reach upstream, sessions
/// attribute through them
#[test]
fn internal_headers_are_stripped_and_attribute_sessions() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        let mut control = ControlClient::connect(&core.control_path).await;
        let session = control
            .expect_ok("registerSession", json!({ "label": "shell", "source": "node" }))
            .await;
        let sid = session["id"].as_str().unwrap().to_string();
        let token = session["token"].as_str().unwrap().to_string();

        let request = build_request(
            "GET",
            &format!("http://127.0.0.1:{}/echo", stub.port),
            &[
                ("x-wiretap-session-id", sid.as_str()),
                ("x-wiretap-session-token", token.as_str()),
                ("x-wiretap-runtime", "node"),
            ],
            b"",
        );
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 200);

        let echoed = String::from_utf8_lossy(&response.body).to_ascii_lowercase();
        assert!(!echoed.contains("x-wiretap"), "leak: {echoed}");

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(200))
            }
        })
        .await;
        assert_eq!(record.session_id.as_deref(), Some(sid.as_str()));
        assert!(record
            .request_headers
            .iter()
            .all(|(name, _)| !name.to_ascii_lowercase().starts_with("x-wiretap")));
    });
}

/// traffic without internal headers lands on the active session, a bad
/// token downgrades to the orphan session
#[test]
fn session_attribution_precedence() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        let mut control = ControlClient::connect(&core.control_path).await;
        let session = control
            .expect_ok("registerSession", json!({ "label": "active" }))
            .await;
        let sid = session["id"].as_str().unwrap().to_string();

        // env-only client: no internal headers at all
        let request = build_request(
            "GET",
            &format!("http://127.0.0.1:{}/a", stub.port),
            &[],
            b"",
        );
        proxy_send(core.proxy_port, &request).await;

        // tampered client: right id, wrong token
        let request = build_request(
            "GET",
            &format!("http://127.0.0.1:{}/b", stub.port),
            &[
                ("x-wiretap-session-id", sid.as_str()),
                ("x-wiretap-session-token", "forged"),
            ],
            b"",
        );
        proxy_send(core.proxy_port, &request).await;

        let store = core.state.store.clone();
        let records = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                (all.len() == 2 && all.iter().all(|r| r.response_status.is_some()))
                    .then_some(all)
            }
        })
        .await;

        let by_path = |p: &str| records.iter().find(|r| r.path == p).unwrap();
        assert_eq!(by_path("/a").session_id.as_deref(), Some(sid.as_str()));
        assert_eq!(by_path("/b").session_id.as_deref(), Some("unknown"));
    });
}

/// body cap: capture truncates, the forwarded payload is byte-exact
#[test]
fn body_cap_truncates_capture_only() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|c| c.body_capture_limit = 32).await;
        let stub = start_stub_http().await;

        let payload = vec![b'z'; 100];
        let request = build_request(
            "POST",
            &format!("http://127.0.0.1:{}/v1", stub.port),
            &[],
            &payload,
        );
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 200);

        // the stub saw every byte
        let seen = stub.seen.lock();
        let raw = seen.last().expect("stub saw the request");
        assert!(raw.ends_with(&payload), "forwarded payload was altered");
        drop(seen);

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(200))
            }
        })
        .await;
        assert!(record.request_body_truncated);
        assert_eq!(record.request_body.unwrap().len(), 32);
    });
}

/// interceptor isolation: a crashing rule produces one event and the
/// request is served untouched
#[test]
fn faulty_interceptor_is_contained() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;
        install_interceptor(
            &core,
            "boom.rhai",
            r#"
            fn matches(req) { true }
            fn handle(req) { throw "kaput" }
            "#,
        );

        let mut control = ControlClient::connect(&core.control_path).await;

        let request = build_request(
            "GET",
            &format!("http://127.0.0.1:{}/x", stub.port),
            &[],
            b"",
        );
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");

        let event = control.next_event().await;
        assert_eq!(event.method.as_deref(), Some("interceptor-error"));
        assert_eq!(event.payload["name"], "boom");

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(200))
            }
        })
        .await;
        assert_eq!(record.intercepted_by, None);
    });
}

/// an Upgrade request becomes a duplex pipe after the 101, captured up to
/// the protocol switch
#[test]
fn upgrade_requests_get_a_duplex_tunnel() {
    multi().build().unwrap().block_on(async {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", core.proxy_port))
            .await
            .unwrap();
        let head = format!(
            "GET http://127.0.0.1:{0}/ws HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
            stub.port
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        // read up to the end of the 101 head
        let mut switched = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            switched.push(byte[0]);
            if switched.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        assert_eq!(parse_response(&switched).status, 101);

        // bytes flow both ways through the tunnel now
        for payload in [&b"ping-1"[..], &b"ping-2"[..]] {
            stream.write_all(payload).await.unwrap();
            stream.flush().await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        }
        drop(stream);

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store
                    .list_requests(10, wiretap::store::RequestFilter::default())
                    .await
                    .ok()?;
                all.into_iter().find(|r| r.response_status == Some(101))
            }
        })
        .await;
        assert_eq!(record.path, "/ws");
    });
}

/// Expect: 100-continue is answered locally and never forwarded
#[test]
fn expect_continue_is_answered_locally() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;
        let stub = start_stub_http().await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", core.proxy_port))
            .await
            .unwrap();
        let request = build_request(
            "POST",
            &format!("http://127.0.0.1:{}/echo", stub.port),
            &[("Expect", "100-continue")],
            b"later",
        );
        {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            stream.write_all(&request).await.unwrap();
            stream.flush().await.unwrap();
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await.unwrap();

            let text = String::from_utf8_lossy(&raw).to_string();
            assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\n"));

            // the real response follows the interim one
            let rest = &raw[b"HTTP/1.1 100 Continue\r\n\r\n".len()..];
            let response = parse_response(rest);
            assert_eq!(response.status, 200);
            let echoed = String::from_utf8_lossy(&response.body).to_ascii_lowercase();
            assert!(!echoed.contains("expect:"), "forwarded Expect: {echoed}");
            assert!(echoed.ends_with("later"));
        }
    });
}

/// unreachable upstreams become captured 502s
#[test]
fn unreachable_upstream_becomes_a_502_record() {
    multi().build().unwrap().block_on(async {
        let core = start_core(|_| {}).await;

        let request = build_request("GET", "http://127.0.0.1:1/offline", &[], b"");
        let response = proxy_send(core.proxy_port, &request).await;
        assert_eq!(response.status, 502);
        assert!(String::from_utf8_lossy(&response.body).contains("wiretap"));

        let store = core.state.store.clone();
        let record = wait_for(|| {
            let store = store.clone();
            async move {
                let all = store.list_requests(10, RequestFilter::default()).await.ok()?;
                all.into_iter().find(|r| r.response_status == Some(502))
            }
        })
        .await;
        assert_eq!(record.path, "/offline");
        assert!(record.response_body.is_some());
    });
}
