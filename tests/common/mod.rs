// shared harness for the end-to-end tests: a full core against a scratch
// data directory, a stub origin server, and raw proxy/control clients.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;

use wiretap::config::Config;
use wiretap::control::envelope::Envelope;
use wiretap::control::ControlServer;
use wiretap::paths::ProjectPaths;
use wiretap::proxy::ProxyServer;
use wiretap::state::{AppState, SharedState};

pub struct TestCore {
    pub state: SharedState,
    pub proxy_port: u16,
    pub control_path: PathBuf,
    pub paths: ProjectPaths,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl Drop for TestCore {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// boot the whole core against a temp directory
pub async fn start_core(tweak: impl FnOnce(&mut Config)) -> TestCore {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ProjectPaths::at(dir.path().join(".wiretap"));
    paths.ensure().expect("data dir");

    let mut config = Config::default();
    tweak(&mut config);

    let state = AppState::build(paths.clone(), config).expect("core state");
    state.registry.load();

    let control = ControlServer::bind(state.clone()).expect("control socket");
    let proxy = ProxyServer::bind(state.clone()).await.expect("proxy listener");
    let proxy_port = proxy.port();

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(control.run(rx.clone()));
    tokio::spawn(proxy.run(rx, Duration::from_secs(2)));

    TestCore {
        control_path: paths.control_socket(),
        paths,
        state,
        proxy_port,
        shutdown,
        _dir: dir,
    }
}

/// write an interceptor script and reload the registry
pub fn install_interceptor(core: &TestCore, name: &str, source: &str) {
    std::fs::write(core.paths.interceptor_dir().join(name), source).expect("write rule");
    core.state.registry.load();
}

// ---------------------------------------------------------------------------
// stub origin
// ---------------------------------------------------------------------------

pub struct StubUpstream {
    pub port: u16,
    /// raw request text (head + body) per handled exchange
    pub seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

async fn read_one_request(stream: &mut (impl tokio::io::AsyncRead + Unpin)) -> Option<Vec<u8>> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    // head
    loop {
        match stream.read(&mut byte).await {
            Ok(0) => return if raw.is_empty() { None } else { Some(raw) },
            Ok(_) => raw.push(byte[0]),
            Err(_) => return None,
        }
        if raw.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    // body by content-length
    let head = String::from_utf8_lossy(&raw).to_string();
    let length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if length > 0 && stream.read_exact(&mut body).await.is_err() {
        return None;
    }
    raw.extend_from_slice(&body);
    Some(raw)
}

fn respond_to(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let request_line = text.lines().next().unwrap_or("");
    let path = request_line.split(' ').nth(1).unwrap_or("/");

    let (status, reason, body): (u16, &str, Vec<u8>) = match path {
        "/x" => (200, "OK", b"hello".to_vec()),
        "/y" => (404, "Not Found", b"nope".to_vec()),
        "/echo" => (200, "OK", raw.to_vec()),
        "/v1" => (200, "OK", b"v1-ok".to_vec()),
        _ => (200, "OK", b"ok".to_vec()),
    };
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}

async fn serve_stub_connection<S>(mut stream: S, seen: Arc<Mutex<Vec<Vec<u8>>>>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    while let Some(raw) = read_one_request(&mut stream).await {
        let text = String::from_utf8_lossy(&raw).to_string();
        let is_upgrade = text
            .lines()
            .next()
            .map(|l| l.starts_with("GET /ws "))
            .unwrap_or(false);
        seen.lock().push(raw.clone());

        if is_upgrade {
            // switch protocols, then echo every byte back
            let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n";
            if stream.write_all(head).await.is_err() {
                break;
            }
            let _ = stream.flush().await;
            let mut frame = [0u8; 1024];
            loop {
                match stream.read(&mut frame).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&frame[..n]).await.is_err() {
                            break;
                        }
                        let _ = stream.flush().await;
                    }
                }
            }
            break;
        }

        let response = respond_to(&raw);
        if stream.write_all(&response).await.is_err() {
            break;
        }
        let _ = stream.flush().await;
        break; // one exchange per connection, responses say close
    }
    let _ = stream.shutdown().await;
}

/// plain-TCP HTTP/1.1 origin
pub async fn start_stub_http() -> StubUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("stub bind");
    let port = listener.local_addr().unwrap().port();
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_stub_connection(stream, log.clone()));
        }
    });

    StubUpstream { port, seen }
}

/// the same origin behind self-signed TLS
pub async fn start_stub_tls() -> StubUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("stub bind");
    let port = listener.local_addr().unwrap().port();
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap()));
    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = params.self_signed(&key).unwrap();
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let log = log.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_stub_connection(tls, log).await;
                }
            });
        }
    });

    StubUpstream { port, seen }
}

// ---------------------------------------------------------------------------
// proxy clients
// ---------------------------------------------------------------------------

pub fn build_request(
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut raw = format!("{method} {target} HTTP/1.1\r\n");
    let mut has_host = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_host {
        if let Some(rest) = target.split("://").nth(1) {
            let host = rest.split('/').next().unwrap_or("");
            raw.push_str(&format!("Host: {host}\r\n"));
        }
    }
    if !body.is_empty() {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("Connection: close\r\n\r\n");
    let mut raw = raw.into_bytes();
    raw.extend_from_slice(body);
    raw
}

pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub fn parse_response(raw: &[u8]) -> RawResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    RawResponse {
        status,
        headers,
        body: raw[split..].to_vec(),
    }
}

/// one full exchange through the plain proxy port
pub async fn proxy_send(proxy_port: u16, raw: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .expect("connect proxy");
    stream.write_all(raw).await.expect("send request");
    stream.flush().await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read response");
    parse_response(&response)
}

/// one exchange through a CONNECT tunnel, trusting the project CA
pub async fn tls_via_connect(
    proxy_port: u16,
    authority: &str,
    request: &[u8],
    ca_pem_path: &std::path::Path,
) -> RawResponse {
    let mut tcp = TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .expect("connect proxy");
    tcp.write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    tcp.flush().await.unwrap();

    // wait for the 200 before starting TLS
    let mut established = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        tcp.read_exact(&mut byte).await.expect("tunnel status");
        established.push(byte[0]);
        if established.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let status = parse_response(&established).status;
    assert_eq!(status, 200, "CONNECT should establish");

    let mut roots = rustls::RootCertStore::empty();
    let ca_pem = std::fs::read(ca_pem_path).expect("read ca.pem");
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        roots.add(cert.expect("parse ca.pem")).expect("trust ca");
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).unwrap();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let mut tls = connector.connect(server_name, tcp).await.expect("client tls");

    tls.write_all(request).await.unwrap();
    tls.flush().await.unwrap();
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await.expect("read tls response");
    parse_response(&response)
}

// ---------------------------------------------------------------------------
// control client
// ---------------------------------------------------------------------------

pub struct ControlClient {
    lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: tokio::net::unix::OwnedWriteHalf,
    next_id: u64,
}

impl ControlClient {
    pub async fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("control connect");
        let (read, writer) = stream.into_split();
        ControlClient {
            lines: BufReader::new(read).lines(),
            writer,
            next_id: 0,
        }
    }

    /// send one request and wait for its response, buffering any events
    pub async fn call(&mut self, method: &str, payload: serde_json::Value) -> Envelope {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let envelope = Envelope {
            id: Some(id.clone()),
            kind: "request".to_string(),
            method: Some(method.to_string()),
            payload,
            error: None,
        };
        self.writer
            .write_all(envelope.encode_line().as_bytes())
            .await
            .expect("send envelope");
        self.writer.flush().await.unwrap();

        loop {
            let line = self
                .lines
                .next_line()
                .await
                .expect("control read")
                .expect("control closed");
            let response: Envelope = serde_json::from_str(&line).expect("decode envelope");
            if response.kind == "response" && response.id.as_deref() == Some(id.as_str()) {
                return response;
            }
        }
    }

    /// expect a successful response, returning its payload
    pub async fn expect_ok(&mut self, method: &str, payload: serde_json::Value) -> serde_json::Value {
        let response = self.call(method, payload).await;
        assert!(
            response.error.is_none(),
            "{method} failed: {:?}",
            response.error
        );
        response.payload
    }

    /// wait for the next push event
    pub async fn next_event(&mut self) -> Envelope {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .expect("control read")
                .expect("control closed");
            let envelope: Envelope = serde_json::from_str(&line).expect("decode envelope");
            if envelope.kind == "event" {
                return envelope;
            }
        }
    }
}

/// poll until the condition produces a value
pub async fn wait_for<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within the polling window");
}
