//! End-to-end tests: real sockets, real agents.

use bayserver_core::agent::{AgentMode, AgentRegistry, GrandAgent, ThreadLauncher, UsageBoard};
use bayserver_core::control::GrandAgentMonitor;
use bayserver_core::docker::{ConfiguredPort, Port, RouteCity};
use bayserver_core::types::{AgentId, PortConfig, WarpConfig};
use bayserver_core::Config;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn port_config(addr: &str) -> PortConfig {
    PortConfig {
        addr: addr.into(),
        protocol: "h1".into(),
        secure: false,
        permit: Vec::new(),
        lenient: false,
    }
}

fn port(warp: Option<&WarpConfig>) -> Arc<dyn Port> {
    port_from(&port_config("127.0.0.1:0"), warp)
}

fn port_from(config: &PortConfig, warp: Option<&WarpConfig>) -> Arc<dyn Port> {
    let city = Arc::new(RouteCity::from_config(warp));
    Arc::new(ConfiguredPort::new(config, city).unwrap())
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    response
}

/// Run a fresh single-process agent on `port` until `client` is done.
async fn serve<F, Fut>(config: Config, port: Arc<dyn Port>, client: F) -> String
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: Future<Output = String>,
{
    let mut agent = GrandAgent::new(
        AgentId::new(1),
        AgentMode::SingleProcess,
        &config,
        AgentRegistry::new(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    agent.anchor(listener, port).unwrap();

    let cancel = agent.cancel_token();
    let client = async move {
        let response = client(addr).await;
        cancel.cancel();
        response
    };
    let (status, response) = tokio::join!(agent.run(), client);
    assert_eq!(status, 0);
    response
}

/// Serve `request` on a fresh single-process agent and return the raw reply.
async fn serve_once(warp: Option<WarpConfig>, request: &'static [u8]) -> String {
    serve(Config::default(), port(warp.as_ref()), move |addr| exchange(addr, request)).await
}

/// Read one request head from `stream`, returning it and any body bytes
/// that arrived with it.
async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return (String::from_utf8(buf).unwrap(), rest);
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "request head cut short");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn warp_to(upstream: SocketAddr, prefix: &str, timeout_secs: i64) -> WarpConfig {
    WarpConfig {
        upstream: upstream.to_string(),
        prefix: prefix.into(),
        timeout_secs,
    }
}

#[tokio::test]
async fn echo_returns_head_and_body() {
    let response = serve_once(
        None,
        b"POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("POST /echo HTTP/1.1\n"), "{}", response);
    assert!(response.ends_with("\nhello"), "{}", response);
}

#[tokio::test]
async fn keep_alive_serves_two_requests_on_one_connection() {
    let response = serve_once(
        None,
        b"GET /a HTTP/1.1\r\nHost: test\r\n\r\nGET /b HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2, "{}", response);
    let first = response.find("GET /a").unwrap();
    let second = response.find("GET /b").unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn warp_relays_the_upstream_response() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let origin = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "request head cut short");
            head.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nupstream")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8(head).unwrap()
    });

    let warp = WarpConfig {
        upstream: upstream_addr.to_string(),
        prefix: "/app".into(),
        timeout_secs: 10,
    };
    let response = serve_once(
        Some(warp),
        b"GET /app/index HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(
        response,
        "HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nupstream"
    );
    let head = origin.await.unwrap();
    assert!(head.starts_with("GET /app/index HTTP/1.1\r\n"), "{}", head);
    assert!(head.contains("Connection: close\r\n"), "{}", head);
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = closed.local_addr().unwrap();
    drop(closed);

    let warp = WarpConfig {
        upstream: upstream_addr.to_string(),
        prefix: "/".into(),
        timeout_secs: 10,
    };
    let response = serve_once(
        Some(warp),
        b"GET /x HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502 "), "{}", response);
}

#[tokio::test]
async fn pipelined_request_waits_for_the_warp_response() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let origin = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let (head, _) = read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        head
    });

    let response = serve_once(
        Some(warp_to(upstream_addr, "/app", 10)),
        b"GET /app/slow HTTP/1.1\r\nHost: test\r\n\r\nGET /local HTTP/1.1\r\nHost: test\r\n\r\n",
    )
    .await;

    // the relayed reply is not keep-alive, so the connection ends with it
    assert_eq!(response, "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow");
    let head = origin.await.unwrap();
    assert!(head.starts_with("GET /app/slow HTTP/1.1\r\n"), "{}", head);
}

#[tokio::test]
async fn request_before_a_malformed_one_is_answered_first() {
    let response = serve_once(
        None,
        b"GET /ok HTTP/1.1\r\nHost: test\r\n\r\nBROKEN\r\n\r\n",
    )
    .await;

    let ok = response.find("HTTP/1.1 200 OK\r\n").expect(&response);
    let bad = response.find("HTTP/1.1 400 ").expect(&response);
    assert!(ok < bad, "{}", response);
    assert!(response.contains("GET /ok HTTP/1.1\n"), "{}", response);
}

#[tokio::test]
async fn lenient_port_keeps_the_connection_after_a_bad_request() {
    let mut config = port_config("127.0.0.1:0");
    config.lenient = true;
    let response = serve(Config::default(), port_from(&config, None), |addr| async move {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"BROKEN\r\n\r\n").await.unwrap();

        let mut first = Vec::new();
        let mut chunk = [0u8; 1024];
        while !first.ends_with(b"400 Bad Request\n") {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed after the bad request");
            first.extend_from_slice(&chunk[..n]);
        }
        let first = String::from_utf8(first).unwrap();
        assert!(first.starts_with("HTTP/1.1 400 "), "{}", first);
        assert!(first.contains("Connection: keep-alive\r\n"), "{}", first);

        client
            .write_all(b"GET /next HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut second = String::new();
        client.read_to_string(&mut second).await.unwrap();
        second
    })
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("GET /next HTTP/1.1\n"), "{}", response);
}

#[tokio::test]
async fn silent_upstream_is_a_gateway_timeout() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        // keep the connection open and never answer
        let _ = held_rx.await;
        drop(stream);
    });

    let mut config = Config::default();
    config.agent.tick = Duration::from_millis(100);
    let warp = warp_to(upstream_addr, "/", 1);
    let started = std::time::Instant::now();
    let response = serve(config, port(Some(&warp)), |addr| {
        exchange(addr, b"GET /slow HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
    })
    .await;
    let _ = held_tx.send(());

    assert!(response.starts_with("HTTP/1.1 504 "), "{}", response);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn large_upload_reaches_the_upstream_intact() {
    const BODY: usize = 300_000;
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let origin = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let (head, mut body) = read_head(&mut stream).await;
        let mut chunk = vec![0u8; 16 * 1024];
        while body.len() < BODY {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "upload cut short at {} bytes", body.len());
            body.extend_from_slice(&chunk[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        (head, body)
    });

    let mut config = Config::default();
    config.agent.read_buffer_size = 1024;
    let warp = warp_to(upstream_addr, "/", 10);
    let payload: Vec<u8> = (0..BODY).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let response = serve(config, port(Some(&warp)), |addr| async move {
        let mut request = format!(
            "POST /upload HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            BODY
        )
        .into_bytes();
        request.extend_from_slice(&payload);
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = client.split();
        let send = async {
            writer.write_all(&request).await.unwrap();
        };
        let receive = async {
            let mut response = String::new();
            reader.read_to_string(&mut response).await.unwrap();
            response
        };
        let ((), response) = tokio::join!(send, receive);
        response
    })
    .await;

    assert_eq!(response, "HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
    let (head, body) = origin.await.unwrap();
    assert!(head.to_ascii_lowercase().contains("content-length: 300000\r\n"), "{}", head);
    assert_eq!(body.len(), BODY);
    assert!(body == expected, "upload bytes differ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitor_replaces_a_stopped_agent_and_stops_all() {
    let mut config = Config::default();
    config.server.agents = 2;
    config.server.multi_core = false;
    config.ports = vec![port_config("127.0.0.1:0")];
    let config = Arc::new(config);

    let registry = AgentRegistry::new();
    let usage = Arc::new(UsageBoard::new());
    registry.add_listener(usage.clone());
    let launcher = ThreadLauncher::bind(Arc::clone(&config), registry.clone(), usage).unwrap();
    let addr = launcher.local_addrs()[0];

    let (monitor, handle) = GrandAgentMonitor::bind(config.server.clone(), Arc::new(launcher))
        .await
        .unwrap();
    let running = tokio::spawn(monitor.run());

    let mut joined = false;
    for _ in 0..300 {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.agents.len() == 2 {
            joined = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(joined, "agents never joined");

    let response = exchange(addr, b"GET /hi HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);

    handle.shutdown(AgentId::new(1)).unwrap();
    let mut replaced = false;
    for _ in 0..300 {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.launches == 3 && snapshot.agents.len() == 2 {
            replaced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(replaced, "agent 1 was not replaced");

    handle.shutdown_all().unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
