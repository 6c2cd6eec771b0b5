use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use portway_core::config::{ConcurrencyModel, ProxyConfig};
use portway_proxy::{ProxyServer, ServerError};

struct TestProxy {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ServerError>>,
    log_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestProxy {
    async fn stop(self) {
        self.shutdown_tx.send(true).expect("signal shutdown");
        self.task
            .await
            .expect("join server task")
            .expect("clean server shutdown");
    }

    fn read_log(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_default()
    }
}

async fn start_proxy(mutate: impl FnOnce(&mut ProxyConfig, &Path)) -> TestProxy {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("access.log");
    let mut config = ProxyConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        log_file_path: log_path.display().to_string(),
        blocked_domains_file: dir.path().join("blocked.txt").display().to_string(),
        ..ProxyConfig::default()
    };
    mutate(&mut config, dir.path());

    let server = ProxyServer::new(config).expect("build proxy server");
    let listener = server.bind().await.expect("bind proxy listener");
    let addr = listener.local_addr().expect("proxy listener addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server.run(listener, shutdown_rx));

    TestProxy {
        addr,
        shutdown_tx,
        task,
        log_path,
        _dir: dir,
    }
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head byte");
        if read == 0 {
            break;
        }
        head.push(byte[0]);
    }
    head
}

async fn roundtrip(proxy_addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client.write_all(request).await.expect("send request");
    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read response");
    response
}

fn spawn_one_shot_upstream(listener: TcpListener, response: &'static [u8]) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept upstream");
        let head = read_head(&mut stream).await;
        stream.write_all(response).await.expect("write response");
        head
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwards_a_plain_get_byte_for_byte() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = spawn_one_shot_upstream(
        upstream,
        b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhi!",
    );

    let proxy = start_proxy(|_, _| {}).await;
    let request = format!(
        "GET http://127.0.0.1:{}/a?b=1 HTTP/1.1\r\nHost: example.test\r\n\r\n",
        upstream_addr.port()
    );
    let response = roundtrip(proxy.addr, request.as_bytes()).await;
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhi!".to_vec()
    );

    let head = String::from_utf8(upstream_task.await.expect("upstream task")).expect("utf8 head");
    assert!(
        head.starts_with("GET /a?b=1 HTTP/1.1\r\n"),
        "absolute-form target must be rewritten to origin-form: {head}"
    );
    assert!(head.contains("\r\nHost: example.test\r\n"), "{head}");

    assert!(proxy.read_log().contains(" ALLOWED 200 "));
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_host_gets_403_without_an_upstream_dial() {
    let proxy = start_proxy(|_, dir| {
        std::fs::write(dir.join("blocked.txt"), "example.com\n*.mal.test\n")
            .expect("write block rules");
    })
    .await;

    let response = roundtrip(
        proxy.addr,
        b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{text}");
    assert!(text.ends_with("403 Forbidden"), "{text}");

    let response = roundtrip(
        proxy.addr,
        b"GET http://a.b.mal.test/ HTTP/1.1\r\nHost: a.b.mal.test\r\n\r\n",
    )
    .await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{text}");

    let log = proxy.read_log();
    assert!(log.contains(" BLOCKED 403 "), "{log}");
    assert!(log.contains("[BLOCKED: example.com]"), "{log}");
    assert!(log.contains("[BLOCKED: *.mal.test]"), "{log}");
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_is_refused_when_tunneling_is_disabled() {
    let proxy = start_proxy(|_, _| {}).await;

    let response = roundtrip(proxy.addr, b"CONNECT api.test:443 HTTP/1.1\r\n\r\n").await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{text}");

    let log = proxy.read_log();
    assert!(log.contains(" BLOCKED 501 "), "{log}");
    assert!(log.contains("[BLOCKED: CONNECT not enabled]"), "{log}");
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auth_token_is_compared_exactly() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task =
        spawn_one_shot_upstream(upstream, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

    let proxy = start_proxy(|config, _| {
        config.authentication_token = "secret".to_string();
    })
    .await;

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: a.test\r\n\r\n",
        upstream_addr.port()
    );
    let response = roundtrip(proxy.addr, request.as_bytes()).await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(
        text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"),
        "{text}"
    );

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: a.test\r\nProxy-Authorization: secret\r\n\r\n",
        upstream_addr.port()
    );
    let response = roundtrip(proxy.addr, request.as_bytes()).await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");

    upstream_task.await.expect("upstream task");
    let log = proxy.read_log();
    assert!(log.contains(" AUTH_FAILED 407 "), "{log}");
    assert!(log.contains(" ALLOWED 200 "), "{log}");
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_tunnel_splices_both_directions() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.expect("accept upstream");
        let mut buf = [0_u8; 4];
        stream.read_exact(&mut buf).await.expect("read ping");
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.expect("write pong");
    });

    let proxy = start_proxy(|config, _| {
        config.enable_connect_tunneling = true;
    })
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client
        .write_all(connect.as_bytes())
        .await
        .expect("send CONNECT");

    let established = read_head(&mut client).await;
    assert_eq!(established, b"HTTP/1.1 200 Connection Established\r\n\r\n");

    client.write_all(b"ping").await.expect("send ping");
    let mut buf = [0_u8; 4];
    client.read_exact(&mut buf).await.expect("read pong");
    assert_eq!(&buf, b"pong");
    drop(client);

    upstream_task.await.expect("upstream task");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(proxy.read_log().contains(" ALLOWED 200 "));
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_serves_the_second_get_without_an_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task =
        spawn_one_shot_upstream(upstream, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

    let proxy = start_proxy(|config, _| {
        config.enable_caching = true;
    })
    .await;

    let request = format!(
        "GET http://127.0.0.1:{}/cached HTTP/1.1\r\nHost: c.test\r\n\r\n",
        upstream_addr.port()
    );
    let first = roundtrip(proxy.addr, request.as_bytes()).await;
    assert_eq!(
        first,
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
    );
    upstream_task.await.expect("upstream task");
    // The listener is gone; only the cache can satisfy this.
    let second = roundtrip(proxy.addr, request.as_bytes()).await;
    assert_eq!(
        second,
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()
    );

    let log = proxy.read_log();
    assert!(log.contains(" ALLOWED 200 "), "{log}");
    assert!(log.contains(" CACHE_HIT 200 "), "{log}");
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_upstream_yields_502() {
    let parked = TcpListener::bind("127.0.0.1:0").await.expect("bind parked");
    let unused_port = parked.local_addr().expect("parked addr").port();
    drop(parked);

    let proxy = start_proxy(|_, _| {}).await;
    let request = format!(
        "GET http://127.0.0.1:{unused_port}/ HTTP/1.1\r\nHost: a.test\r\n\r\n"
    );
    let response = roundtrip(proxy.addr, request.as_bytes()).await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{text}");
    assert!(text.ends_with("502 Bad Gateway"), "{text}");

    assert!(proxy.read_log().contains(" ERROR 502 "));
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_yields_400() {
    let proxy = start_proxy(|_, _| {}).await;

    let response = roundtrip(proxy.addr, b"NOT-HTTP\r\n\r\n").await;
    let text = String::from_utf8(response).expect("utf8 response");
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");

    assert!(proxy.read_log().contains(" ERROR 400 "));
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_mode_forwards_like_task_per_connection() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        for _ in 0..2 {
            let (mut stream, _) = upstream.accept().await.expect("accept upstream");
            let _head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .expect("write response");
        }
    });

    let proxy = start_proxy(|config, _| {
        config.concurrency_model = ConcurrencyModel::ThreadPool;
        config.thread_pool_size = 2;
    })
    .await;

    let request = format!(
        "GET http://127.0.0.1:{}/pooled HTTP/1.1\r\nHost: p.test\r\n\r\n",
        upstream_addr.port()
    );
    for _ in 0..2 {
        let response = roundtrip(proxy.addr, request.as_bytes()).await;
        let text = String::from_utf8(response).expect("utf8 response");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    }

    upstream_task.await.expect("upstream task");
    proxy.stop().await;
}
