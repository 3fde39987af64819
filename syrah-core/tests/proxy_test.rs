use axum::{http::header, routing::get, Router};
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use syrah_core::{
    Bridge, BridgeConfig, CertificateAuthority, Phase, ProxyServer, ProxyStartupConfig, Rule,
    RuleType,
};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(|| async { "hello from upstream" }))
        .route(
            "/gzip",
            get(|| async { ([(header::CONTENT_ENCODING, "gzip")], gzip(b"hello world")) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

struct Harness {
    bridge: Bridge,
    proxy_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    _certs: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let certs = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(certs.path()).unwrap();
        let bridge = Bridge::new(BridgeConfig {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        });
        let config = ProxyStartupConfig {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: free_port(),
            cert_dir: certs.path().to_path_buf(),
        };
        let proxy_addr = config.socket_addr();

        let (tx, rx) = oneshot::channel();
        let server = ProxyServer::new(config, ca, bridge.interceptor());
        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = server.run_until(shutdown).await {
                eprintln!("Proxy server failed: {}", e);
            }
        });

        // wait for the proxy to accept connections
        for _ in 0..50 {
            if TcpStream::connect(proxy_addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            bridge,
            proxy_addr,
            stop: Some(tx),
            _certs: certs,
        }
    }

    /// Plain-http GET through the proxy, returns the raw response text.
    async fn get(&self, url: &str, host: &str) -> String {
        let mut stream = TcpStream::connect(self.proxy_addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            url, host
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
            .await
            .expect("proxy response timed out")
            .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[tokio::test]
async fn test_plain_request_passes_through() {
    let upstream = start_upstream().await;
    let harness = Harness::start().await;

    let response = harness
        .get(&format!("http://{}/hello", upstream), &upstream.to_string())
        .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("hello from upstream"), "{}", response);
}

#[tokio::test]
async fn test_block_rule_answers_bad_gateway() {
    let upstream = start_upstream().await;
    let harness = Harness::start().await;
    harness
        .bridge
        .rules()
        .replace(vec![Rule::new("b", RuleType::Block, Phase::Request, "*/hello")]);

    let response = harness
        .get(&format!("http://{}/hello", upstream), &upstream.to_string())
        .await;
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
}

#[tokio::test]
async fn test_map_local_serves_file() {
    let upstream = start_upstream().await;
    let harness = Harness::start().await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"mocked body").unwrap();
    let mut rule = Rule::new("ml", RuleType::MapLocal, Phase::Response, "*/hello");
    rule.file_path = Some(file.path().to_string_lossy().into_owned());
    harness.bridge.rules().replace(vec![rule]);

    let response = harness
        .get(&format!("http://{}/hello", upstream), &upstream.to_string())
        .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("application/octet-stream"), "{}", response);
    assert!(response.ends_with("mocked body"), "{}", response);
}

#[tokio::test]
async fn test_compressed_response_is_decoded_for_events() {
    let upstream = start_upstream().await;
    let harness = Harness::start().await;
    let bridge = harness.bridge.start().await.unwrap();

    let (mut client, _) = connect_async(format!("ws://{}/", bridge.local_addr()))
        .await
        .unwrap();
    for _ in 0..100 {
        if !harness.bridge.peers().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = harness
        .get(&format!("http://{}/gzip", upstream), &upstream.to_string())
        .await;
    assert!(response.ends_with("hello world"), "{}", response);
    assert!(!response.to_ascii_lowercase().contains("content-encoding"), "{}", response);

    let event = loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no response event")
            .unwrap()
            .unwrap();
        let Message::Text(text) = frame else { continue };
        let event: serde_json::Value = serde_json::from_str(&text).unwrap();
        if event["phase"] == "response" {
            break event;
        }
    };
    assert_eq!(event["response"]["body"], "hello world");
    assert_eq!(event["response"]["contentLength"], 11);

    bridge.stop().await;
}
