//! End-to-end tests for the public front door
//!
//! A real server is bound on 127.0.0.1 with base domain `example.com`.
//! Public requests are written as raw HTTP so the Host header can name any
//! tenant; tunnel sockets are plain TCP connections into tenant ports.

use burrow_control::{ClientManager, ManagerConfig};
use burrow_server::{DispatchServer, ServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

async fn start_server() -> (SocketAddr, ClientManager) {
    let manager = ClientManager::new(ManagerConfig {
        tunnel_bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..Default::default()
    });
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        domain: Some("example.com".to_string()),
        ..Default::default()
    };
    let server = DispatchServer::bind(config, manager.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, manager)
}

/// Send one raw request and read the whole response (server closes after it)
async fn send_raw(addr: SocketAddr, request: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("response should complete")
        .unwrap();
    let raw = String::from_utf8(raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    (head.to_string(), body.to_string())
}

fn get(path: &str, host: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    )
}

async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "stream closed before end of head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_root_redirects_to_landing_page() {
    let (addr, _manager) = start_server().await;

    let (head, _) = send_raw(addr, &get("/", "example.com")).await;

    assert!(head.starts_with("HTTP/1.1 302"), "head was {}", head);
    assert!(head
        .to_lowercase()
        .contains("location: https://localtunnel.github.io/www/"));
}

#[tokio::test]
async fn test_new_tunnel_with_generated_id() {
    let (addr, manager) = start_server().await;

    let (head, body) = send_raw(addr, &get("/?new", "example.com:3000")).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head was {}", head);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let id = json["id"].as_str().unwrap();
    assert!(manager.has_client(id));
    assert_eq!(json["max_conn_count"], 10);
    assert!(json["port"].as_u64().unwrap() > 0);
    assert_eq!(
        json["url"].as_str().unwrap(),
        format!("http://{}.example.com:3000", id)
    );
}

#[tokio::test]
async fn test_new_tunnel_with_requested_id() {
    let (addr, manager) = start_server().await;

    let (head, body) = send_raw(addr, &get("/my-app", "example.com")).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head was {}", head);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["id"], "my-app");
    assert_eq!(json["url"], "http://my-app.example.com");
    assert!(manager.has_client("my-app"));
}

#[tokio::test]
async fn test_new_tunnel_accepts_any_method() {
    let (addr, manager) = start_server().await;

    let (head, body) = send_raw(
        addr,
        "POST /post-tenant HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "head was {}", head);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["id"], "post-tenant");
    assert!(manager.has_client("post-tenant"));

    let (head, body) = send_raw(
        addr,
        "PUT /?new HTTP/1.1\r\nHost: example.com\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "head was {}", head);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(manager.has_client(json["id"].as_str().unwrap()));
}

#[tokio::test]
async fn test_overlong_id_is_rejected() {
    let (addr, manager) = start_server().await;

    let (head, body) = send_raw(
        addr,
        &get(
            "/thisdomainisoutsidethesizeofwhatweallowwhichissixtythreecharacters",
            "example.com",
        ),
    )
    .await;

    assert!(head.starts_with("HTTP/1.1 403"), "head was {}", head);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        json["message"],
        "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters."
    );
    assert!(manager.client_ids().is_empty());
}

#[tokio::test]
async fn test_status_endpoints() {
    let (addr, manager) = start_server().await;
    manager.new_client(Some("statuscheck")).await.unwrap();

    let (head, body) = send_raw(addr, &get("/api/status", "example.com")).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["tunnels"], 1);

    let (head, body) = send_raw(addr, &get("/api/tunnels/statuscheck/status", "example.com")).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["connected_sockets"], 0);

    let (head, _) = send_raw(addr, &get("/api/tunnels/nobody/status", "example.com")).await;
    assert!(head.starts_with("HTTP/1.1 404"), "head was {}", head);
}

#[tokio::test]
async fn test_missing_host_is_bad_request() {
    let (addr, _manager) = start_server().await;

    let (head, body) = send_raw(addr, "GET / HTTP/1.0\r\n\r\n").await;

    assert!(head.contains(" 400 "), "head was {}", head);
    assert_eq!(body, "Host header is required");
}

#[tokio::test]
async fn test_unknown_tenant_is_not_found() {
    let (addr, _manager) = start_server().await;

    let (head, body) = send_raw(addr, &get("/", "nobody.example.com")).await;

    assert!(head.starts_with("HTTP/1.1 404"), "head was {}", head);
    assert_eq!(body, "404");
}

#[tokio::test]
async fn test_request_relayed_through_tunnel() {
    let (addr, manager) = start_server().await;
    let info = manager.new_client(Some("relaytest")).await.unwrap();

    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let remote = tokio::spawn(async move {
        let head = read_head(&mut tunnel).await;
        tunnel
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\nx-from: tunnel\r\n\r\nX")
            .await
            .unwrap();
        (head, tunnel)
    });

    let (head, body) = send_raw(addr, &get("/hello?x=1", "relaytest.example.com")).await;

    assert!(head.starts_with("HTTP/1.1 200"), "head was {}", head);
    assert!(head.to_lowercase().contains("x-from: tunnel"));
    assert_eq!(body, "X");

    let (tunnel_head, _tunnel) = remote.await.unwrap();
    let tunnel_head = tunnel_head.to_lowercase();
    assert!(tunnel_head.starts_with("get /hello?x=1 http/1.1\r\n"));
    assert!(tunnel_head.contains("host: relaytest.example.com\r\n"));
}

#[tokio::test]
async fn test_websocket_upgrade_relayed_through_tunnel() {
    let (addr, manager) = start_server().await;
    let info = manager.new_client(Some("wstest")).await.unwrap();

    // Dummy websocket server behind the tunnel: handshake, then echo
    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    tokio::spawn(async move {
        let head = read_head(&mut tunnel).await;
        assert!(head.starts_with("GET /socket HTTP/1.1\r\n"), "head was {}", head);
        assert!(head.contains("Upgrade: websocket\r\n"));
        tunnel
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match tunnel.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tunnel.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut public = TcpStream::connect(addr).await.unwrap();
    public
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: wstest.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(5), read_head(&mut public))
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 101"), "response was {}", response);

    public.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(5), public.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_upgrade_for_unknown_tenant_is_dropped() {
    let (addr, _manager) = start_server().await;

    let mut public = TcpStream::connect(addr).await.unwrap();
    public
        .write_all(
            b"GET / HTTP/1.1\r\nHost: ghost.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(5), public.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}
