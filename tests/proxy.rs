mod support;

use httpdebugger::{CertAuthority, Proxy, ProxyConfig, SearchOptions};
use hyper::{Body, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

// RSA-2048 keygen is expensive in debug builds; every test loads the same
// pre-generated CA instead of minting its own.
static CERT_DIR: OnceCell<tempfile::TempDir> = OnceCell::const_new();

async fn shared_cert_dir() -> std::path::PathBuf {
    let dir = CERT_DIR
        .get_or_init(|| async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || {
                CertAuthority::load_or_generate(
                    &path,
                    &path.join("httpCA.crt"),
                    &path.join("httpCA.key"),
                )
                .unwrap();
            })
            .await
            .unwrap();
            dir
        })
        .await;
    dir.path().to_path_buf()
}

async fn start_proxy() -> (Proxy, u16) {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = ProxyConfig {
        port: 0,
        cert_dir: shared_cert_dir().await,
        ..ProxyConfig::default()
    };
    let proxy = Proxy::new(config);
    let port = proxy.start().await.unwrap();
    (proxy, port)
}

async fn send_raw(port: u16, request: String) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn wait_for_sessions(proxy: &Proxy, count: usize) {
    for _ in 0..50 {
        if proxy.store().len() >= count {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!(
        "expected {count} sessions, store has {}",
        proxy.store().len()
    );
}

#[tokio::test]
async fn forwards_plain_http_and_records_a_session() {
    let upstream = support::server::http(|_req| {
        Response::builder()
            .header("content-type", "text/plain")
            .header("x-upstream", "yes")
            .body(Body::from("hello from upstream"))
            .unwrap()
    })
    .await;

    let (proxy, port) = start_proxy().await;

    let response = send_raw(
        port,
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            upstream.uri("/hello"),
            upstream.addr()
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("hello from upstream"));
    assert!(response.contains("x-upstream"));
    assert_eq!(upstream.hits(), 1);

    wait_for_sessions(&proxy, 1).await;
    let sessions = proxy.list_sessions();
    let list = sessions.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["method"], "GET");
    assert_eq!(list[0]["type"], "HTTPSession");
    assert_eq!(list[0]["status"], 200);

    let id = list[0]["id"].as_str().unwrap();
    let detail = proxy.session_detail(id).unwrap();
    assert_eq!(detail["protocol"], "HTTP/1.1");
    assert_eq!(detail["responseBody"], "hello from upstream");
    assert!(detail["url"].as_str().unwrap().contains("/hello"));

    proxy.stop().unwrap();
}

#[tokio::test]
async fn gzip_bodies_are_stored_decoded_but_forwarded_encoded() {
    let plain = br#"{"greeting":"hello"}"#;
    let encoded = {
        let mut out = Vec::new();
        let mut encoder = async_compression::tokio::bufread::GzipEncoder::new(&plain[..]);
        encoder.read_to_end(&mut out).await.unwrap();
        out
    };

    let body_for_server = encoded.clone();
    let upstream = support::server::http(move |_req| {
        Response::builder()
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .body(Body::from(body_for_server.clone()))
            .unwrap()
    })
    .await;

    let (proxy, port) = start_proxy().await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            format!(
                "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                upstream.uri("/data"),
                upstream.addr()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut wire = Vec::new();
    stream.read_to_end(&mut wire).await.unwrap();

    // The client still sees the gzip bytes.
    let split = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    assert_eq!(&wire[split..], &encoded[..]);

    // The stored session has the decoded, pretty-printed JSON.
    wait_for_sessions(&proxy, 1).await;
    let sessions = proxy.list_sessions();
    let id = sessions[0]["id"].as_str().unwrap();
    let detail = proxy.session_detail(id).unwrap();
    let body = detail["responseBody"].as_str().unwrap();
    assert!(body.contains("\"greeting\": \"hello\""));

    proxy.stop().unwrap();
}

#[tokio::test]
async fn unreachable_origin_yields_502_and_an_error_session() {
    let (proxy, port) = start_proxy().await;

    let response = send_raw(
        port,
        "GET http://127.0.0.1:1/nothing HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n"
            .to_owned(),
    )
    .await;
    assert!(response.contains("502"));

    wait_for_sessions(&proxy, 1).await;
    let sessions = proxy.list_sessions();
    assert_eq!(sessions[0]["status"], 502);
    assert!(sessions[0]["error"].as_str().unwrap().contains("upstream"));

    proxy.stop().unwrap();
}

#[tokio::test]
async fn keep_alive_requests_record_sessions_in_wire_order() {
    let upstream =
        support::server::http(|req| Response::new(Body::from(req.uri().path().to_owned()))).await;

    let (proxy, port) = start_proxy().await;

    let first = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        upstream.uri("/first"),
        upstream.addr()
    );
    let second = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        upstream.uri("/second"),
        upstream.addr()
    );

    let response = send_raw(port, format!("{first}{second}")).await;
    assert!(response.contains("/first"));
    assert!(response.contains("/second"));

    wait_for_sessions(&proxy, 2).await;
    let sessions = proxy.list_sessions();
    assert!(sessions[0]["url"].as_str().unwrap().ends_with("/first"));
    assert!(sessions[1]["url"].as_str().unwrap().ends_with("/second"));

    proxy.stop().unwrap();
}

#[tokio::test]
async fn search_compare_and_curl_through_the_api() {
    let upstream = support::server::http(|_req| Response::new(Body::from("ok"))).await;
    let (proxy, port) = start_proxy().await;

    for cookie in ["sid=one", "sid=two"] {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nCookie: {}\r\nConnection: close\r\n\r\n",
            upstream.uri("/api/users"),
            upstream.addr(),
            cookie
        );
        send_raw(port, request).await;
    }
    wait_for_sessions(&proxy, 2).await;

    // Search: URL substring AND cookie value.
    let hits = proxy
        .search(&SearchOptions {
            url: Some("users".into()),
            cookies_val: Some("two".into()),
            ..SearchOptions::default()
        })
        .unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 1);

    // Empty options are refused.
    assert!(proxy.search(&SearchOptions::default()).is_err());

    // Compare: only the cookie differs.
    let sessions = proxy.list_sessions();
    let first_id = sessions[0]["id"].as_str().unwrap();
    let second_id = sessions[1]["id"].as_str().unwrap();
    let comparison = proxy.compare(first_id, second_id).unwrap();
    let differences = &comparison["differences"];
    assert_eq!(differences["cookies"]["changed"], true);
    assert_eq!(differences["cookies"]["modified"]["sid"]["original"], "one");
    assert!(differences.get("url").is_none());

    // cURL export keeps the cookie header, skips Host. The plaintext path
    // sees hyper-normalized (lowercased) names.
    let curl = proxy.session_curl(first_id).unwrap();
    assert!(curl.starts_with("curl -X GET"));
    assert!(curl.contains("cookie: sid=one"));
    assert!(!curl.to_lowercase().contains("host:"));

    // Unknown ids surface NotFound.
    assert!(proxy.session_detail("missing").unwrap_err().is_not_found());

    proxy.clear();
    assert_eq!(proxy.list_sessions().as_array().unwrap().len(), 0);

    proxy.stop().unwrap();
}

#[tokio::test]
async fn replay_sends_the_request_back_through_the_proxy() {
    let upstream = support::server::http(|_req| Response::new(Body::from("pong"))).await;
    let (proxy, port) = start_proxy().await;

    send_raw(
        port,
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nX-Replay-Me: 1\r\nConnection: close\r\n\r\n",
            upstream.uri("/ping"),
            upstream.addr()
        ),
    )
    .await;
    wait_for_sessions(&proxy, 1).await;

    let sessions = proxy.list_sessions();
    let id = sessions[0]["id"].as_str().unwrap().to_owned();

    proxy.replay(&id).await.unwrap();
    wait_for_sessions(&proxy, 2).await;

    assert_eq!(upstream.hits(), 2);
    let sessions = proxy.list_sessions();
    assert_eq!(sessions.as_array().unwrap().len(), 2);
    assert!(sessions[1]["url"].as_str().unwrap().ends_with("/ping"));

    proxy.stop().unwrap();
}

#[tokio::test]
async fn status_flips_with_start_and_stop() {
    let (proxy, port) = start_proxy().await;
    let status = proxy.status();
    assert_eq!(status["running"], true);
    assert_eq!(status["port"], port);

    proxy.stop().unwrap();
    assert_eq!(proxy.status()["running"], false);

    // Double start guard.
    let port_again = proxy.start().await.unwrap();
    assert!(proxy.start().await.is_err());
    assert_eq!(proxy.status()["port"], port_again);
    proxy.stop().unwrap();
}
