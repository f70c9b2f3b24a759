use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use replaytrack::config::Config;
use tokio::{net::TcpListener, sync::mpsc};

#[derive(Debug)]
struct CapturedRequest {
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

type TestClient = Client<HttpConnector, Full<Bytes>>;

fn client() -> TestClient {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

fn proxy_config(upstream_addr: SocketAddr, fixtures: &Path, extra: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
[engine]
remote = "http://{upstream_addr}/api"
{extra}

[store]
backend = "directory"
path = "{}"

[proxy]
listen = "127.0.0.1:0"
"#,
        fixtures.display()
    ))
    .unwrap()
}

fn fixture_count(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn records_once_then_replays_from_disk() {
    let (upstream_addr, hits, mut upstream_rx, upstream_join) = spawn_upstream().await;
    let fixtures = tempfile::tempdir().unwrap();
    let config = proxy_config(upstream_addr, fixtures.path(), "");
    let proxy = replaytrack::proxy::serve(&config).await.unwrap();
    let client = client();

    let send = |body: &'static [u8]| {
        let uri: Uri = format!("http://{}/hello?x=1", proxy.listen_addr)
            .parse()
            .unwrap();
        let mut req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONNECTION, "x-hop")
            .header("x-hop", "secret")
            .header("x-end", "kept")
            .body(Full::new(Bytes::from_static(body)))
            .unwrap();
        req.headers_mut()
            .insert(header::HOST, HeaderValue::from_static("proxy.invalid"));
        client.request(req)
    };

    let res = send(b"client-body").await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(
        res.headers().get("x-resp-end").unwrap(),
        &HeaderValue::from_static("ok")
    );
    assert!(res.headers().get("x-resp-hop").is_none());
    assert!(res.headers().get(header::CONNECTION).is_none());
    let recorded = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&recorded[..], b"upstream-body");

    let captured = upstream_rx.recv().await.unwrap();
    assert_eq!(captured.uri.path(), "/api/hello");
    assert_eq!(captured.uri.query(), Some("x=1"));
    assert_eq!(
        captured.headers.get(header::HOST).unwrap(),
        &HeaderValue::from_str(&upstream_addr.to_string()).unwrap()
    );
    assert_eq!(
        captured.headers.get("x-end").unwrap(),
        &HeaderValue::from_static("kept")
    );
    assert!(captured.headers.get("x-hop").is_none());
    assert_eq!(&captured.body[..], b"client-body");
    assert_eq!(fixture_count(fixtures.path()), 1);

    let res = send(b"client-body").await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let replayed = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(replayed, recorded);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let res = send(b"other-body").await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(fixture_count(fixtures.path()), 2);

    proxy.shutdown().await;
    upstream_join.abort();
}

#[tokio::test]
async fn series_bracketing_through_the_proxy_handle() {
    let (upstream_addr, hits, _upstream_rx, upstream_join) = spawn_upstream().await;
    let fixtures = tempfile::tempdir().unwrap();
    let config = proxy_config(upstream_addr, fixtures.path(), "");
    let proxy = replaytrack::proxy::serve(&config).await.unwrap();
    let client = client();

    let get = |path: &str| {
        let uri: Uri = format!("http://{}{path}", proxy.listen_addr).parse().unwrap();
        let req = Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap();
        client.request(req)
    };

    for _ in 0..2 {
        proxy.engine().start_series("checkout").unwrap();
        for path in ["/cart", "/cart", "/pay"] {
            let res = get(path).await.unwrap();
            assert_eq!(res.status(), StatusCode::CREATED);
        }
        proxy.engine().stop_series();
    }

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(fixture_count(fixtures.path()), 3);

    proxy.shutdown().await;
    upstream_join.abort();
}

#[tokio::test]
async fn misses_with_recording_disabled_return_json_errors() {
    let (upstream_addr, hits, _upstream_rx, upstream_join) = spawn_upstream().await;
    let fixtures = tempfile::tempdir().unwrap();
    let config = proxy_config(upstream_addr, fixtures.path(), "prevent_recording = true");
    let proxy = replaytrack::proxy::serve(&config).await.unwrap();

    let uri: Uri = format!("http://{}/never-recorded", proxy.listen_addr)
        .parse()
        .unwrap();
    let req = Request::builder()
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = client().request(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["kind"], "recording_prevented");
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .contains("GET_%2Fnever-recorded_")
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(fixture_count(fixtures.path()), 0);

    proxy.shutdown().await;
    upstream_join.abort();
}

#[tokio::test]
async fn serve_requires_a_listen_address() {
    let fixtures = tempfile::tempdir().unwrap();
    let config = Config::from_toml_str(&format!(
        r#"
[engine]
remote = "http://127.0.0.1:9"

[store]
path = "{}"
"#,
        fixtures.path().display()
    ))
    .unwrap();
    let err = replaytrack::proxy::serve(&config).await.unwrap_err();
    assert!(err.to_string().contains("listen"), "unexpected: {err}");
}

async fn spawn_upstream() -> (
    SocketAddr,
    Arc<AtomicUsize>,
    mpsc::UnboundedReceiver<CapturedRequest>,
    tokio::task::JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel::<CapturedRequest>();

    let accept_hits = Arc::clone(&hits);
    let join = tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let tx = tx.clone();
            let hits = Arc::clone(&accept_hits);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let (parts, body) = req.into_parts();
                        let body_bytes = body.collect().await.unwrap().to_bytes();
                        let _ = tx.send(CapturedRequest {
                            uri: parts.uri,
                            headers: parts.headers,
                            body: body_bytes,
                        });

                        let mut res =
                            Response::new(Full::new(Bytes::from_static(b"upstream-body")));
                        *res.status_mut() = StatusCode::CREATED;
                        res.headers_mut().insert(
                            header::CONNECTION,
                            HeaderValue::from_static("x-resp-hop"),
                        );
                        res.headers_mut()
                            .insert("x-resp-hop", HeaderValue::from_static("yes"));
                        res.headers_mut()
                            .insert("x-resp-end", HeaderValue::from_static("ok"));
                        Ok::<_, hyper::Error>(res)
                    }
                });

                let builder = ConnectionBuilder::new(TokioExecutor::new());
                let _ = builder.serve_connection(io, service).await;
            });
        }
    });

    (addr, hits, rx, join)
}
