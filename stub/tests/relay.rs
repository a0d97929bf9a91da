//! End-to-end: a real hub on a loopback port, real tunnel clients, and HTTP
//! driven through reqwest.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use stubrelay::{AppState, Config};
use stubrelay_client::{Client, Response, DEFAULT_MAX_REPLY_BYTES};
use tokio::net::TcpListener;

struct Hub {
    base: String,
    state: AppState,
}

impl Hub {
    async fn start(wait_timeout_ms: u64) -> Self {
        let mut config = Config::default();
        config.server.wait_timeout_ms = wait_timeout_ms;
        config.server.status_path = Some("/_relay/status".into());
        let state = AppState::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(stubrelay::serve(
            listener,
            state.clone(),
            std::future::pending(),
        ));
        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    /// Connect a client and wait until the hub has registered it.
    async fn client(&self) -> Client {
        let before = self.connections().await;
        let client = Client::connect(&self.base).await.unwrap();
        self.wait_for_connections(before + 1).await;
        client
    }

    async fn connections(&self) -> usize {
        self.state.hub.snapshot().await.unwrap().connections
    }

    async fn wait_for_connections(&self, n: usize) {
        for _ in 0..200 {
            if self.connections().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hub never reached {n} connections");
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

#[tokio::test]
async fn post_orders_is_answered_by_matching_stub() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;
    let _stub = client
        .stub()
        .method_post()
        .path("/orders")
        .returns_json(201, &json!({"ok": true}))
        .await
        .unwrap();

    let resp = reqwest::Client::new()
        .post(hub.url("/orders"))
        .json(&json!({"id": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"ok": true}));

    client.close().await;
}

#[tokio::test]
async fn no_client_times_out_with_408() {
    let hub = Hub::start(200).await;
    let started = Instant::now();
    let resp = reqwest::get(hub.url("/anything")).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(resp.status(), 408);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(hub.state.hub.snapshot().await.unwrap().pending, 0);
}

#[tokio::test]
async fn method_mismatch_is_not_answered() {
    let hub = Hub::start(200).await;
    let client = hub.client().await;
    let _stub = client
        .stub()
        .method_post()
        .path("/orders")
        .returns(Response::new(201))
        .await
        .unwrap();

    let resp = reqwest::get(hub.url("/orders")).await.unwrap();
    assert_eq!(resp.status(), 408);
    client.close().await;
}

#[tokio::test]
async fn released_stub_stops_answering() {
    let hub = Hub::start(300).await;
    let client = hub.client().await;
    let handle = client
        .stub()
        .path("/ping")
        .returns(Response::new(204))
        .await
        .unwrap();

    assert_eq!(reqwest::get(hub.url("/ping")).await.unwrap().status(), 204);
    handle.release().await.unwrap();
    assert_eq!(reqwest::get(hub.url("/ping")).await.unwrap().status(), 408);

    client.close().await;
}

#[tokio::test]
async fn duplicate_matches_deliver_one_reply() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;
    let _first = client
        .stub()
        .path("/dup")
        .returns(Response::new(200).with_body("first"))
        .await
        .unwrap();
    let _second = client
        .stub()
        .path("/dup")
        .returns(Response::new(500).with_body("second"))
        .await
        .unwrap();

    let resp = reqwest::get(hub.url("/dup")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "first");

    let stats = hub.state.stats.clone();
    for _ in 0..100 {
        if stats.replies_discarded.load(Ordering::Relaxed) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(stats.replies_discarded.load(Ordering::Relaxed), 1);
    assert_eq!(stats.replies_delivered.load(Ordering::Relaxed), 1);

    client.close().await;
}

#[tokio::test]
async fn header_and_custom_matchers_select_stub() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;
    let _stub = client
        .stub()
        .header("X-Tenant", "acme")
        .matcher(|r: &stubrelay_client::Request| {
            r.url.query_pairs().any(|(k, v)| k == "page" && v == "2")
        })
        .returns(
            Response::new(200)
                .with_header("X-Served-By", "stub")
                .with_header("X-Served-By", "relay")
                .with_body("page two"),
        )
        .await
        .unwrap();

    let resp = reqwest::Client::new()
        .delete(hub.url("/any/path?page=2"))
        .header("x-tenant", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let served: Vec<_> = resp
        .headers()
        .get_all("x-served-by")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(served, vec!["stub", "relay"]);
    assert_eq!(resp.text().await.unwrap(), "page two");

    client.close().await;
}

#[tokio::test]
async fn stub_without_matchers_answers_everything() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;
    let _any = client
        .stub()
        .returns(Response::new(200).with_body("catch-all"))
        .await
        .unwrap();

    let http = reqwest::Client::new();
    for (method, path) in [
        (reqwest::Method::GET, "/"),
        (reqwest::Method::PATCH, "/a/b/c"),
        (reqwest::Method::OPTIONS, "/x?y=z"),
    ] {
        let resp = http.request(method, hub.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "catch-all");
    }

    client.close().await;
}

#[tokio::test]
async fn body_predicate_selects_stub() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;
    let _small = client
        .stub()
        .body(|b| b.len() < 4)
        .returns(Response::new(200).with_body("small"))
        .await
        .unwrap();
    let _large = client
        .stub()
        .body(|b| b.len() >= 4)
        .returns(Response::new(200).with_body("large"))
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let resp = http.put(hub.url("/blob")).body("abcdef").send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "large");
    let resp = http.put(hub.url("/blob")).body("ab").send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "small");

    client.close().await;
}

#[tokio::test]
async fn disconnected_client_is_covered_by_another() {
    let hub = Hub::start(2000).await;
    let leaving = hub.client().await;
    let staying = hub.client().await;
    let _stub = staying
        .stub()
        .path("/")
        .returns(Response::new(202))
        .await
        .unwrap();

    leaving.close().await;
    hub.wait_for_connections(1).await;

    let resp = reqwest::get(hub.url("/still-here")).await.unwrap();
    assert_eq!(resp.status(), 202);
    staying.close().await;
}

#[tokio::test]
async fn client_leaving_mid_call_yields_timeout() {
    let hub = Hub::start(500).await;
    let client = hub.client().await;

    let call = tokio::spawn(reqwest::get(hub.url("/never")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;
    hub.wait_for_connections(0).await;

    let resp = call.await.unwrap().unwrap();
    assert_eq!(resp.status(), 408);
}

#[tokio::test]
async fn status_endpoint_reports_live_connections() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;

    let status: Value = reqwest::get(hub.url("/_relay/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");
    assert_eq!(status["connections"], 1);

    client.close().await;
}

#[tokio::test]
async fn hub_shutdown_closes_clients() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;

    hub.state.hub.shutdown();
    for _ in 0..200 {
        if client.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.is_closed());
}

#[tokio::test]
async fn large_reply_body_is_relayed_and_tunnel_survives() {
    let hub = Hub::start(2000).await;
    let client = hub.client().await;
    let body: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    let _big = client
        .stub()
        .path("/big")
        .returns(Response::new(200).with_body(body.clone()))
        .await
        .unwrap();
    let _small = client
        .stub()
        .path("/small")
        .returns(Response::new(200).with_body("ok"))
        .await
        .unwrap();

    let resp = reqwest::get(hub.url("/big")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), body.as_slice());

    let resp = reqwest::get(hub.url("/small")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
    assert_eq!(hub.connections().await, 1);
    assert!(!client.is_closed());

    client.close().await;
}

#[test]
fn client_reply_limit_matches_hub_frame_limit() {
    assert_eq!(DEFAULT_MAX_REPLY_BYTES, Config::default().max_message_size());
}
