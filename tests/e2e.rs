//! End-to-end tests for hls-relay
//!
//! Starts a real Axum server on a random port in front of a wiremock origin
//! and drives it the way a player would: master playlist, variant playlist,
//! key and segments, all through the rewritten links.
//!
//! The private-target guard is disabled because the origin listens on
//! 127.0.0.1.

use hls_relay::config::Config;
use hls_relay::server::build_router_with_state;
use hls_relay::server::state::AppState;
use hls_relay::source::SourceDefinition;
use hls_relay::streaming::StreamSettings;
use hls_relay::upstream::{PoolSettings, TimeoutBudgets, TimeoutClass};
use m3u8_rs::Playlist;
use std::net::SocketAddr;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PLAYLIST_TYPE: &str = "application/vnd.apple.mpegurl";

// ── Test server helpers ───────────────────────────────────────────────────────

/// Spin up the relay with `PUBLIC_BASE_URL` pointing at its own listener.
///
/// Returns the state as well so tests can inspect pool accounting.
async fn start_relay(stream: StreamSettings) -> (SocketAddr, AppState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();

    let config = Config {
        port: 0,
        is_dev: true,
        public_base_url: Some(format!("http://{}", addr)),
        default_user_agent: "RelayE2E/1.0".to_string(),
        sources: vec![SourceDefinition {
            key: "e2e".to_string(),
            base_url: "https://catalog.example.com/".to_string(),
            user_agent: None,
            is_live: true,
            timeout_class: TimeoutClass::Default,
        }],
        slow_domains: Vec::new(),
        referer_overrides: Vec::new(),
        pool: PoolSettings::default(),
        stream,
        timeouts: TimeoutBudgets::default(),
        max_manifest_bytes: 1024 * 1024,
        block_private_targets: false,
    };

    let state = AppState::new(config).expect("Failed to build state");
    let app = build_router_with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

fn relay_link(addr: SocketAddr, endpoint: &str, target: &str) -> String {
    format!(
        "http://{}/proxy/{}?url={}&source=e2e",
        addr,
        endpoint,
        urlencoding::encode(target)
    )
}

async fn fetch_playlist(client: &reqwest::Client, link: &str) -> Playlist {
    let resp = client.get(link).send().await.unwrap();
    assert_eq!(resp.status(), 200, "{link}");
    assert_eq!(resp.headers()["content-type"], PLAYLIST_TYPE);
    let body = resp.bytes().await.unwrap();
    m3u8_rs::parse_playlist_res(&body).expect("relay output must parse")
}

/// Poll until every pool lease has been returned or the deadline passes.
async fn wait_for_idle_pool(state: &AppState) -> u64 {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let in_use = state.pool().stats().in_use;
        if in_use == 0 || tokio::time::Instant::now() >= deadline {
            return in_use;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_check() {
    let (addr, _) = start_relay(StreamSettings::default()).await;

    let resp = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["x-relay-version"],
        env!("CARGO_PKG_VERSION")
    );

    let body = resp.bytes().await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sources"], 1);
}

#[tokio::test]
async fn player_follows_rewritten_links_end_to_end() {
    let origin = MockServer::start().await;
    let segment_bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let key_bytes = vec![0x11u8; 16];

    Mock::given(method("GET"))
        .and(path("/show/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "#EXTM3U\n\
             #EXT-X-INDEPENDENT-SEGMENTS\n\
             #EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720\n\
             hd/index.m3u8\n",
            PLAYLIST_TYPE,
        ))
        .mount(&origin)
        .await;

    Mock::given(method("GET"))
        .and(path("/show/hd/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:6\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"../keys/k1.bin\"\n\
             #EXTINF:6.0,\n\
             seg0.ts\n\
             #EXT-X-ENDLIST\n",
            PLAYLIST_TYPE,
        ))
        .mount(&origin)
        .await;

    Mock::given(method("GET"))
        .and(path("/show/keys/k1.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(key_bytes.clone(), "application/octet-stream"))
        .mount(&origin)
        .await;

    Mock::given(method("GET"))
        .and(path("/show/hd/seg0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(segment_bytes.clone(), "video/mp2t"))
        .mount(&origin)
        .await;

    let (addr, state) = start_relay(StreamSettings {
        chunk_size: 16 * 1024,
        window_chunks: 2,
    })
    .await;
    let client = reqwest::Client::new();

    // Master: the variant URI points back at the relay's playlist endpoint.
    let master_target = format!("{}/show/master.m3u8", origin.uri());
    let master = match fetch_playlist(&client, &relay_link(addr, "m3u8", &master_target)).await {
        Playlist::MasterPlaylist(master) => master,
        Playlist::MediaPlaylist(_) => panic!("expected master playlist"),
    };
    assert_eq!(master.variants.len(), 1);
    let variant_link = &master.variants[0].uri;
    assert_eq!(
        variant_link,
        &relay_link(addr, "m3u8", &format!("{}/show/hd/index.m3u8", origin.uri()))
    );

    // Media: key and segment links are resolved against the variant URL.
    let media = match fetch_playlist(&client, variant_link).await {
        Playlist::MediaPlaylist(media) => media,
        Playlist::MasterPlaylist(_) => panic!("expected media playlist"),
    };
    assert_eq!(media.segments.len(), 1);
    let segment = &media.segments[0];
    assert_eq!(
        segment.uri,
        relay_link(addr, "segment", &format!("{}/show/hd/seg0.ts", origin.uri()))
    );
    let key_link = segment
        .key
        .as_ref()
        .and_then(|k| k.uri.clone())
        .expect("segment should carry its key");
    assert_eq!(
        key_link,
        relay_link(addr, "key", &format!("{}/show/keys/k1.bin", origin.uri()))
    );

    let key = client.get(&key_link).send().await.unwrap();
    assert_eq!(key.status(), 200);
    assert_eq!(key.bytes().await.unwrap().to_vec(), key_bytes);

    let seg = client.get(&segment.uri).send().await.unwrap();
    assert_eq!(seg.status(), 200);
    assert_eq!(seg.headers()["content-type"], "video/mp2t");
    assert_eq!(
        seg.headers()["cache-control"],
        "public, max-age=31536000, immutable"
    );
    assert_eq!(seg.bytes().await.unwrap().to_vec(), segment_bytes);

    assert_eq!(wait_for_idle_pool(&state).await, 0);
}

#[tokio::test]
async fn client_abort_releases_pool_slot() {
    let origin = MockServer::start().await;
    let big = vec![0x47u8; 8 * 1024 * 1024];
    Mock::given(method("GET"))
        .and(path("/big.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(big, "video/mp2t"))
        .mount(&origin)
        .await;

    let (addr, state) = start_relay(StreamSettings {
        chunk_size: 8 * 1024,
        window_chunks: 1,
    })
    .await;

    let link = relay_link(addr, "segment", &format!("{}/big.ts", origin.uri()));
    let mut resp = reqwest::get(&link).await.unwrap();
    assert_eq!(resp.status(), 200);

    let first = resp.chunk().await.unwrap().expect("at least one chunk");
    assert!(!first.is_empty());
    drop(resp);

    assert_eq!(wait_for_idle_pool(&state).await, 0);
}

#[tokio::test]
async fn live_playlist_is_refetched_on_every_poll() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2,\nlive1.ts\n",
            PLAYLIST_TYPE,
        ))
        .expect(2)
        .mount(&origin)
        .await;

    let (addr, _) = start_relay(StreamSettings::default()).await;
    let link = relay_link(addr, "m3u8", &format!("{}/live.m3u8", origin.uri()));
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client.get(&link).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["cache-control"], "public, max-age=10");
        let body = resp.text().await.unwrap();
        assert!(body.contains("/proxy/segment?url="), "{body}");
    }
}
