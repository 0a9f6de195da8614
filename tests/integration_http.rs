use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use offline_player::api::{BackendClient, PlayReporter, SEARCH_LIMIT};
use offline_player::asset_cache::{CacheStorage, OfflineAssetCache};
use offline_player::connectivity::{Connectivity, ConnectivityProbe};
use offline_player::fetch::{Fetch, HttpFetcher};
use offline_player::player::media::{MediaDirective, RemoteMediaElement};
use offline_player::player::{PlayerController, PlayerEvent, PlayerHandle};
use offline_player::server::{self, AppState};
use offline_player::store::LocalAudioStore;
use offline_player::track::{PlaylistId, SongId, Track, UserId};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const AUDIO: &[u8] = b"ID3\x03fake-audio-frames";

type Plays = Arc<Mutex<Vec<String>>>;

/// Stand-in for the music backend.
fn backend(plays: Plays) -> Router {
    Router::new()
        .route(
            "/songs/:id",
            get(|Path(id): Path<u64>| async move {
                Json(json!({
                    "song_id": id,
                    "title": format!("Song {}", id),
                    "artist": "Stub Artist",
                    "file_url": format!("/audio/{}.mp3", id),
                }))
            }),
        )
        .route(
            "/audio/:file",
            get(|| async { ([(header::CONTENT_TYPE, "audio/mpeg")], AUDIO) }),
        )
        .route(
            "/search",
            get(|| async {
                let results: Vec<Value> = (1..=15)
                    .map(|i| json!({ "song_id": i, "title": format!("Match {}", i), "artist": "A" }))
                    .collect();
                Json(results)
            }),
        )
        .route(
            "/lyrics",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("title").map(String::as_str) != Some("Known") {
                    return StatusCode::NOT_FOUND.into_response();
                }
                Json(json!({ "lyrics": [
                    { "seconds": 12.0, "lyrics": "second" },
                    { "seconds": 1.5, "lyrics": "first" },
                ]}))
                .into_response()
            }),
        )
        .route(
            "/playlist/:playlist/songs/:song",
            post(
                |State(plays): State<Plays>, Path((playlist, song)): Path<(String, String)>| async move {
                    plays.lock().unwrap().push(format!("{}/{}", playlist, song));
                    StatusCode::OK
                },
            ),
        )
        .route(
            "/styles.css",
            get(|| async { ([(header::CONTENT_TYPE, "text/css")], "body { color: red; }") }),
        )
        .with_state(plays)
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn stub_backend() -> (String, Plays) {
    let plays = Plays::default();
    let url = serve(backend(plays.clone())).await;
    (url, plays)
}

#[tokio::test]
async fn fetcher_reads_bodies_and_rejects_error_statuses() {
    let (url, _) = stub_backend().await;
    let fetcher = HttpFetcher::new(Client::new(), &url);

    let fetched = fetcher.fetch("/audio/1.mp3").await.unwrap();
    assert_eq!(&fetched.body[..], AUDIO);
    assert_eq!(fetched.content_type.as_deref(), Some("audio/mpeg"));

    let err = fetcher.fetch("/nowhere").await.unwrap_err();
    assert_eq!(err.url, "/nowhere");
    assert!(err.reason.contains("404"));
}

#[tokio::test]
async fn backend_client_song_search_and_lyrics() {
    let (url, _) = stub_backend().await;
    let api = BackendClient::new(Client::new(), format!("{}/", url));

    let song = api.song(&SongId::from("7")).await.unwrap();
    assert_eq!(song.song_id, SongId::from("7"));
    let track = song.into_track(Some(PlaylistId::from("3")));
    assert_eq!(track.source_url, "/audio/7.mp3");
    assert_eq!(track.artist, "Stub Artist");

    assert!(api.search("a").await.unwrap().is_empty());
    assert!(api.search("  b ").await.unwrap().is_empty());
    assert_eq!(api.search("match").await.unwrap().len(), SEARCH_LIMIT);

    let sheet = api.lyrics("Known", "A").await.unwrap().unwrap();
    assert_eq!(sheet.lines()[0].lyrics, "first");
    assert!(api.lyrics("Unknown", "A").await.unwrap().is_none());
}

#[tokio::test]
async fn plays_outside_a_playlist_report_playlist_zero() {
    let (url, plays) = stub_backend().await;
    let api = BackendClient::new(Client::new(), &url);

    api.report_play(None, &SongId::from("5")).await.unwrap();
    api.report_play(Some(&PlaylistId::from("9")), &SongId::from("6"))
        .await
        .unwrap();

    assert_eq!(*plays.lock().unwrap(), ["0/5", "9/6"]);
}

#[tokio::test]
async fn probe_reports_reachability() {
    let (url, _) = stub_backend().await;
    let probe = ConnectivityProbe::new(Client::new(), &url, Duration::from_millis(50));
    assert_eq!(probe.check().await, Connectivity::Online);

    probe.online_hint().store(false, Ordering::Relaxed);
    assert_eq!(probe.check().await, Connectivity::Offline);

    // A port nothing listens on any more.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let probe = ConnectivityProbe::new(Client::new(), closed, Duration::from_millis(50));
    assert_eq!(probe.check().await, Connectivity::Offline);
}

#[tokio::test]
async fn probe_publishes_the_offline_transition() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let probe = ConnectivityProbe::new(Client::new(), closed, Duration::from_millis(20));
    let (tx, mut rx) = tokio::sync::watch::channel(Connectivity::Online);
    tokio::spawn(probe.run(tx));

    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*rx.borrow(), Connectivity::Offline);
}

#[tokio::test]
async fn companion_serves_downloads_and_cached_assets() {
    let (backend_url, _) = stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let client = Client::new();
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(client.clone(), &backend_url));
    let user = UserId::from("u1");

    let store = Arc::new(LocalAudioStore::new(dir.path(), fetcher.clone()));
    store
        .save(&Track::new("7", "Song 7", "Stub Artist", "/audio/7.mp3"), &user)
        .await
        .unwrap();

    let assets = Arc::new(OfflineAssetCache::new(
        CacheStorage::new(dir.path().join("caches")),
        "music-app-cache-v1",
        vec!["/styles.css".to_string()],
        fetcher,
    ));
    assert_eq!(assets.install().await.unwrap(), 1);

    let backend = BackendClient::new(client.clone(), &backend_url);
    let (events, _) = broadcast::channel(64);
    let (player, commands) = PlayerHandle::channel(16);
    let reporter: Arc<dyn PlayReporter> = Arc::new(backend.clone());
    let controller = PlayerController::new(
        RemoteMediaElement::new(events.clone()),
        user.clone(),
        store.clone(),
        reporter,
        events.clone(),
    );
    tokio::spawn(controller.run(commands));

    let probe = ConnectivityProbe::new(client.clone(), &backend_url, Duration::from_secs(60));
    let app = serve(server::router(AppState {
        player,
        store,
        assets,
        backend,
        events,
        user_id: user,
        online_hint: probe.online_hint(),
        previews: Default::default(),
    }))
    .await;

    let downloads: Value = client
        .get(format!("{}/downloads", app))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(downloads[0]["song_id"], "7");
    assert_eq!(downloads[0]["audio_url"], "/downloads/7/audio");

    let audio = client
        .get(format!("{}/downloads/7/audio", app))
        .send()
        .await
        .unwrap();
    assert_eq!(audio.status(), 200);
    assert_eq!(audio.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(&audio.bytes().await.unwrap()[..], AUDIO);

    let css = client.get(format!("{}/styles.css", app)).send().await.unwrap();
    assert_eq!(css.headers()["x-offline-cache"], "music-app-cache-v1");
    assert_eq!(css.text().await.unwrap(), "body { color: red; }");

    let status = client
        .post(format!("{}/downloads/view", app))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 202);
    let snapshot: Value = client
        .get(format!("{}/player/state", app))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["queue_len"], 1);
    assert_eq!(snapshot["context"], "offline");

    let lyrics = client.get(format!("{}/lyrics", app)).send().await.unwrap();
    assert_eq!(lyrics.status(), 400);

    let deleted = client
        .delete(format!("{}/downloads/7", app))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    let again = client
        .delete(format!("{}/downloads/7", app))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
    let gone = client
        .get(format!("{}/downloads/7/audio", app))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn queue_request_resolves_songs_through_the_backend() {
    let (backend_url, plays) = stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let client = Client::new();
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(client.clone(), &backend_url));
    let user = UserId::from("u2");
    let store = Arc::new(LocalAudioStore::new(dir.path(), fetcher.clone()));
    let assets = Arc::new(OfflineAssetCache::new(
        CacheStorage::new(dir.path().join("caches")),
        "music-app-cache-v1",
        Vec::new(),
        fetcher,
    ));
    let backend = BackendClient::new(client.clone(), &backend_url);
    let (events, _) = broadcast::channel(64);
    let (player, commands) = PlayerHandle::channel(16);
    let reporter: Arc<dyn PlayReporter> = Arc::new(backend.clone());
    tokio::spawn(
        PlayerController::new(
            RemoteMediaElement::new(events.clone()),
            user.clone(),
            store.clone(),
            reporter,
            events.clone(),
        )
        .run(commands),
    );
    let probe = ConnectivityProbe::new(client.clone(), &backend_url, Duration::from_secs(60));
    let app = serve(server::router(AppState {
        player,
        store,
        assets,
        backend,
        events,
        user_id: user,
        online_hint: probe.online_hint(),
        previews: Default::default(),
    }))
    .await;

    let loaded: Value = client
        .post(format!("{}/player/queue", app))
        .json(&json!({ "song_ids": [3, "4"], "playlist_id": 12 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(loaded["loaded"], 2);

    // No page is attached, so the element cannot start, but the play is
    // still reported.
    client
        .post(format!("{}/player/play/1", app))
        .send()
        .await
        .unwrap();
    let snapshot: Value = client
        .get(format!("{}/player/state", app))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["cursor"], 1);
    assert_eq!(snapshot["session"]["current_track"]["id"], "4");
    assert_eq!(snapshot["session"]["is_playing"], false);

    for _ in 0..50 {
        if !plays.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(*plays.lock().unwrap(), ["12/4"]);
}

#[tokio::test]
async fn previews_play_one_at_a_time() {
    let (backend_url, _) = stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let client = Client::new();
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(client.clone(), &backend_url));
    let user = UserId::from("u3");
    let store = Arc::new(LocalAudioStore::new(dir.path(), fetcher.clone()));
    let assets = Arc::new(OfflineAssetCache::new(
        CacheStorage::new(dir.path().join("caches")),
        "music-app-cache-v1",
        Vec::new(),
        fetcher,
    ));
    let backend = BackendClient::new(client.clone(), &backend_url);
    // Stands in for an open page so preview elements have an output.
    let (events, mut page) = broadcast::channel(64);
    let (player, _commands) = PlayerHandle::channel(16);
    let probe = ConnectivityProbe::new(client.clone(), &backend_url, Duration::from_secs(60));
    let app = serve(server::router(AppState {
        player,
        store,
        assets,
        backend,
        events,
        user_id: user,
        online_hint: probe.online_hint(),
        previews: Default::default(),
    }))
    .await;

    let loaded: Value = client
        .post(format!("{}/previews", app))
        .json(&json!({ "song_ids": [1, 2, 3] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(loaded["slots"], json!(["1", "2", "3"]));

    for slot in [0, 2] {
        let status = client
            .post(format!("{}/previews/{}/play", app, slot))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, 202);
    }
    let state: Value = client
        .get(format!("{}/previews", app))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["count"], 3);
    assert_eq!(state["playing"], 2);

    // Starting slot 2 paused and rewound slot 0.
    let mut slot_zero = Vec::new();
    while let Ok(event) = page.try_recv() {
        if let PlayerEvent::Preview { slot: 0, directive } = event {
            slot_zero.push(directive);
        }
    }
    assert!(slot_zero.ends_with(&[MediaDirective::Pause, MediaDirective::Seek { seconds: 0.0 }]));

    let missing = client
        .post(format!("{}/previews/9/play", app))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(missing, 404);
}
