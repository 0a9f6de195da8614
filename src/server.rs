use crate::api::BackendClient;
use crate::asset_cache::{AssetSource, OfflineAssetCache};
use crate::error::{MediaError, StoreError};
use crate::player::exclusive::PreviewGroup;
use crate::player::media::{
    downloaded_audio_url, MediaElement, MediaReport, MediaSource, RemoteMediaElement,
};
use crate::player::{PlaybackContext, PlayerCommand, PlayerEvent, PlayerHandle};
use crate::store::LocalAudioStore;
use crate::track::{PlaylistId, RecordId, SongId, UserId};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::future::join_all;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const SHELL_PAGE: &str = include_str!("server/shell.html");
const STREAM_CHUNK: usize = 64 * 1024;

// --- State ---

#[derive(Clone)]
pub struct AppState {
    pub player: PlayerHandle,
    pub store: Arc<LocalAudioStore>,
    pub assets: Arc<OfflineAssetCache>,
    pub backend: BackendClient,
    pub events: broadcast::Sender<PlayerEvent>,
    pub user_id: UserId,
    pub online_hint: Arc<AtomicBool>,
    pub previews: Arc<Mutex<PreviewGroup<RemoteMediaElement>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(web_interface))
        .route("/events", get(player_events))
        .route("/player/state", get(player_state))
        .route("/player/queue", post(load_queue))
        .route("/player/play/:index", post(play_index))
        .route("/player/toggle", post(|s: State<AppState>| intent(s, PlayerCommand::TogglePlayPause)))
        .route("/player/next", post(|s: State<AppState>| intent(s, PlayerCommand::Next)))
        .route("/player/previous", post(|s: State<AppState>| intent(s, PlayerCommand::Previous)))
        .route("/player/shuffle", post(|s: State<AppState>| intent(s, PlayerCommand::ToggleShuffle)))
        .route("/player/repeat", post(|s: State<AppState>| intent(s, PlayerCommand::CycleRepeat)))
        .route("/player/download", post(|s: State<AppState>| intent(s, PlayerCommand::DownloadCurrent)))
        .route("/player/seek", post(seek))
        .route("/player/volume", post(volume))
        .route("/player/media", post(media_report))
        .route("/previews", get(preview_state).post(load_previews))
        .route("/previews/:slot/play", post(play_preview))
        .route("/previews/:slot/pause", post(pause_preview))
        .route("/downloads", get(list_downloads))
        .route("/downloads/view", post(|s: State<AppState>| intent(s, PlayerCommand::ShowDownloads)))
        .route("/downloads/:song_id", axum::routing::delete(delete_download))
        .route("/downloads/:song_id/audio", get(stream_download))
        .route("/search", get(search_songs))
        .route("/lyrics", get(lyrics))
        .route("/connectivity", post(report_connectivity))
        .route("/health", get(|| async { "OK" }))
        .fallback(offline_fallback)
        .with_state(state)
}

// --- Web Interface ---

async fn web_interface() -> Html<&'static str> {
    Html(SHELL_PAGE)
}

/// Server-sent events carrying every player event to the page.
async fn player_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    debug!("Page attached to event stream");

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(data) => yield Ok(Event::default().data(data)),
                    Err(e) => error!("Failed to encode player event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// --- Player Intents ---

async fn intent(State(state): State<AppState>, command: PlayerCommand) -> StatusCode {
    match state.player.send(command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            error!("{}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn play_index(state: State<AppState>, Path(index): Path<usize>) -> StatusCode {
    intent(state, PlayerCommand::Play(index)).await
}

#[derive(Deserialize)]
struct SeekRequest {
    fraction: f64,
}

async fn seek(state: State<AppState>, Json(req): Json<SeekRequest>) -> StatusCode {
    intent(state, PlayerCommand::Seek(req.fraction)).await
}

#[derive(Deserialize)]
struct VolumeRequest {
    level: f64,
}

async fn volume(state: State<AppState>, Json(req): Json<VolumeRequest>) -> StatusCode {
    intent(state, PlayerCommand::SetVolume(req.level)).await
}

#[derive(Deserialize)]
struct ReportStamp {
    at: Option<f64>,
}

async fn media_report(
    state: State<AppState>,
    Query(stamp): Query<ReportStamp>,
    Json(report): Json<MediaReport>,
) -> StatusCode {
    intent(
        state,
        PlayerCommand::Media {
            report,
            at: stamp.at,
        },
    )
    .await
}

async fn player_state(State(state): State<AppState>) -> impl IntoResponse {
    match state.player.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Deserialize)]
struct QueueRequest {
    song_ids: Vec<SongId>,
    #[serde(default)]
    playlist_id: Option<PlaylistId>,
}

/// Resolves each song through the backend and makes them the online queue.
/// Songs that fail to resolve are left out.
async fn load_queue(state: State<AppState>, Json(req): Json<QueueRequest>) -> impl IntoResponse {
    let lookups = req.song_ids.iter().map(|id| state.backend.song(id));
    let mut tracks = Vec::with_capacity(req.song_ids.len());
    for (id, result) in req.song_ids.iter().zip(join_all(lookups).await) {
        match result {
            Ok(song) => tracks.push(song.into_track(req.playlist_id.clone())),
            Err(e) => warn!("Skipping song {}: {:#}", id, e),
        }
    }

    let count = tracks.len();
    let status = intent(
        state,
        PlayerCommand::LoadQueue {
            tracks,
            context: PlaybackContext::Online,
        },
    )
    .await;
    (status, Json(serde_json::json!({ "loaded": count })))
}

// --- Previews ---

#[derive(Deserialize)]
struct PreviewRequest {
    song_ids: Vec<SongId>,
}

/// Replaces the page's preview players, one slot per resolved song.
async fn load_previews(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> impl IntoResponse {
    let lookups = req.song_ids.iter().map(|id| state.backend.song(id));
    let mut group = PreviewGroup::new();
    let mut slots = Vec::with_capacity(req.song_ids.len());
    for (id, result) in req.song_ids.iter().zip(join_all(lookups).await) {
        match result {
            Ok(song) => {
                let mut element = RemoteMediaElement::preview(state.events.clone(), group.len());
                element.load(&MediaSource::Network(song.file_url));
                group.add(element);
                slots.push(id.clone());
            }
            Err(e) => warn!("No preview for {}: {:#}", id, e),
        }
    }

    let mut previews = state.previews.lock().await;
    if let Some(slot) = previews.playing() {
        previews.pause(slot);
    }
    *previews = group;
    Json(serde_json::json!({ "slots": slots }))
}

/// Starts one preview; every other preview is paused and rewound.
async fn play_preview(State(state): State<AppState>, Path(slot): Path<usize>) -> StatusCode {
    match state.previews.lock().await.play(slot) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(MediaError::NoSource) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!("Preview {} did not start: {}", slot, e);
            StatusCode::CONFLICT
        }
    }
}

async fn pause_preview(State(state): State<AppState>, Path(slot): Path<usize>) -> StatusCode {
    state.previews.lock().await.pause(slot);
    StatusCode::ACCEPTED
}

async fn preview_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    let previews = state.previews.lock().await;
    Json(serde_json::json!({
        "count": previews.len(),
        "playing": previews.playing(),
    }))
}

// --- Downloads ---

#[derive(Serialize)]
struct DownloadView {
    song_id: SongId,
    title: String,
    artist: String,
    size_bytes: u64,
    audio_url: String,
}

async fn list_downloads(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_for_user(&state.user_id).await {
        Ok(records) => {
            let views: Vec<DownloadView> = records
                .into_iter()
                .map(|r| DownloadView {
                    audio_url: downloaded_audio_url(r.song_id()),
                    song_id: r.id.song_id,
                    title: r.title,
                    artist: r.artist,
                    size_bytes: r.size_bytes,
                })
                .collect();
            Json(views).into_response()
        }
        Err(e) => {
            error!("Error loading downloaded songs: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn delete_download(
    State(state): State<AppState>,
    Path(song_id): Path<String>,
) -> StatusCode {
    let id = RecordId::new(state.user_id.clone(), SongId::from(song_id));
    match state.store.delete(&id).await {
        Ok(true) => {
            let _ = state.player.send(PlayerCommand::DownloadsChanged).await;
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Streams a downloaded blob back to the page's audio element.
async fn stream_download(
    State(state): State<AppState>,
    Path(song_id): Path<String>,
) -> Response {
    let id = RecordId::new(state.user_id.clone(), SongId::from(song_id));
    let record = match state.store.find(&id.user_id, &id.song_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Error looking up {}: {}", id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let path = match state.store.blob_path(&id).await {
        Ok(path) => path,
        Err(StoreError::NotFound(_)) => return StatusCode::NOT_FOUND.into_response(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let stream = async_stream::try_stream! {
        let mut file = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    };

    AudioStreamResponse {
        stream: Box::pin(stream),
        content_type: record
            .content_type
            .unwrap_or_else(|| "audio/mpeg".to_string()),
        len: record.size_bytes,
    }
    .into_response()
}

struct AudioStreamResponse {
    stream: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    content_type: String,
    len: u64,
}

impl IntoResponse for AudioStreamResponse {
    fn into_response(self) -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, self.content_type)
            .header(header::CONTENT_LENGTH, self.len)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(self.stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

// --- Backend Proxies ---

/// Suggestions for the search box.
async fn search_songs(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let query = params.get("q").map(String::as_str).unwrap_or_default();
    match state.backend.search(query).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => {
            error!("Error fetching suggestions: {:#}", e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[derive(Deserialize)]
struct LyricsQuery {
    title: Option<String>,
    artist: Option<String>,
    song_id: Option<String>,
}

/// Fetches timed lyrics. With `song_id`, also hands them to the player so
/// it can follow along.
async fn lyrics(State(state): State<AppState>, Query(query): Query<LyricsQuery>) -> impl IntoResponse {
    let (Some(title), Some(artist)) = (query.title, query.artist) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "message": "Title and artist are required" })),
        )
            .into_response();
    };

    match state.backend.lyrics(&title, &artist).await {
        Ok(Some(sheet)) => {
            if let Some(song_id) = query.song_id {
                let _ = state
                    .player
                    .send(PlayerCommand::AttachLyrics {
                        song_id: SongId::from(song_id),
                        sheet: sheet.clone(),
                    })
                    .await;
            }
            Json(serde_json::json!({ "lyrics": sheet.lines() })).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "message": "Lyrics not found" })),
        )
            .into_response(),
        Err(e) => {
            error!("Error fetching lyrics: {:#}", e);
            (StatusCode::BAD_GATEWAY, "Error fetching lyrics").into_response()
        }
    }
}

#[derive(Deserialize)]
struct ConnectivityReport {
    online: bool,
}

/// The page's own view of the network (navigator.onLine).
async fn report_connectivity(
    State(state): State<AppState>,
    Json(report): Json<ConnectivityReport>,
) -> StatusCode {
    let was_online = state.online_hint.swap(report.online, Ordering::Relaxed);
    if was_online != report.online {
        info!("Page reports {}", if report.online { "online" } else { "offline" });
    }
    StatusCode::NO_CONTENT
}

// --- Offline Fallback ---

/// Every other GET goes through the asset cache: cached copy first, then
/// the network.
async fn offline_fallback(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    let key = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    match state.assets.respond(key).await {
        Ok(resp) => {
            let mut builder = Response::builder().status(StatusCode::OK);
            if let Some(content_type) = resp.asset.content_type.as_deref() {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            if resp.source == AssetSource::Cache {
                builder = builder.header("x-offline-cache", state.assets.name());
            }
            builder
                .body(Body::from(resp.asset.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            warn!("{}", e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
