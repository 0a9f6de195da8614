use crate::lyrics::{LyricLine, LyricSheet};
use crate::track::{PlaylistId, SongId, Track};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Suggestion lists never grow past this.
pub const SEARCH_LIMIT: usize = 10;
/// Shorter queries are answered locally with no results.
pub const SEARCH_MIN_CHARS: usize = 2;
/// Playlist id reported for plays outside any playlist.
const NO_PLAYLIST: &str = "0";

// --- Backend API Models ---

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SongMetadata {
    pub song_id: SongId,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    pub file_url: String,
    #[serde(default)]
    pub cover_image_url: Option<String>,
    #[serde(default)]
    pub lyrics_url: Option<String>,
}

impl SongMetadata {
    pub fn into_track(self, playlist_id: Option<PlaylistId>) -> Track {
        Track {
            id: self.song_id,
            title: self.title,
            artist: self.artist.unwrap_or_default(),
            source_url: self.file_url,
            playlist_id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SongSummary {
    pub song_id: SongId,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
}

#[derive(Deserialize)]
struct LyricsResponse {
    #[serde(default)]
    lyrics: Vec<LyricLine>,
}

/// Receives play events. Implemented by the backend client; the player only
/// sees this seam.
#[async_trait]
pub trait PlayReporter: Send + Sync {
    async fn report_play(&self, playlist_id: Option<&PlaylistId>, song_id: &SongId)
        -> anyhow::Result<()>;
}

// --- Client ---

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetches track metadata via `GET /songs/{id}`.
    pub async fn song(&self, song_id: &SongId) -> anyhow::Result<SongMetadata> {
        let url = format!("{}/songs/{}", self.base_url, song_id);
        let song = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json::<SongMetadata>()
            .await
            .with_context(|| format!("decoding song {}", song_id))?;
        Ok(song)
    }

    /// Timed lyrics via `GET /lyrics`. `None` when the backend has none.
    pub async fn lyrics(&self, title: &str, artist: &str) -> anyhow::Result<Option<LyricSheet>> {
        let url = format!("{}/lyrics", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("title", title), ("artist", artist)])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("No lyrics for {} - {}", artist, title);
            return Ok(None);
        }

        let body = resp.error_for_status()?.json::<LyricsResponse>().await?;
        if body.lyrics.is_empty() {
            return Ok(None);
        }
        Ok(Some(LyricSheet::new(body.lyrics)))
    }

    /// Suggestions for the search box, capped at [`SEARCH_LIMIT`].
    pub async fn search(&self, query: &str) -> anyhow::Result<Vec<SongSummary>> {
        let query = query.trim();
        if query.chars().count() < SEARCH_MIN_CHARS {
            return Ok(Vec::new());
        }

        let url = format!("{}/search", self.base_url);
        let mut results = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("q", query)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<SongSummary>>()
            .await?;
        results.truncate(SEARCH_LIMIT);
        Ok(results)
    }
}

#[async_trait]
impl PlayReporter for BackendClient {
    /// Increments the play count and records play history.
    async fn report_play(
        &self,
        playlist_id: Option<&PlaylistId>,
        song_id: &SongId,
    ) -> anyhow::Result<()> {
        let playlist = playlist_id.map(PlaylistId::as_str).unwrap_or(NO_PLAYLIST);
        let url = format!("{}/playlist/{}/songs/{}", self.base_url, playlist, song_id);
        self.client
            .post(&url)
            .header("Content-Type", "application/json")
            .send()
            .await?
            .error_for_status()?;
        debug!("Reported play of {} in playlist {}", song_id, playlist);
        Ok(())
    }
}
