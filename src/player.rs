//! The player controller: the only code that touches the media element.
//!
//! UI intents arrive as [`PlayerCommand`]s on a channel and are applied one
//! at a time by [`PlayerController::run`]. State changes go out as
//! [`PlayerEvent`]s on a broadcast channel that the page subscribes to.

pub mod exclusive;
pub mod media;

use crate::api::PlayReporter;
use crate::error::PlayerError;
use crate::lyrics::LyricSheet;
use crate::queue::{Advance, PlaybackQueue, RepeatMode};
use crate::store::{LocalAudioStore, SaveOutcome};
use crate::track::{format_time, SongId, Track, UserId};
use media::{downloaded_audio_url, MediaDirective, MediaElement, MediaReport, MediaSource};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};


/// Where the current queue came from. Plays are only reported online.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackContext {
    #[default]
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    Media {
        directive: MediaDirective,
    },
    Preview {
        slot: usize,
        directive: MediaDirective,
    },
    NowPlaying {
        index: usize,
        title: String,
        artist: String,
        downloaded: bool,
    },
    PlayState {
        playing: bool,
    },
    Progress {
        current: f64,
        duration: Option<f64>,
        fraction: f64,
        elapsed: String,
        total: Option<String>,
    },
    Queue {
        tracks: Vec<Track>,
        cursor: Option<usize>,
        shuffle: bool,
        repeat: RepeatMode,
        context: PlaybackContext,
    },
    Lyric {
        line: Option<usize>,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
}

/// Per-page playback state. Not persisted.
#[derive(Clone, Debug, Serialize)]
pub struct PlayerSession {
    pub is_playing: bool,
    pub current_track: Option<Track>,
    pub volume: f64,
    pub progress_fraction: f64,
}

impl Default for PlayerSession {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_track: None,
            volume: 1.0,
            progress_fraction: 0.0,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PlayerSnapshot {
    pub session: PlayerSession,
    pub cursor: Option<usize>,
    pub queue_len: usize,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub context: PlaybackContext,
}

pub enum PlayerCommand {
    Play(usize),
    TogglePlayPause,
    Next,
    Previous,
    Seek(f64),
    SetVolume(f64),
    ToggleShuffle,
    CycleRepeat,
    /// `at` is the page's timestamp for the report, when it sent one.
    Media {
        report: MediaReport,
        at: Option<f64>,
    },
    LoadQueue {
        tracks: Vec<Track>,
        context: PlaybackContext,
    },
    ShowDownloads,
    DownloadsChanged,
    DownloadCurrent,
    AttachLyrics {
        song_id: SongId,
        sheet: LyricSheet,
    },
    Snapshot(oneshot::Sender<PlayerSnapshot>),
}

/// Cloneable sender side used by the HTTP handlers.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PlayerCommand>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: PlayerCommand) -> Result<(), PlayerError> {
        self.tx.send(command).await.map_err(|_| PlayerError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<PlayerSnapshot, PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| PlayerError::Stopped)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub struct PlayerController<M> {
    media: M,
    queue: PlaybackQueue,
    session: PlayerSession,
    context: PlaybackContext,
    user_id: UserId,
    store: Arc<LocalAudioStore>,
    reporter: Arc<dyn PlayReporter>,
    events: broadcast::Sender<PlayerEvent>,
    lyrics: Option<LyricSheet>,
    lyric_line: Option<usize>,
    last_report_at: Option<f64>,
    rng: StdRng,
}

impl<M: MediaElement> PlayerController<M> {
    pub fn new(
        media: M,
        user_id: UserId,
        store: Arc<LocalAudioStore>,
        reporter: Arc<dyn PlayReporter>,
        events: broadcast::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            media,
            queue: PlaybackQueue::default(),
            session: PlayerSession::default(),
            context: PlaybackContext::default(),
            user_id,
            store,
            reporter,
            events,
            lyrics: None,
            lyric_line: None,
            last_report_at: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replaces the shuffle randomness, mainly for reproducible tests.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    pub fn session(&self) -> &PlayerSession {
        &self.session
    }

    pub fn context(&self) -> PlaybackContext {
        self.context
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            session: self.session.clone(),
            cursor: self.queue.cursor(),
            queue_len: self.queue.len(),
            shuffle: self.queue.is_shuffled(),
            repeat: self.queue.repeat_mode(),
            context: self.context,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers just means no page is open.
        let _ = self.events.send(event);
    }

    fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(PlayerEvent::Notice {
            level,
            message: message.into(),
        });
    }

    fn emit_queue(&self) {
        self.emit(PlayerEvent::Queue {
            tracks: self.queue.tracks().to_vec(),
            cursor: self.queue.cursor(),
            shuffle: self.queue.is_shuffled(),
            repeat: self.queue.repeat_mode(),
            context: self.context,
        });
    }

    fn set_playing(&mut self, playing: bool) {
        self.session.is_playing = playing;
        self.emit(PlayerEvent::PlayState { playing });
    }

    /// Starts the element and takes the playing flag from what it did.
    fn start_media(&mut self) {
        if let Err(e) = self.media.play() {
            warn!("Error playing the audio: {}", e);
        }
        let playing = !self.media.is_paused();
        self.set_playing(playing);
    }

    async fn resolve_source(store: &LocalAudioStore, user_id: &UserId, track: &Track) -> MediaSource {
        match store.find(user_id, &track.id).await {
            Ok(Some(record)) => MediaSource::Downloaded(record.id),
            Ok(None) => MediaSource::Network(track.source_url.clone()),
            Err(e) => {
                warn!("Download lookup for {} failed, streaming instead: {}", track.id, e);
                MediaSource::Network(track.source_url.clone())
            }
        }
    }

    fn report_play(&self, track: &Track) {
        let reporter = self.reporter.clone();
        let song_id = track.id.clone();
        let playlist_id = track.playlist_id.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.report_play(playlist_id.as_ref(), &song_id).await {
                warn!("Error incrementing play count for {}: {:#}", song_id, e);
            }
        });
    }

    pub async fn play(&mut self, index: usize) -> Result<(), PlayerError> {
        let len = self.queue.len();
        let track = match self.queue.select(index).and_then(|i| self.queue.get(i)) {
            Some(track) => track.clone(),
            None => return Err(PlayerError::OutOfRange { index, len }),
        };

        let source = Self::resolve_source(&self.store, &self.user_id, &track).await;
        self.media.load(&source);
        self.session.current_track = Some(track.clone());
        self.session.progress_fraction = 0.0;
        self.lyrics = None;
        self.lyric_line = None;

        info!("Now Playing: {} - {}", track.artist, track.title);
        self.emit(PlayerEvent::NowPlaying {
            index,
            title: track.title.clone(),
            artist: track.artist.clone(),
            downloaded: source.is_downloaded(),
        });
        self.start_media();

        if self.context == PlaybackContext::Online {
            self.report_play(&track);
        }
        Ok(())
    }

    pub fn toggle_play_pause(&mut self) {
        if self.session.is_playing {
            self.media.pause();
            let playing = !self.media.is_paused();
            self.set_playing(playing);
        } else {
            self.start_media();
        }
    }

    pub fn seek(&mut self, fraction: f64) {
        let fraction = clamp_unit(fraction);
        match self.media.duration().filter(|d| d.is_finite() && *d > 0.0) {
            Some(duration) => {
                self.media.set_current_time(fraction * duration);
                self.session.progress_fraction = fraction;
            }
            None => debug!("Seek ignored, duration not known yet"),
        }
    }

    pub fn set_volume(&mut self, level: f64) {
        let level = clamp_unit(level);
        self.media.set_volume(level);
        self.session.volume = level;
    }

    pub async fn next(&mut self) -> Result<(), PlayerError> {
        match self.queue.next(Advance::Skip) {
            Some(index) => self.play(index).await,
            None => Ok(()),
        }
    }

    pub async fn previous(&mut self) -> Result<(), PlayerError> {
        match self.queue.previous() {
            Some(index) => self.play(index).await,
            None => Ok(()),
        }
    }

    /// End-of-track: the queue decides where to go, then we play it.
    pub async fn on_ended(&mut self) -> Result<(), PlayerError> {
        match self.queue.next(Advance::Ended) {
            Some(index) => self.play(index).await,
            None => {
                self.set_playing(false);
                Ok(())
            }
        }
    }

    pub async fn toggle_shuffle(&mut self) -> Result<(), PlayerError> {
        let start = self.queue.toggle_shuffle(&mut self.rng);
        debug!("Shuffle {}", if self.queue.is_shuffled() { "on" } else { "off" });
        self.emit_queue();
        match start {
            Some(index) => self.play(index).await,
            None => Ok(()),
        }
    }

    pub fn cycle_repeat(&mut self) -> RepeatMode {
        let mode = self.queue.cycle_repeat();
        debug!("Repeat mode {:?}", mode);
        self.emit_queue();
        mode
    }

    pub fn on_time_update(&mut self, current: f64, duration: Option<f64>) {
        let fraction = match duration {
            Some(d) if d.is_finite() && d > 0.0 => clamp_unit(current / d),
            _ => 0.0,
        };
        self.session.progress_fraction = fraction;
        self.emit(PlayerEvent::Progress {
            current,
            duration,
            fraction,
            elapsed: format_time(current),
            total: duration.map(format_time),
        });

        if let Some(sheet) = &self.lyrics {
            let line = sheet.active_line(current);
            if line != self.lyric_line {
                self.lyric_line = line;
                self.emit(PlayerEvent::Lyric { line });
            }
        }
    }

    pub async fn on_media_report(&mut self, report: MediaReport) -> Result<(), PlayerError> {
        self.media.sync(&report);
        match report {
            MediaReport::TimeUpdate { current, duration } => {
                self.on_time_update(current, duration.or(self.media.duration()));
            }
            MediaReport::Paused { .. } => {
                let playing = !self.media.is_paused();
                if playing != self.session.is_playing {
                    self.set_playing(playing);
                }
            }
            MediaReport::Ended => return self.on_ended().await,
            MediaReport::Error { message } => {
                warn!("Media element error: {}", message);
                let playing = !self.media.is_paused();
                self.set_playing(playing);
            }
        }
        Ok(())
    }

    /// True when the page stamped this report earlier than one already
    /// applied. Unstamped reports are always applied.
    fn is_stale_report(&mut self, at: Option<f64>) -> bool {
        let Some(at) = at.filter(|t| t.is_finite()) else {
            return false;
        };
        if self.last_report_at.is_some_and(|last| at < last) {
            return true;
        }
        self.last_report_at = Some(at);
        false
    }

    /// Rebuilds the queue for a new view.
    pub fn load_queue(&mut self, tracks: Vec<Track>, context: PlaybackContext) {
        info!("Loaded {} tracks ({:?})", tracks.len(), context);
        self.queue.replace(tracks);
        self.context = context;
        self.emit_queue();
    }

    /// Switches to the downloads view: the queue becomes the user's stored
    /// tracks, played from local blobs.
    pub async fn show_downloads(&mut self) {
        let records = match self.store.list_for_user(&self.user_id).await {
            Ok(records) => records,
            Err(e) => {
                error!("Error loading downloaded songs: {}", e);
                self.notice(NoticeLevel::Error, "Could not load downloaded songs.");
                return;
            }
        };

        let tracks = records
            .into_iter()
            .map(|record| Track {
                source_url: downloaded_audio_url(record.song_id()),
                id: record.id.song_id,
                title: record.title,
                artist: record.artist,
                playlist_id: None,
            })
            .collect();
        self.load_queue(tracks, PlaybackContext::Offline);
    }

    pub fn attach_lyrics(&mut self, song_id: &SongId, sheet: LyricSheet) {
        let is_current = self
            .session
            .current_track
            .as_ref()
            .is_some_and(|t| &t.id == song_id);
        if !is_current {
            debug!("Lyrics for {} arrived after the track changed", song_id);
            return;
        }
        self.lyric_line = sheet.active_line(self.media.current_time());
        self.lyrics = Some(sheet);
        self.emit(PlayerEvent::Lyric {
            line: self.lyric_line,
        });
    }

    /// Saves the current track for offline use in the background. The
    /// outcome is published as a notice.
    pub fn download_current(&self) -> Option<JoinHandle<()>> {
        let Some(track) = self.queue.current().cloned() else {
            self.notice(NoticeLevel::Warning, "Nothing is playing.");
            return None;
        };
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let events = self.events.clone();

        Some(tokio::spawn(async move {
            let (level, message) = match store.save(&track, &user_id).await {
                Ok(SaveOutcome::Saved(_)) => (
                    NoticeLevel::Info,
                    format!("Saved {} to Downloads.", track.title),
                ),
                Ok(SaveOutcome::AlreadyDownloaded(_)) => (
                    NoticeLevel::Warning,
                    format!("{} already exists in downloads.", track.title),
                ),
                Err(e) => (
                    NoticeLevel::Error,
                    format!("Could not download {}: {}", track.title, e),
                ),
            };
            let _ = events.send(PlayerEvent::Notice { level, message });
        }))
    }

    pub async fn dispatch(&mut self, command: PlayerCommand) {
        let result = match command {
            PlayerCommand::Play(index) => self.play(index).await,
            PlayerCommand::TogglePlayPause => {
                self.toggle_play_pause();
                Ok(())
            }
            PlayerCommand::Next => self.next().await,
            PlayerCommand::Previous => self.previous().await,
            PlayerCommand::Seek(fraction) => {
                self.seek(fraction);
                Ok(())
            }
            PlayerCommand::SetVolume(level) => {
                self.set_volume(level);
                Ok(())
            }
            PlayerCommand::ToggleShuffle => self.toggle_shuffle().await,
            PlayerCommand::CycleRepeat => {
                self.cycle_repeat();
                Ok(())
            }
            PlayerCommand::Media { report, at } => {
                if self.is_stale_report(at) {
                    debug!("Dropping out-of-order media report {:?}", report);
                    Ok(())
                } else {
                    self.on_media_report(report).await
                }
            }
            PlayerCommand::LoadQueue { tracks, context } => {
                self.load_queue(tracks, context);
                Ok(())
            }
            PlayerCommand::ShowDownloads => {
                self.show_downloads().await;
                Ok(())
            }
            PlayerCommand::DownloadsChanged => {
                if self.context == PlaybackContext::Offline {
                    self.show_downloads().await;
                }
                Ok(())
            }
            PlayerCommand::DownloadCurrent => {
                self.download_current();
                Ok(())
            }
            PlayerCommand::AttachLyrics { song_id, sheet } => {
                self.attach_lyrics(&song_id, sheet);
                Ok(())
            }
            PlayerCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Player command failed: {}", e);
            self.notice(NoticeLevel::Warning, e.to_string());
        }
    }

    /// Applies commands until every [`PlayerHandle`] is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<PlayerCommand>) {
        info!("Player ready for user {}", self.user_id);
        while let Some(command) = commands.recv().await {
            self.dispatch(command).await;
        }
        debug!("Player command channel closed");
    }
}
