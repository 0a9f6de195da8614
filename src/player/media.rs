use super::PlayerEvent;
use crate::error::MediaError;
use crate::track::{RecordId, SongId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Path under which the service streams a downloaded track back to the page.
pub fn downloaded_audio_url(song_id: &SongId) -> String {
    format!("/downloads/{}/audio", song_id)
}

#[derive(Clone, Debug, PartialEq)]
pub enum MediaSource {
    Downloaded(RecordId),
    Network(String),
}

impl MediaSource {
    pub fn url(&self) -> String {
        match self {
            MediaSource::Downloaded(record) => downloaded_audio_url(&record.song_id),
            MediaSource::Network(url) => url.clone(),
        }
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, MediaSource::Downloaded(_))
    }
}

/// What the element itself tells us happened.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediaReport {
    TimeUpdate {
        current: f64,
        #[serde(default)]
        duration: Option<f64>,
    },
    Paused {
        paused: bool,
    },
    Ended,
    Error {
        message: String,
    },
}

/// The single playback element. Mirrors the subset of the HTML media
/// element API the controller needs.
pub trait MediaElement: Send {
    fn load(&mut self, source: &MediaSource);
    /// Starts playback. Rejections leave the element paused.
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    fn is_paused(&self) -> bool;
    fn current_time(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn set_current_time(&mut self, seconds: f64);
    fn set_volume(&mut self, level: f64);
    /// Folds an element report into local state.
    fn sync(&mut self, _report: &MediaReport) {}
}

/// Instructions for the `<audio>` element on the page.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MediaDirective {
    Load { url: String },
    Play,
    Pause,
    Seek { seconds: f64 },
    Volume { level: f64 },
}

/// An `<audio>` element living in the browser page, driven over the event
/// stream. Keeps a mirror of the element's state, updated from reports.
pub struct RemoteMediaElement {
    events: broadcast::Sender<PlayerEvent>,
    // preview slot on the page; `None` is the main player element
    slot: Option<usize>,
    src: Option<String>,
    paused: bool,
    current: f64,
    duration: Option<f64>,
    volume: f64,
    // last error the page reported for the loaded source
    failed: Option<String>,
}

impl RemoteMediaElement {
    pub fn new(events: broadcast::Sender<PlayerEvent>) -> Self {
        Self {
            events,
            slot: None,
            src: None,
            paused: true,
            current: 0.0,
            duration: None,
            volume: 1.0,
            failed: None,
        }
    }

    /// One of the page's preview players, addressed by slot.
    pub fn preview(events: broadcast::Sender<PlayerEvent>, slot: usize) -> Self {
        Self {
            slot: Some(slot),
            ..Self::new(events)
        }
    }

    pub fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    fn send(&self, directive: MediaDirective) {
        let event = match self.slot {
            Some(slot) => PlayerEvent::Preview { slot, directive },
            None => PlayerEvent::Media { directive },
        };
        if self.events.send(event).is_err() {
            debug!("No page attached, media directive dropped");
        }
    }
}

impl MediaElement for RemoteMediaElement {
    fn load(&mut self, source: &MediaSource) {
        let url = source.url();
        self.src = Some(url.clone());
        self.paused = true;
        self.current = 0.0;
        self.duration = None;
        self.failed = None;
        self.send(MediaDirective::Load { url });
    }

    fn play(&mut self) -> Result<(), MediaError> {
        if self.src.is_none() {
            return Err(MediaError::NoSource);
        }
        if let Some(message) = &self.failed {
            return Err(MediaError::Rejected(message.clone()));
        }
        if self.events.receiver_count() == 0 {
            return Err(MediaError::NoOutput);
        }
        self.send(MediaDirective::Play);
        self.paused = false;
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
        self.send(MediaDirective::Pause);
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn current_time(&self) -> f64 {
        self.current
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn set_current_time(&mut self, seconds: f64) {
        self.current = seconds;
        self.send(MediaDirective::Seek { seconds });
    }

    fn set_volume(&mut self, level: f64) {
        self.volume = level;
        self.send(MediaDirective::Volume { level });
    }

    fn sync(&mut self, report: &MediaReport) {
        match report {
            MediaReport::TimeUpdate { current, duration } => {
                self.current = *current;
                if duration.is_some() {
                    self.duration = *duration;
                }
            }
            MediaReport::Paused { paused } => self.paused = *paused,
            MediaReport::Ended => self.paused = true,
            MediaReport::Error { message } => {
                self.paused = true;
                self.failed = Some(message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_needs_a_source_and_a_listener() {
        let (tx, _) = broadcast::channel(8);
        let mut element = RemoteMediaElement::new(tx.clone());
        assert_eq!(element.play(), Err(MediaError::NoSource));

        element.load(&MediaSource::Network("/a.mp3".into()));
        assert_eq!(element.play(), Err(MediaError::NoOutput));
        assert!(element.is_paused());

        let mut page = tx.subscribe();
        element.play().unwrap();
        assert!(!element.is_paused());
        match page.try_recv().unwrap() {
            PlayerEvent::Media { directive } => assert_eq!(directive, MediaDirective::Play),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn a_failed_source_is_rejected_until_reloaded() {
        let (tx, _page) = broadcast::channel(8);
        let mut element = RemoteMediaElement::new(tx);
        element.load(&MediaSource::Network("/broken.flac".into()));
        element.sync(&MediaReport::Error {
            message: "format not supported".into(),
        });

        assert_eq!(
            element.play(),
            Err(MediaError::Rejected("format not supported".into()))
        );
        assert!(element.is_paused());

        element.load(&MediaSource::Network("/ok.mp3".into()));
        assert_eq!(element.play(), Ok(()));
    }

    #[test]
    fn preview_elements_tag_their_directives() {
        let (tx, mut page) = broadcast::channel(8);
        let mut element = RemoteMediaElement::preview(tx, 3);
        element.load(&MediaSource::Network("/clip.mp3".into()));

        match page.try_recv().unwrap() {
            PlayerEvent::Preview { slot, directive } => {
                assert_eq!(slot, 3);
                assert_eq!(
                    directive,
                    MediaDirective::Load {
                        url: "/clip.mp3".into()
                    }
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reports_update_the_mirror() {
        let (tx, _) = broadcast::channel(8);
        let mut element = RemoteMediaElement::new(tx);
        element.sync(&MediaReport::TimeUpdate {
            current: 12.5,
            duration: Some(200.0),
        });
        assert_eq!(element.current_time(), 12.5);
        assert_eq!(element.duration(), Some(200.0));

        element.sync(&MediaReport::Paused { paused: false });
        assert!(!element.is_paused());
        element.sync(&MediaReport::Ended);
        assert!(element.is_paused());
    }

    #[test]
    fn downloaded_sources_point_at_the_local_stream() {
        let id = RecordId::new("u".into(), "42".into());
        assert_eq!(MediaSource::Downloaded(id).url(), "/downloads/42/audio");
    }

    #[test]
    fn reports_parse_from_page_json() {
        let report: MediaReport =
            serde_json::from_str(r#"{"event":"time_update","current":3.0,"duration":90.0}"#).unwrap();
        assert_eq!(
            report,
            MediaReport::TimeUpdate {
                current: 3.0,
                duration: Some(90.0)
            }
        );
        let ended: MediaReport = serde_json::from_str(r#"{"event":"ended"}"#).unwrap();
        assert_eq!(ended, MediaReport::Ended);
    }
}
