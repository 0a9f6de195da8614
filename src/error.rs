use crate::track::RecordId;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to fetch {url}: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

impl FetchError {
    pub fn new(url: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures of the local audio store. Duplicates are not errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store index is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("no downloaded audio for {0}")]
    NotFound(RecordId),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache install aborted: {0}")]
    Install(#[from] FetchError),
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache manifest is corrupt: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Why the media element refused to start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MediaError {
    #[error("no source loaded")]
    NoSource,
    #[error("no audio output attached")]
    NoOutput,
    #[error("playback rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("track index {index} out of range for queue of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("player task has stopped")]
    Stopped,
}
