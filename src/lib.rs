//! Offline download and playback for the music app.
//!
//! A local companion service: it keeps per-user downloaded audio on disk,
//! owns the playback queue and player state, caches the app shell for
//! offline use and drives the browser's `<audio>` element over an event
//! stream.

pub mod api;
pub mod asset_cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod fetch;
pub mod lyrics;
pub mod player;
pub mod queue;
pub mod server;
pub mod store;
pub mod track;
