//! Per-user store of downloaded audio.
//!
//! Layout under the data directory:
//!
//! ```text
//! audioFiles/
//!   index.json        records in insertion order
//!   blobs/00000000.audio
//! ```
//!
//! The index is the source of truth. A blob is written and renamed into
//! place before the index that references it is committed, so a crash or a
//! failed fetch never leaves a record pointing at a partial file.

use crate::error::StoreError;
use crate::fetch::{Fetch, Fetched};
use crate::track::{RecordId, SongId, Track, UserId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};


pub const STORE_NAME: &str = "audioFiles";
const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const PARTIAL_SUFFIX: &str = "part";
const SCHEMA_VERSION: u32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioRecord {
    pub id: RecordId,
    pub title: String,
    pub artist: String,
    pub user_id: UserId,
    pub size_bytes: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    pub saved_at_ms: u64,
    blob_file: String,
}

impl AudioRecord {
    pub fn song_id(&self) -> &SongId {
        &self.id.song_id
    }
}

#[derive(Debug, PartialEq)]
pub enum SaveOutcome {
    Saved(AudioRecord),
    /// The user already has this song; nothing was written.
    AlreadyDownloaded(AudioRecord),
}

#[derive(Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    next_blob: u64,
    records: Vec<AudioRecord>,
}

struct Database {
    dir: PathBuf,
    next_blob: u64,
    records: Vec<AudioRecord>,
    // user -> positions in `records`, ascending
    by_user: HashMap<UserId, Vec<usize>>,
}

fn now_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

impl Database {
    async fn open(root: &Path) -> Result<Self, StoreError> {
        let dir = root.join(STORE_NAME);
        fs::create_dir_all(dir.join(BLOB_DIR)).await?;

        let index_path = dir.join(INDEX_FILE);
        let (index, fresh) = match fs::read(&index_path).await {
            Ok(raw) => (serde_json::from_slice::<IndexFile>(&raw)?, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (IndexFile::default(), true),
            Err(e) => return Err(e.into()),
        };

        let mut db = Database {
            dir,
            next_blob: index.next_blob,
            records: index.records,
            by_user: HashMap::new(),
        };
        db.reindex();
        db.sweep_partials().await;

        if fresh || index.version < SCHEMA_VERSION {
            info!("Initializing {} store (schema v{})", STORE_NAME, SCHEMA_VERSION);
            db.commit().await?;
        }
        debug!("Opened {} with {} records", STORE_NAME, db.records.len());
        Ok(db)
    }

    fn reindex(&mut self) {
        self.by_user.clear();
        for (pos, record) in self.records.iter().enumerate() {
            self.by_user
                .entry(record.user_id.clone())
                .or_default()
                .push(pos);
        }
    }

    fn for_user<'a>(&'a self, user_id: &UserId) -> impl Iterator<Item = &'a AudioRecord> + 'a {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .map(|&pos| &self.records[pos])
    }

    fn find(&self, user_id: &UserId, song_id: &SongId) -> Option<&AudioRecord> {
        self.for_user(user_id).find(|r| &r.id.song_id == song_id)
    }

    fn get(&self, id: &RecordId) -> Option<&AudioRecord> {
        self.find(&id.user_id, &id.song_id)
    }

    fn blob_path(&self, record: &AudioRecord) -> PathBuf {
        self.dir.join(BLOB_DIR).join(&record.blob_file)
    }

    /// Removes blobs left behind by an interrupted write.
    async fn sweep_partials(&self) {
        let Ok(mut entries) = fs::read_dir(self.dir.join(BLOB_DIR)).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == PARTIAL_SUFFIX) {
                warn!("Removing partial download {}", path.display());
                let _ = fs::remove_file(&path).await;
            }
        }
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let index = IndexFile {
            version: SCHEMA_VERSION,
            next_blob: self.next_blob,
            records: self.records.clone(),
        };
        let raw = serde_json::to_vec_pretty(&index)?;
        let path = self.dir.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn insert(
        &mut self,
        track: &Track,
        user_id: &UserId,
        fetched: Fetched,
    ) -> Result<AudioRecord, StoreError> {
        let blob_file = format!("{:08}.audio", self.next_blob);
        let blob_path = self.dir.join(BLOB_DIR).join(&blob_file);
        let partial = blob_path.with_extension(PARTIAL_SUFFIX);

        if let Err(e) = fs::write(&partial, &fetched.body).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, &blob_path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }

        let record = AudioRecord {
            id: RecordId::new(user_id.clone(), track.id.clone()),
            title: track.title.clone(),
            artist: track.artist.clone(),
            user_id: user_id.clone(),
            size_bytes: fetched.body.len() as u64,
            content_type: fetched.content_type,
            saved_at_ms: now_timestamp_millis(),
            blob_file,
        };
        self.next_blob += 1;
        self.records.push(record.clone());
        self.reindex();

        if let Err(e) = self.commit().await {
            self.records.pop();
            self.reindex();
            let _ = fs::remove_file(&blob_path).await;
            return Err(e);
        }
        Ok(record)
    }
}

/// Durable, per-user cache of downloaded tracks.
pub struct LocalAudioStore {
    root: PathBuf,
    fetcher: Arc<dyn Fetch>,
    db: OnceCell<Mutex<Database>>,
}

impl LocalAudioStore {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            root: root.into(),
            fetcher,
            db: OnceCell::new(),
        }
    }

    /// Opens (and on first use creates) the store. Safe to call repeatedly;
    /// concurrent callers wait on the same initialization.
    pub async fn open(&self) -> Result<(), StoreError> {
        self.database().await.map(|_| ())
    }

    async fn database(&self) -> Result<&Mutex<Database>, StoreError> {
        self.db
            .get_or_try_init(|| async {
                Database::open(&self.root).await.map(Mutex::new)
            })
            .await
            .map_err(|e| {
                error!("Error opening {} store: {}", STORE_NAME, e);
                e
            })
    }

    /// Downloads `track` for `user_id`. A second download of the same song
    /// by the same user is reported as [`SaveOutcome::AlreadyDownloaded`].
    pub async fn save(&self, track: &Track, user_id: &UserId) -> Result<SaveOutcome, StoreError> {
        let db = self.database().await?;

        if let Some(existing) = db.lock().await.find(user_id, &track.id).cloned() {
            info!("{} already exists in downloads for user {}", track.title, user_id);
            return Ok(SaveOutcome::AlreadyDownloaded(existing));
        }

        let fetched = match self.fetcher.fetch(&track.source_url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("Error fetching audio file: {}", e);
                return Err(e.into());
            }
        };

        let mut db = db.lock().await;
        // Another save for the same song may have finished while we fetched.
        if let Some(existing) = db.find(user_id, &track.id).cloned() {
            info!("{} already exists in downloads for user {}", track.title, user_id);
            return Ok(SaveOutcome::AlreadyDownloaded(existing));
        }

        match db.insert(track, user_id, fetched).await {
            Ok(record) => {
                info!(
                    "Saved {} to downloads for user {} ({} bytes)",
                    record.title, user_id, record.size_bytes
                );
                Ok(SaveOutcome::Saved(record))
            }
            Err(e) => {
                error!("Error saving {} to downloads: {}", track.title, e);
                Err(e)
            }
        }
    }

    /// All records of `user_id`, oldest download first.
    pub async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<AudioRecord>, StoreError> {
        let db = self.database().await?;
        let db = db.lock().await;
        Ok(db.for_user(user_id).cloned().collect())
    }

    pub async fn find(
        &self,
        user_id: &UserId,
        song_id: &SongId,
    ) -> Result<Option<AudioRecord>, StoreError> {
        let db = self.database().await?;
        let db = db.lock().await;
        Ok(db.find(user_id, song_id).cloned())
    }

    pub async fn read_blob(&self, id: &RecordId) -> Result<Bytes, StoreError> {
        let path = self.blob_path(id).await?;
        let raw = fs::read(&path).await.map_err(|e| {
            error!("Error reading blob for {}: {}", id, e);
            e
        })?;
        Ok(Bytes::from(raw))
    }

    /// Location of the blob on disk, for streaming it out.
    pub async fn blob_path(&self, id: &RecordId) -> Result<PathBuf, StoreError> {
        let db = self.database().await?;
        let db = db.lock().await;
        db.get(id)
            .map(|record| db.blob_path(record))
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Removes a record and its blob. Returns `false` when there was nothing
    /// to delete.
    pub async fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        let db = self.database().await?;
        let mut db = db.lock().await;

        let Some(pos) = db.records.iter().position(|r| &r.id == id) else {
            warn!("Error deleting song {}: not in downloads", id);
            return Ok(false);
        };

        let record = db.records.remove(pos);
        db.reindex();
        if let Err(e) = db.commit().await {
            error!("Error deleting song {}: {}", id, e);
            db.records.insert(pos, record);
            db.reindex();
            return Err(e);
        }

        let blob_path = db.blob_path(&record);
        if let Err(e) = fs::remove_file(&blob_path).await {
            warn!("Deleted {} but could not remove {}: {}", id, blob_path.display(), e);
        }
        info!("Song with ID {} deleted successfully", id);
        Ok(true)
    }
}
