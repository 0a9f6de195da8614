//! Versioned cache of the static shell assets.
//!
//! Each named cache is a directory holding the asset bodies and a
//! `manifest.json` mapping request paths to files. A cache exists once its
//! manifest does, and entries only become visible when the manifest that
//! lists them is renamed into place.

use crate::error::{CacheError, FetchError};
use crate::fetch::Fetch;
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};


pub const DEFAULT_CACHE_NAME: &str = "music-app-cache-v1";

/// Shell assets needed to render the downloads view with no network.
pub const DEFAULT_ASSETS: &[&str] = &[
    "/bootstrap/css/bootstrap.min.css",
    "/bootstrap/js/bootstrap.bundle.min.js",
    "/fontawesome/css/all.min.css",
    "/js/downloadedSongsHandler.js",
    "/fontawesome/webfonts/fa-solid-900.woff2",
    "/fontawesome/webfonts/fa-solid-900.ttf",
    "/js/checkConnection.js",
];

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, PartialEq)]
pub struct CachedAsset {
    pub url: String,
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ManifestEntry {
    file: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Default, Serialize, Deserialize)]
struct Manifest {
    next_file: u64,
    entries: BTreeMap<String, ManifestEntry>,
}

/// All named caches under one directory.
pub struct CacheStorage {
    root: PathBuf,
}

impl CacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn manifest(&self, name: &str) -> Result<Option<Manifest>, CacheError> {
        match fs::read(self.cache_dir(name).join(MANIFEST_FILE)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the caches that exist, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if fs::try_exists(entry.path().join(MANIFEST_FILE)).await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.manifest(name).await?.is_some())
    }

    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        match fs::remove_dir_all(self.cache_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds every asset to cache `name` in one commit.
    pub async fn put_all(&self, name: &str, assets: Vec<CachedAsset>) -> Result<(), CacheError> {
        let dir = self.cache_dir(name);
        fs::create_dir_all(&dir).await?;
        let mut manifest = self.manifest(name).await?.unwrap_or_default();

        let mut written = Vec::with_capacity(assets.len());
        let mut replaced = Vec::new();
        for asset in assets {
            let file = format!("{:06}.asset", manifest.next_file);
            manifest.next_file += 1;
            if let Err(e) = fs::write(dir.join(&file), &asset.body).await {
                for orphan in &written {
                    let _ = fs::remove_file(dir.join(orphan)).await;
                }
                return Err(e.into());
            }
            written.push(file.clone());
            let previous = manifest.entries.insert(
                asset.url,
                ManifestEntry {
                    file,
                    content_type: asset.content_type,
                },
            );
            replaced.extend(previous.map(|entry| entry.file));
        }

        let path = dir.join(MANIFEST_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?).await?;
        fs::rename(&tmp, &path).await?;

        // Only unreferenced once the new manifest is in place.
        for file in replaced {
            if let Err(e) = fs::remove_file(dir.join(&file)).await {
                warn!("Failed to remove replaced asset {}: {}", file, e);
            }
        }
        Ok(())
    }

    pub async fn match_url(&self, name: &str, url: &str) -> Result<Option<CachedAsset>, CacheError> {
        let Some(manifest) = self.manifest(name).await? else {
            return Ok(None);
        };
        let Some(entry) = manifest.entries.get(url) else {
            return Ok(None);
        };
        let body = fs::read(self.cache_dir(name).join(&entry.file)).await?;
        Ok(Some(CachedAsset {
            url: url.to_string(),
            body: Bytes::from(body),
            content_type: entry.content_type.clone(),
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetSource {
    Cache,
    Network,
}

#[derive(Clone, Debug)]
pub struct AssetResponse {
    pub asset: CachedAsset,
    pub source: AssetSource,
}

/// Install / activate / fetch lifecycle around one current cache version.
pub struct OfflineAssetCache {
    storage: CacheStorage,
    name: String,
    assets: Vec<String>,
    fetcher: Arc<dyn Fetch>,
}

impl OfflineAssetCache {
    pub fn new(
        storage: CacheStorage,
        name: impl Into<String>,
        assets: Vec<String>,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            storage,
            name: name.into(),
            assets,
            fetcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// Fetches every listed asset and stores them together. If any fetch
    /// fails nothing is stored. A cache that already exists under this name
    /// is left as it is; new content needs a new name.
    pub async fn install(&self) -> Result<usize, CacheError> {
        if let Some(manifest) = self.storage.manifest(&self.name).await? {
            debug!("Asset cache {} already installed", self.name);
            return Ok(manifest.entries.len());
        }
        info!("Installing asset cache {} ({} assets)", self.name, self.assets.len());
        let results = join_all(self.assets.iter().map(|url| async move {
            self.fetcher.fetch(url).await.map(|fetched| CachedAsset {
                url: url.clone(),
                body: fetched.body,
                content_type: fetched.content_type,
            })
        }))
        .await;

        let assets = results.into_iter().collect::<Result<Vec<_>, FetchError>>().map_err(|e| {
            error!("Asset cache install failed: {}", e);
            CacheError::Install(e)
        })?;

        let count = assets.len();
        self.storage.put_all(&self.name, assets).await?;
        info!("Opened cache {}", self.name);
        Ok(count)
    }

    /// Install, then activate. Older versions are only dropped once the
    /// current one is in place.
    pub async fn prepare(&self) -> Result<(usize, Vec<String>), CacheError> {
        let count = self.install().await?;
        let deleted = self.activate().await?;
        Ok((count, deleted))
    }

    /// Drops every cache but the current one. Returns the deleted names.
    /// Does nothing until the current cache has been installed.
    pub async fn activate(&self) -> Result<Vec<String>, CacheError> {
        let mut deleted = Vec::new();
        if !self.storage.has(&self.name).await? {
            warn!("Asset cache {} not installed, keeping older caches", self.name);
            return Ok(deleted);
        }
        for name in self.storage.keys().await? {
            if name == self.name {
                continue;
            }
            if self.storage.delete(&name).await? {
                info!("Deleted stale asset cache {}", name);
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Cache-first lookup; misses go to the network and are not stored.
    pub async fn respond(&self, url: &str) -> Result<AssetResponse, FetchError> {
        match self.storage.match_url(&self.name, url).await {
            Ok(Some(asset)) => {
                debug!("Serving {} from cache", url);
                return Ok(AssetResponse {
                    asset,
                    source: AssetSource::Cache,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Asset cache lookup for {} failed: {}", url, e),
        }

        let fetched = self.fetcher.fetch(url).await?;
        Ok(AssetResponse {
            asset: CachedAsset {
                url: url.to_string(),
                body: fetched.body,
                content_type: fetched.content_type,
            },
            source: AssetSource::Network,
        })
    }
}
