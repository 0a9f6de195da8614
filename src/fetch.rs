use crate::error::FetchError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header, Client};
use tracing::debug;

/// A fully-read network response.
#[derive(Clone, Debug)]
pub struct Fetched {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Network access used by the audio store and the asset cache.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetches `url` and reads the whole body into memory.
    /// A body that fails halfway is an error, never a short result.
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError>;
}

/// reqwest-backed fetcher. Relative URLs resolve against `origin`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: String,
}

impl HttpFetcher {
    pub fn new(client: Client, origin: impl Into<String>) -> Self {
        Self {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.origin, url)
        } else {
            format!("{}/{}", self.origin, url)
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let target = self.resolve(url);
        let response = self
            .client
            .get(&target)
            .send()
            .await
            .map_err(|e| FetchError::new(url, e))?;

        if !response.status().is_success() {
            return Err(FetchError::new(
                url,
                format!("server returned {}", response.status()),
            ));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::new(url, e))?;
            body.extend_from_slice(&chunk);
        }
        debug!("Fetched {} ({} bytes)", target, body.len());

        Ok(Fetched {
            body: body.freeze(),
            content_type,
        })
    }
}
