use bytes::Bytes;
use futures::{channel::mpsc, SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::{io, sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{VersionError, VersionResult};
use crate::models::{src_object_key, Checksum, StorageRecord};
use crate::storage::{ArtifactStore, ByteStream};
use crate::telemetry::{SOURCE_UPLOAD_BYTES, SOURCE_UPLOAD_DURATION};

pub const CHECKSUM_ALG: &str = "sha256";

/// Chunks in flight between the reader and the store.
const PIPE_DEPTH: usize = 8;

/// Input of a version creation: a remote archive or an already open stream.
pub enum Source {
    Url(String),
    Stream(ByteStream),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(u) => f.debug_tuple("Url").field(u).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Source {
    pub fn url(url: impl Into<String>) -> Self { Self::Url(url.into()) }
    pub fn bytes(data: impl Into<Bytes>) -> Self { Self::Stream(crate::storage::bytes_body(data)) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedArtifact {
    pub object_key: String,
    pub provider: String,
    pub generation: String,
    pub checksum: Checksum,
    pub size: u64,
}

impl UploadedArtifact {
    pub fn storage_record(&self) -> StorageRecord {
        StorageRecord {
            object_key: self.object_key.clone(),
            provider: self.provider.clone(),
            generation: Some(self.generation.clone()),
            checksum: Some(self.checksum.clone()),
        }
    }
}

/// Streams a source into the artifact store while hashing it.
#[derive(Clone)]
pub struct UploadPipe {
    store: Arc<dyn ArtifactStore>,
    http: reqwest::Client,
    max_bytes: Option<u64>,
    content_type: String,
}

impl UploadPipe {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store, http: reqwest::Client::new(), max_bytes: None, content_type: "application/zip".into() }
    }

    pub fn from_config(store: Arc<dyn ArtifactStore>, cfg: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(cfg.uploads.fetch_timeout_secs)).build()?;
        Ok(Self::new(store)
            .with_http_client(http)
            .with_max_bytes(cfg.uploads.max_source_size)
            .with_content_type(cfg.leases.src_content_type.clone()))
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self { self.http = http; self }
    pub fn with_max_bytes(mut self, max: Option<u64>) -> Self { self.max_bytes = max; self }
    pub fn with_content_type(mut self, ct: impl Into<String>) -> Self { self.content_type = ct.into(); self }

    pub fn max_bytes(&self) -> Option<u64> { self.max_bytes }

    /// Writes `source` under a fresh key owned by `owner_id`. Exactly one object write per call;
    /// on failure nothing is left behind under the new key.
    pub async fn create(&self, owner_id: &str, source: Source) -> VersionResult<UploadedArtifact> {
        let key = src_object_key(owner_id, Uuid::new_v4());
        let input = self.open(source).await?;
        let timer = SOURCE_UPLOAD_DURATION.start_timer();

        let (mut tx, rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_DEPTH);
        let max_bytes = self.max_bytes;
        let pump = async move {
            let mut input = input;
            let mut hasher = Sha256::new();
            let mut size = 0u64;
            while let Some(chunk) = input.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let msg = e.to_string();
                        let _ = tx.send(Err(e)).await;
                        return Err(VersionError::UploadFailed(format!("reading source: {msg}")));
                    }
                };
                size += chunk.len() as u64;
                if let Some(limit) = max_bytes.filter(|l| size > *l) {
                    let _ = tx.send(Err(io::Error::new(io::ErrorKind::InvalidData, "source exceeds size limit"))).await;
                    return Err(VersionError::MaxFilesizeExceeded { limit });
                }
                hasher.update(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    return Err(VersionError::UploadFailed("artifact store stopped reading".into()));
                }
            }
            Ok((format!("{:x}", hasher.finalize()), size))
        };
        let write = self.store.put_object(&key, Some(&self.content_type), Box::pin(rx));
        let (pumped, written) = tokio::join!(pump, write);

        let result = match (pumped, written) {
            (Ok((hash, size)), Ok(meta)) => Ok(UploadedArtifact {
                object_key: key.clone(),
                provider: self.store.provider().to_string(),
                generation: meta.generation,
                checksum: Checksum { alg: CHECKSUM_ALG.into(), hash },
                size,
            }),
            (Err(e @ VersionError::MaxFilesizeExceeded { .. }), written) => {
                if written.is_ok() { self.discard(&key).await; }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(VersionError::UploadFailed(format!("writing {key}: {e:#}"))),
            (Err(_), Err(e)) if e.downcast_ref::<io::Error>().is_none() => Err(VersionError::UploadFailed(format!("writing {key}: {e:#}"))),
            (Err(e), written) => {
                if written.is_ok() { self.discard(&key).await; }
                Err(e)
            }
        };
        timer.observe_duration();
        match &result {
            Ok(a) => {
                SOURCE_UPLOAD_BYTES.inc_by(a.size);
                info!(key=%a.object_key, size=a.size, generation=%a.generation, "upload.stored");
            }
            Err(e) => warn!(%key, error=%e, "upload.failed"),
        }
        result
    }

    async fn open(&self, source: Source) -> VersionResult<ByteStream> {
        match source {
            Source::Stream(s) => Ok(s),
            Source::Url(raw) => {
                let parsed = url::Url::parse(&raw).map_err(|_| VersionError::invalid("source", "invalid"))?;
                if !matches!(parsed.scheme(), "http" | "https") { return Err(VersionError::invalid("source", "invalid")); }
                let resp = self
                    .http
                    .get(parsed)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| VersionError::UploadFailed(format!("fetching source: {e}")))?;
                if let (Some(limit), Some(len)) = (self.max_bytes, resp.content_length()) {
                    if len > limit { return Err(VersionError::MaxFilesizeExceeded { limit }); }
                }
                Ok(Box::pin(resp.bytes_stream().map(|r| r.map_err(|e| io::Error::new(io::ErrorKind::Other, e)))))
            }
        }
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.store.delete_object(key).await {
            warn!(key, error=%e, "upload.discard_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArtifactStore;

    fn pipe() -> (Arc<MemoryArtifactStore>, UploadPipe) {
        let store = Arc::new(MemoryArtifactStore::new("http://localhost:9000", "b", "s"));
        (store.clone(), UploadPipe::new(store))
    }

    #[tokio::test]
    async fn hashes_while_streaming() {
        let (store, pipe) = pipe();
        let chunks = vec![Ok(Bytes::from("hel")), Ok(Bytes::from("lo"))];
        let up = pipe.create("p1", Source::Stream(Box::pin(futures::stream::iter(chunks)))).await.unwrap();
        assert_eq!(up.checksum.alg, "sha256");
        assert_eq!(up.checksum.hash, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        assert_eq!(up.size, 5);
        assert!(up.object_key.starts_with("projects/p1/versions/"));
        assert!(store.contains(&up.object_key));
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let (store, pipe) = pipe();
        let pipe = pipe.with_max_bytes(Some(4));
        let err = pipe.create("p1", Source::bytes("too large")).await.unwrap_err();
        assert!(matches!(err, VersionError::MaxFilesizeExceeded { limit: 4 }), "{err:?}");
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn read_error_leaves_nothing_behind() {
        let (store, pipe) = pipe();
        let chunks = vec![Ok(Bytes::from("ab")), Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))];
        let err = pipe.create("p1", Source::Stream(Box::pin(futures::stream::iter(chunks)))).await.unwrap_err();
        assert!(matches!(err, VersionError::UploadFailed(_)), "{err:?}");
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn non_http_urls_are_invalid() {
        let (_, pipe) = pipe();
        for raw in ["ftp://example.com/a.zip", "not a url"] {
            let err = pipe.create("p1", Source::url(raw)).await.unwrap_err();
            assert!(matches!(err, VersionError::InvalidOption { option: "source", .. }), "{err:?}");
        }
    }
}
