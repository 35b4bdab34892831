use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tracing::{info, warn};

use crate::config::{StorageConfig, StorageMode};

/// Streaming body used for every artifact read and write.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseAction { Read, Write }

impl LeaseAction {
    pub fn as_str(&self) -> &'static str { match self { Self::Read => "read", Self::Write => "write" } }
    pub fn method(&self) -> &'static str { match self { Self::Read => "GET", Self::Write => "PUT" } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlOptions {
    pub action: LeaseAction,
    pub expires_at: DateTime<Utc>,
    /// Pin the grant to this object revision.
    pub generation: Option<String>,
    pub content_type: Option<String>,
    pub response_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl { pub url: String, pub method: String, pub headers: HashMap<String, String> }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta { pub key: String, pub generation: String, pub size: u64, pub content_type: Option<String> }

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Provider name recorded on storage records written through this store.
    fn provider(&self) -> &'static str;
    async fn put_object(&self, key: &str, content_type: Option<&str>, body: ByteStream) -> anyhow::Result<ObjectMeta>;
    async fn get_object(&self, key: &str, generation: Option<&str>) -> anyhow::Result<ByteStream>;
    /// `None` when the object (or the requested revision) does not exist.
    async fn object_metadata(&self, key: &str, generation: Option<&str>) -> anyhow::Result<Option<ObjectMeta>>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> anyhow::Result<PresignedUrl>;
}

#[derive(Debug, Clone)]
struct StoredObject { generation: u64, data: Bytes, content_type: Option<String> }

#[derive(Debug, Default)]
struct MemoryObjects { last_generation: u64, objects: HashMap<String, StoredObject> }

type HmacSha256 = Hmac<Sha256>;

/// Process-local store. Hands out HMAC-SHA256 signed URLs that it can verify itself,
/// so a worker emulation can write through a lease exactly like against GCS/S3.
#[derive(Debug)]
pub struct MemoryArtifactStore {
    base_url: String,
    bucket: String,
    secret: String,
    inner: std::sync::Mutex<MemoryObjects>,
}

impl MemoryArtifactStore {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), bucket: bucket.into(), secret: secret.into(), inner: Default::default() }
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, MemoryObjects> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sign(&self, method: &str, key: &str, expires: i64, generation: &str, content_type: &str) -> anyhow::Result<String> {
        let expires = expires.to_string();
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|e| anyhow::anyhow!("signing key: {e}"))?;
        for part in [method, self.bucket.as_str(), key, expires.as_str(), generation, content_type] {
            mac.update(part.as_bytes());
            mac.update(b"\n");
        }
        Ok(format!("{:x}", mac.finalize().into_bytes()))
    }

    fn store(&self, key: &str, content_type: Option<&str>, data: Bytes) -> ObjectMeta {
        let mut objects = self.objects();
        objects.last_generation += 1;
        let generation = objects.last_generation;
        let size = data.len() as u64;
        objects.objects.insert(key.to_string(), StoredObject { generation, data, content_type: content_type.map(str::to_owned) });
        ObjectMeta { key: key.to_string(), generation: generation.to_string(), size, content_type: content_type.map(str::to_owned) }
    }

    /// Checks a URL produced by [`ArtifactStore::signed_url`] and returns the object key.
    fn verify(&self, url: &str, action: LeaseAction) -> anyhow::Result<(String, Option<String>)> {
        let parsed = url::Url::parse(url)?;
        let prefix = format!("/{}/", self.bucket);
        let key = parsed.path().strip_prefix(&prefix).ok_or_else(|| anyhow::anyhow!("url is not in bucket {}", self.bucket))?.to_string();
        let q: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let param = |k: &str| q.get(k).cloned().unwrap_or_default();
        if param("action") != action.as_str() { anyhow::bail!("lease does not grant {}", action.as_str()); }
        let expires: i64 = param("expires").parse()?;
        if Utc::now().timestamp() > expires { anyhow::bail!("lease expired at {expires}"); }
        let generation = param("generation");
        let expected = self.sign(action.method(), &key, expires, &generation, &param("content-type"))?;
        if param("signature") != expected { anyhow::bail!("signature mismatch"); }
        Ok((key, Some(generation).filter(|g| !g.is_empty())))
    }

    /// Performs the PUT a worker would send to a write lease.
    pub fn write_with_lease(&self, url: &str, content_type: Option<&str>, data: Bytes) -> anyhow::Result<ObjectMeta> {
        let (key, generation) = self.verify(url, LeaseAction::Write)?;
        if let Some(g) = generation {
            let current = self.objects().objects.get(&key).map(|o| o.generation.to_string());
            if current.as_deref() != Some(g.as_str()) { anyhow::bail!("precondition failed: generation {g} is no longer current"); }
        }
        Ok(self.store(&key, content_type, data))
    }

    /// Performs the GET a browser would send to a read lease.
    pub fn read_with_lease(&self, url: &str) -> anyhow::Result<Bytes> {
        let (key, generation) = self.verify(url, LeaseAction::Read)?;
        let objects = self.objects();
        let obj = objects.objects.get(&key).ok_or_else(|| anyhow::anyhow!("object {key} not found"))?;
        if let Some(g) = generation { if obj.generation.to_string() != g { anyhow::bail!("generation {g} of {key} not found"); } }
        Ok(obj.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool { self.objects().objects.contains_key(key) }
    pub fn object_count(&self) -> usize { self.objects().objects.len() }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn provider(&self) -> &'static str { "memory" }

    async fn put_object(&self, key: &str, content_type: Option<&str>, mut body: ByteStream) -> anyhow::Result<ObjectMeta> {
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await { data.extend_from_slice(&chunk?); }
        Ok(self.store(key, content_type, Bytes::from(data)))
    }

    async fn get_object(&self, key: &str, generation: Option<&str>) -> anyhow::Result<ByteStream> {
        let data = {
            let objects = self.objects();
            let obj = objects.objects.get(key).ok_or_else(|| anyhow::anyhow!("object {key} not found"))?;
            if let Some(g) = generation { if obj.generation.to_string() != g { anyhow::bail!("generation {g} of {key} not found"); } }
            obj.data.clone()
        };
        Ok(Box::pin(futures::stream::iter([Ok(data)])))
    }

    async fn object_metadata(&self, key: &str, generation: Option<&str>) -> anyhow::Result<Option<ObjectMeta>> {
        let objects = self.objects();
        Ok(objects
            .objects
            .get(key)
            .filter(|o| generation.map_or(true, |g| o.generation.to_string() == g))
            .map(|o| ObjectMeta { key: key.to_string(), generation: o.generation.to_string(), size: o.data.len() as u64, content_type: o.content_type.clone() }))
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        match self.objects().objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(anyhow::anyhow!("object {key} not found")),
        }
    }

    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> anyhow::Result<PresignedUrl> {
        let expires = opts.expires_at.timestamp();
        let generation = opts.generation.clone().unwrap_or_default();
        let content_type = opts.content_type.clone().unwrap_or_default();
        let method = opts.action.method();
        let signature = self.sign(method, key, expires, &generation, &content_type)?;
        let mut url = url::Url::parse(&format!("{}/{}/{}", self.base_url.trim_end_matches('/'), self.bucket, key))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("action", opts.action.as_str());
            q.append_pair("expires", &expires.to_string());
            q.append_pair("generation", &generation);
            q.append_pair("content-type", &content_type);
            if let Some(name) = &opts.response_filename { q.append_pair("filename", name); }
            q.append_pair("signature", &signature);
        }
        let mut headers = HashMap::new();
        if let Some(ct) = &opts.content_type { headers.insert("content-type".to_string(), ct.clone()); }
        Ok(PresignedUrl { url: url.to_string(), method: method.into(), headers })
    }
}

#[cfg(feature = "s3")]
pub use s3::S3ArtifactStore;

#[cfg(feature = "s3")]
mod s3 {
    use super::*;
    use aws_sdk_s3::{
        presigning::PresigningConfig,
        primitives::ByteStream as SdkByteStream,
        types::{CompletedMultipartUpload, CompletedPart},
    };
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio_util::io::ReaderStream;

    /// Minimum S3 part size; also the most we hold in memory per upload.
    const PART_SIZE: usize = 8 * 1024 * 1024;
    const MAX_PRESIGN: Duration = Duration::from_secs(7 * 24 * 3600);

    /// S3 generations are the object version id on versioned buckets, the etag otherwise.
    enum S3Generation<'a> { Version(&'a str), ETag(&'a str) }

    fn parse_generation(g: &str) -> S3Generation<'_> {
        match g.strip_prefix("vid:") {
            Some(v) => S3Generation::Version(v),
            None => S3Generation::ETag(g.strip_prefix("etag:").unwrap_or(g)),
        }
    }

    fn format_generation(version_id: Option<&str>, e_tag: Option<&str>) -> anyhow::Result<String> {
        match (version_id.filter(|v| !v.is_empty() && *v != "null"), e_tag) {
            (Some(v), _) => Ok(format!("vid:{v}")),
            (None, Some(e)) => Ok(format!("etag:{e}")),
            (None, None) => Err(anyhow::anyhow!("s3 response carried neither version id nor etag")),
        }
    }

    #[derive(Clone)]
    pub struct S3ArtifactStore { client: aws_sdk_s3::Client, bucket: String }

    impl std::fmt::Debug for S3ArtifactStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("S3ArtifactStore").field("bucket", &self.bucket).finish() }
    }

    impl S3ArtifactStore {
        pub async fn from_config(cfg: &StorageConfig) -> Self {
            use aws_config::BehaviorVersion;
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(cfg.region.clone()))
                .load()
                .await;
            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(ep) = &cfg.endpoint_url {
                // MinIO and friends want path-style addressing
                builder = builder.endpoint_url(ep).force_path_style(true);
            }
            Self { client: aws_sdk_s3::Client::from_conf(builder.build()), bucket: cfg.bucket.clone() }
        }

        async fn abort(&self, key: &str, upload_id: &str) {
            if let Err(e) = self.client.abort_multipart_upload().bucket(&self.bucket).key(key).upload_id(upload_id).send().await {
                warn!(?e, key, "s3_abort_multipart_failed");
            }
        }

        async fn upload_parts(&self, key: &str, upload_id: &str, body: &mut ByteStream, mut buf: BytesMut) -> anyhow::Result<(Vec<CompletedPart>, u64)> {
            let mut parts = Vec::new();
            let mut size = 0u64;
            let mut exhausted = false;
            loop {
                while !exhausted && buf.len() < PART_SIZE {
                    match body.next().await {
                        Some(chunk) => buf.extend_from_slice(&chunk?),
                        None => exhausted = true,
                    }
                }
                if buf.is_empty() { break; }
                let part = buf.split_to(buf.len().min(PART_SIZE)).freeze();
                size += part.len() as u64;
                let number = parts.len() as i32 + 1;
                let out = self.client.upload_part().bucket(&self.bucket).key(key).upload_id(upload_id)
                    .part_number(number).body(SdkByteStream::from(part)).send().await?;
                parts.push(CompletedPart::builder().part_number(number).set_e_tag(out.e_tag().map(str::to_owned)).build());
                if exhausted && buf.is_empty() { break; }
            }
            Ok((parts, size))
        }
    }

    #[async_trait]
    impl ArtifactStore for S3ArtifactStore {
        fn provider(&self) -> &'static str { "s3" }

        async fn put_object(&self, key: &str, content_type: Option<&str>, mut body: ByteStream) -> anyhow::Result<ObjectMeta> {
            let mut buf = BytesMut::with_capacity(PART_SIZE);
            let mut exhausted = false;
            while buf.len() < PART_SIZE {
                match body.next().await {
                    Some(chunk) => buf.extend_from_slice(&chunk?),
                    None => { exhausted = true; break; }
                }
            }
            if exhausted {
                // small object, single request
                let size = buf.len() as u64;
                let out = self.client.put_object().bucket(&self.bucket).key(key)
                    .set_content_type(content_type.map(str::to_owned))
                    .body(SdkByteStream::from(buf.freeze())).send().await?;
                let generation = format_generation(out.version_id(), out.e_tag())?;
                return Ok(ObjectMeta { key: key.to_string(), generation, size, content_type: content_type.map(str::to_owned) });
            }
            let created = self.client.create_multipart_upload().bucket(&self.bucket).key(key)
                .set_content_type(content_type.map(str::to_owned)).send().await?;
            let upload_id = created.upload_id().unwrap_or_default().to_string();
            let (parts, size) = match self.upload_parts(key, &upload_id, &mut body, buf).await {
                Ok(v) => v,
                Err(e) => { self.abort(key, &upload_id).await; return Err(e); }
            };
            let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
            let out = match self.client.complete_multipart_upload().bucket(&self.bucket).key(key)
                .upload_id(&upload_id).multipart_upload(completed).send().await {
                Ok(o) => o,
                Err(e) => { self.abort(key, &upload_id).await; return Err(e.into()); }
            };
            let generation = format_generation(out.version_id(), out.e_tag())?;
            info!(key, size, "s3_multipart_complete");
            Ok(ObjectMeta { key: key.to_string(), generation, size, content_type: content_type.map(str::to_owned) })
        }

        async fn get_object(&self, key: &str, generation: Option<&str>) -> anyhow::Result<ByteStream> {
            let mut req = self.client.get_object().bucket(&self.bucket).key(key);
            match generation.map(parse_generation) {
                Some(S3Generation::Version(v)) => req = req.version_id(v),
                Some(S3Generation::ETag(e)) => req = req.if_match(e),
                None => {}
            }
            let out = req.send().await?;
            Ok(Box::pin(ReaderStream::new(out.body.into_async_read())))
        }

        async fn object_metadata(&self, key: &str, generation: Option<&str>) -> anyhow::Result<Option<ObjectMeta>> {
            let mut req = self.client.head_object().bucket(&self.bucket).key(key);
            match generation.map(parse_generation) {
                Some(S3Generation::Version(v)) => req = req.version_id(v),
                Some(S3Generation::ETag(e)) => req = req.if_match(e),
                None => {}
            }
            match req.send().await {
                Ok(out) => Ok(Some(ObjectMeta {
                    key: key.to_string(),
                    generation: format_generation(out.version_id(), out.e_tag())?,
                    size: out.content_length().unwrap_or(0).max(0) as u64,
                    content_type: out.content_type().map(str::to_owned),
                })),
                Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }

        async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
            self.client.delete_object().bucket(&self.bucket).key(key).send().await?;
            Ok(())
        }

        async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> anyhow::Result<PresignedUrl> {
            let ttl = (opts.expires_at - Utc::now()).to_std().unwrap_or(Duration::from_secs(1)).clamp(Duration::from_secs(1), MAX_PRESIGN);
            let config = PresigningConfig::expires_in(ttl)?;
            let presigned = match opts.action {
                LeaseAction::Read => {
                    let mut req = self.client.get_object().bucket(&self.bucket).key(key);
                    match opts.generation.as_deref().map(parse_generation) {
                        Some(S3Generation::Version(v)) => req = req.version_id(v),
                        Some(S3Generation::ETag(e)) => req = req.if_match(e),
                        None => {}
                    }
                    if let Some(name) = &opts.response_filename {
                        req = req.response_content_disposition(format!("attachment; filename=\"{name}\""));
                    }
                    req.presigned(config).await?
                }
                // S3 cannot pin a PUT to the previous revision; the content type is signed in.
                LeaseAction::Write => {
                    self.client.put_object().bucket(&self.bucket).key(key)
                        .set_content_type(opts.content_type.clone()).presigned(config).await?
                }
            };
            let headers = presigned.headers().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            Ok(PresignedUrl { url: presigned.uri().to_string(), method: presigned.method().to_string(), headers })
        }
    }
}

#[derive(Clone)]
pub struct StorageManager { inner: Arc<dyn ArtifactStore> }

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("StorageManager").field("provider", &self.inner.provider()).finish() }
}

impl StorageManager {
    pub fn new(inner: Arc<dyn ArtifactStore>) -> Self { Self { inner } }

    pub async fn from_config(cfg: &StorageConfig) -> Self {
        if cfg.mode == StorageMode::S3 {
            #[cfg(feature = "s3")]
            {
                info!(bucket=%cfg.bucket, "storage_manager.init_s3");
                return Self::new(Arc::new(S3ArtifactStore::from_config(cfg).await));
            }
            #[cfg(not(feature = "s3"))]
            warn!("s3 feature not enabled, falling back to memory store");
        }
        info!(bucket=%cfg.bucket, "storage_manager.init_memory");
        Self::new(Arc::new(MemoryArtifactStore::new(cfg.base_url.clone(), cfg.bucket.clone(), cfg.signing_secret.clone())))
    }

    pub fn backend(&self) -> &dyn ArtifactStore { self.inner.as_ref() }
    pub fn shared(&self) -> Arc<dyn ArtifactStore> { self.inner.clone() }
}

/// Convenience for tests and tools: a single-chunk body.
pub fn bytes_body(data: impl Into<Bytes>) -> ByteStream { Box::pin(futures::stream::iter([Ok(data.into())])) }
