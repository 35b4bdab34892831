//! In-process harness for integration tests: memory stores, a worker that
//! records requests instead of building, and a deployer that records calls.
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::deploy::{DeployNotifier, DeployRequest};
use crate::error::{VersionError, VersionResult};
use crate::models::{ProjectRef, ProjectVersion};
use crate::storage::{ArtifactStore, ByteStream, MemoryArtifactStore, ObjectMeta, PresignedUrl, SignedUrlOptions};
use crate::store::MemoryVersionStore;
use crate::upload::Source;
use crate::versions::{CreateOptions, VersionService};
use crate::worker::{BuildReport, BuildRequest, BuildWorker};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

/// Memory artifact store whose deletes can be made to fail per key.
#[derive(Debug)]
pub struct FlakyArtifactStore {
    pub inner: Arc<MemoryArtifactStore>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl FlakyArtifactStore {
    pub fn new(inner: Arc<MemoryArtifactStore>) -> Self { Self { inner, failing_deletes: Mutex::default() } }
    pub fn fail_delete_of(&self, key: &str) { locked(&self.failing_deletes).insert(key.to_string()); }
}

#[async_trait]
impl ArtifactStore for FlakyArtifactStore {
    fn provider(&self) -> &'static str { self.inner.provider() }
    async fn put_object(&self, key: &str, content_type: Option<&str>, body: ByteStream) -> anyhow::Result<ObjectMeta> {
        self.inner.put_object(key, content_type, body).await
    }
    async fn get_object(&self, key: &str, generation: Option<&str>) -> anyhow::Result<ByteStream> {
        self.inner.get_object(key, generation).await
    }
    async fn object_metadata(&self, key: &str, generation: Option<&str>) -> anyhow::Result<Option<ObjectMeta>> {
        self.inner.object_metadata(key, generation).await
    }
    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        if locked(&self.failing_deletes).contains(key) { anyhow::bail!("injected delete failure for {key}"); }
        self.inner.delete_object(key).await
    }
    async fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> anyhow::Result<PresignedUrl> {
        self.inner.signed_url(key, opts).await
    }
}

/// Accepts every request; optionally refuses the next one or holds its acknowledgement.
#[derive(Debug, Default)]
pub struct RecordingWorker {
    requests: Mutex<Vec<BuildRequest>>,
    refuse_next: AtomicBool,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RecordingWorker {
    pub fn requests(&self) -> Vec<BuildRequest> { locked(&self.requests).clone() }
    pub fn refuse_next(&self) { self.refuse_next.store(true, Ordering::SeqCst); }

    /// The next request is recorded at once but `schedule` only returns after the sender fires.
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *locked(&self.hold) = Some(rx);
        tx
    }

    pub fn last_request_for(&self, version: &ProjectVersion) -> Option<BuildRequest> {
        locked(&self.requests).iter().rev().find(|r| r.version_id == version.id).cloned()
    }
}

#[async_trait]
impl BuildWorker for RecordingWorker {
    async fn schedule(&self, request: &BuildRequest) -> anyhow::Result<()> {
        if self.refuse_next.swap(false, Ordering::SeqCst) { anyhow::bail!("queue unavailable"); }
        locked(&self.requests).push(request.clone());
        let held = locked(&self.hold).take();
        if let Some(rx) = held { rx.await?; }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingDeployNotifier {
    requests: Mutex<Vec<DeployRequest>>,
    failing: AtomicBool,
}

impl RecordingDeployNotifier {
    pub fn requests(&self) -> Vec<DeployRequest> { locked(&self.requests).clone() }
    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst); }
}

#[async_trait]
impl DeployNotifier for RecordingDeployNotifier {
    async fn schedule(&self, request: &DeployRequest) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) { anyhow::bail!("deployer unreachable"); }
        locked(&self.requests).push(request.clone());
        Ok(())
    }
}

pub struct Harness {
    pub config: Config,
    pub store: Arc<MemoryVersionStore>,
    pub objects: Arc<MemoryArtifactStore>,
    pub artifacts: Arc<FlakyArtifactStore>,
    pub worker: Arc<RecordingWorker>,
    pub deployer: Arc<RecordingDeployNotifier>,
    pub service: VersionService,
}

impl Harness {
    pub fn new() -> Self { Self::with_config(Config::default()) }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryVersionStore::new());
        let objects = Arc::new(MemoryArtifactStore::new(
            config.storage.base_url.clone(),
            config.storage.bucket.clone(),
            config.storage.signing_secret.clone(),
        ));
        let artifacts = Arc::new(FlakyArtifactStore::new(objects.clone()));
        let worker = Arc::new(RecordingWorker::default());
        let deployer = Arc::new(RecordingDeployNotifier::default());
        // only fails on a broken TLS backend
        let service = VersionService::new(&config, store.clone(), artifacts.clone(), worker.clone(), deployer.clone())
            .expect("version service");
        Self { config, store, objects, artifacts, worker, deployer, service }
    }

    pub fn project(id: &str) -> ProjectRef { ProjectRef::new(id).with_code(format!("{id}-site")) }

    pub async fn create(&self, project: &ProjectRef, body: &'static str) -> VersionResult<ProjectVersion> {
        self.service.create(project, Source::bytes(body), CreateOptions::default()).await
    }

    /// Plays the worker: writes `output` through the dest lease of the latest request, then reports success.
    pub async fn complete_build(&self, version: &ProjectVersion, output: &'static str) -> VersionResult<ProjectVersion> {
        let req = self.worker.last_request_for(version).ok_or_else(|| VersionError::not_found("build request", version.id.to_string()))?;
        let ct = req.dest.headers.get("content-type").cloned();
        self.objects.write_with_lease(&req.dest.url, ct.as_deref(), Bytes::from(output)).map_err(VersionError::storage)?;
        self.service.builds().handle_build_success(&req.request_id, &BuildReport::default()).await
    }

    pub fn read(&self, url: &str) -> anyhow::Result<Bytes> { self.objects.read_with_lease(url) }
}

impl Default for Harness {
    fn default() -> Self { Self::new() }
}
