use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::build::BuildCoordinator;
use crate::config::Config;
use crate::deploy::DeployNotifier;
use crate::error::{VersionError, VersionResult};
use crate::leases::{Artifact, Lease, LeaseIssuer, LeaseOptions, LeaseRequest, Leases};
use crate::models::{dist_object_key, BuildStatus, NewVersion, ProjectRef, ProjectVersion, StorageRecord};
use crate::sequencer::Sequencer;
use crate::storage::ArtifactStore;
use crate::store::VersionStore;
use crate::telemetry::{DRAFTS_SWEPT, VERSIONS_CREATED};
use crate::upload::{Source, UploadPipe};
use crate::worker::BuildWorker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub schedule_build: bool,
}

/// Which artifacts a download request wants links for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadRequest { pub src: bool, pub dist: bool }

/// Version lifecycle entry points: create, restore, delete, queries, leases.
#[derive(Clone)]
pub struct VersionService {
    store: Arc<dyn VersionStore>,
    artifacts: Arc<dyn ArtifactStore>,
    uploads: UploadPipe,
    sequencer: Sequencer,
    leases: LeaseIssuer,
    builds: BuildCoordinator,
    draft_ttl: Duration,
}

impl VersionService {
    pub fn new(
        cfg: &Config,
        store: Arc<dyn VersionStore>,
        artifacts: Arc<dyn ArtifactStore>,
        worker: Arc<dyn BuildWorker>,
        deploy: Arc<dyn DeployNotifier>,
    ) -> anyhow::Result<Self> {
        let uploads = UploadPipe::from_config(artifacts.clone(), cfg)?;
        let leases = LeaseIssuer::new(artifacts.clone(), cfg.default_lease_ttl(), cfg.leases.dist_content_type.clone());
        let builds = BuildCoordinator::new(store.clone(), artifacts.clone(), leases.clone(), worker, deploy);
        let draft_ttl = cfg.draft_ttl();
        Ok(Self { sequencer: Sequencer::new(store.clone(), draft_ttl), store, artifacts, uploads, leases, builds, draft_ttl })
    }

    pub fn builds(&self) -> &BuildCoordinator { &self.builds }
    pub fn leases(&self) -> &LeaseIssuer { &self.leases }

    /// Upload, persist a draft, number it, optionally schedule a build.
    ///
    /// A scheduling failure does not undo the creation: the version is returned in whatever
    /// build state the failed attempt left it (FAILED when the enqueue was refused).
    pub async fn create(&self, project: &ProjectRef, source: Source, opts: CreateOptions) -> VersionResult<ProjectVersion> {
        project.validate()?;
        let uploaded = self.uploads.create(&project.id, source).await?;
        let src_storage = uploaded.storage_record();
        let dist_storage = StorageRecord {
            object_key: dist_object_key(&uploaded.object_key),
            provider: uploaded.provider.clone(),
            generation: None,
            checksum: None,
        };
        let draft = NewVersion { id: Uuid::new_v4(), project_id: project.id.clone(), src_storage, dist_storage };
        let draft = match self.store.insert_draft(draft).await {
            Ok(d) => d,
            Err(e) => {
                self.discard_object(&uploaded.object_key).await;
                return Err(e);
            }
        };
        let version = match self.sequencer.assign(&draft).await {
            Ok(v) => v,
            Err(e) => {
                warn!(project_id=%project.id, version_id=%draft.id, error=%e, "version.numbering_failed");
                if let Err(re) = self.store.remove(draft.id).await { warn!(version_id=%draft.id, error=%re, "version.draft_cleanup_failed"); }
                self.discard_object(&uploaded.object_key).await;
                return Err(e);
            }
        };
        VERSIONS_CREATED.inc();
        info!(project_id=%project.id, version_id=%version.id, code=?version.code, size=uploaded.size, checksum=%uploaded.checksum.hash, "version.created");

        if !opts.schedule_build { return Ok(version); }
        match self.builds.schedule_build(&version).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(version_id=%version.id, error=%e, "version.create_schedule_failed");
                self.get_by_id(version.id).await
            }
        }
    }

    /// Removes the stored version's artifacts, then the document.
    ///
    /// Decisions are taken on the stored document, not on `version`. The dist object is removed
    /// when the build succeeded, or when a failed build left output behind. Versions with a build
    /// in flight are refused. Both removals are attempted; any failure keeps the document and
    /// reports both sides.
    pub async fn delete(&self, version: &ProjectVersion) -> VersionResult<()> {
        let current = self.get_by_id(version.id).await?;
        let foreign = |v: &ProjectVersion| v.src_storage.provider != self.artifacts.provider();
        if foreign(version) || foreign(&current) {
            return Err(VersionError::invalid("version.srcStorage.provider", "unsupported"));
        }
        if current.build_status.value.is_in_flight() {
            warn!(version_id=%current.id, status=%current.build_status.value, "version.delete_refused");
            return Err(VersionError::BuildInFlight { version_id: current.id.to_string() });
        }
        let dist_key = &current.dist_storage.object_key;
        let remove_dist = current.has_dist()
            || self.artifacts.object_metadata(dist_key, None).await.map_err(VersionError::storage)?.is_some();

        let src = self.artifacts.delete_object(&current.src_storage.object_key);
        let dist = async { if remove_dist { self.artifacts.delete_object(dist_key).await } else { Ok(()) } };
        let (src, dist) = tokio::join!(src, dist);
        if src.is_err() || dist.is_err() {
            let err = VersionError::DeleteFailed {
                src: src.err().map(|e| format!("{e:#}")),
                dist: dist.err().map(|e| format!("{e:#}")),
            };
            warn!(version_id=%current.id, error=%err, "version.delete_failed");
            return Err(err);
        }
        self.store.remove(current.id).await?;
        info!(version_id=%current.id, code=?current.code, dist=remove_dist, "version.deleted");
        Ok(())
    }

    /// Removes up to `limit` drafts older than the draft TTL together with their uploaded source.
    /// Drafts numbered in the meantime are left alone.
    pub async fn sweep_stale_drafts(&self, limit: i64) -> VersionResult<usize> {
        let ttl = chrono::Duration::from_std(self.draft_ttl).map_err(VersionError::storage)?;
        let stale = self.store.list_stale_drafts(Utc::now() - ttl, limit).await?;
        let mut swept = 0;
        for draft in stale {
            if !self.store.remove_draft(draft.id).await? { continue; }
            swept += 1;
            let key = &draft.src_storage.object_key;
            match self.artifacts.object_metadata(key, None).await {
                Ok(Some(_)) => self.discard_object(key).await,
                Ok(None) => {}
                Err(e) => warn!(version_id=%draft.id, object_key=%key, error=%e, "version.draft_source_lookup_failed"),
            }
        }
        DRAFTS_SWEPT.inc_by(swept as u64);
        if swept > 0 { info!(count=swept, "version.drafts_swept"); }
        Ok(swept)
    }

    /// Creates a new version from the source bytes of `code`, through the normal creation path.
    pub async fn restore(&self, project: &ProjectRef, code: &str) -> VersionResult<ProjectVersion> {
        let original = self.get_by_project_and_code(project, code).await?;
        let src = &original.src_storage;
        let stream = self
            .artifacts
            .get_object(&src.object_key, src.generation.as_deref())
            .await
            .map_err(|e| VersionError::UploadFailed(format!("reading {}: {e:#}", src.object_key)))?;
        let restored = self.create(project, Source::Stream(stream), CreateOptions::default()).await?;
        info!(project_id=%project.id, from=%code, code=?restored.code, "version.restored");
        Ok(restored)
    }

    pub async fn get_by_id(&self, id: Uuid) -> VersionResult<ProjectVersion> {
        self.store.get(id).await?.ok_or_else(|| VersionError::not_found("version", id.to_string()))
    }

    pub async fn list_by_project(&self, project: &ProjectRef) -> VersionResult<Vec<ProjectVersion>> {
        project.validate()?;
        self.store.list_by_project(&project.id).await
    }

    pub async fn get_by_project_and_code(&self, project: &ProjectRef, code: &str) -> VersionResult<ProjectVersion> {
        project.validate()?;
        if code.trim().is_empty() { return Err(VersionError::invalid("code", "required")); }
        self.store.find_by_code(&project.id, code).await?.ok_or_else(|| VersionError::not_found("version", code))
    }

    pub async fn get_project_latest(&self, project: &ProjectRef) -> VersionResult<ProjectVersion> {
        project.validate()?;
        self.store.find_latest(&project.id).await?.ok_or_else(|| VersionError::not_found("version", format!("{}@latest", project.id)))
    }

    pub async fn list_by_build_status(&self, statuses: &[BuildStatus], limit: i64) -> VersionResult<Vec<ProjectVersion>> {
        if statuses.is_empty() { return Err(VersionError::invalid("statuses", "required")); }
        self.store.list_by_build_status(statuses, limit).await
    }

    pub async fn schedule_build(&self, version: &ProjectVersion) -> VersionResult<ProjectVersion> {
        self.builds.schedule_build(version).await
    }

    /// Reschedules up to `limit` FAILED builds, oldest first. Individual failures are logged and skipped.
    pub async fn reschedule_failed_builds(&self, limit: i64) -> VersionResult<Vec<ProjectVersion>> {
        let failed = self.store.list_by_build_status(&[BuildStatus::Failed], limit).await?;
        let mut scheduled = Vec::with_capacity(failed.len());
        for v in failed {
            match self.builds.schedule_build(&v).await {
                Ok(s) => scheduled.push(s),
                Err(e) => warn!(version_id=%v.id, error=%e, "build.reschedule_failed"),
            }
        }
        info!(count=scheduled.len(), "build.rescheduled");
        Ok(scheduled)
    }

    pub async fn lease(&self, version: &ProjectVersion, artifact: Artifact, opts: &LeaseOptions) -> VersionResult<Lease> {
        self.leases.get_lease(version, artifact, opts).await
    }

    pub async fn leases_for(&self, version: &ProjectVersion, req: &LeaseRequest) -> VersionResult<Leases> {
        self.leases.get_leases(version, req).await
    }

    /// Read leases named `{versionCode}.{projectCode}-src.zip` / `-dist.zip` for browser downloads.
    pub async fn download_leases(&self, project: &ProjectRef, version: &ProjectVersion, want: DownloadRequest, expires_in: Option<&str>) -> VersionResult<Leases> {
        let code = version.code_str()?;
        let project_code = project.code.as_deref().unwrap_or(&project.id);
        let named = |suffix: &str| {
            let mut o = LeaseOptions::read().filename(format!("{code}.{project_code}-{suffix}.zip"));
            o.expires_in = expires_in.map(str::to_owned);
            o
        };
        let req = LeaseRequest { src: want.src.then(|| named("src")), dist: want.dist.then(|| named("dist")) };
        self.leases.get_leases(version, &req).await
    }

    async fn discard_object(&self, key: &str) {
        if let Err(e) = self.artifacts.delete_object(key).await {
            warn!(key, error=%e, "version.discard_object_failed");
        }
    }
}
