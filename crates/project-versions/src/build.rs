use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::deploy::{DeployNotifier, DeployOutcome, DeployRequest};
use crate::error::{VersionError, VersionResult};
use crate::leases::{LeaseIssuer, LeaseOptions};
use crate::models::{BuildTransition, DeployTransition, ProjectVersion};
use crate::storage::ArtifactStore;
use crate::store::VersionStore;
use crate::telemetry::{BUILDS_SCHEDULED, BUILD_RESULTS, DEPLOY_NOTIFY_FAILURES, STALE_CALLBACKS};
use crate::worker::{BuildDestination, BuildReport, BuildRequest, BuildSource, BuildWorker};

/// Drives `build_status` and `deploy_status`. All writes are guarded transitions on the store.
#[derive(Clone)]
pub struct BuildCoordinator {
    store: Arc<dyn VersionStore>,
    artifacts: Arc<dyn ArtifactStore>,
    leases: LeaseIssuer,
    worker: Arc<dyn BuildWorker>,
    deploy: Arc<dyn DeployNotifier>,
}

impl BuildCoordinator {
    pub fn new(
        store: Arc<dyn VersionStore>,
        artifacts: Arc<dyn ArtifactStore>,
        leases: LeaseIssuer,
        worker: Arc<dyn BuildWorker>,
        deploy: Arc<dyn DeployNotifier>,
    ) -> Self {
        Self { store, artifacts, leases, worker, deploy }
    }

    /// Idempotent: a version with a build in flight is returned untouched.
    ///
    /// The SCHEDULED claim carries the request id the worker reports results under and is
    /// written before the worker sees anything, so concurrent callers cannot both enqueue and
    /// an early worker callback always finds its version.
    pub async fn schedule_build(&self, version: &ProjectVersion) -> VersionResult<ProjectVersion> {
        if version.is_draft() { return Err(VersionError::invalid("version", "required")); }
        let current = self.store.get(version.id).await?.ok_or_else(|| VersionError::not_found("version", version.id.to_string()))?;
        if current.build_status.value.is_in_flight() {
            info!(version_id=%current.id, status=%current.build_status.value, "build.already_in_flight");
            return Ok(current);
        }

        let claim = Uuid::new_v4().to_string();
        let Some(claimed) = self.store.transition_build(current.id, None, &BuildTransition::Schedule { request_id: claim.clone() }).await? else {
            // lost the race to another scheduler
            return self.reload(current.id).await;
        };

        let request = match self.build_request(&claimed, &claim).await {
            Ok(r) => r,
            Err(e) => return Err(self.abandon(&claimed, &claim, format!("lease issuance failed: {e}"), e).await),
        };
        if let Err(e) = self.worker.schedule(&request).await {
            let reason = format!("enqueue failed: {e:#}");
            return Err(self.abandon(&claimed, &claim, reason, VersionError::storage(e)).await);
        }
        BUILDS_SCHEDULED.inc();
        info!(version_id=%claimed.id, code=?claimed.code, build_request_id=%claim, "build.scheduled");
        // callbacks may already have moved it past SCHEDULED
        self.reload(claimed.id).await
    }

    async fn build_request(&self, version: &ProjectVersion, request_id: &str) -> VersionResult<BuildRequest> {
        let (read, write) = (LeaseOptions::read(), LeaseOptions::write());
        let (src, dest) = tokio::try_join!(self.leases.src_lease(version, &read), self.leases.dist_lease(version, &write))?;
        Ok(BuildRequest {
            request_id: request_id.to_string(),
            project_id: version.project_id.clone(),
            version_id: version.id,
            version_code: version.code_str()?.to_string(),
            src: BuildSource { url: src.url },
            dest: BuildDestination { method: dest.method, url: dest.url, headers: dest.headers },
        })
    }

    /// Releases a claim that never reached the worker; the version ends FAILED so it can be rescheduled.
    async fn abandon(&self, version: &ProjectVersion, claim: &str, reason: String, err: VersionError) -> VersionError {
        warn!(version_id=%version.id, %reason, "build.schedule_failed");
        if let Err(e) = self.store.transition_build(version.id, Some(claim), &BuildTransition::Fail { reason: Some(reason) }).await {
            warn!(version_id=%version.id, error=%e, "build.release_claim_failed");
        }
        err
    }

    async fn reload(&self, id: Uuid) -> VersionResult<ProjectVersion> {
        self.store.get(id).await?.ok_or_else(|| VersionError::not_found("version", id.to_string()))
    }

    async fn in_flight(&self, build_request_id: &str, event: &str) -> VersionResult<ProjectVersion> {
        match self.store.find_by_build_request(build_request_id).await? {
            Some(v) if v.build_status.value.is_in_flight() => Ok(v),
            _ => Err(self.stale(build_request_id, event)),
        }
    }

    fn stale(&self, build_request_id: &str, event: &str) -> VersionError {
        STALE_CALLBACKS.inc();
        warn!(build_request_id, event, "build.callback_stale");
        VersionError::not_found("build request", build_request_id)
    }

    pub async fn handle_build_started(&self, build_request_id: &str) -> VersionResult<ProjectVersion> {
        let v = self.in_flight(build_request_id, "started").await?;
        match self.store.transition_build(v.id, Some(build_request_id), &BuildTransition::Start).await? {
            Some(v) => {
                info!(version_id=%v.id, build_request_id, "build.started");
                Ok(v)
            }
            None => Err(self.stale(build_request_id, "started")),
        }
    }

    /// Marks the build SUCCEEDED with the dist revision actually present in the store, then
    /// notifies the deployer. Notification failures are logged only.
    pub async fn handle_build_success(&self, build_request_id: &str, report: &BuildReport) -> VersionResult<ProjectVersion> {
        let v = self.in_flight(build_request_id, "succeeded").await?;
        let meta = self.artifacts.object_metadata(&v.dist_storage.object_key, None).await.map_err(VersionError::storage)?;
        let Some(meta) = meta else {
            warn!(version_id=%v.id, build_request_id, "build.success_without_output");
            let reason = Some("worker reported success but no build output was written".to_string());
            return self.finish(&v, build_request_id, BuildTransition::Fail { reason }, "failed").await;
        };
        let succeeded = self
            .finish(&v, build_request_id, BuildTransition::Succeed { dist_generation: Some(meta.generation) }, "succeeded")
            .await?;
        if let Some(msg) = &report.message { info!(version_id=%succeeded.id, report=%msg, "build.report"); }
        Ok(self.notify_deploy(succeeded).await)
    }

    pub async fn handle_build_failure(&self, build_request_id: &str, report: &BuildReport) -> VersionResult<ProjectVersion> {
        let v = self.in_flight(build_request_id, "failed").await?;
        self.finish(&v, build_request_id, BuildTransition::Fail { reason: report.message.clone() }, "failed").await
    }

    async fn finish(&self, v: &ProjectVersion, build_request_id: &str, transition: BuildTransition, outcome: &str) -> VersionResult<ProjectVersion> {
        match self.store.transition_build(v.id, Some(build_request_id), &transition).await? {
            Some(done) => {
                BUILD_RESULTS.with_label_values(&[outcome]).inc();
                info!(version_id=%done.id, code=?done.code, build_request_id, outcome, reason=?done.build_status.reason, "build.finished");
                Ok(done)
            }
            None => Err(self.stale(build_request_id, outcome)),
        }
    }

    async fn notify_deploy(&self, version: ProjectVersion) -> ProjectVersion {
        let request = DeployRequest::version_built(&version);
        if let Err(e) = self.deploy.schedule(&request).await {
            DEPLOY_NOTIFY_FAILURES.inc();
            warn!(version_id=%version.id, error=%e, "deploy.notify_failed");
            return version;
        }
        match self.store.transition_deploy(version.id, &DeployTransition::Schedule).await {
            Ok(Some(v)) => v,
            Ok(None) => version,
            Err(e) => {
                warn!(version_id=%version.id, error=%e, "deploy.status_update_failed");
                version
            }
        }
    }

    /// Applies a deployer result. Results for versions with no deploy in flight are rejected as `NotFound`.
    pub async fn record_deploy_result(&self, version_id: Uuid, outcome: DeployOutcome, reason: Option<String>) -> VersionResult<ProjectVersion> {
        let transition = match outcome {
            DeployOutcome::Succeeded => DeployTransition::Succeed,
            DeployOutcome::Failed => DeployTransition::Fail { reason },
        };
        match self.store.transition_deploy(version_id, &transition).await? {
            Some(v) => {
                info!(version_id=%v.id, status=%v.deploy_status.value, "deploy.finished");
                Ok(v)
            }
            None => {
                warn!(%version_id, ?outcome, "deploy.callback_stale");
                Err(VersionError::not_found("deploy request", version_id.to_string()))
            }
        }
    }
}
