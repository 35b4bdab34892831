use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{VersionError, VersionResult};
use crate::models::{BuildStatus, BuildTransition, DeployTransition, NewVersion, ProjectVersion};

/// Document store contract for version records.
///
/// Queries that serve callers (`find_by_code`, `find_latest`, `list_*`) never
/// return unnumbered drafts. `transition_*` are compare-and-swap writes: they
/// return `None` when the guard does not hold instead of writing.
#[async_trait]
pub trait VersionStore: Send + Sync + 'static {
    /// Persists a draft and stamps its `created_at`. Stamps are strictly increasing per project.
    async fn insert_draft(&self, draft: NewVersion) -> VersionResult<ProjectVersion>;
    /// Fails with `DuplicateCode` when `(project_id, code)` is taken.
    async fn assign_number(&self, id: Uuid, number: i64, code: &str) -> VersionResult<ProjectVersion>;
    /// Most recently created version (draft or not) of the project created strictly before `before`.
    async fn find_previous(&self, project_id: &str, before: DateTime<Utc>) -> VersionResult<Option<ProjectVersion>>;
    async fn get(&self, id: Uuid) -> VersionResult<Option<ProjectVersion>>;
    async fn find_by_code(&self, project_id: &str, code: &str) -> VersionResult<Option<ProjectVersion>>;
    async fn find_latest(&self, project_id: &str) -> VersionResult<Option<ProjectVersion>>;
    /// Ordered by `(created_at, number)` ascending.
    async fn list_by_project(&self, project_id: &str) -> VersionResult<Vec<ProjectVersion>>;
    async fn list_by_build_status(&self, statuses: &[BuildStatus], limit: i64) -> VersionResult<Vec<ProjectVersion>>;
    async fn find_by_build_request(&self, request_id: &str) -> VersionResult<Option<ProjectVersion>>;
    /// Applies `transition` iff the current build status is in `transition.allowed_from()` and,
    /// when `request_id` is given, the stored `build_request_id` equals it.
    async fn transition_build(&self, id: Uuid, request_id: Option<&str>, transition: &BuildTransition) -> VersionResult<Option<ProjectVersion>>;
    async fn transition_deploy(&self, id: Uuid, transition: &DeployTransition) -> VersionResult<Option<ProjectVersion>>;
    /// Returns whether a document was removed.
    async fn remove(&self, id: Uuid) -> VersionResult<bool>;
    /// Unnumbered drafts created before `before`, oldest first.
    async fn list_stale_drafts(&self, before: DateTime<Utc>, limit: i64) -> VersionResult<Vec<ProjectVersion>>;
    /// Removes the document only while it is still an unnumbered draft.
    async fn remove_draft(&self, id: Uuid) -> VersionResult<bool>;
}

#[derive(Debug, Default)]
struct Documents { by_id: HashMap<Uuid, ProjectVersion>, last_stamp: HashMap<String, DateTime<Utc>> }

/// In-process store, used in `memory` mode and by the test harness.
#[derive(Debug, Default)]
pub struct MemoryVersionStore { docs: Mutex<Documents> }

impl MemoryVersionStore {
    pub fn new() -> Self { Self::default() }
}

fn ordered(mut versions: Vec<ProjectVersion>) -> Vec<ProjectVersion> {
    versions.sort_by(|a, b| (a.created_at, a.number).cmp(&(b.created_at, b.number)));
    versions
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn insert_draft(&self, draft: NewVersion) -> VersionResult<ProjectVersion> {
        let mut docs = self.docs.lock().await;
        let now = Utc::now();
        let stamp = match docs.last_stamp.get(&draft.project_id) {
            Some(last) if *last >= now => *last + Duration::microseconds(1),
            _ => now,
        };
        docs.last_stamp.insert(draft.project_id.clone(), stamp);
        let version = draft.into_draft(stamp);
        docs.by_id.insert(version.id, version.clone());
        Ok(version)
    }

    async fn assign_number(&self, id: Uuid, number: i64, code: &str) -> VersionResult<ProjectVersion> {
        let mut docs = self.docs.lock().await;
        let project_id = docs.by_id.get(&id).map(|v| v.project_id.clone()).ok_or_else(|| VersionError::not_found("version", id.to_string()))?;
        let taken = docs.by_id.values().any(|v| v.id != id && v.project_id == project_id && v.code.as_deref() == Some(code));
        if taken { return Err(VersionError::DuplicateCode { project_id, code: code.to_string() }); }
        let v = docs.by_id.get_mut(&id).ok_or_else(|| VersionError::not_found("version", id.to_string()))?;
        v.number = Some(number);
        v.code = Some(code.to_string());
        Ok(v.clone())
    }

    async fn find_previous(&self, project_id: &str, before: DateTime<Utc>) -> VersionResult<Option<ProjectVersion>> {
        let docs = self.docs.lock().await;
        Ok(docs.by_id.values().filter(|v| v.project_id == project_id && v.created_at < before).max_by_key(|v| v.created_at).cloned())
    }

    async fn get(&self, id: Uuid) -> VersionResult<Option<ProjectVersion>> {
        Ok(self.docs.lock().await.by_id.get(&id).cloned())
    }

    async fn find_by_code(&self, project_id: &str, code: &str) -> VersionResult<Option<ProjectVersion>> {
        let docs = self.docs.lock().await;
        Ok(docs.by_id.values().find(|v| v.project_id == project_id && v.code.as_deref() == Some(code)).cloned())
    }

    async fn find_latest(&self, project_id: &str) -> VersionResult<Option<ProjectVersion>> {
        let docs = self.docs.lock().await;
        Ok(docs.by_id.values().filter(|v| v.project_id == project_id && !v.is_draft()).max_by_key(|v| (v.created_at, v.number)).cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> VersionResult<Vec<ProjectVersion>> {
        let docs = self.docs.lock().await;
        Ok(ordered(docs.by_id.values().filter(|v| v.project_id == project_id && !v.is_draft()).cloned().collect()))
    }

    async fn list_by_build_status(&self, statuses: &[BuildStatus], limit: i64) -> VersionResult<Vec<ProjectVersion>> {
        let docs = self.docs.lock().await;
        let mut hits = ordered(docs.by_id.values().filter(|v| !v.is_draft() && statuses.contains(&v.build_status.value)).cloned().collect());
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn find_by_build_request(&self, request_id: &str) -> VersionResult<Option<ProjectVersion>> {
        let docs = self.docs.lock().await;
        Ok(docs.by_id.values().find(|v| v.build_request_id.as_deref() == Some(request_id)).cloned())
    }

    async fn transition_build(&self, id: Uuid, request_id: Option<&str>, transition: &BuildTransition) -> VersionResult<Option<ProjectVersion>> {
        let mut docs = self.docs.lock().await;
        let Some(v) = docs.by_id.get_mut(&id) else { return Ok(None) };
        if !transition.allowed_from().contains(&v.build_status.value) { return Ok(None); }
        if request_id.is_some() && v.build_request_id.as_deref() != request_id { return Ok(None); }
        transition.apply(v, Utc::now());
        Ok(Some(v.clone()))
    }

    async fn transition_deploy(&self, id: Uuid, transition: &DeployTransition) -> VersionResult<Option<ProjectVersion>> {
        let mut docs = self.docs.lock().await;
        let Some(v) = docs.by_id.get_mut(&id) else { return Ok(None) };
        if !transition.allowed_from().contains(&v.deploy_status.value) { return Ok(None); }
        transition.apply(v, Utc::now());
        Ok(Some(v.clone()))
    }

    async fn remove(&self, id: Uuid) -> VersionResult<bool> {
        Ok(self.docs.lock().await.by_id.remove(&id).is_some())
    }

    async fn list_stale_drafts(&self, before: DateTime<Utc>, limit: i64) -> VersionResult<Vec<ProjectVersion>> {
        let docs = self.docs.lock().await;
        let mut drafts = ordered(docs.by_id.values().filter(|v| v.is_draft() && v.created_at < before).cloned().collect());
        drafts.truncate(limit.max(0) as usize);
        Ok(drafts)
    }

    async fn remove_draft(&self, id: Uuid) -> VersionResult<bool> {
        let mut docs = self.docs.lock().await;
        if !docs.by_id.get(&id).is_some_and(ProjectVersion::is_draft) { return Ok(false); }
        Ok(docs.by_id.remove(&id).is_some())
    }
}
