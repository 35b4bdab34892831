use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::debug;

use crate::error::{VersionError, VersionResult};
use crate::models::ProjectVersion;
use crate::storage::{ArtifactStore, LeaseAction, SignedUrlOptions};
use crate::telemetry::{LEASES_ISSUED, LEASE_SUBSTITUTIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Artifact { Src, Dist }

impl Artifact {
    pub fn as_str(&self) -> &'static str { match self { Self::Src => "src", Self::Dist => "dist" } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOptions {
    pub action: LeaseAction,
    /// humantime duration; the issuer default applies when absent.
    pub expires_in: Option<String>,
    /// Suggested download name, honoured on read leases only.
    pub filename: Option<String>,
}

impl LeaseOptions {
    pub fn read() -> Self { Self { action: LeaseAction::Read, expires_in: None, filename: None } }
    pub fn write() -> Self { Self { action: LeaseAction::Write, expires_in: None, filename: None } }
    pub fn expires_in(mut self, d: impl Into<String>) -> Self { self.expires_in = Some(d.into()); self }
    pub fn filename(mut self, f: impl Into<String>) -> Self { self.filename = Some(f.into()); self }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    /// Artifact the URL actually points at.
    pub artifact: Artifact,
    pub action: LeaseAction,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
    /// A dist read answered with the source because no build output exists.
    pub substituted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseRequest { pub src: Option<LeaseOptions>, pub dist: Option<LeaseOptions> }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Leases { pub src: Option<Lease>, pub dist: Option<Lease> }

#[derive(Clone)]
pub struct LeaseIssuer {
    store: Arc<dyn ArtifactStore>,
    default_ttl: Duration,
    dist_content_type: String,
}

impl LeaseIssuer {
    pub fn new(store: Arc<dyn ArtifactStore>, default_ttl: Duration, dist_content_type: impl Into<String>) -> Self {
        Self { store, default_ttl, dist_content_type: dist_content_type.into() }
    }

    fn expiry(&self, expires_in: Option<&str>) -> VersionResult<DateTime<Utc>> {
        let ttl = match expires_in {
            Some(raw) => humantime::parse_duration(raw).map_err(|_| VersionError::invalid("expiresIn", "invalid"))?,
            None => self.default_ttl,
        };
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| VersionError::invalid("expiresIn", "invalid"))?;
        Ok(Utc::now() + ttl)
    }

    pub async fn get_lease(&self, version: &ProjectVersion, artifact: Artifact, opts: &LeaseOptions) -> VersionResult<Lease> {
        match (artifact, opts.action) {
            (Artifact::Src, LeaseAction::Write) => Err(VersionError::invalid("action", "unsupported")),
            (Artifact::Src, LeaseAction::Read) => self.read_lease(version, Artifact::Src, opts, false).await,
            (Artifact::Dist, LeaseAction::Read) if !version.has_dist() => {
                LEASE_SUBSTITUTIONS.inc();
                debug!(version_id=%version.id, build_status=%version.build_status.value, "lease.dist_substituted");
                self.read_lease(version, Artifact::Src, opts, true).await
            }
            (Artifact::Dist, LeaseAction::Read) => self.read_lease(version, Artifact::Dist, opts, false).await,
            (Artifact::Dist, LeaseAction::Write) => self.write_lease(version, opts).await,
        }
    }

    pub async fn src_lease(&self, version: &ProjectVersion, opts: &LeaseOptions) -> VersionResult<Lease> {
        self.get_lease(version, Artifact::Src, opts).await
    }

    pub async fn dist_lease(&self, version: &ProjectVersion, opts: &LeaseOptions) -> VersionResult<Lease> {
        self.get_lease(version, Artifact::Dist, opts).await
    }

    /// Issues the requested subset concurrently.
    pub async fn get_leases(&self, version: &ProjectVersion, req: &LeaseRequest) -> VersionResult<Leases> {
        let src = async {
            match &req.src { Some(o) => self.get_lease(version, Artifact::Src, o).await.map(Some), None => Ok(None) }
        };
        let dist = async {
            match &req.dist { Some(o) => self.get_lease(version, Artifact::Dist, o).await.map(Some), None => Ok(None) }
        };
        let (src, dist) = tokio::try_join!(src, dist)?;
        Ok(Leases { src, dist })
    }

    async fn read_lease(&self, version: &ProjectVersion, served: Artifact, opts: &LeaseOptions, substituted: bool) -> VersionResult<Lease> {
        let record = match served { Artifact::Src => &version.src_storage, Artifact::Dist => &version.dist_storage };
        let expires_at = self.expiry(opts.expires_in.as_deref())?;
        let signed = SignedUrlOptions {
            action: LeaseAction::Read,
            expires_at,
            generation: record.generation.clone(),
            content_type: None,
            response_filename: opts.filename.clone(),
        };
        let url = self.store.signed_url(&record.object_key, &signed).await.map_err(VersionError::storage)?;
        LEASES_ISSUED.with_label_values(&[served.as_str(), "read"]).inc();
        Ok(Lease { artifact: served, action: LeaseAction::Read, url: url.url, method: url.method, headers: url.headers, expires_at, substituted })
    }

    /// Write grants are pinned to the revision currently in the store, so two builders cannot both land.
    async fn write_lease(&self, version: &ProjectVersion, opts: &LeaseOptions) -> VersionResult<Lease> {
        let key = &version.dist_storage.object_key;
        let expires_at = self.expiry(opts.expires_in.as_deref())?;
        let current = self.store.object_metadata(key, None).await.map_err(VersionError::storage)?;
        let signed = SignedUrlOptions {
            action: LeaseAction::Write,
            expires_at,
            generation: current.map(|m| m.generation),
            content_type: Some(self.dist_content_type.clone()),
            response_filename: None,
        };
        let url = self.store.signed_url(key, &signed).await.map_err(VersionError::storage)?;
        LEASES_ISSUED.with_label_values(&["dist", "write"]).inc();
        Ok(Lease { artifact: Artifact::Dist, action: LeaseAction::Write, url: url.url, method: url.method, headers: url.headers, expires_at, substituted: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildStatus, NewVersion, StorageRecord};
    use crate::storage::{bytes_body, MemoryArtifactStore};
    use uuid::Uuid;

    async fn fixture() -> (Arc<MemoryArtifactStore>, LeaseIssuer, ProjectVersion) {
        let store = Arc::new(MemoryArtifactStore::new("http://localhost:9000", "b", "s"));
        let meta = store.put_object("p/src.zip", None, bytes_body("zip")).await.unwrap();
        let rec = |key: &str, generation: Option<String>| StorageRecord { object_key: key.into(), provider: "memory".into(), generation, checksum: None };
        let v = NewVersion {
            id: Uuid::new_v4(),
            project_id: "p".into(),
            src_storage: rec("p/src.zip", Some(meta.generation)),
            dist_storage: rec("p/dist.zip", None),
        }
        .into_draft(Utc::now());
        let issuer = LeaseIssuer::new(store.clone(), Duration::from_secs(3 * 3600), "application/zip");
        (store, issuer, v)
    }

    #[tokio::test]
    async fn src_is_read_only() {
        let (_, issuer, v) = fixture().await;
        let err = issuer.src_lease(&v, &LeaseOptions::write()).await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidOption { option: "action", kind: "unsupported" }));
    }

    #[tokio::test]
    async fn dist_read_falls_back_to_source_until_built() {
        let (store, issuer, mut v) = fixture().await;
        for status in [BuildStatus::NotScheduled, BuildStatus::Scheduled, BuildStatus::Failed] {
            v.build_status.value = status;
            let lease = issuer.dist_lease(&v, &LeaseOptions::read()).await.unwrap();
            assert!(lease.substituted);
            assert_eq!(lease.artifact, Artifact::Src);
            assert_eq!(store.read_with_lease(&lease.url).unwrap(), bytes::Bytes::from("zip"));
        }
    }

    #[tokio::test]
    async fn ttl_parsing() {
        let (_, issuer, v) = fixture().await;
        let lease = issuer.src_lease(&v, &LeaseOptions::read().expires_in("15min")).await.unwrap();
        let left = lease.expires_at - Utc::now();
        assert!(left <= chrono::Duration::minutes(15) && left > chrono::Duration::minutes(14));
        let default = issuer.src_lease(&v, &LeaseOptions::read()).await.unwrap();
        assert!(default.expires_at - Utc::now() > chrono::Duration::hours(2));
        let err = issuer.src_lease(&v, &LeaseOptions::read().expires_in("whenever")).await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidOption { option: "expiresIn", .. }));
    }

    #[tokio::test]
    async fn write_lease_carries_content_type() {
        let (store, issuer, v) = fixture().await;
        let lease = issuer.dist_lease(&v, &LeaseOptions::write()).await.unwrap();
        assert_eq!(lease.method, "PUT");
        assert_eq!(lease.headers.get("content-type").map(String::as_str), Some("application/zip"));
        store.write_with_lease(&lease.url, Some("application/zip"), bytes::Bytes::from("built")).unwrap();
        // issued for the empty slot, so unpinned
        assert!(store.write_with_lease(&lease.url, Some("application/zip"), bytes::Bytes::from("again")).is_ok());
        let pinned = issuer.dist_lease(&v, &LeaseOptions::write()).await.unwrap();
        store.write_with_lease(&pinned.url, None, bytes::Bytes::from("rebuild")).unwrap();
        assert!(store.write_with_lease(&pinned.url, None, bytes::Bytes::from("stale")).is_err());
    }

    #[tokio::test]
    async fn batched_leases_only_include_requested() {
        let (_, issuer, v) = fixture().await;
        let out = issuer.get_leases(&v, &LeaseRequest { src: Some(LeaseOptions::read()), dist: None }).await.unwrap();
        assert!(out.src.is_some());
        assert!(out.dist.is_none());
    }
}
