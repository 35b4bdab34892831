use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{VersionError, VersionResult};

/// The owning project, as far as the version core cares about it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub id: String,
    /// Slug-like project code, only used to name downloads.
    pub code: Option<String>,
}

impl ProjectRef {
    pub fn new(id: impl Into<String>) -> Self { Self { id: id.into(), code: None } }
    pub fn with_code(mut self, code: impl Into<String>) -> Self { self.code = Some(code.into()); self }

    pub(crate) fn validate(&self) -> VersionResult<()> {
        if self.id.trim().is_empty() { return Err(VersionError::invalid("project", "required")); }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Checksum { pub alg: String, pub hash: String }

/// Location of a stored artifact at the storage provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    pub object_key: String,
    pub provider: String,
    /// Provider revision token of the object; `None` until bytes exist.
    pub generation: Option<String>,
    pub checksum: Option<Checksum>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus { NotScheduled, Scheduled, Started, Succeeded, Failed }

impl BuildStatus {
    pub const ALL: [BuildStatus; 5] = [Self::NotScheduled, Self::Scheduled, Self::Started, Self::Succeeded, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotScheduled => "not_scheduled",
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// A build request is outstanding at the worker.
    pub fn is_in_flight(&self) -> bool { matches!(self, Self::Scheduled | Self::Started) }

    pub fn can_transition_to(&self, target: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (*self, target),
            (NotScheduled | Succeeded | Failed, Scheduled)
                | (Scheduled, Started)
                | (Scheduled | Started, Succeeded | Failed)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus { NotScheduled, Scheduled, Succeeded, Failed }

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotScheduled => "not_scheduled",
            Self::Scheduled => "scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, target: DeployStatus) -> bool {
        use DeployStatus::*;
        matches!((*self, target), (NotScheduled | Succeeded | Failed, Scheduled) | (Scheduled, Succeeded | Failed))
    }
}

macro_rules! status_from_str {
    ($ty:ident, $($variant:ident),+) => {
        impl FromStr for $ty {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $( if s == $ty::$variant.as_str() { return Ok($ty::$variant); } )+
                Err(anyhow::anyhow!("unknown {} value {s:?}", stringify!($ty)))
            }
        }
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }
    };
}

status_from_str!(BuildStatus, NotScheduled, Scheduled, Started, Succeeded, Failed);
status_from_str!(DeployStatus, NotScheduled, Scheduled, Succeeded, Failed);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord<S> {
    pub value: S,
    pub updated_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl<S> StatusRecord<S> {
    pub fn new(value: S, at: DateTime<Utc>) -> Self { Self { value, updated_at: at, reason: None } }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectVersion {
    pub id: Uuid,
    pub project_id: String,
    /// `None` only while the version is an unnumbered draft.
    pub number: Option<i64>,
    pub code: Option<String>,
    pub src_storage: StorageRecord,
    pub dist_storage: StorageRecord,
    pub build_status: StatusRecord<BuildStatus>,
    pub deploy_status: StatusRecord<DeployStatus>,
    pub build_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProjectVersion {
    pub fn is_draft(&self) -> bool { self.code.is_none() }

    pub fn code_str(&self) -> VersionResult<&str> {
        self.code.as_deref().ok_or(VersionError::invalid("version.code", "required"))
    }

    /// The distribution artifact only holds usable bytes after a successful build.
    pub fn has_dist(&self) -> bool { self.build_status.value == BuildStatus::Succeeded }
}

/// Draft document persisted before the sequencer names the version.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub id: Uuid,
    pub project_id: String,
    pub src_storage: StorageRecord,
    pub dist_storage: StorageRecord,
}

impl NewVersion {
    /// Materialises the draft with the creation timestamp chosen by the store.
    pub fn into_draft(self, created_at: DateTime<Utc>) -> ProjectVersion {
        ProjectVersion {
            id: self.id,
            project_id: self.project_id,
            number: None,
            code: None,
            src_storage: self.src_storage,
            dist_storage: self.dist_storage,
            build_status: StatusRecord::new(BuildStatus::NotScheduled, created_at),
            deploy_status: StatusRecord::new(DeployStatus::NotScheduled, created_at),
            build_request_id: None,
            created_at,
        }
    }
}

/// Guarded build status change. Every write of `build_status` goes through one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildTransition {
    Schedule { request_id: String },
    Start,
    Succeed { dist_generation: Option<String> },
    Fail { reason: Option<String> },
}

impl BuildTransition {
    pub fn target(&self) -> BuildStatus {
        match self {
            Self::Schedule { .. } => BuildStatus::Scheduled,
            Self::Start => BuildStatus::Started,
            Self::Succeed { .. } => BuildStatus::Succeeded,
            Self::Fail { .. } => BuildStatus::Failed,
        }
    }

    pub fn allowed_from(&self) -> Vec<BuildStatus> {
        BuildStatus::ALL.into_iter().filter(|s| s.can_transition_to(self.target())).collect()
    }

    pub fn request_id_after(&self, current: Option<&str>) -> Option<String> {
        match self {
            Self::Schedule { request_id } => Some(request_id.clone()),
            Self::Start => current.map(str::to_owned),
            Self::Succeed { .. } | Self::Fail { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self { Self::Fail { reason } => reason.clone(), _ => None }
    }

    /// Applies the change to an in-memory document; callers check `allowed_from` first.
    pub fn apply(&self, version: &mut ProjectVersion, now: DateTime<Utc>) {
        version.build_request_id = self.request_id_after(version.build_request_id.as_deref());
        if let Self::Succeed { dist_generation } = self { version.dist_storage.generation = dist_generation.clone(); }
        version.build_status = StatusRecord { value: self.target(), updated_at: now, reason: self.reason() };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployTransition { Schedule, Succeed, Fail { reason: Option<String> } }

impl DeployTransition {
    pub fn target(&self) -> DeployStatus {
        match self {
            Self::Schedule => DeployStatus::Scheduled,
            Self::Succeed => DeployStatus::Succeeded,
            Self::Fail { .. } => DeployStatus::Failed,
        }
    }

    pub fn allowed_from(&self) -> Vec<DeployStatus> {
        [DeployStatus::NotScheduled, DeployStatus::Scheduled, DeployStatus::Succeeded, DeployStatus::Failed]
            .into_iter()
            .filter(|s| s.can_transition_to(self.target()))
            .collect()
    }

    pub fn reason(&self) -> Option<String> {
        match self { Self::Fail { reason } => reason.clone(), _ => None }
    }

    pub fn apply(&self, version: &mut ProjectVersion, now: DateTime<Utc>) {
        version.deploy_status = StatusRecord { value: self.target(), updated_at: now, reason: self.reason() };
    }
}

pub fn version_code(number: i64) -> String { format!("v{number}") }

pub fn src_object_key(project_id: &str, upload_id: Uuid) -> String {
    format!("projects/{project_id}/versions/{upload_id}/src.zip")
}

/// The dist key lives next to the src key so it never needs a lookup.
pub fn dist_object_key(src_key: &str) -> String {
    match src_key.strip_suffix("src.zip") {
        Some(prefix) => format!("{prefix}dist.zip"),
        None => format!("{src_key}.dist"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_transitions() {
        use BuildStatus::*;
        assert!(NotScheduled.can_transition_to(Scheduled));
        assert!(Failed.can_transition_to(Scheduled));
        assert!(Succeeded.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Started));
        assert!(Started.can_transition_to(Failed));
        assert!(!NotScheduled.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Scheduled.can_transition_to(Scheduled));
        assert!(!Started.can_transition_to(Scheduled));
    }

    #[test]
    fn allowed_from_follows_transition_table() {
        let t = BuildTransition::Succeed { dist_generation: None };
        assert_eq!(t.allowed_from(), vec![BuildStatus::Scheduled, BuildStatus::Started]);
        let s = BuildTransition::Schedule { request_id: "r".into() };
        assert_eq!(s.allowed_from(), vec![BuildStatus::NotScheduled, BuildStatus::Succeeded, BuildStatus::Failed]);
        assert_eq!(DeployTransition::Succeed.allowed_from(), vec![DeployStatus::Scheduled]);
    }

    #[test]
    fn status_strings_round_trip() {
        for s in BuildStatus::ALL { assert_eq!(s.as_str().parse::<BuildStatus>().unwrap(), s); }
        assert!("bogus".parse::<DeployStatus>().is_err());
    }

    #[test]
    fn dist_key_derivation() {
        let id = Uuid::nil();
        let src = src_object_key("p1", id);
        assert_eq!(src, "projects/p1/versions/00000000-0000-0000-0000-000000000000/src.zip");
        assert_eq!(dist_object_key(&src), "projects/p1/versions/00000000-0000-0000-0000-000000000000/dist.zip");
        assert_eq!(dist_object_key("legacy"), "legacy.dist");
        assert_eq!(version_code(3), "v3");
    }

    #[test]
    fn terminal_transition_clears_request_id() {
        let now = Utc::now();
        let mut v = NewVersion {
            id: Uuid::new_v4(),
            project_id: "p".into(),
            src_storage: StorageRecord { object_key: "a/src.zip".into(), provider: "memory".into(), generation: Some("1".into()), checksum: None },
            dist_storage: StorageRecord { object_key: "a/dist.zip".into(), provider: "memory".into(), generation: None, checksum: None },
        }
        .into_draft(now);
        BuildTransition::Schedule { request_id: "r1".into() }.apply(&mut v, now);
        assert_eq!(v.build_request_id.as_deref(), Some("r1"));
        BuildTransition::Start.apply(&mut v, now);
        assert_eq!(v.build_request_id.as_deref(), Some("r1"));
        BuildTransition::Fail { reason: Some("exit 1".into()) }.apply(&mut v, now);
        assert_eq!(v.build_status.value, BuildStatus::Failed);
        assert_eq!(v.build_status.reason.as_deref(), Some("exit 1"));
        assert!(v.build_request_id.is_none());
    }
}
