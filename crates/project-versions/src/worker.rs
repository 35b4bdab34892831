use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::build::BuildCoordinator;
use crate::error::VersionResult;
use crate::models::ProjectVersion;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildSource { pub url: String }

/// Where the worker must upload the build output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildDestination {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// Proposed correlation id; workers echo it back unless they assign their own.
    pub request_id: String,
    pub project_id: String,
    pub version_id: Uuid,
    pub version_code: String,
    pub src: BuildSource,
    pub dest: BuildDestination,
}

/// Free-form payload attached to worker results.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl BuildReport {
    pub fn message(msg: impl Into<String>) -> Self { Self { message: Some(msg.into()), detail: serde_json::Value::Null } }
}

/// Client side of the external build worker.
#[async_trait]
pub trait BuildWorker: Send + Sync + 'static {
    /// Enqueues the request. Results must be reported under `request.request_id`.
    async fn schedule(&self, request: &BuildRequest) -> anyhow::Result<()>;
}

/// Inbound worker messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event")]
pub enum WorkerEvent {
    #[serde(rename = "started", rename_all = "camelCase")]
    Started { build_request_id: String },
    #[serde(rename = "result:success", rename_all = "camelCase")]
    Succeeded { build_request_id: String, #[serde(default)] report: BuildReport },
    #[serde(rename = "result:error", rename_all = "camelCase")]
    Failed { build_request_id: String, #[serde(default)] report: BuildReport },
}

impl WorkerEvent {
    pub fn build_request_id(&self) -> &str {
        match self {
            Self::Started { build_request_id } | Self::Succeeded { build_request_id, .. } | Self::Failed { build_request_id, .. } => build_request_id,
        }
    }
}

/// Routes a worker event to the matching state machine handler.
pub async fn dispatch_event(builds: &BuildCoordinator, event: WorkerEvent) -> VersionResult<ProjectVersion> {
    match event {
        WorkerEvent::Started { build_request_id } => builds.handle_build_started(&build_request_id).await,
        WorkerEvent::Succeeded { build_request_id, report } => builds.handle_build_success(&build_request_id, &report).await,
        WorkerEvent::Failed { build_request_id, report } => builds.handle_build_failure(&build_request_id, &report).await,
    }
}
