use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::models::ProjectVersion;

pub const VERSION_BUILT: &str = "version.built";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub project_id: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl DeployRequest {
    pub fn version_built(v: &ProjectVersion) -> Self {
        Self {
            kind: VERSION_BUILT.into(),
            project_id: v.project_id.clone(),
            detail: serde_json::json!({
                "versionId": v.id,
                "versionCode": v.code,
                "distObjectKey": v.dist_storage.object_key,
                "distGeneration": v.dist_storage.generation,
            }),
        }
    }
}

/// Downstream website deployer. Calls are fire-and-forget from the core's point of view.
#[async_trait]
pub trait DeployNotifier: Send + Sync + 'static {
    async fn schedule(&self, request: &DeployRequest) -> anyhow::Result<()>;
}

/// Used when no deployer is wired; only records the intent in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeployNotifier;

#[async_trait]
impl DeployNotifier for LogDeployNotifier {
    async fn schedule(&self, request: &DeployRequest) -> anyhow::Result<()> {
        info!(kind=%request.kind, project_id=%request.project_id, "deploy.skipped_no_deployer");
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployOutcome { Succeeded, Failed }

/// Result message published by the deployer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    pub version_id: Uuid,
    pub outcome: DeployOutcome,
    #[serde(default)]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_event_parses() {
        let ev: DeployEvent = serde_json::from_str(r#"{"versionId":"00000000-0000-0000-0000-000000000000","outcome":"failed","reason":"dns"}"#).unwrap();
        assert_eq!(ev.outcome, DeployOutcome::Failed);
        assert_eq!(ev.reason.as_deref(), Some("dns"));
    }
}
