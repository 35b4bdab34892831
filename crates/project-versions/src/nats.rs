//! NATS transport for the build worker and the website deployer.
//!
//! Requests go to `{subject}.requests`; workers publish results to
//! `{subject}.results`, consumed through a queue group so that several
//! replicas of this service share the load.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::build::BuildCoordinator;
use crate::config::QueueConfig;
use crate::deploy::{DeployEvent, DeployNotifier, DeployRequest};
use crate::worker::{dispatch_event, BuildRequest, BuildWorker, WorkerEvent};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn connect(url: &str) -> Result<async_nats::Client> {
    info!(%url, "nats.connect");
    let client = timeout(Duration::from_secs(5), async_nats::connect(url)).await??;
    info!("nats.connected");
    Ok(client)
}

async fn publish_json<T: serde::Serialize>(client: &async_nats::Client, subject: String, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    timeout(PUBLISH_TIMEOUT, client.publish(subject.clone(), payload.into()))
        .await
        .map_err(|_| anyhow::anyhow!("timeout publishing to {subject}"))??;
    // a dead connection must fail the enqueue
    timeout(PUBLISH_TIMEOUT, client.flush()).await.map_err(|_| anyhow::anyhow!("timeout flushing {subject}"))??;
    Ok(())
}

#[derive(Clone, Debug)]
pub struct NatsBuildWorker {
    client: async_nats::Client,
    subject: String,
    queue_group: String,
}

impl NatsBuildWorker {
    pub fn new(client: async_nats::Client, cfg: &QueueConfig) -> Self {
        Self { client, subject: cfg.build_subject.clone(), queue_group: cfg.queue_group.clone() }
    }

    /// Consumes worker results until the subscription ends.
    pub async fn listen(&self, builds: BuildCoordinator) -> Result<()> {
        let subject = format!("{}.results", self.subject);
        let mut sub = self.client.queue_subscribe(subject.clone(), self.queue_group.clone()).await?;
        info!(%subject, group=%self.queue_group, "build_results.listening");
        while let Some(msg) = sub.next().await {
            let event: WorkerEvent = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error=%e, "build_results.malformed");
                    continue;
                }
            };
            let id = event.build_request_id().to_string();
            match dispatch_event(&builds, event).await {
                Ok(v) => debug!(build_request_id=%id, status=%v.build_status.value, "build_results.applied"),
                // stale callbacks are already logged by the coordinator
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(build_request_id=%id, error=%e, "build_results.apply_failed"),
            }
        }
        warn!(%subject, "build_results.subscription_closed");
        Ok(())
    }
}

#[async_trait]
impl BuildWorker for NatsBuildWorker {
    async fn schedule(&self, request: &BuildRequest) -> Result<()> {
        publish_json(&self.client, format!("{}.requests", self.subject), request).await?;
        debug!(build_request_id=%request.request_id, "build_request.published");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NatsDeployNotifier {
    client: async_nats::Client,
    subject: String,
    queue_group: String,
}

impl NatsDeployNotifier {
    pub fn new(client: async_nats::Client, cfg: &QueueConfig) -> Self {
        Self { client, subject: cfg.deploy_subject.clone(), queue_group: cfg.queue_group.clone() }
    }

    pub async fn listen(&self, builds: BuildCoordinator) -> Result<()> {
        let subject = format!("{}.results", self.subject);
        let mut sub = self.client.queue_subscribe(subject.clone(), self.queue_group.clone()).await?;
        info!(%subject, "deploy_results.listening");
        while let Some(msg) = sub.next().await {
            let event: DeployEvent = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error=%e, "deploy_results.malformed");
                    continue;
                }
            };
            if let Err(e) = builds.record_deploy_result(event.version_id, event.outcome, event.reason).await {
                if !e.is_not_found() { warn!(version_id=%event.version_id, error=%e, "deploy_results.apply_failed"); }
            }
        }
        warn!(%subject, "deploy_results.subscription_closed");
        Ok(())
    }
}

#[async_trait]
impl DeployNotifier for NatsDeployNotifier {
    async fn schedule(&self, request: &DeployRequest) -> Result<()> {
        publish_json(&self.client, format!("{}.requests", self.subject), request).await
    }
}
