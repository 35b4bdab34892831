use anyhow::Context;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use project_versions::{
    config::Config,
    db::{init_db, PgVersionStore},
    logging::init_logging,
    nats::{connect, NatsBuildWorker, NatsDeployNotifier},
    storage::StorageManager,
    store::{MemoryVersionStore, VersionStore},
    VersionService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    init_logging(&cfg.log.level, cfg.log.format)?;

    let storage = StorageManager::from_config(&cfg.storage).await;
    let store: Arc<dyn VersionStore> = match &cfg.database_url {
        Some(url) => Arc::new(PgVersionStore::new(init_db(url).await.context("database init")?)),
        None => {
            info!("no database configured, using in-memory version store");
            Arc::new(MemoryVersionStore::new())
        }
    };

    let nats_url = cfg.queue.nats_url.clone().context("PV_NATS_URL is required to reach the build worker")?;
    let client = connect(&nats_url).await?;
    let worker = NatsBuildWorker::new(client.clone(), &cfg.queue);
    let deployer = NatsDeployNotifier::new(client, &cfg.queue);

    let service = VersionService::new(&cfg, store, storage.shared(), Arc::new(worker.clone()), Arc::new(deployer.clone()))?;
    info!(provider=%storage.backend().provider(), build_subject=%cfg.queue.build_subject, "project_versions.started");

    let builds = service.builds().clone();
    let build_results = tokio::spawn(async move { worker.listen(builds).await });
    let builds = service.builds().clone();
    let deploy_results = tokio::spawn(async move { deployer.listen(builds).await });

    let sweeper = service.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            if let Err(e) = sweeper.sweep_stale_drafts(100).await { warn!(error=%e, "draft sweep failed"); }
        }
    });

    tokio::select! {
        res = build_results => { error!(?res, "build result listener stopped"); }
        res = deploy_results => { error!(?res, "deploy result listener stopped"); }
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    Ok(())
}
