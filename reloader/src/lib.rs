use std::sync::Arc;

use anyhow::Context;
use kube::Client;
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch::channel;

pub mod annotations;
pub mod config;
pub mod endpoints;
pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod matcher;
pub mod metrics;
pub mod pipeline;
pub mod refs;
pub mod source;
pub mod strategy;
pub mod workload;

use config::ReloaderConfig;
use events::EventPublisher;
use metrics::exporter::Exporter;
use pipeline::cache::ObjectCache;
use pipeline::pause::PauseIndex;
use pipeline::queue::WorkQueue;
use pipeline::watch::WatchScope;
use pipeline::worker::Processor;

pub fn init_log(level: &str) -> anyhow::Result<()> {
    let level: log::LevelFilter = level
        .parse()
        .with_context(|| format!("invalid log level {level:?}"))?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string()),
    )
    .init();
    Ok(())
}

pub async fn run(config: ReloaderConfig) -> anyhow::Result<()> {
    info!("{config:#?}");
    let config = Arc::new(config);
    let (tx, rx) = channel(true);

    let client = Client::try_default()
        .await
        .context("Failed to create the cluster client")?;

    let exporter = Exporter::new();
    let cache = Arc::new(ObjectCache::default());
    let queue = WorkQueue::new(exporter.metrics.queue_depth.clone());
    let adapters = workload::build_adapters(&config, &client)?;
    let scope = WatchScope::resolve(&config, &client).await?;

    // Pick up pause windows left over from a previous run
    let pause = Arc::new(PauseIndex::default());
    match scope.expand(&client).await {
        Ok(namespaces) => pause.rebuild(&adapters, &namespaces).await,
        Err(e) => warn!("Skipping paused-workload recovery: {e}"),
    }

    let processor = Arc::new(Processor::new(
        client.clone(),
        Arc::clone(&config),
        adapters.clone(),
        Arc::clone(&cache),
        Arc::clone(&pause),
        EventPublisher::new(client.clone()),
        Arc::clone(&exporter.metrics),
    ));

    pipeline::watch::spawn_watchers(&client, &config, &scope, &cache, &queue, &rx);
    for index in 0..config.workers() {
        tokio::spawn(pipeline::worker::run_worker(
            index,
            Arc::clone(&queue),
            Arc::clone(&processor),
            rx.clone(),
        ));
    }
    tokio::spawn(Arc::clone(&pause).run_sweeper(adapters.clone(), rx.clone()));

    endpoints::Server::new(
        config.endpoint(),
        exporter.clone(),
        config.expose_metrics(),
        config.health_check(),
    )
    .start(rx.clone());

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    tx.send(false)?;
    info!("Exiting...");

    Ok(())
}
