// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use llamero_gateway::auth::StaticTokenAuthenticator;
use llamero_gateway::config::GatewayConfig;
use llamero_gateway::http::service::HttpService;
use llamero_gateway::probe::BackendProbe;
use llamero_gateway::registry::BackendRegistry;
use llamero_gateway::sync::SyncEngine;
use llamero_gateway::tasks::scheduler::Scheduler;
use llamero_gateway::tasks::worker::{SyncTaskHandler, WorkerPool};
use llamero_gateway::tasks::{TaskEnqueuer, TaskQueue};
use llamero_runtime::logging;
use llamero_runtime::storage::key_value_store::{KeyValueStoreManager, Selector};

mod flags;
use flags::{Command, Flags};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let flags = Flags::parse();
    let command = flags.command.unwrap_or(Command::All);
    let config = GatewayConfig::load(flags.config.as_deref())?;

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel_token.clone()));

    tracing::info!(%command, store = ?config.store, "Starting llamero");
    run(command, config, cancel_token).await
}

async fn run(command: Command, config: GatewayConfig, cancel_token: CancellationToken) -> anyhow::Result<()> {
    if command != Command::All && matches!(config.store, Selector::Memory) {
        tracing::warn!(%command, "In-memory store is private to this process; use file:<dir> to share it");
    }

    let store = KeyValueStoreManager::from_selector(&config.store);
    let registry = BackendRegistry::new(store.clone());
    let queue = TaskQueue::from_config(store, &config.worker);
    let client = reqwest::Client::builder().build()?;
    let probe = Arc::new(BackendProbe::new(client.clone(), config.probe.timeout));
    let mut engine = SyncEngine::new(registry.clone(), probe);

    let mut tasks = JoinSet::new();

    if command.serves() {
        let enqueuer: Arc<dyn TaskEnqueuer> = Arc::new(queue.clone());
        let service = HttpService::builder()
            .host(config.server.host.clone())
            .port(config.server.port)
            .registry(registry.clone())
            .max_body_bytes(config.server.max_body_bytes)
            .with_tasks(Some(enqueuer))
            .with_authenticator(StaticTokenAuthenticator::from_config(&config.auth.tokens))
            .with_client(Some(client))
            .build()?;
        engine = engine.with_metrics(service.state().metrics_clone());

        let removed = engine.reconcile(&config.backends).await?;
        tracing::info!(
            backends = config.backends.len(),
            removed = removed.len(),
            "Backends reconciled"
        );

        match engine.sync_all().await {
            Ok(summary) => tracing::info!(
                healthy = summary.healthy,
                unhealthy = summary.unhealthy,
                skipped = summary.skipped,
                "Initial backend sync done"
            ),
            Err(err) => tracing::warn!(%err, "Initial backend sync failed"),
        }

        let token = cancel_token.clone();
        tasks.spawn(async move { service.run(token).await });
    }

    if command.works() {
        let handler = Arc::new(SyncTaskHandler::new(engine.clone()));
        let pool = WorkerPool::new(queue.clone(), handler, &config.worker);
        tasks.spawn(pool.run(cancel_token.clone()));
    }

    if command.schedules() {
        let scheduler = Scheduler::new(Arc::new(queue.clone()), config.scheduler.interval);
        tasks.spawn(scheduler.run(cancel_token.clone()));
    }

    // the first failure takes the whole process down
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(anyhow::Error::from).and_then(|r| r);
        if let Err(err) = outcome {
            tracing::error!(%err, "Component failed, shutting down");
            cancel_token.cancel();
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    tracing::info!("Shutdown complete");
    result
}

async fn cancel_on_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = cancel_token.cancelled() => return,
    }
    cancel_token.cancel();
}
