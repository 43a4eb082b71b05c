//! The `drover run` command: wire the engine, the reporter, and the HTTP
//! surface, then run until interrupted.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use drover_core::handler::HandlerRegistry;
use drover_core::report::{LogSink, Reporter};
use drover_core::scheduler::Scheduler;
use drover_core::taskfile;
use drover_store::{ResultStore, TaskStore};

use crate::config::DroverConfig;
use crate::handlers::{EchoHandler, NapHandler};
use crate::serve_cmd;

/// Run the engine until Ctrl-C.
pub async fn run(config: DroverConfig, tasks_file: Option<&Path>, bind: SocketAddr) -> Result<()> {
    let store = Arc::new(TaskStore::open(&config.storage).context("could not open task store")?);
    let results = Arc::new(ResultStore::new());

    let mut handlers = HandlerRegistry::new();
    handlers.register(EchoHandler);
    handlers.register(NapHandler);
    info!(tags = ?handlers.list(), "registered handlers");

    if let Some(path) = tasks_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read task file {}", path.display()))?;
        let file = taskfile::parse_task_file(&contents)
            .with_context(|| format!("invalid task file {}", path.display()))?;
        let seeded = taskfile::materialize(&file, &store)?;
        info!(count = seeded.len(), file = %path.display(), "seeded tasks from file");
    }

    let reporter = Arc::new(Reporter::new(
        Arc::clone(&results),
        Arc::new(LogSink),
        config.reporting_interval,
    ));
    let scheduler = Arc::new(
        Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&store),
            Arc::clone(&results),
            Arc::new(handlers),
        )
        .with_reporter(Arc::clone(&reporter)),
    );

    let cancel = CancellationToken::new();

    let engine = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };
    let reporting = {
        let reporter = Arc::clone(&reporter);
        let cancel = cancel.clone();
        tokio::spawn(async move { reporter.run(cancel).await })
    };
    let http = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move { serve_cmd::run_serve(store, bind, cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("interrupt received; shutting down");
    cancel.cancel();

    engine.await.context("engine task panicked")??;
    reporting.await.context("reporter task panicked")?;
    http.await.context("http task panicked")??;

    Ok(())
}
