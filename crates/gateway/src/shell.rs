//! The service-shell composition pattern (§9 "Cyclic ownership
//! avoidance", §11 "Readiness handshake"/"Graceful shutdown via
//! `select!`"): start the Data Manager, wait for it to signal ready,
//! *then* start ReadDB, and serve HTTP until canceled.
//!
//! Concrete resource routes, auth and the git-remote integrations that
//! would sit alongside [`health_router`] in a real `configstore` or
//! `runservice` binary are out of scope (§1) — callers merge their own
//! `Router` with it via [`axum::Router::merge`].

use crate::health::health_router;
use kilnforge_core::Result;
use kilnforge_datamanager::DataManager;
use kilnforge_readdb::ReadDb;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Start `dm` and `readdb` as background tasks, in the order the original
/// `configstore.go` `Run` enforced (DM first, blocking on its ready
/// channel, then ReadDB), and run both until `cancel` fires.
///
/// Returns once both background loops have exited. Callers typically
/// `tokio::spawn` this alongside [`serve`].
pub async fn run_background(
    dm: Arc<DataManager>,
    readdb: Arc<ReadDb>,
    cancel: CancellationToken,
) -> Result<()> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let dm_cancel = cancel.clone();
    let dm_for_run = dm.clone();
    let dm_task = tokio::spawn(async move { dm_for_run.run(ready_tx, dm_cancel).await });

    ready_rx
        .await
        .map_err(|_| kilnforge_core::Error::Unavailable("data manager exited before ready".into()))?;
    info!("data manager ready, starting read db");

    let readdb_cancel = cancel.clone();
    let readdb_task = tokio::spawn(async move { readdb.run(readdb_cancel).await });

    let (dm_result, readdb_result) = tokio::join!(dm_task, readdb_task);
    dm_result.expect("data manager task panicked")?;
    readdb_result.expect("read db task panicked")?;
    Ok(())
}

/// Serve `router` on `addr` until `cancel` fires, then drain in-flight
/// requests and return. The direct idiomatic translation of the
/// original's `select!` over the listener's error channel and
/// `ctx.Done()`.
pub async fn serve(addr: std::net::SocketAddr, router: axum::Router, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(kilnforge_core::Error::Io)?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(kilnforge_core::Error::Io)?;
    Ok(())
}

/// Convenience combining [`run_background`] with [`health_router`]'s
/// `/healthz`/`/readyz` routes merged into a caller-supplied `router`.
pub async fn run(
    dm: Arc<DataManager>,
    readdb: Arc<ReadDb>,
    router: axum::Router,
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let router = router.merge(health_router(readdb.clone()));

    let background_cancel = cancel.clone();
    let background = tokio::spawn(run_background(dm, readdb, background_cancel));

    let serve_result = serve(addr, router, cancel.clone()).await;
    cancel.cancel();
    background.await.expect("background task panicked")?;
    serve_result
}
