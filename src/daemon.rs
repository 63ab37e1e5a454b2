use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::{db, server, store, sweep};

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    let sweep_secret = bootstrap_sweep_secret(&pool, &config).await?;

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    // Spawn the scheduled-publish sweeper
    let sweeper_handle = tokio::spawn(sweep::sweep_loop(pool.clone(), config.clone(), cancel.clone()));

    // Build and start HTTP server
    let app_state = server::AppState {
        pool: pool.clone(),
        config: config.clone(),
        sweep_secret,
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.plume.listen)
        .await
        .with_context(|| format!("binding to {}", config.plume.listen))?;

    info!(listen = %config.plume.listen, "HTTP server listening");

    // Run the server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    // Wait for shutdown signal
    wait_for_shutdown().await;
    info!("shutdown signal received");

    // Cancel all tasks
    cancel.cancel();

    // Wait for tasks with timeout
    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = sweeper_handle.await;
        let _ = server_handle.await;
    })
    .await;

    // Close DB pool
    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn bootstrap_sweep_secret(pool: &SqlitePool, config: &Config) -> Result<String> {
    // Priority: config value → DB stored value → auto-generate
    if let Some(ref secret) = config.plume.sweep_secret {
        // Store config-provided secret in DB for consistency
        store::set_setting(pool, "sweep_secret", secret).await?;
        info!("using sweep secret from config");
        return Ok(secret.clone());
    }

    if let Some(secret) = store::get_setting(pool, "sweep_secret").await? {
        info!("using stored sweep secret");
        return Ok(secret);
    }

    // Auto-generate
    let secret = generate_token();
    store::set_setting(pool, "sweep_secret", &secret).await?;
    warn!(
        secret = %secret,
        "sweep secret generated — save this, it won't be shown again"
    );
    Ok(secret)
}

pub(crate) fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
