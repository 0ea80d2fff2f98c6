use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinHandle};

use crate::rtun::{
    admin, config, logging, telemetry,
    tunnel::client::{Client, RunError},
    version,
};

const ADMIN_DRAIN: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logging = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    if cfg.proxies.is_empty() {
        tracing::warn!("config: no proxies configured; nothing will be routed");
    }

    tracing::info!(
        version = version::VERSION,
        config = %resolved.path.display(),
        server_addr = %cfg.server_addr,
        dial_timeout = %humantime::format_duration(cfg.dial_timeout),
        idle_timeout = %humantime::format_duration(cfg.idle_timeout),
        admin_addr = %cfg.admin_addr,
        proxies = cfg.proxies.len(),
        "rtun: starting"
    );

    // The recorder is process-global; only install it when something serves it.
    let admin_addr = if cfg.admin_addr.is_empty() {
        None
    } else {
        Some(admin::parse_bind_addr(&cfg.admin_addr)?)
    };
    let prom = match admin_addr {
        Some(_) => Some(Arc::new(telemetry::init_prometheus()?)),
        None => None,
    };

    let client = Arc::new(
        Client::dial(&cfg.server_addr, cfg.client_options())
            .await
            .context("tunnel: dial")?,
    );

    // Failures are logged by the client and do not stop the remaining proxies.
    for p in &cfg.proxies {
        let _ = client.proxy(&p.name, &p.token, &p.local_addr).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_task: Option<JoinHandle<anyhow::Result<()>>> =
        match (admin_addr, prom) {
            (Some(addr), Some(prom)) => {
                let state = admin::AdminState {
                    prom,
                    client: client.clone(),
                };
                let shutdown = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    admin::serve_with_shutdown(addr, state, shutdown).await
                }))
            }
            _ => None,
        };

    let mut running = tokio::spawn({
        let client = client.clone();
        let shutdown = shutdown_rx.clone();
        async move { client.run(shutdown).await }
    });

    let mut by_signal = false;
    let res = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            by_signal = true;
            let _ = shutdown_tx.send(true);
            (&mut running).await
        }
        res = &mut running => res,
    };
    let _ = shutdown_tx.send(true);

    if let Some(task) = admin_task {
        match tokio::time::timeout(ADMIN_DRAIN, task).await {
            Ok(Ok(Err(err))) => tracing::warn!(err = %format!("{err:#}"), "admin: server error"),
            Ok(_) => {}
            Err(_) => tracing::warn!("admin: did not stop in time"),
        }
    }

    match res.context("tunnel: run task")? {
        RunError::Cancelled if by_signal => {
            tracing::info!("rtun: stopped");
            Ok(())
        }
        err => Err(anyhow::Error::new(err).context("tunnel: run")),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
