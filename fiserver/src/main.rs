use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::sync::watch;

use ficore::finalize::FinalizeCoordinator;
use ficore::monitor::{CapacityMonitor, MonitorConfig};
use ficore::registry::{RedisRegistry, RegistryStore};
use ficore::reload::Reloader;
use ficore::select::{SelectorConfig, StorageSelector};
use ficore::upload::UploadCoordinator;
use fise::admin::{AdminApi, AdminClient};
use fise::auth::{AuthClient, TokenSource};
use fise::seclient::{ElementApi, SeClient, SeTimeouts};

use fiserver::config::Config;
use fiserver::routes::{router, Ctx};
use fiserver::util::{replica_id, setup_logs};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override listen.tcp from the command line.
    #[arg(long)]
    tcp: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logs();
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(tcp) = args.tcp {
        config.listen.tcp = tcp;
    }
    let replica = replica_id();
    info!("starting ingester replica {replica}");

    let auth = Arc::new(
        AuthClient::new(fise::auth::AuthConfig {
            admin_url: config.auth.admin_url.clone(),
            client_id: config.auth.client_id.clone(),
            client_secret: config.auth.client_secret.clone(),
            refresh_skew: Duration::from_secs(config.auth.token_refresh_skew),
            timeout: ADMIN_TIMEOUT,
        })
        .context("could not build auth client")?,
    );
    let tokens: Arc<dyn TokenSource> = auth;
    let elements: Arc<dyn ElementApi> = Arc::new(
        SeClient::new(
            tokens.clone(),
            SeTimeouts {
                capacity: Duration::from_secs(config.capacity_monitor.per_se_timeout),
                upload: UPLOAD_TIMEOUT,
                control: ADMIN_TIMEOUT,
            },
        )
        .context("could not build element client")?,
    );
    let admin: Arc<dyn AdminApi> = Arc::new(
        AdminClient::new(config.auth.admin_url.clone(), tokens.clone(), ADMIN_TIMEOUT)
            .context("could not build admin client")?,
    );
    let registry: Arc<dyn RegistryStore> = Arc::new(
        RedisRegistry::connect(
            &config.registry.endpoint,
            Duration::from_secs(config.registry.max_stale),
        )
        .await
        .context("could not connect to the registry")?,
    );

    let reloader = Arc::new(Reloader::new(
        registry.clone(),
        admin.clone(),
        config.reload_interval(),
        config.reloader.enabled,
    ));
    if let Err(e) = reloader.reload_now("startup").await {
        // not fatal: readiness stays red and the periodic loop keeps trying
        warn!("initial catalogue load failed: {e}");
    }
    let map = reloader.handle();

    let selector = Arc::new(StorageSelector::new(
        SelectorConfig {
            local_cache_ttl: Duration::from_secs(config.selector.local_cache_ttl),
            min_headroom_bytes: config.selector.min_headroom_bytes,
        },
        registry.clone(),
        admin.clone(),
        map.clone(),
    ));
    let uploads = UploadCoordinator::new(selector.clone(), elements.clone(), map.clone());
    let finalize = Arc::new(FinalizeCoordinator::new(
        ficore::finalize::FinalizeConfig {
            safety_margin: Duration::from_secs(config.finalize.safety_margin),
            phase_max_attempts: config.finalize.phase_max_attempts,
            phase_backoff: Duration::from_millis(500),
            recovery_timeout: Duration::from_secs(config.finalize.recovery_timeout),
            gc_interval: Duration::from_secs(config.finalize.gc_interval),
        },
        registry.clone(),
        admin.clone(),
        elements.clone(),
        selector.clone(),
        map.clone(),
    ));
    if let Err(e) = finalize.recover().await {
        warn!("transaction recovery failed: {e}");
    }

    let monitor = Arc::new(CapacityMonitor::new(
        MonitorConfig {
            enabled: config.capacity_monitor.enabled,
            replica_id: replica,
            base_interval: Duration::from_secs(config.capacity_monitor.base_interval),
            min_interval: Duration::from_secs(config.capacity_monitor.min_interval),
            max_interval: Duration::from_secs(config.capacity_monitor.max_interval),
            leader_check: Duration::from_secs(config.capacity_monitor.leader_check),
            per_se_timeout: Duration::from_secs(config.capacity_monitor.per_se_timeout),
            concurrency: config.capacity_monitor.concurrency,
            thresholds: config.thresholds(),
        },
        registry.clone(),
        elements.clone(),
        map.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let reloader = reloader.clone();
        let rx = shutdown_rx.clone();
        async move { reloader.run(rx).await }
    }));
    tasks.push(tokio::spawn({
        let monitor = monitor.clone();
        let rx = shutdown_rx.clone();
        async move { monitor.run(rx).await }
    }));
    tasks.push(tokio::spawn({
        let finalize = finalize.clone();
        let rx = shutdown_rx.clone();
        async move { finalize.run_gc(rx).await }
    }));

    let drain_timeout = Duration::from_secs(config.shutdown.drain_timeout);
    let listen = config.listen.tcp.clone();
    let ctx = Arc::new(Ctx::new(
        config, uploads, selector, finalize, registry, admin, map,
    ));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("could not bind {listen}"))?;
    info!("listening on {listen}");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, draining background loops");
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(drain_timeout, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("drain timeout expired, forcing exit");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("could not install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
