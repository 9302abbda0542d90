use anyhow::{bail, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use server::{router, state::AppState, transport::HttpTransportFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use stratus_core::{
    auth,
    config::AppConfig,
    store::memory::{MemoryEphemeralStore, MemoryPersistentStore},
    Scheduler,
};
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stratus scheduler daemon.
#[derive(Parser)]
#[command(name = "stratus-scheduler")]
#[command(about = "Content-addressed edge CDN scheduler")]
struct Args {
    /// Host address and port the scheduler API listens on.
    #[arg(long)]
    listen: Option<String>,

    /// Ephemeral (key-value) store URL.
    #[arg(long)]
    cachedb_url: Option<String>,

    /// Persistent store URL.
    #[arg(long)]
    persistentdb_url: Option<String>,

    /// Unique name of this scheduler instance.
    #[arg(long)]
    server_name: Option<String>,

    /// Deployment region tag.
    #[arg(long)]
    area: Option<String>,

    /// TLS certificate path.
    #[arg(long)]
    certificate_path: Option<String>,

    /// TLS private key path.
    #[arg(long)]
    private_key_path: Option<String>,

    /// CA certificate path for node client verification.
    #[arg(long)]
    ca_certificate_path: Option<String>,
}

impl Args {
    /// CLI flags override loaded configuration.
    fn apply(self, config: &mut AppConfig) {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(url) = self.cachedb_url {
            config.stores.cachedb_url = url;
        }
        if let Some(url) = self.persistentdb_url {
            config.stores.persistentdb_url = url;
        }
        if let Some(name) = self.server_name {
            config.scheduler.server_name = name;
        }
        if let Some(area) = self.area {
            config.scheduler.region = area;
        }
        if self.certificate_path.is_some() {
            config.server.certificate_path = self.certificate_path;
        }
        if self.private_key_path.is_some() {
            config.server.private_key_path = self.private_key_path;
        }
        if self.ca_certificate_path.is_some() {
            config.server.ca_certificate_path = self.ca_certificate_path;
        }
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,stratus_core={0},server={0}", config.logging.level)));
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load().context("configuration loading failed")?;
    args.apply(&mut config);
    config.validate().context("configuration validation failed")?;
    init_logging(&config);

    // The workspace ships the in-memory reference backends; production
    // SQL/KV backends are external implementors of the store traits.
    if !config.stores.cachedb_url.is_empty() || !config.stores.persistentdb_url.is_empty() {
        bail!(
            "no store driver is linked for the configured URLs; \
             leave stores.cachedb_url / stores.persistentdb_url empty to run \
             on the in-memory backends"
        );
    }
    let region = config.region().context("invalid region tag")?;
    let persistent = Arc::new(MemoryPersistentStore::new(region));
    let ephemeral = Arc::new(MemoryEphemeralStore::new());

    let secret = auth::load_or_create_secret(&auth::default_repo_dir())
        .context("scheduler secret unavailable")?;
    let transports =
        Arc::new(HttpTransportFactory::new().context("transport factory init failed")?);

    let prometheus = if config.metrics.enabled {
        Some(
            stratus_core::metrics::install_prometheus()
                .map_err(|e| anyhow::anyhow!("metrics recorder init failed: {e}"))?,
        )
    } else {
        None
    };

    let scheduler = Arc::new(Scheduler::new(
        &config,
        persistent,
        ephemeral,
        transports,
        secret,
    ));
    scheduler.startup().await.context("startup presence reset failed")?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let background = scheduler.spawn_background(&shutdown_tx);
    info!(tasks = background.len(), "background tasks started");

    let app = router::build_router(
        AppState::new(Arc::clone(&scheduler), prometheus),
        config.server.max_body_bytes,
    );
    let addr: SocketAddr = config.server.listen.parse().context("bad listen address")?;
    info!(%addr, server_name = %config.scheduler.server_name, "scheduler listening");

    let tls = match (&config.server.certificate_path, &config.server.private_key_path) {
        (Some(cert), Some(key)) => Some(
            RustlsConfig::from_pem_file(cert, key)
                .await
                .context("TLS configuration failed")?,
        ),
        _ => None,
    };

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Some(tls) = tls {
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = tx.send(());
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        });
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(service)
            .await
            .context("server failed")?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await.context("bind failed")?;
        let tx = shutdown_tx.clone();
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                wait_for_shutdown_signal().await;
                let _ = tx.send(());
            })
            .await
            .context("server failed")?;
    }

    info!("waiting for background tasks");
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
