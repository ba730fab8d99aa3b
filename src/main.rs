use relaygate::admin::{AdminServer, AdvertisedEndpoints, PKG_NAME, VERSION};
use relaygate::admission::AdmissionControl;
use relaygate::config::Config;
use relaygate::forward::{Forwarder, UpstreamClients};
use relaygate::healthcheck::{HttpProxySource, ProxyRefresher};
use relaygate::pool::ProxyPool;
use relaygate::proxy::{Gateway, ProxyServer};
use relaygate::request_log::{DailyFileSink, RequestLog};
use relaygate::upstream::UpstreamSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaygate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admission = Arc::new(AdmissionControl::from_config(&config.admission));
    let pool = ProxyPool::new(config.pool.concurrency_limit, config.pool.proxy_list.clone());
    let clients = Arc::new(UpstreamClients::new());
    let log = RequestLog::new(Arc::new(DailyFileSink::new(&config.logging.log_dir)));

    let gateway = Arc::new(Gateway {
        admission: Arc::clone(&admission),
        pool: Arc::clone(&pool),
        upstreams: UpstreamSet::from_config(&config.upstreams),
        forwarder: Forwarder::new(Arc::clone(&clients), log),
        trust_forwarded_headers: config.server.trust_forwarded_headers,
        cors: config.server.cors,
    });

    let source = Arc::new(HttpProxySource::from_config(&config.pool)?);
    let refresher = ProxyRefresher::new(
        Arc::clone(&pool),
        source,
        config.pool.refresh_interval(),
        shutdown_rx.clone(),
    )
    .with_clients(Arc::clone(&clients));
    let refresh_handle = tokio::spawn(refresher.run());

    let sweep_admission = Arc::clone(&admission);
    let sweep_interval = config.admission.sweep_interval();
    let sweep_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        error_sweep_loop(sweep_admission, sweep_interval, sweep_shutdown_rx).await;
    });

    let gateway_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let server = ProxyServer::new(gateway_addr, gateway, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));
        let endpoints = AdvertisedEndpoints::new(&config.server.public_domain, config.server.port);
        let admin_server = AdminServer::new(admin_addr, Arc::clone(&pool), endpoints, shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Stats server error");
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        let _ = refresh_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

async fn error_sweep_loop(
    admission: Arc<AdmissionControl>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let purged = admission.sweep_errors();
                if purged > 0 {
                    info!(purged, "Purged stale IP error counters");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        public_domain = %config.server.public_domain,
        trust_forwarded_headers = config.server.trust_forwarded_headers,
        cors = config.server.cors,
        "Server configuration"
    );
    info!(
        rate_limit_requests = config.admission.rate_limit_requests,
        rate_limit_interval_ms = config.admission.rate_limit_interval_ms,
        ip_error_threshold = config.admission.ip_error_threshold,
        error_window_ms = config.admission.error_window_ms,
        blacklist_path = %config.admission.blacklist_path,
        "Admission settings"
    );
    info!(
        concurrency_limit = config.pool.concurrency_limit,
        static_proxies = config.pool.proxy_list.len(),
        scraper_urls = config.pool.scraper_urls.len(),
        refresh_interval_ms = config.pool.refresh_interval_ms,
        validate = config.pool.validate,
        "Proxy pool settings"
    );
    info!(
        claude = %config.upstreams.claude.base_url(),
        openai = %config.upstreams.openai.base_url(),
        log_dir = %config.logging.log_dir,
        "Upstreams"
    );
}
