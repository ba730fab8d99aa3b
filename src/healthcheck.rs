//! Egress proxy discovery and validation
//!
//! Candidates come from HTML pages listing proxies in a table (first column
//! the IP, second the port). Each candidate is probed by fetching the probe
//! URLs through it; only candidates that answer every probe with a success
//! status make it into the pool. The refresher runs once at startup and then
//! on a fixed interval.

use crate::config::PoolConfig;
use crate::forward::UpstreamClients;
use crate::pool::ProxyPool;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Probes run concurrently up to this many candidates
const PROBE_CONCURRENCY: usize = 16;

/// Produces and validates egress proxy candidates
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Candidate `host:port` strings, in discovery order
    async fn discover(&self) -> Vec<String>;

    /// The subset of `candidates` that is usable, order preserved
    async fn validate(&self, candidates: Vec<String>) -> Vec<String>;
}

/// Scrapes proxy list pages and probes candidates over HTTP
pub struct HttpProxySource {
    client: reqwest::Client,
    scraper_urls: Vec<String>,
    probe_urls: Vec<String>,
    probe_timeout: Duration,
    validate: bool,
}

impl HttpProxySource {
    pub fn from_config(config: &PoolConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout().max(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            client,
            scraper_urls: config.scraper_urls.clone(),
            probe_urls: config.probe_urls.clone(),
            probe_timeout: config.probe_timeout(),
            validate: config.validate,
        })
    }

    async fn scrape(&self, url: &str) -> Vec<String> {
        let page = match self.client.get(url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.text().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match page {
            Ok(html) => {
                let found = parse_proxy_table(&html);
                debug!(url, found = found.len(), "Scraped proxy list");
                found
            }
            Err(e) => {
                warn!(url, error = %e, "Failed to fetch proxy list");
                Vec::new()
            }
        }
    }

    /// True if every probe URL answers with a success status through `proxy`
    async fn probe(&self, proxy: &str) -> bool {
        let client = match reqwest::Proxy::all(format!("http://{}", proxy)).and_then(|p| {
            reqwest::Client::builder()
                .proxy(p)
                .timeout(self.probe_timeout)
                .build()
        }) {
            Ok(client) => client,
            Err(e) => {
                debug!(proxy, error = %e, "Invalid proxy candidate");
                return false;
            }
        };

        for url in &self.probe_urls {
            match client.get(url).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    debug!(proxy, url, status = %response.status(), "Probe rejected");
                    return false;
                }
                Err(e) => {
                    debug!(proxy, url, error = %e, "Probe failed");
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl ProxySource for HttpProxySource {
    async fn discover(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        for url in &self.scraper_urls {
            candidates.extend(self.scrape(url).await);
        }
        candidates
    }

    async fn validate(&self, candidates: Vec<String>) -> Vec<String> {
        if !self.validate {
            return candidates;
        }

        let total = candidates.len();
        let valid: Vec<String> = stream::iter(candidates)
            .map(|proxy| async move {
                let live = self.probe(&proxy).await;
                (proxy, live)
            })
            .buffered(PROBE_CONCURRENCY)
            .filter_map(|(proxy, live)| async move { live.then_some(proxy) })
            .collect()
            .await;

        info!(total, valid = valid.len(), "Validated proxy candidates");
        valid
    }
}

/// Extract `ip:port` pairs from the rows of every table on the page
pub fn parse_proxy_table(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let (Ok(rows), Ok(ip_cell), Ok(port_cell)) = (
        Selector::parse("table tr"),
        Selector::parse("td:nth-child(1)"),
        Selector::parse("td:nth-child(2)"),
    ) else {
        return Vec::new();
    };

    document
        .select(&rows)
        .filter_map(|row| {
            let ip = row.select(&ip_cell).next()?.text().collect::<String>();
            let port = row.select(&port_cell).next()?.text().collect::<String>();
            let (ip, port) = (ip.trim(), port.trim());
            if ip.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            Some(format!("{}:{}", ip, port))
        })
        .collect()
}

/// Keeps the pool in sync with its proxy source
pub struct ProxyRefresher {
    pool: Arc<ProxyPool>,
    source: Arc<dyn ProxySource>,
    clients: Option<Arc<UpstreamClients>>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyRefresher {
    pub fn new(
        pool: Arc<ProxyPool>,
        source: Arc<dyn ProxySource>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            source,
            clients: None,
            interval,
            shutdown_rx,
        }
    }

    /// Drop cached upstream clients for proxies that leave the pool
    pub fn with_clients(mut self, clients: Arc<UpstreamClients>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Refresh once
    pub async fn refresh(&self) -> usize {
        let total = self.pool.refresh(self.source.as_ref()).await;
        if total == 0 {
            warn!("Proxy pool is empty, requests will fail until the next refresh");
        }
        if let Some(clients) = &self.clients {
            clients.retain(&self.pool.proxies());
        }
        total
    }

    /// Refresh now, then on every tick until shutdown
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Proxy refresher started"
        );

        self.refresh().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.refresh().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Proxy refresher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
