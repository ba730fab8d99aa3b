use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting and blacklist settings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Egress proxy pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Upstream API hosts
    #[serde(default)]
    pub upstreams: UpstreamsConfig,

    /// Request log settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Gateway port (default: 6543)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the loopback stats server (default: 6544, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Domain used to build the advertised endpoint addresses
    #[serde(default = "default_public_domain")]
    pub public_domain: String,

    /// Resolve the source address from X-Forwarded-For and friends.
    /// Only enable this behind a trusted load balancer.
    #[serde(default)]
    pub trust_forwarded_headers: bool,

    /// Answer CORS preflights and add CORS headers to responses (default: true)
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            public_domain: default_public_domain(),
            trust_forwarded_headers: false,
            cors: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Errors needed inside the window before an IP is blacklisted
    #[serde(default = "default_ip_error_threshold")]
    pub ip_error_threshold: u32,

    /// Error window in milliseconds (default: one day)
    #[serde(default = "default_error_window_ms")]
    pub error_window_ms: u64,

    /// Requests allowed per source per window
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,

    /// Rate limit window in milliseconds (default: one minute)
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,

    /// Where the blacklist document is persisted
    #[serde(default = "default_blacklist_path")]
    pub blacklist_path: String,

    /// How often stale error counters are purged (default: hourly)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl AdmissionConfig {
    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }

    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            ip_error_threshold: default_ip_error_threshold(),
            error_window_ms: default_error_window_ms(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            blacklist_path: default_blacklist_path(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Statically configured egress proxies ("host:port")
    #[serde(default)]
    pub proxy_list: Vec<String>,

    /// Pages listing proxies in an HTML table (ip, port columns)
    #[serde(default)]
    pub scraper_urls: Vec<String>,

    /// Maximum number of requests in flight across all proxies
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Interval between pool refreshes in milliseconds (default: one hour)
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Probe every candidate before admitting it to the pool (default: true)
    #[serde(default = "default_true")]
    pub validate: bool,

    /// URLs fetched through a candidate to prove it works
    #[serde(default = "default_probe_urls")]
    pub probe_urls: Vec<String>,

    /// Timeout for each probe request in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl PoolConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            proxy_list: Vec::new(),
            scraper_urls: Vec::new(),
            concurrency_limit: default_concurrency_limit(),
            refresh_interval_ms: default_refresh_interval_ms(),
            validate: true,
            probe_urls: default_probe_urls(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamsConfig {
    /// Messages API upstream
    #[serde(default = "default_claude_upstream")]
    pub claude: UpstreamConfig,

    /// Completions/chat API upstream
    #[serde(default = "default_openai_upstream")]
    pub openai: UpstreamConfig,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            claude: default_claude_upstream(),
            openai: default_openai_upstream(),
        }
    }
}

/// Connection details for a single upstream API
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Upstream hostname, also sent as the Host header
    pub host: String,

    /// "https" (default) or "http"
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Port override (default: 443 for https, 80 for http)
    pub port: Option<u16>,

    /// Upper bound on a whole upstream exchange. Unset means no timeout.
    pub request_timeout_secs: Option<u64>,
}

impl UpstreamConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            scheme: default_scheme(),
            port: None,
            request_timeout_secs: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.scheme == "http" { 80 } else { 443 })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Base URL without a trailing slash, e.g. `https://api.anthropic.com`
    pub fn base_url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("upstreams.{}: host must not be empty", name));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(format!(
                "upstreams.{}: scheme must be \"http\" or \"https\", got \"{}\"",
                name, self.scheme
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory for the day-partitioned request logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

fn default_listen_port() -> u16 {
    6543
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    6544
}

fn default_public_domain() -> String {
    "your-domain.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ip_error_threshold() -> u32 {
    10
}

fn default_error_window_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_rate_limit_requests() -> u32 {
    100
}

fn default_rate_limit_interval_ms() -> u64 {
    60 * 1000
}

fn default_blacklist_path() -> String {
    "black.json".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_concurrency_limit() -> usize {
    100
}

fn default_refresh_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_probe_urls() -> Vec<String> {
    vec!["https://api.ipify.org".to_string()]
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_claude_upstream() -> UpstreamConfig {
    UpstreamConfig::new("api.anthropic.com")
}

fn default_openai_upstream() -> UpstreamConfig {
    UpstreamConfig::new("api.openai.com")
}

fn default_log_dir() -> String {
    "logs".to_string()
}

/// Check that a proxy entry looks like `host:port`
pub fn validate_proxy_address(entry: &str) -> Result<(), String> {
    let (host, port) = entry
        .rsplit_once(':')
        .ok_or_else(|| format!("proxy \"{}\" is not in host:port form", entry))?;
    if host.is_empty() {
        return Err(format!("proxy \"{}\" has an empty host", entry));
    }
    port.parse::<u16>()
        .map_err(|_| format!("proxy \"{}\" has an invalid port", entry))?;
    Ok(())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.pool.concurrency_limit == 0 {
            errors.push("pool.concurrency_limit must be greater than 0".to_string());
        }
        if self.admission.rate_limit_requests == 0 {
            errors.push("admission.rate_limit_requests must be greater than 0".to_string());
        }
        if self.admission.rate_limit_interval_ms == 0 {
            errors.push("admission.rate_limit_interval_ms must be greater than 0".to_string());
        }
        if self.admission.ip_error_threshold == 0 {
            errors.push("admission.ip_error_threshold must be greater than 0".to_string());
        }
        if self.admission.sweep_interval_secs == 0 {
            errors.push("admission.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.pool.refresh_interval_ms == 0 {
            errors.push("pool.refresh_interval_ms must be greater than 0".to_string());
        }

        for entry in &self.pool.proxy_list {
            if let Err(e) = validate_proxy_address(entry.trim()) {
                errors.push(format!("pool.proxy_list: {}", e));
            }
        }

        if let Err(e) = self.upstreams.claude.validate("claude") {
            errors.push(e);
        }
        if let Err(e) = self.upstreams.openai.validate("openai") {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
public_domain = "example.net"
trust_forwarded_headers = true

[admission]
ip_error_threshold = 3
rate_limit_requests = 20

[pool]
proxy_list = ["10.0.0.1:3128", "10.0.0.2:8080"]
concurrency_limit = 8

[upstreams.claude]
host = "claude.internal"
scheme = "http"
port = 9000
request_timeout_secs = 30

[logging]
log_dir = "/var/log/relaygate"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.public_domain, "example.net");
        assert!(config.server.trust_forwarded_headers);
        assert_eq!(config.admission.ip_error_threshold, 3);
        assert_eq!(config.admission.rate_limit_requests, 20);
        assert_eq!(config.pool.proxy_list.len(), 2);
        assert_eq!(config.pool.concurrency_limit, 8);
        assert_eq!(config.upstreams.claude.base_url(), "http://claude.internal:9000");
        assert_eq!(
            config.upstreams.claude.request_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.upstreams.openai.host, "api.openai.com");
        assert_eq!(config.logging.log_dir, "/var/log/relaygate");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 6543);
        assert_eq!(config.server.admin_port, 6544);
        assert!(config.server.cors);
        assert!(!config.server.trust_forwarded_headers);
        assert_eq!(config.admission.ip_error_threshold, 10);
        assert_eq!(config.admission.error_window(), Duration::from_secs(86_400));
        assert_eq!(config.admission.rate_limit_requests, 100);
        assert_eq!(config.admission.rate_limit_interval(), Duration::from_secs(60));
        assert_eq!(config.admission.blacklist_path, "black.json");
        assert_eq!(config.pool.concurrency_limit, 100);
        assert_eq!(config.pool.refresh_interval(), Duration::from_secs(3600));
        assert_eq!(config.pool.probe_timeout(), Duration::from_secs(5));
        assert!(config.pool.validate);
        assert_eq!(config.upstreams.claude.host, "api.anthropic.com");
        assert_eq!(config.upstreams.openai.base_url(), "https://api.openai.com");
        assert_eq!(config.upstreams.openai.request_timeout(), None);
        assert_eq!(config.logging.log_dir, "logs");
    }

    #[test]
    fn test_upstream_default_ports() {
        let mut upstream = UpstreamConfig::new("api.example.com");
        assert_eq!(upstream.port(), 443);

        upstream.scheme = "http".to_string();
        assert_eq!(upstream.port(), 80);

        upstream.port = Some(8443);
        assert_eq!(upstream.port(), 8443);
    }

    #[test]
    fn test_validate_proxy_address() {
        assert!(validate_proxy_address("1.2.3.4:8080").is_ok());
        assert!(validate_proxy_address("proxy.example.com:3128").is_ok());
        assert!(validate_proxy_address("1.2.3.4").is_err());
        assert!(validate_proxy_address(":8080").is_err());
        assert!(validate_proxy_address("1.2.3.4:http").is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[pool]
concurrency_limit = 0
proxy_list = ["not-a-proxy"]

[upstreams.openai]
host = "api.openai.com"
scheme = "ftp"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("concurrency_limit"));
        assert!(err.contains("not-a-proxy"));
        assert!(err.contains("upstreams.openai"));
    }

    #[test]
    fn test_validate_rejects_zero_loop_intervals() {
        let toml = r#"
[admission]
sweep_interval_secs = 0

[pool]
refresh_interval_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("admission.sweep_interval_secs"));
        assert!(err.contains("pool.refresh_interval_ms"));
        assert!(Config::default().validate().is_ok());
    }
}
