use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tether_common::{LogFormat, TelemetryConfig};
use tether_proxy::config::{ConfigError, ProxyConfig, UpstreamTarget};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Upstream API server, e.g. "https://10.0.0.1:6443". Comma separated
    /// lists are accepted; the first entry is used.
    #[arg(long, env = "TETHER_SERVER_ADDR")]
    pub server_addr: String,

    #[arg(long, env = "TETHER_LISTEN_ADDR", default_value = "127.0.0.1:10261")]
    pub listen_addr: String,

    #[arg(long, env = "TETHER_DISK_CACHE_PATH", default_value = "/etc/kubernetes/cache/")]
    pub disk_cache_path: PathBuf,

    /// Request handler: "dev" or "sample".
    #[arg(long, env = "TETHER_HANDLER", default_value = "dev")]
    pub handler: String,

    /// PEM bundle trusted for the upstream's certificate.
    #[arg(long, env = "TETHER_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// File holding the bearer token sent upstream.
    #[arg(long, env = "TETHER_BEARER_TOKEN_FILE")]
    pub bearer_token_file: Option<PathBuf>,

    #[arg(long, env = "TETHER_INSECURE_SKIP_TLS_VERIFY", default_value_t = false)]
    pub insecure_skip_tls_verify: bool,

    #[arg(long, default_value_t = 10)]
    pub health_interval_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub health_timeout_secs: u64,

    #[arg(long, default_value_t = 16)]
    pub tee_buffer_chunks: usize,

    #[arg(long, default_value_t = 5000)]
    pub populate_wait_ms: u64,

    /// "text" or "json".
    #[arg(long, env = "TETHER_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "TETHER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "TETHER_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn to_config(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = ProxyConfig::new(UpstreamTarget::parse(&self.server_addr)?);
        config.listen_addr = self.listen_addr.clone();
        config.disk_cache_path = self.disk_cache_path.clone();
        config.handler = self.handler.parse()?;
        config.health_interval = Duration::from_secs(self.health_interval_secs.max(1));
        config.health_timeout = Duration::from_secs(self.health_timeout_secs.max(1));
        config.tee_buffer_chunks = self.tee_buffer_chunks.max(1);
        config.populate_wait = Duration::from_millis(self.populate_wait_ms);
        Ok(config)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "tether-proxy".to_string(),
            log_format: self.log_format,
            otlp_endpoint: self.otlp_endpoint.clone(),
            otlp_token: self.otlp_token.clone(),
        }
    }
}
