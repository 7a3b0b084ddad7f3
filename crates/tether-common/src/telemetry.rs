use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format of the stderr log layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}', available: text, json")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}

/// Where and how the process reports its logs and spans.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Identifies this process in exported spans (e.g. "tether-proxy").
    pub service_name: String,
    pub log_format: LogFormat,
    /// OTLP/HTTP base URL. The exporter appends `/v1/traces`.
    pub otlp_endpoint: Option<String>,
    /// Bearer token sent with every export request.
    pub otlp_token: Option<String>,
}

impl TelemetryConfig {
    fn export_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(token) = self.otlp_token.as_deref().filter(|t| !t.is_empty()) {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        headers
    }
}

/// Install the global subscriber. `RUST_LOG` controls the filter, `info` by default.
///
/// Returns the tracer provider when span export is enabled; the caller keeps
/// it alive and calls `shutdown()` on it before exit. A broken exporter
/// config degrades to local logging only.
pub fn init_tracing(config: &TelemetryConfig) -> Option<TracerProvider> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };
    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        registry.init();
        return None;
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(config.export_headers())
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            registry.init();
            tracing::warn!(error=%err, endpoint, "failed to create OTLP exporter, logging locally only");
            return None;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();
    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()));

    registry.with(otel_layer).init();
    tracing::info!(endpoint, service = %config.service_name, "OTLP span export enabled");
    Some(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn empty_token_sends_no_auth_header() {
        let mut config = TelemetryConfig {
            otlp_token: Some(String::new()),
            ..Default::default()
        };
        assert!(config.export_headers().is_empty());

        config.otlp_token = Some("abc".into());
        assert_eq!(config.export_headers()["Authorization"], "Bearer abc");
    }
}
