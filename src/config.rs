//! Process-wide configuration for the operator
//!
//! Everything the builders need that does not come from an EventListener
//! itself: the sink image, HTTP timeouts passed to the sink, probe tuning and
//! the observability settings injected into every sink container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use tracing::warn;

/// Port the sink listens on unless configured otherwise
pub const DEFAULT_PORT: i32 = 8080;

/// Port the service switches to when TLS is enabled on a default-port listener
pub const DEFAULT_HTTPS_PORT: i32 = 8443;

/// Metrics port exposed by every sink container
pub const METRICS_PORT: i32 = 9000;

/// Name of the shared, per-namespace logging ConfigMap
pub const LOGGING_CONFIG_MAP: &str = "config-logging-triggers";

/// Name of the per-namespace observability ConfigMap
pub const OBSERVABILITY_CONFIG_MAP: &str = "config-observability-triggers";

/// Metrics domain handed to the sink
pub const METRICS_DOMAIN: &str = "tekton.dev/triggers";

const DEFAULT_IMAGE: &str = "ghcr.io/tektoncd/triggers/eventlistenersink:latest";
const DEFAULT_SYSTEM_NAMESPACE: &str = "tekton-pipelines";

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Sink image
    pub image: String,
    /// Port the sink listens on
    pub port: i32,
    /// Apply restricted pod/container security contexts
    pub set_security_context: bool,
    /// Namespace the controller itself runs in
    pub system_namespace: String,
    /// Sink server read timeout (seconds)
    pub read_timeout: i64,
    /// Sink server write timeout (seconds)
    pub write_timeout: i64,
    /// Sink server idle timeout (seconds)
    pub idle_timeout: i64,
    /// Sink request handler timeout (seconds)
    pub timeout_handler: i64,
    /// Outgoing HTTP client read timeout (seconds)
    pub http_client_read_timeout: i64,
    /// Outgoing HTTP client keep-alive (seconds)
    pub http_client_keep_alive: i64,
    /// Outgoing HTTP client TLS handshake timeout (seconds)
    pub http_client_tls_handshake_timeout: i64,
    /// Outgoing HTTP client response header timeout (seconds)
    pub http_client_response_header_timeout: i64,
    /// Outgoing HTTP client expect-continue timeout (seconds)
    pub http_client_expect_continue_timeout: i64,
    /// Probe period (seconds)
    pub period_seconds: i32,
    /// Probe failure threshold
    pub failure_threshold: i32,
    /// Labels stamped on every generated resource
    pub static_resource_labels: BTreeMap<String, String>,
    /// Observability settings forwarded to sinks
    pub observability: ObservabilityConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            port: DEFAULT_PORT,
            set_security_context: false,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            read_timeout: 5,
            write_timeout: 40,
            idle_timeout: 120,
            timeout_handler: 30,
            http_client_read_timeout: 30,
            http_client_keep_alive: 30,
            http_client_tls_handshake_timeout: 10,
            http_client_response_header_timeout: 10,
            http_client_expect_continue_timeout: 1,
            period_seconds: 10,
            failure_threshold: 3,
            static_resource_labels: default_static_labels(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_static_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "EventListener".to_string(),
    );
    labels.insert("app.kubernetes.io/part-of".to_string(), "Triggers".to_string());
    labels
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EL_IMAGE`: sink image
    /// - `EL_PORT`: sink port (default: 8080)
    /// - `SET_SECURITY_CONTEXT`: "true" to apply restricted security contexts
    /// - `SYSTEM_NAMESPACE`: namespace the controller runs in
    /// - `EL_READ_TIMEOUT`, `EL_WRITE_TIMEOUT`, `EL_IDLE_TIMEOUT`, `EL_TIMEOUT_HANDLER`
    /// - `EL_HTTPCLIENT_READ_TIMEOUT`, `EL_HTTPCLIENT_KEEP_ALIVE`,
    ///   `EL_HTTPCLIENT_TLS_HANDSHAKE_TIMEOUT`, `EL_HTTPCLIENT_RESPONSE_HEADER_TIMEOUT`,
    ///   `EL_HTTPCLIENT_EXPECT_CONTINUE_TIMEOUT`
    /// - `PERIOD_SECONDS`, `FAILURE_THRESHOLD`: probe tuning
    /// - `STATIC_RESOURCE_LABELS`: comma separated `key=value` pairs
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let static_resource_labels = match std::env::var("STATIC_RESOURCE_LABELS") {
            Ok(raw) => parse_labels(&raw),
            Err(_) => defaults.static_resource_labels,
        };

        Self {
            image: std::env::var("EL_IMAGE").unwrap_or(defaults.image),
            port: parse_env("EL_PORT", defaults.port),
            set_security_context: std::env::var("SET_SECURITY_CONTEXT")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            system_namespace: std::env::var("SYSTEM_NAMESPACE")
                .unwrap_or(defaults.system_namespace),
            read_timeout: parse_env("EL_READ_TIMEOUT", defaults.read_timeout),
            write_timeout: parse_env("EL_WRITE_TIMEOUT", defaults.write_timeout),
            idle_timeout: parse_env("EL_IDLE_TIMEOUT", defaults.idle_timeout),
            timeout_handler: parse_env("EL_TIMEOUT_HANDLER", defaults.timeout_handler),
            http_client_read_timeout: parse_env(
                "EL_HTTPCLIENT_READ_TIMEOUT",
                defaults.http_client_read_timeout,
            ),
            http_client_keep_alive: parse_env(
                "EL_HTTPCLIENT_KEEP_ALIVE",
                defaults.http_client_keep_alive,
            ),
            http_client_tls_handshake_timeout: parse_env(
                "EL_HTTPCLIENT_TLS_HANDSHAKE_TIMEOUT",
                defaults.http_client_tls_handshake_timeout,
            ),
            http_client_response_header_timeout: parse_env(
                "EL_HTTPCLIENT_RESPONSE_HEADER_TIMEOUT",
                defaults.http_client_response_header_timeout,
            ),
            http_client_expect_continue_timeout: parse_env(
                "EL_HTTPCLIENT_EXPECT_CONTINUE_TIMEOUT",
                defaults.http_client_expect_continue_timeout,
            ),
            period_seconds: parse_env("PERIOD_SECONDS", defaults.period_seconds),
            failure_threshold: parse_env("FAILURE_THRESHOLD", defaults.failure_threshold),
            static_resource_labels,
            observability: ObservabilityConfig::from_env(),
        }
    }
}

/// Parse a numeric environment variable, logging and falling back on failure.
fn parse_env<T>(var_name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(v) => match v.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    env_var = var_name,
                    value = %v,
                    error = %e,
                    default = %default,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse `key=value,key=value` into a label map, skipping malformed pairs.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                warn!(pair, "Ignoring static label without a key");
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Logging, metrics and tracing settings forwarded to every sink container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// JSON-encoded logging configuration
    pub logging: Option<String>,
    /// JSON-encoded metrics configuration
    pub metrics: Option<String>,
    /// JSON-encoded tracing configuration
    pub tracing: Option<String>,
}

impl ObservabilityConfig {
    /// Read `K_LOGGING_CONFIG`, `K_METRICS_CONFIG` and `K_TRACING_CONFIG` from
    /// the controller's own environment.
    pub fn from_env() -> Self {
        Self {
            logging: std::env::var("K_LOGGING_CONFIG").ok(),
            metrics: std::env::var("K_METRICS_CONFIG").ok(),
            tracing: std::env::var("K_TRACING_CONFIG").ok(),
        }
    }

    /// Environment variables carrying this configuration into a container.
    /// Unset settings are passed as empty strings so the sink falls back to
    /// its own defaults.
    pub fn to_env_vars(&self) -> Vec<EnvVar> {
        [
            ("K_LOGGING_CONFIG", &self.logging),
            ("K_METRICS_CONFIG", &self.metrics),
            ("K_TRACING_CONFIG", &self.tracing),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value.clone().unwrap_or_default()),
            ..Default::default()
        })
        .collect()
    }
}
