//! The sink container shared by the Deployment and custom object shapes

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, Probe, SecretKeySelector,
    SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::{
    ControllerConfig, DEFAULT_PORT, LOGGING_CONFIG_MAP, METRICS_DOMAIN, METRICS_PORT,
    OBSERVABILITY_CONFIG_MAP,
};
use crate::crd::EventListener;

/// Name of the sink container
pub const CONTAINER_NAME: &str = "event-listener";

/// Port the sink process binds inside the container
pub const CONTAINER_PORT: i32 = DEFAULT_PORT;

/// Annotation that disables payload validation when set to "false"
pub const PAYLOAD_VALIDATION_ANNOTATION: &str = "tekton.dev/payload-validation";

/// Env var carrying the TLS certificate secret reference
pub const TLS_CERT_ENV: &str = "TLS_CERT";
/// Env var carrying the TLS key secret reference
pub const TLS_KEY_ENV: &str = "TLS_KEY";

/// Volume name used for the TLS secret
pub const TLS_VOLUME_NAME: &str = "https-connection";
/// Where the TLS secret is mounted
pub const TLS_MOUNT_PATH: &str = "/etc/triggers/tls";

/// Liveness/readiness endpoint of the sink
const PROBE_PATH: &str = "/live";

/// Build the baseline sink container.
///
/// Only the env vars and resource requirements of `user` are kept; every other
/// field of a user-declared container is discarded.
pub fn build_container(
    el: &EventListener,
    config: &ControllerConfig,
    user: Option<&Container>,
) -> Container {
    let mut env = base_env(el, config);
    let mut resources = None;

    if let Some(user) = user {
        for var in user.env.iter().flatten() {
            upsert_env(&mut env, var.clone());
        }
        resources = user.resources.clone();
    }

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        args: Some(base_args(el, config)),
        ports: Some(vec![ContainerPort {
            name: Some("http-listener".to_string()),
            container_port: CONTAINER_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        resources,
        ..Default::default()
    }
}

fn base_args(el: &EventListener, config: &ControllerConfig) -> Vec<String> {
    let is_multi_ns = el
        .spec
        .namespace_selector
        .as_ref()
        .is_some_and(|ns| !ns.match_names.is_empty());

    let payload_validation = el
        .annotations()
        .get(PAYLOAD_VALIDATION_ANNOTATION)
        .map_or(true, |v| v != "false");

    vec![
        format!("--el-name={}", el.name_any()),
        format!("--el-namespace={}", el.namespace().unwrap_or_default()),
        format!("--port={}", CONTAINER_PORT),
        format!("--readtimeout={}", config.read_timeout),
        format!("--writetimeout={}", config.write_timeout),
        format!("--idletimeout={}", config.idle_timeout),
        format!("--timeouthandler={}", config.timeout_handler),
        format!("--httpclient-readtimeout={}", config.http_client_read_timeout),
        format!("--httpclient-keep-alive={}", config.http_client_keep_alive),
        format!(
            "--httpclient-tlshandshaketimeout={}",
            config.http_client_tls_handshake_timeout
        ),
        format!(
            "--httpclient-responseheadertimeout={}",
            config.http_client_response_header_timeout
        ),
        format!(
            "--httpclient-expectcontinuetimeout={}",
            config.http_client_expect_continue_timeout
        ),
        format!("--is-multi-ns={}", is_multi_ns),
        format!("--payload-validation={}", payload_validation),
    ]
}

fn base_env(el: &EventListener, config: &ControllerConfig) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("NAMESPACE", &el.namespace().unwrap_or_default()),
        env_var("NAME", &el.name_any()),
        env_var("SYSTEM_NAMESPACE", &el.namespace().unwrap_or_default()),
        env_var("CONFIG_LOGGING_NAME", LOGGING_CONFIG_MAP),
        env_var("CONFIG_OBSERVABILITY_NAME", OBSERVABILITY_CONFIG_MAP),
        env_var("METRICS_DOMAIN", METRICS_DOMAIN),
        env_var("METRICS_PROMETHEUS_PORT", &METRICS_PORT.to_string()),
    ];
    env.extend(config.observability.to_env_vars());
    env
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Replace an env var with the same name or append it
pub fn upsert_env(env: &mut Vec<EnvVar>, var: EnvVar) {
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Expose the metrics port
pub fn with_metrics_port(container: &mut Container) {
    container
        .ports
        .get_or_insert_with(Vec::new)
        .push(ContainerPort {
            name: Some("http-metrics".to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
}

/// Add liveness and readiness probes against the sink's `/live` endpoint
pub fn with_probes(container: &mut Container, config: &ControllerConfig, https: bool) {
    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some(PROBE_PATH.to_string()),
            port: IntOrString::Int(CONTAINER_PORT),
            scheme: Some(if https { "HTTPS" } else { "HTTP" }.to_string()),
            ..Default::default()
        }),
        period_seconds: Some(config.period_seconds),
        failure_threshold: Some(config.failure_threshold),
        ..Default::default()
    };
    container.liveness_probe = Some(probe.clone());
    container.readiness_probe = Some(probe);
}

/// Restricted container security context
pub fn with_security_context(container: &mut Container) {
    container.security_context = Some(SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        run_as_non_root: Some(true),
        ..Default::default()
    });
}

/// Secret references found in the TLS env vars of a container
#[derive(Debug, Clone, PartialEq)]
pub struct TlsSecrets {
    pub cert: SecretKeySelector,
    pub key: Option<SecretKeySelector>,
}

impl TlsSecrets {
    /// Read `TLS_CERT` (required) and `TLS_KEY` from secret-sourced env vars
    pub fn from_container(container: &Container) -> Option<Self> {
        let cert = secret_env(container, TLS_CERT_ENV)?;
        let key = secret_env(container, TLS_KEY_ENV);
        Some(Self { cert, key })
    }

    /// Both certificate and key are present
    pub fn is_complete(&self) -> bool {
        self.key.is_some()
    }
}

fn secret_env(container: &Container, name: &str) -> Option<SecretKeySelector> {
    container
        .env
        .iter()
        .flatten()
        .find(|e| e.name == name)
        .and_then(|e| e.value_from.as_ref())
        .and_then(|source| source.secret_key_ref.clone())
}

/// Whether the container serves HTTPS (both TLS env vars come from secrets)
pub fn has_tls(container: &Container) -> bool {
    TlsSecrets::from_container(container).is_some_and(|tls| tls.is_complete())
}

/// Mount the TLS secret and point the sink at the certificate and key
pub fn with_tls(container: &mut Container, tls: &TlsSecrets) {
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: TLS_VOLUME_NAME.to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });

    let args = container.args.get_or_insert_with(Vec::new);
    args.push(format!("--tls-cert={}/{}", TLS_MOUNT_PATH, tls.cert.key));
    if let Some(ref key) = tls.key {
        args.push(format!("--tls-key={}/{}", TLS_MOUNT_PATH, key.key));
    }
}
