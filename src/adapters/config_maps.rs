//! Default per-namespace ConfigMaps read by sink pods

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::config::{LOGGING_CONFIG_MAP, OBSERVABILITY_CONFIG_MAP};

const DEFAULT_ZAP_CONFIG: &str = r#"{
  "level": "info",
  "development": false,
  "sampling": {
    "initial": 100,
    "thereafter": 100
  },
  "outputPaths": ["stdout"],
  "errorOutputPaths": ["stderr"],
  "encoding": "json",
  "encoderConfig": {
    "timeKey": "ts",
    "levelKey": "level",
    "nameKey": "logger",
    "callerKey": "caller",
    "messageKey": "msg",
    "stacktraceKey": "stacktrace",
    "lineEnding": "",
    "levelEncoder": "",
    "timeEncoder": "iso8601",
    "durationEncoder": "",
    "callerEncoder": ""
  }
}"#;

/// Logging ConfigMap shared by every listener in a namespace.
///
/// It has no owner reference: it outlives individual listeners and is only
/// removed when the last listener of the namespace is finalized.
pub fn logging_config_map(namespace: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(
        "zap-logger-config".to_string(),
        DEFAULT_ZAP_CONFIG.to_string(),
    );
    data.insert("loglevel.eventlistener".to_string(), "info".to_string());
    config_map(namespace, LOGGING_CONFIG_MAP, data)
}

/// Observability ConfigMap with the sink's metrics defaults
pub fn observability_config_map(namespace: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(
        "metrics.backend-destination".to_string(),
        "prometheus".to_string(),
    );
    config_map(namespace, OBSERVABILITY_CONFIG_MAP, data)
}

fn config_map(namespace: &str, name: &str, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}
