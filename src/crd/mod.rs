//! Custom Resource Definitions for the EventListener Operator

pub mod defaults;
mod event_listener;

pub use event_listener::*;

use kube::CustomResourceExt;

/// Generate CRD YAML manifests for all custom resources
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![serde_yaml::to_string(&EventListener::crd())?])
}

/// Prefix of every generated child resource name
pub const GENERATED_RESOURCE_PREFIX: &str = "el";

impl EventListener {
    /// Name shared by the Deployment, Service or custom object of this listener
    pub fn generated_resource_name(&self) -> String {
        generated_resource_name(self.metadata.name.as_deref().unwrap_or_default())
    }
}

/// `el-<name>`
pub fn generated_resource_name(listener_name: &str) -> String {
    format!("{}-{}", GENERATED_RESOURCE_PREFIX, listener_name)
}
