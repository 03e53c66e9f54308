//! EventListener Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DeploymentCondition;
use k8s_openapi::api::core::v1::{PodTemplateSpec, Toleration};
use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// EventListener resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "triggers.tekton.dev",
    version = "v1beta1",
    kind = "EventListener",
    plural = "eventlisteners",
    singular = "eventlistener",
    shortname = "el",
    namespaced,
    status = "EventListenerStatus",
    printcolumn = r#"{"name": "Address", "type": "string", "jsonPath": ".status.address.url"}"#,
    printcolumn = r#"{"name": "Available", "type": "string", "jsonPath": ".status.conditions[?(@.type=='Available')].status"}"#,
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EventListenerSpec {
    /// Service account used by the sink pods
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,

    /// Triggers served by this listener (evaluated by the sink, not the operator)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub triggers: Vec<serde_json::Value>,

    /// Namespaces whose triggers this listener serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,

    /// How the sink is run: a Deployment + Service, or an arbitrary object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,

    /// Deprecated: use resources.kubernetesResource.replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Deprecated: use resources.kubernetesResource.spec.template.spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<DeprecatedPodTemplate>,
}

/// Namespace selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Explicit namespace names; `*` selects every namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
}

/// Sink representation. Exactly one mode can be selected.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Resources {
    /// Run the sink as a managed Deployment + Service
    KubernetesResource(KubernetesResource),
    /// Run the sink as an arbitrary object (e.g. a Knative Service)
    CustomResource(CustomResourceTemplate),
}

/// Deployment + Service mode settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResource {
    /// Desired replicas; when unset the live count is left alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Service port override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<i32>,

    /// Pod template overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<WithPodSpec>,
}

/// Wrapper carrying a pod template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WithPodSpec {
    /// Pod template
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// Arbitrary object mode settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceTemplate {
    /// Complete object template, including apiVersion and kind
    #[schemars(schema_with = "preserve_unknown_object")]
    pub runtime: serde_json::Value,
}

/// Deprecated top level pod settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeprecatedPodTemplate {
    /// Node selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Tolerations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

fn preserve_unknown_object(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap_or(Schema::Bool(true))
}

fn preserve_unknown_list(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    }))
    .unwrap_or(Schema::Bool(true))
}

/// EventListener status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventListenerStatus {
    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Where the sink can be reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,

    /// Names of the generated resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<EventListenerConfig>,
}

/// Generated resource naming
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventListenerConfig {
    /// Name shared by the Deployment, Service or custom object
    pub generated_name: String,
}

/// Sink address
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Addressable {
    /// Sink URL
    pub url: String,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready, ServiceExists, DeploymentExists, Available, ...)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Condition types written by the controller
pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const SERVICE_EXISTS: &str = "ServiceExists";
    pub const DEPLOYMENT_EXISTS: &str = "DeploymentExists";
    pub const DEPLOYMENT_AVAILABLE: &str = "Available";
}

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(type_: &str, status: &str, reason: Option<&str>, message: Option<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: reason.map(str::to_string),
            message,
        }
    }

    /// Whether the status is true (case-insensitive, objects in the wild vary)
    pub fn is_true(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_TRUE)
    }
}

impl From<&DeploymentCondition> for Condition {
    fn from(c: &DeploymentCondition) -> Self {
        Self {
            type_: c.type_.clone(),
            status: c.status.clone(),
            last_transition_time: c.last_transition_time.as_ref().map(|t| t.0),
            reason: c.reason.clone(),
            message: c.message.clone(),
        }
    }
}

impl EventListenerStatus {
    /// Reset to the reconciling baseline: dependent conditions that are
    /// missing start out Unknown.
    pub fn initialize_conditions(&mut self) {
        for type_ in [
            condition_types::READY,
            condition_types::SERVICE_EXISTS,
            condition_types::DEPLOYMENT_EXISTS,
        ] {
            if self.get_condition(type_).is_none() {
                self.conditions
                    .push(Condition::new(type_, STATUS_UNKNOWN, None, None));
            }
        }
    }

    /// Forget the address and conditions of a removed Deployment and Service
    pub fn clear_workload_state(&mut self) {
        self.address = None;
        self.conditions.clear();
        self.initialize_conditions();
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition. The previous transition time is kept
    /// when the status did not change.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing
                        .last_transition_time
                        .or(condition.last_transition_time);
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Record whether a child resource exists
    pub fn mark_exists(&mut self, type_: &str, error: Option<&crate::Error>) {
        let condition = match error {
            None => Condition::new(type_, STATUS_TRUE, None, None),
            Some(e) => Condition::new(
                type_,
                STATUS_FALSE,
                Some("CreateFailed"),
                Some(e.to_string()),
            ),
        };
        self.set_condition(condition);
    }

    /// Mirror the live Deployment conditions
    pub fn set_deployment_conditions(&mut self, conditions: &[DeploymentCondition]) {
        for c in conditions {
            self.set_condition(Condition::from(c));
        }
    }

    /// Replace every condition with those reported by a custom object
    pub fn set_conditions_for_dynamic_object(&mut self, conditions: Vec<Condition>) {
        self.conditions = conditions;
    }

    /// Derive Ready from the existence and availability conditions
    pub fn set_ready_condition(&mut self) {
        let dependents = [
            condition_types::DEPLOYMENT_EXISTS,
            condition_types::SERVICE_EXISTS,
            condition_types::DEPLOYMENT_AVAILABLE,
        ];

        let mut waiting_on = None;
        for type_ in dependents {
            match self.get_condition(type_) {
                Some(c) if c.is_true() => {}
                Some(c) if c.status == STATUS_FALSE => {
                    let message = c
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("{} is False", type_));
                    self.set_condition(Condition::new(
                        condition_types::READY,
                        STATUS_FALSE,
                        Some(type_),
                        Some(message),
                    ));
                    return;
                }
                _ => {
                    waiting_on.get_or_insert(type_);
                }
            }
        }

        let condition = match waiting_on {
            Some(type_) => Condition::new(
                condition_types::READY,
                STATUS_UNKNOWN,
                Some(type_),
                Some(format!("Waiting for {}", type_)),
            ),
            None => Condition::new(condition_types::READY, STATUS_TRUE, None, None),
        };
        self.set_condition(condition);
    }

    /// Record the sink address from a `host[:port]`
    pub fn set_address(&mut self, scheme: &str, hostname: &str) {
        self.address = Some(Addressable {
            url: format!("{}://{}", scheme, hostname),
        });
    }
}
