//! Labels, annotations and owner references shared by every generated resource

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::config::ControllerConfig;
use crate::crd::EventListener;

/// Label carrying the owning listener's name
pub const EVENT_LISTENER_LABEL: &str = "eventlistener";

/// Annotation written by `kubectl apply`; never copied onto children
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Labels that identify the resources of one listener. Used as the selector.
pub fn generate_labels(
    listener_name: &str,
    static_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = static_labels.clone();
    labels.insert(EVENT_LISTENER_LABEL.to_string(), listener_name.to_string());
    labels
}

/// Listener labels overlaid with the generated ones (generated labels win)
pub fn resource_labels(el: &EventListener, config: &ControllerConfig) -> BTreeMap<String, String> {
    let mut labels = el.labels().clone();
    labels.extend(generate_labels(&el.name_any(), &config.static_resource_labels));
    labels
}

/// Listener annotations to propagate onto generated resources
pub fn resource_annotations(el: &EventListener) -> BTreeMap<String, String> {
    el.annotations()
        .iter()
        .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `None` for an empty map so unset and empty serialize the same way
pub fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Controller owner reference pointing at the listener
pub fn build_owner_reference(el: &EventListener) -> OwnerReference {
    OwnerReference {
        api_version: EventListener::api_version(&()).to_string(),
        kind: EventListener::kind(&()).to_string(),
        name: el.name_any(),
        uid: el.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether `owner` is a controller reference to an EventListener
pub fn is_listener_owner(owner: &OwnerReference) -> bool {
    owner.controller == Some(true)
        && owner.kind == EventListener::kind(&())
        && owner.api_version.split('/').next() == Some(EventListener::group(&()).as_ref())
}

/// Labels must match exactly: the controller owns the whole set
pub fn labels_differ(
    desired: Option<&BTreeMap<String, String>>,
    existing: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    desired.unwrap_or(&empty) != existing.unwrap_or(&empty)
}

/// Annotations only differ when a desired key is missing or has another value;
/// annotations added by others are left alone
pub fn annotations_differ(
    desired: Option<&BTreeMap<String, String>>,
    existing: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    let existing = existing.unwrap_or(&empty);
    desired
        .unwrap_or(&empty)
        .iter()
        .any(|(k, v)| existing.get(k) != Some(v))
}

/// Existing annotations with the desired ones laid on top
pub fn merge_annotations(
    desired: Option<&BTreeMap<String, String>>,
    existing: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = existing.cloned().unwrap_or_default();
    if let Some(desired) = desired {
        merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    non_empty(merged)
}
