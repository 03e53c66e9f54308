//! Untyped sink object for listeners running in customResource mode
//!
//! The template is an arbitrary document (usually a Knative Service). Only the
//! pieces the sink depends on are rewritten: identity metadata, the single
//! container, and the service account. Everything else is passed through.

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::ResourceExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::adapters::container_builder::build_container;
use crate::adapters::metadata::{build_owner_reference, generate_labels, non_empty};
use crate::config::ControllerConfig;
use crate::crd::{CustomResourceTemplate, EventListener};
use crate::{Error, Result};

/// A desired custom object together with the coordinates used to address it
#[derive(Clone, Debug)]
pub struct CustomObject {
    pub resource: ApiResource,
    pub object: DynamicObject,
}

/// Build the desired object from the listener's runtime template
pub fn build_custom_object(
    el: &EventListener,
    template: &CustomResourceTemplate,
    config: &ControllerConfig,
) -> Result<CustomObject> {
    let Value::Object(mut doc) = template.runtime.clone() else {
        return Err(Error::InvalidCustomResource(
            "runtime template must be an object".to_string(),
        ));
    };

    let api_version = take_string(&mut doc, "apiVersion")?;
    let kind = take_string(&mut doc, "kind")?;
    let resource = api_resource_for(&api_version, &kind);

    let template_meta: ObjectMeta = match doc.remove("metadata") {
        Some(Value::Null) | None => ObjectMeta::default(),
        Some(meta) => serde_json::from_value(meta)?,
    };

    rewrite_pod_template(el, config, &mut doc)?;

    let mut labels: BTreeMap<String, String> = template_meta.labels.clone().unwrap_or_default();
    labels.extend(el.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    labels.extend(generate_labels(&el.name_any(), &config.static_resource_labels));

    let name = template_meta
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| el.generated_resource_name());

    let object = DynamicObject {
        types: Some(TypeMeta {
            api_version,
            kind,
        }),
        metadata: ObjectMeta {
            name: Some(name),
            namespace: el.namespace(),
            labels: Some(labels),
            annotations: template_meta.annotations.and_then(non_empty),
            owner_references: Some(vec![build_owner_reference(el)]),
            ..Default::default()
        },
        data: Value::Object(doc),
    };

    Ok(CustomObject { resource, object })
}

fn take_string(doc: &mut Map<String, Value>, key: &str) -> Result<String> {
    match doc.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(Error::InvalidCustomResource(format!(
            "runtime template is missing {}",
            key
        ))),
    }
}

/// Replace the pod template's metadata and containers with the sink's
fn rewrite_pod_template(
    el: &EventListener,
    config: &ControllerConfig,
    doc: &mut Map<String, Value>,
) -> Result<()> {
    let spec = object_entry(doc, "spec")?;
    let template = object_entry(spec, "template")?;

    let template_meta: ObjectMeta = match template.remove("metadata") {
        Some(Value::Null) | None => ObjectMeta::default(),
        Some(meta) => serde_json::from_value(meta)?,
    };
    let rebuilt = ObjectMeta {
        name: template_meta.name,
        labels: template_meta.labels,
        annotations: template_meta.annotations,
        ..Default::default()
    };
    template.insert("metadata".to_string(), serde_json::to_value(rebuilt)?);

    let pod_spec = object_entry(template, "spec")?;
    let user_containers: Vec<Container> = match pod_spec.remove("containers") {
        Some(Value::Null) | None => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(decode_container)
            .collect::<serde_json::Result<_>>()?,
        Some(other) => serde_json::from_value(other)?,
    };
    let user = match user_containers.as_slice() {
        [only] => Some(only),
        _ => None,
    };
    let container = build_container(el, config, user);
    pod_spec.insert(
        "containers".to_string(),
        Value::Array(vec![serde_json::to_value(container)?]),
    );

    let sa_missing = pod_spec
        .get("serviceAccountName")
        .and_then(Value::as_str)
        .map_or(true, str::is_empty);
    if sa_missing && !el.spec.service_account_name.is_empty() {
        pod_spec.insert(
            "serviceAccountName".to_string(),
            Value::String(el.spec.service_account_name.clone()),
        );
    }
    Ok(())
}

/// Runtime templates may leave the container unnamed; the name is replaced anyway
fn decode_container(mut item: Value) -> serde_json::Result<Container> {
    if let Some(fields) = item.as_object_mut() {
        fields
            .entry("name")
            .or_insert_with(|| Value::String(String::new()));
    }
    serde_json::from_value(item)
}

/// Nested object at `key`, created when absent
fn object_entry<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>> {
    let entry = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    entry
        .as_object_mut()
        .ok_or_else(|| Error::InvalidCustomResource(format!("{} must be an object", key)))
}

/// Coordinates for `apiVersion`/`kind`, guessing the plural from the kind
pub fn api_resource_for(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let gvk = GroupVersionKind::gvk(group, version, kind);
    ApiResource::from_gvk_with_plural(&gvk, &guess_plural(kind))
}

fn guess_plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}
