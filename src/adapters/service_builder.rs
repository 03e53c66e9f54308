//! Kubernetes Service builder for sink access

use k8s_openapi::api::core::v1::{Container, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::adapters::container_builder::{has_tls, CONTAINER_PORT};
use crate::adapters::deployment_builder::kubernetes_resource;
use crate::adapters::metadata::{
    build_owner_reference, generate_labels, non_empty, resource_annotations, resource_labels,
};
use crate::config::{ControllerConfig, DEFAULT_HTTPS_PORT, DEFAULT_PORT, METRICS_PORT};
use crate::crd::EventListener;

/// Default Service type
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

/// Build the Service fronting the sink pods.
///
/// `container` is the sink container as built for the Deployment; its TLS env
/// decides the port name and number.
pub fn build_service(el: &EventListener, config: &ControllerConfig, container: &Container) -> Service {
    let selector = generate_labels(&el.name_any(), &config.static_resource_labels);
    let service_type = kubernetes_resource(el)
        .and_then(|kr| kr.service_type.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(el.generated_resource_name()),
            namespace: el.namespace(),
            labels: Some(resource_labels(el, config)),
            annotations: non_empty(resource_annotations(el)),
            owner_references: Some(vec![build_owner_reference(el)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type),
            selector: Some(selector),
            ports: Some(vec![
                listener_port(el, config, container),
                ServicePort {
                    name: Some("http-metrics".to_string()),
                    port: METRICS_PORT,
                    target_port: Some(IntOrString::Int(METRICS_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The port traffic reaches the sink on.
///
/// An explicit `servicePort` always wins. Otherwise a TLS-enabled container
/// gets an `https-listener` port, numbered 8443 only while the configured port
/// is still the built-in default.
pub fn listener_port(el: &EventListener, config: &ControllerConfig, container: &Container) -> ServicePort {
    let mut port = ServicePort {
        name: Some("http-listener".to_string()),
        port: config.port,
        target_port: Some(IntOrString::Int(CONTAINER_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    if let Some(explicit) = kubernetes_resource(el).and_then(|kr| kr.service_port) {
        port.port = explicit;
        return port;
    }

    if has_tls(container) {
        port.name = Some("https-listener".to_string());
        if config.port == DEFAULT_PORT {
            port.port = DEFAULT_HTTPS_PORT;
        }
    }
    port
}

/// In-cluster `host:port` of the listener Service
pub fn service_hostname(el: &EventListener, port: i32) -> String {
    format!(
        "{}.{}.svc.cluster.local:{}",
        el.generated_resource_name(),
        el.namespace().unwrap_or_default(),
        port
    )
}

/// URL scheme clients use to reach the sink
pub fn address_scheme(container: &Container) -> &'static str {
    if has_tls(container) {
        "https"
    } else {
        "http"
    }
}

/// Keep fields the API server allocated on the live Service so the desired
/// spec does not fight them.
pub fn carry_over_allocated_fields(desired: &mut ServiceSpec, existing: &ServiceSpec) {
    desired.cluster_ip = existing.cluster_ip.clone();
    desired.cluster_ips = existing.cluster_ips.clone();

    let both_node_port = desired.type_.as_deref() == Some("NodePort")
        && existing.type_.as_deref() == Some("NodePort");
    if !both_node_port {
        return;
    }
    if let (Some(desired_ports), Some(existing_ports)) =
        (desired.ports.as_mut(), existing.ports.as_ref())
    {
        for (d, e) in desired_ports.iter_mut().zip(existing_ports.iter()) {
            d.node_port = e.node_port;
        }
    }
}
