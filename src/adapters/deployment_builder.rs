//! Kubernetes Deployment builder for sink pods

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile, SecretVolumeSource, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::adapters::container_builder::{self, TlsSecrets, TLS_VOLUME_NAME};
use crate::adapters::metadata::{
    build_owner_reference, generate_labels, non_empty, resource_annotations, resource_labels,
};
use crate::config::ControllerConfig;
use crate::crd::{EventListener, KubernetesResource, Resources};

/// The workload-mode settings of a listener, if it is in that mode
pub fn kubernetes_resource(el: &EventListener) -> Option<&KubernetesResource> {
    match el.spec.resources.as_ref() {
        Some(Resources::KubernetesResource(kr)) => Some(kr),
        _ => None,
    }
}

/// Pod template overrides declared on the listener
pub fn user_pod_template(el: &EventListener) -> Option<&PodTemplateSpec> {
    kubernetes_resource(el)
        .and_then(|kr| kr.spec.as_ref())
        .map(|s| &s.template)
}

/// Pod spec overrides declared on the listener
pub fn user_pod_spec(el: &EventListener) -> Option<&PodSpec> {
    user_pod_template(el).and_then(|t| t.spec.as_ref())
}

/// Build the sink container for workload mode, including metrics port, probes
/// and TLS wiring.
pub fn build_workload_container(
    el: &EventListener,
    config: &ControllerConfig,
) -> k8s_openapi::api::core::v1::Container {
    let user = user_pod_spec(el).and_then(|spec| spec.containers.first());
    let mut container = container_builder::build_container(el, config, user);

    container_builder::with_metrics_port(&mut container);
    let tls = TlsSecrets::from_container(&container);
    container_builder::with_probes(&mut container, config, tls.is_some());
    if let Some(ref tls) = tls {
        container_builder::with_tls(&mut container, tls);
    }
    if config.set_security_context {
        container_builder::with_security_context(&mut container);
    }
    container
}

/// Build the Deployment for a listener
pub fn build_deployment(el: &EventListener, config: &ControllerConfig) -> Deployment {
    let name = el.generated_resource_name();
    let labels = resource_labels(el, config);
    let selector = generate_labels(&el.name_any(), &config.static_resource_labels);

    let container = build_workload_container(el, config);
    let pod_spec = build_pod_spec(el, config, container);

    let user_meta = user_pod_template(el).and_then(|t| t.metadata.as_ref());
    let mut pod_labels = labels.clone();
    if let Some(user_labels) = user_meta.and_then(|m| m.labels.as_ref()) {
        pod_labels.extend(user_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    // the selector has to keep matching whatever the user put on the template
    pod_labels.extend(selector.clone());
    let pod_annotations = user_meta.and_then(|m| m.annotations.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: el.namespace(),
            labels: Some(labels),
            annotations: non_empty(resource_annotations(el)),
            owner_references: Some(vec![build_owner_reference(el)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: kubernetes_resource(el).and_then(|kr| kr.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: pod_annotations,
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pod_spec(
    el: &EventListener,
    config: &ControllerConfig,
    container: k8s_openapi::api::core::v1::Container,
) -> PodSpec {
    let tls = TlsSecrets::from_container(&container);
    let user = user_pod_spec(el);

    let service_account_name = user
        .and_then(|s| s.service_account_name.clone())
        .filter(|sa| !sa.is_empty())
        .or_else(|| Some(el.spec.service_account_name.clone()).filter(|sa| !sa.is_empty()));

    let mut pod_spec = PodSpec {
        containers: vec![container],
        service_account_name,
        tolerations: user.and_then(|s| s.tolerations.clone()),
        node_selector: user.and_then(|s| s.node_selector.clone()),
        affinity: user.and_then(|s| s.affinity.clone()),
        topology_spread_constraints: user.and_then(|s| s.topology_spread_constraints.clone()),
        ..Default::default()
    };

    if let Some(tls) = tls {
        pod_spec.volumes = Some(vec![Volume {
            name: TLS_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls.cert.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    if config.set_security_context {
        pod_spec.security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    pod_spec
}
