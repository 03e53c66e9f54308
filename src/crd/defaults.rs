//! Upgrade of fields moved out of the deprecated top level layout

use super::{EventListenerSpec, KubernetesResource, Resources};

/// Move deprecated `replicas` and `podTemplate` settings into
/// `resources.kubernetesResource`. Values already set in the new layout win.
///
/// Listeners running in customResource mode are left untouched.
pub fn upgrade_deprecated_fields(spec: &mut EventListenerSpec) {
    if spec.replicas.is_none() && spec.pod_template.is_none() {
        return;
    }
    if matches!(spec.resources, Some(Resources::CustomResource(_))) {
        return;
    }

    let replicas = spec.replicas.take();
    let pod_template = spec.pod_template.take();

    let resources = spec
        .resources
        .get_or_insert_with(|| Resources::KubernetesResource(KubernetesResource::default()));
    let Resources::KubernetesResource(kr) = resources else {
        return;
    };

    if kr.replicas.is_none() {
        kr.replicas = replicas;
    }

    if let Some(pt) = pod_template {
        let pod_spec = kr
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);
        if pod_spec.node_selector.is_none() {
            pod_spec.node_selector = pt.node_selector;
        }
        if pod_spec.tolerations.is_none() {
            pod_spec.tolerations = pt.tolerations;
        }
    }
}
