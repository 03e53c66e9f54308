//! Reconciliation logic for EventListener resources
//!
//! A listener runs either as a Deployment plus Service (the default) or as a
//! single object of an arbitrary kind built from `resources.customResource`.
//! Every pass converges the live objects toward what the listener describes
//! and records the outcome in the listener status. Passes are safe to repeat
//! and to interrupt at any point.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::adapters::conditions::{extract_status, hostname_from_url};
use crate::adapters::config_maps::{logging_config_map, observability_config_map};
use crate::adapters::custom_object_builder::build_custom_object;
use crate::adapters::deployment_builder::{build_deployment, build_workload_container};
use crate::adapters::metadata::{annotations_differ, labels_differ, merge_annotations};
use crate::adapters::semantic::{differs, is_derivative};
use crate::adapters::service_builder::{
    address_scheme, build_service, carry_over_allocated_fields, listener_port, service_hostname,
};
use crate::config::{ControllerConfig, LOGGING_CONFIG_MAP};
use crate::crd::defaults::upgrade_deprecated_fields;
use crate::crd::{
    condition_types, CustomResourceTemplate, EventListener, EventListenerConfig,
    EventListenerStatus, Resources,
};
use crate::error::combine_errors;
use crate::reconcilers::client::{DynamicWatcher, ListenerKubeClient};
use crate::{Error, Result};

/// Reconciles EventListeners into running sinks
pub struct Reconciler {
    client: Arc<dyn ListenerKubeClient>,
    watcher: Arc<dyn DynamicWatcher>,
    config: Arc<ControllerConfig>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ListenerKubeClient>,
        watcher: Arc<dyn DynamicWatcher>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            client,
            watcher,
            config,
        }
    }

    /// Client the reconciler writes through
    pub fn client(&self) -> &dyn ListenerKubeClient {
        self.client.as_ref()
    }

    /// Converge the sink of `el`, recording progress in `status`.
    ///
    /// `status` is updated even when an error is returned so partial progress
    /// (for example a failed create) is still reported.
    pub async fn reconcile_kind(
        &self,
        el: &EventListener,
        status: &mut EventListenerStatus,
    ) -> Result<()> {
        status.initialize_conditions();
        status.configuration = Some(EventListenerConfig {
            generated_name: el.generated_resource_name(),
        });
        status.observed_generation = el.metadata.generation;

        let mut el = el.clone();
        upgrade_deprecated_fields(&mut el.spec);

        if let Some(Resources::CustomResource(template)) = el.spec.resources.as_ref() {
            return self.reconcile_custom_object(&el, template, status).await;
        }

        let deployment = self.reconcile_deployment(&el, status).await;
        let service = self.reconcile_service(&el, status).await;
        combine_errors(deployment, service)?;

        status.set_ready_condition();
        Ok(())
    }

    /// Clean up namespace-wide state when a listener is deleted.
    ///
    /// The logging ConfigMap is shared by all listeners of a namespace, so it
    /// is only removed together with the last one, and never from the
    /// controller's own namespace.
    pub async fn finalize_kind(&self, el: &EventListener) -> Result<()> {
        let ns = el.namespace().unwrap_or_default();
        let listeners = self.client.list_event_listeners(&ns).await?;

        if listeners.len() > 1 {
            debug!(
                namespace = %ns,
                remaining = listeners.len(),
                "other EventListeners remain, keeping logging ConfigMap"
            );
            return Ok(());
        }
        if ns == self.config.system_namespace {
            debug!(namespace = %ns, "system namespace, keeping logging ConfigMap");
            return Ok(());
        }

        match self.client.delete_config_map(&ns, LOGGING_CONFIG_MAP).await {
            Ok(()) => {
                info!(namespace = %ns, name = LOGGING_CONFIG_MAP, "Deleted logging ConfigMap");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reconcile_service(
        &self,
        el: &EventListener,
        status: &mut EventListenerStatus,
    ) -> Result<()> {
        let ns = el.namespace().unwrap_or_default();
        let name = el.generated_resource_name();

        let container = build_workload_container(el, &self.config);
        let desired = build_service(el, &self.config, &container);
        let hostname = service_hostname(el, listener_port(el, &self.config, &container).port);
        let scheme = address_scheme(&container);

        let Some(existing) = self.client.get_service(&ns, &name).await? else {
            return match self.client.create_service(&ns, &desired).await {
                Ok(_) => {
                    info!(namespace = %ns, name = %name, "Created Service");
                    status.mark_exists(condition_types::SERVICE_EXISTS, None);
                    status.set_address(scheme, &hostname);
                    Ok(())
                }
                Err(e) => {
                    error!(namespace = %ns, name = %name, error = %e, "Failed to create Service");
                    status.mark_exists(condition_types::SERVICE_EXISTS, Some(&e));
                    Err(e)
                }
            };
        };

        let mut desired_spec = desired.spec.clone().unwrap_or_default();
        let existing_spec = existing.spec.clone().unwrap_or_default();
        carry_over_allocated_fields(&mut desired_spec, &existing_spec);

        let changed = differs(&desired_spec, &existing_spec)?
            || labels_differ(
                desired.metadata.labels.as_ref(),
                existing.metadata.labels.as_ref(),
            )
            || annotations_differ(
                desired.metadata.annotations.as_ref(),
                existing.metadata.annotations.as_ref(),
            );

        if changed {
            let mut updated = existing.clone();
            updated.metadata.labels = desired.metadata.labels.clone();
            updated.metadata.annotations = merge_annotations(
                desired.metadata.annotations.as_ref(),
                existing.metadata.annotations.as_ref(),
            );
            updated.spec = Some(desired_spec);
            let result = self.client.update_service(&ns, &updated).await?;
            if result.metadata.resource_version != existing.metadata.resource_version {
                info!(namespace = %ns, name = %name, "Updated Service");
            }
        }

        status.mark_exists(condition_types::SERVICE_EXISTS, None);
        status.set_address(scheme, &hostname);
        Ok(())
    }

    async fn reconcile_deployment(
        &self,
        el: &EventListener,
        status: &mut EventListenerStatus,
    ) -> Result<()> {
        let ns = el.namespace().unwrap_or_default();
        let name = el.generated_resource_name();

        self.ensure_config_map(&ns, logging_config_map(&ns)).await?;
        self.ensure_config_map(&ns, observability_config_map(&ns))
            .await?;

        let desired = build_deployment(el, &self.config);

        let Some(existing) = self.client.get_deployment(&ns, &name).await? else {
            return match self.client.create_deployment(&ns, &desired).await {
                Ok(created) => {
                    info!(namespace = %ns, name = %name, "Created Deployment");
                    status.mark_exists(condition_types::DEPLOYMENT_EXISTS, None);
                    if let Some(conditions) =
                        created.status.as_ref().and_then(|s| s.conditions.as_ref())
                    {
                        status.set_deployment_conditions(conditions);
                    }
                    Ok(())
                }
                Err(e) => {
                    error!(namespace = %ns, name = %name, error = %e, "Failed to create Deployment");
                    status.mark_exists(condition_types::DEPLOYMENT_EXISTS, Some(&e));
                    Err(e)
                }
            };
        };

        status.mark_exists(condition_types::DEPLOYMENT_EXISTS, None);
        if let Some(conditions) = existing.status.as_ref().and_then(|s| s.conditions.as_ref()) {
            status.set_deployment_conditions(conditions);
        }

        let mut desired_spec = desired.spec.clone().unwrap_or_default();
        let existing_spec = existing.spec.clone().unwrap_or_default();
        // unset replicas leave scaling to whoever owns it (e.g. an autoscaler)
        if desired_spec.replicas.is_none() {
            desired_spec.replicas = existing_spec.replicas;
        }

        let changed = differs(&desired_spec, &existing_spec)?
            || labels_differ(
                desired.metadata.labels.as_ref(),
                existing.metadata.labels.as_ref(),
            )
            || annotations_differ(
                desired.metadata.annotations.as_ref(),
                existing.metadata.annotations.as_ref(),
            );

        if changed {
            let mut updated = existing.clone();
            updated.metadata.labels = desired.metadata.labels.clone();
            updated.metadata.annotations = merge_annotations(
                desired.metadata.annotations.as_ref(),
                existing.metadata.annotations.as_ref(),
            );
            updated.spec = Some(desired_spec);
            let result = self.client.update_deployment(&ns, &updated).await?;
            if result.metadata.resource_version != existing.metadata.resource_version {
                info!(namespace = %ns, name = %name, "Updated Deployment");
            }
        }
        Ok(())
    }

    async fn reconcile_custom_object(
        &self,
        el: &EventListener,
        template: &CustomResourceTemplate,
        status: &mut EventListenerStatus,
    ) -> Result<()> {
        let ns = el.namespace().unwrap_or_default();

        self.ensure_config_map(&ns, logging_config_map(&ns)).await?;

        let desired = build_custom_object(el, template, &self.config)?;
        let resource = &desired.resource;
        let name = desired.object.name_any();

        self.watcher.watch_on_dynamic_object(resource).await?;

        let Some(existing) = self
            .client
            .get_dynamic_object(resource, &ns, &name)
            .await?
        else {
            self.client
                .create_dynamic_object(resource, &ns, &desired.object)
                .await?;
            info!(namespace = %ns, name = %name, kind = %resource.kind, "Created custom object");
            return Ok(());
        };

        if self.delete_workload_leftovers(el).await? {
            status.clear_workload_state();
        }
        self.update_custom_object(&desired.object, &existing, resource)
            .await?;

        let reported = extract_status(&existing)?;
        if reported.conditions.is_empty() {
            return Ok(());
        }
        if let Some(ready) = reported
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::READY)
        {
            if !ready.is_true() {
                return Err(Error::NotReady {
                    kind: resource.kind.clone(),
                    namespace: ns,
                    name,
                });
            }
        }

        status.set_conditions_for_dynamic_object(reported.conditions);
        if let Some(url) = reported.url.as_ref().and_then(Value::as_str) {
            status.set_address("http", hostname_from_url(url));
        }
        Ok(())
    }

    async fn update_custom_object(
        &self,
        desired: &DynamicObject,
        existing: &DynamicObject,
        resource: &kube::api::ApiResource,
    ) -> Result<()> {
        let ns = existing.namespace().unwrap_or_default();
        let name = existing.name_any();
        let desired_spec = desired.data.get("spec").cloned().unwrap_or(Value::Null);
        let existing_spec = existing.data.get("spec").cloned().unwrap_or(Value::Null);

        let changed = !is_derivative(&desired_spec, &existing_spec)
            || labels_differ(
                desired.metadata.labels.as_ref(),
                existing.metadata.labels.as_ref(),
            )
            || annotations_differ(
                desired.metadata.annotations.as_ref(),
                existing.metadata.annotations.as_ref(),
            );
        if !changed {
            return Ok(());
        }

        let mut updated = existing.clone();
        updated.metadata.labels = desired.metadata.labels.clone();
        updated.metadata.annotations = merge_annotations(
            desired.metadata.annotations.as_ref(),
            existing.metadata.annotations.as_ref(),
        );
        if let Some(data) = updated.data.as_object_mut() {
            data.insert("spec".to_string(), desired_spec);
        }
        let result = self
            .client
            .update_dynamic_object(resource, &ns, &updated)
            .await?;
        if result.metadata.resource_version != existing.metadata.resource_version {
            info!(namespace = %ns, name = %name, kind = %resource.kind, "Updated custom object");
        }
        Ok(())
    }

    /// Remove the Deployment and Service left behind by a switch to custom
    /// mode. Returns whether anything was deleted.
    async fn delete_workload_leftovers(&self, el: &EventListener) -> Result<bool> {
        let ns = el.namespace().unwrap_or_default();
        let name = el.generated_resource_name();
        let mut deleted = false;

        match self.client.delete_deployment(&ns, &name).await {
            Ok(()) => {
                info!(namespace = %ns, name = %name, "Deleted Deployment");
                deleted = true;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.client.delete_service(&ns, &name).await {
            Ok(()) => {
                info!(namespace = %ns, name = %name, "Deleted Service");
                deleted = true;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(deleted)
    }

    async fn ensure_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<()> {
        let name = config_map.name_any();
        if self.client.get_config_map(namespace, &name).await?.is_some() {
            return Ok(());
        }
        self.client.create_config_map(namespace, &config_map).await?;
        info!(namespace = %namespace, name = %name, "Created ConfigMap");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::container_builder::tests::{listener, secret_env_var};
    use crate::adapters::container_builder::{TLS_CERT_ENV, TLS_KEY_ENV};
    use crate::config::OBSERVABILITY_CONFIG_MAP;
    use crate::crd::{KubernetesResource, WithPodSpec, STATUS_TRUE, STATUS_UNKNOWN};
    use crate::reconcilers::client::{MockDynamicWatcher, MockListenerKubeClient};
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        Container, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServicePort,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ApiResource;
    use kube::core::ErrorResponse;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: "Test".to_string(),
            code,
        }))
    }

    type Key = (String, String);

    /// In-memory API server: stores what it is sent, bumps resource versions
    /// and counts writes.
    #[derive(Default)]
    struct FakeClient {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        version: u64,
        deployments: HashMap<Key, Deployment>,
        services: HashMap<Key, Service>,
        config_maps: HashMap<Key, ConfigMap>,
        dynamic: HashMap<(String, String, String), DynamicObject>,
        listeners: Vec<EventListener>,
        creates: usize,
        updates: usize,
        deletes: usize,
    }

    impl FakeState {
        fn next_version(&mut self) -> Option<String> {
            self.version += 1;
            Some(self.version.to_string())
        }
    }

    fn key(ns: &str, name: &str) -> Key {
        (ns.to_string(), name.to_string())
    }

    fn not_found() -> Error {
        api_error(404)
    }

    impl FakeClient {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().unwrap()
        }

        fn writes(&self) -> (usize, usize, usize) {
            let s = self.state();
            (s.creates, s.updates, s.deletes)
        }

        fn deployment(&self, ns: &str, name: &str) -> Option<Deployment> {
            self.state().deployments.get(&key(ns, name)).cloned()
        }

        fn service(&self, ns: &str, name: &str) -> Option<Service> {
            self.state().services.get(&key(ns, name)).cloned()
        }
    }

    #[async_trait]
    impl ListenerKubeClient for FakeClient {
        async fn get_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>> {
            Ok(self.deployment(ns, name))
        }

        async fn create_deployment(&self, ns: &str, d: &Deployment) -> Result<Deployment> {
            let mut s = self.state();
            let mut d = d.clone();
            d.metadata.resource_version = s.next_version();
            s.creates += 1;
            s.deployments.insert(key(ns, &d.name_any()), d.clone());
            Ok(d)
        }

        async fn update_deployment(&self, ns: &str, d: &Deployment) -> Result<Deployment> {
            let mut s = self.state();
            let mut d = d.clone();
            d.metadata.resource_version = s.next_version();
            s.updates += 1;
            s.deployments.insert(key(ns, &d.name_any()), d.clone());
            Ok(d)
        }

        async fn delete_deployment(&self, ns: &str, name: &str) -> Result<()> {
            let mut s = self.state();
            s.deployments.remove(&key(ns, name)).ok_or_else(not_found)?;
            s.deletes += 1;
            Ok(())
        }

        async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>> {
            Ok(self.service(ns, name))
        }

        async fn create_service(&self, ns: &str, svc: &Service) -> Result<Service> {
            let mut s = self.state();
            let mut svc = svc.clone();
            svc.metadata.resource_version = s.next_version();
            s.creates += 1;
            s.services.insert(key(ns, &svc.name_any()), svc.clone());
            Ok(svc)
        }

        async fn update_service(&self, ns: &str, svc: &Service) -> Result<Service> {
            let mut s = self.state();
            let mut svc = svc.clone();
            svc.metadata.resource_version = s.next_version();
            s.updates += 1;
            s.services.insert(key(ns, &svc.name_any()), svc.clone());
            Ok(svc)
        }

        async fn delete_service(&self, ns: &str, name: &str) -> Result<()> {
            let mut s = self.state();
            s.services.remove(&key(ns, name)).ok_or_else(not_found)?;
            s.deletes += 1;
            Ok(())
        }

        async fn get_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>> {
            Ok(self.state().config_maps.get(&key(ns, name)).cloned())
        }

        async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap> {
            let mut s = self.state();
            s.creates += 1;
            s.config_maps.insert(key(ns, &cm.name_any()), cm.clone());
            Ok(cm.clone())
        }

        async fn delete_config_map(&self, ns: &str, name: &str) -> Result<()> {
            let mut s = self.state();
            s.config_maps.remove(&key(ns, name)).ok_or_else(not_found)?;
            s.deletes += 1;
            Ok(())
        }

        async fn list_event_listeners(&self, ns: &str) -> Result<Vec<EventListener>> {
            Ok(self
                .state()
                .listeners
                .iter()
                .filter(|el| el.namespace().as_deref() == Some(ns))
                .cloned()
                .collect())
        }

        async fn patch_event_listener_status(
            &self,
            _ns: &str,
            _name: &str,
            _status: &EventListenerStatus,
        ) -> Result<()> {
            Ok(())
        }

        async fn get_dynamic_object(
            &self,
            resource: &ApiResource,
            ns: &str,
            name: &str,
        ) -> Result<Option<DynamicObject>> {
            Ok(self
                .state()
                .dynamic
                .get(&(resource.plural.clone(), ns.to_string(), name.to_string()))
                .cloned())
        }

        async fn create_dynamic_object(
            &self,
            resource: &ApiResource,
            ns: &str,
            obj: &DynamicObject,
        ) -> Result<DynamicObject> {
            let mut s = self.state();
            let mut obj = obj.clone();
            obj.metadata.resource_version = s.next_version();
            s.creates += 1;
            s.dynamic.insert(
                (resource.plural.clone(), ns.to_string(), obj.name_any()),
                obj.clone(),
            );
            Ok(obj)
        }

        async fn update_dynamic_object(
            &self,
            resource: &ApiResource,
            ns: &str,
            obj: &DynamicObject,
        ) -> Result<DynamicObject> {
            let mut s = self.state();
            let mut obj = obj.clone();
            obj.metadata.resource_version = s.next_version();
            s.updates += 1;
            s.dynamic.insert(
                (resource.plural.clone(), ns.to_string(), obj.name_any()),
                obj.clone(),
            );
            Ok(obj)
        }
    }

    #[derive(Default)]
    struct RecordingWatcher {
        kinds: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DynamicWatcher for RecordingWatcher {
        async fn watch_on_dynamic_object(&self, resource: &ApiResource) -> Result<()> {
            self.kinds.lock().unwrap().push(resource.kind.clone());
            Ok(())
        }
    }

    struct Harness {
        client: Arc<FakeClient>,
        watcher: Arc<RecordingWatcher>,
        reconciler: Reconciler,
    }

    fn harness_with(config: ControllerConfig) -> Harness {
        let client = Arc::new(FakeClient::default());
        let watcher = Arc::new(RecordingWatcher::default());
        let reconciler = Reconciler::new(client.clone(), watcher.clone(), Arc::new(config));
        Harness {
            client,
            watcher,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(ControllerConfig::default())
    }

    async fn reconcile(h: &Harness, el: &EventListener) -> (Result<()>, EventListenerStatus) {
        let mut status = EventListenerStatus::default();
        let result = h.reconciler.reconcile_kind(el, &mut status).await;
        (result, status)
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn knative_listener(name: &str, ns: &str) -> EventListener {
        let mut el = listener(name, ns);
        el.spec.resources = Some(Resources::CustomResource(CustomResourceTemplate {
            runtime: json!({
                "apiVersion": "serving.knative.dev/v1",
                "kind": "Service",
                "spec": {"template": {"spec": {"containers": [{"name": "c"}]}}}
            }),
        }));
        el
    }

    fn knative_resource() -> ApiResource {
        crate::adapters::custom_object_builder::api_resource_for("serving.knative.dev/v1", "Service")
    }

    fn set_knative_status(h: &Harness, ns: &str, name: &str, status: Value) {
        let mut s = h.client.state();
        let obj = s
            .dynamic
            .get_mut(&(knative_resource().plural, ns.to_string(), name.to_string()))
            .unwrap();
        obj.data["status"] = status;
    }

    #[tokio::test]
    async fn first_pass_creates_everything() {
        let h = harness();
        let el = listener("my-el", "ns1");
        let (result, status) = reconcile(&h, &el).await;
        result.unwrap();

        assert!(h.client.deployment("ns1", "el-my-el").is_some());
        assert!(h.client.service("ns1", "el-my-el").is_some());
        {
            let s = h.client.state();
            assert!(s.config_maps.contains_key(&key("ns1", LOGGING_CONFIG_MAP)));
            assert!(s.config_maps.contains_key(&key("ns1", OBSERVABILITY_CONFIG_MAP)));
        }

        assert_eq!(
            status.configuration.as_ref().map(|c| c.generated_name.as_str()),
            Some("el-my-el")
        );
        assert_eq!(
            status.address.as_ref().map(|a| a.url.as_str()),
            Some("http://el-my-el.ns1.svc.cluster.local:8080")
        );
        assert!(status
            .get_condition(condition_types::DEPLOYMENT_EXISTS)
            .unwrap()
            .is_true());
        assert!(status
            .get_condition(condition_types::SERVICE_EXISTS)
            .unwrap()
            .is_true());
        // no Available condition until the deployment reports one
        assert_eq!(
            status.get_condition(condition_types::READY).unwrap().status,
            STATUS_UNKNOWN
        );
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let h = harness();
        let el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        let before = h.client.writes();
        let version = h.client.deployment("ns1", "el-my-el").unwrap().metadata.resource_version;

        let (result, status) = reconcile(&h, &el).await;
        result.unwrap();
        assert_eq!(h.client.writes(), before);
        assert_eq!(
            h.client.deployment("ns1", "el-my-el").unwrap().metadata.resource_version,
            version
        );
        assert!(status.address.is_some());
    }

    #[tokio::test]
    async fn available_deployment_makes_listener_ready() {
        let h = harness();
        let el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();

        {
            let mut s = h.client.state();
            let d = s.deployments.get_mut(&key("ns1", "el-my-el")).unwrap();
            d.status = Some(DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }

        let (result, status) = reconcile(&h, &el).await;
        result.unwrap();
        assert_eq!(
            status.get_condition(condition_types::READY).unwrap().status,
            STATUS_TRUE
        );
    }

    #[tokio::test]
    async fn labels_on_children_are_reverted() {
        let h = harness();
        let el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();

        let expected = h.client.deployment("ns1", "el-my-el").unwrap().metadata.labels;
        {
            let mut s = h.client.state();
            let d = s.deployments.get_mut(&key("ns1", "el-my-el")).unwrap();
            d.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert("foo".to_string(), "bar".to_string());
        }

        reconcile(&h, &el).await.0.unwrap();
        let d = h.client.deployment("ns1", "el-my-el").unwrap();
        assert_eq!(d.metadata.labels, expected);
        assert_eq!(h.client.writes().1, 1);
    }

    #[tokio::test]
    async fn listener_annotations_propagate_and_child_annotations_stay() {
        let h = harness();
        let mut el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();

        {
            let mut s = h.client.state();
            let svc = s.services.get_mut(&key("ns1", "el-my-el")).unwrap();
            svc.metadata.annotations = Some(labels(&[("cloud.io/lb", "internal")]));
        }
        el.metadata.annotations = Some(labels(&[("team", "a")]));
        reconcile(&h, &el).await.0.unwrap();

        let svc = h.client.service("ns1", "el-my-el").unwrap();
        assert_eq!(
            svc.metadata.annotations,
            Some(labels(&[("cloud.io/lb", "internal"), ("team", "a")]))
        );
        let d = h.client.deployment("ns1", "el-my-el").unwrap();
        assert_eq!(
            d.metadata.annotations.unwrap().get("team").map(String::as_str),
            Some("a")
        );
    }

    #[tokio::test]
    async fn allocated_node_port_is_preserved() {
        let h = harness();
        let mut el = listener("my-el", "ns1");
        el.spec.resources = Some(Resources::KubernetesResource(KubernetesResource {
            service_type: Some("NodePort".to_string()),
            ..Default::default()
        }));
        reconcile(&h, &el).await.0.unwrap();

        {
            let mut s = h.client.state();
            let svc = s.services.get_mut(&key("ns1", "el-my-el")).unwrap();
            let spec = svc.spec.as_mut().unwrap();
            spec.cluster_ip = Some("10.0.0.9".to_string());
            spec.ports.as_mut().unwrap()[0].node_port = Some(30000);
        }
        let before = h.client.writes();

        reconcile(&h, &el).await.0.unwrap();
        assert_eq!(h.client.writes(), before);
        let svc = h.client.service("ns1", "el-my-el").unwrap();
        let ports: &Vec<ServicePort> = svc.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert_eq!(ports[0].node_port, Some(30000));
    }

    #[tokio::test]
    async fn unset_replicas_inherit_live_count() {
        let h = harness();
        let mut el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();

        {
            let mut s = h.client.state();
            let d = s.deployments.get_mut(&key("ns1", "el-my-el")).unwrap();
            d.spec.as_mut().unwrap().replicas = Some(5);
        }
        reconcile(&h, &el).await.0.unwrap();
        let replicas = |h: &Harness| {
            h.client
                .deployment("ns1", "el-my-el")
                .and_then(|d| d.spec)
                .and_then(|s| s.replicas)
        };
        assert_eq!(replicas(&h), Some(5));
        assert_eq!(h.client.writes().1, 0);

        el.spec.resources = Some(Resources::KubernetesResource(KubernetesResource {
            replicas: Some(2),
            ..Default::default()
        }));
        reconcile(&h, &el).await.0.unwrap();
        assert_eq!(replicas(&h), Some(2));
    }

    #[tokio::test]
    async fn deprecated_replicas_are_honoured() {
        let h = harness();
        let mut el = listener("my-el", "ns1");
        el.spec.replicas = Some(4);
        reconcile(&h, &el).await.0.unwrap();
        let d = h.client.deployment("ns1", "el-my-el").unwrap();
        assert_eq!(d.spec.unwrap().replicas, Some(4));
    }

    #[tokio::test]
    async fn tls_listener_gets_https_address() {
        let h = harness();
        let mut el = listener("my-el", "ns1");
        el.spec.resources = Some(Resources::KubernetesResource(KubernetesResource {
            spec: Some(WithPodSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            env: Some(vec![
                                secret_env_var(TLS_CERT_ENV, "tls", "tls.crt"),
                                secret_env_var(TLS_KEY_ENV, "tls", "tls.key"),
                            ]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
            }),
            ..Default::default()
        }));

        let (result, status) = reconcile(&h, &el).await;
        result.unwrap();
        let svc = h.client.service("ns1", "el-my-el").unwrap();
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 8443);
        assert_eq!(port.name.as_deref(), Some("https-listener"));
        assert_eq!(
            status.address.map(|a| a.url),
            Some("https://el-my-el.ns1.svc.cluster.local:8443".to_string())
        );
    }

    #[tokio::test]
    async fn switching_to_custom_mode_removes_workload() {
        let h = harness();
        let el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        assert!(h.client.deployment("ns1", "el-my-el").is_some());

        let custom = knative_listener("my-el", "ns1");
        // first pass creates the custom object
        reconcile(&h, &custom).await.0.unwrap();
        // second pass finds it and cleans up the old workload
        reconcile(&h, &custom).await.0.unwrap();

        assert!(h.client.deployment("ns1", "el-my-el").is_none());
        assert!(h.client.service("ns1", "el-my-el").is_none());
        assert_eq!(h.watcher.kinds.lock().unwrap()[0], "Service");
    }

    #[tokio::test]
    async fn custom_object_without_conditions_reports_nothing() {
        let h = harness();
        let el = knative_listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();

        let (result, status) = reconcile(&h, &el).await;
        result.unwrap();
        assert!(status.address.is_none());
        assert_eq!(
            status.get_condition(condition_types::READY).unwrap().status,
            STATUS_UNKNOWN
        );
    }

    #[tokio::test]
    async fn custom_object_not_ready_is_retried() {
        let h = harness();
        let el = knative_listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        set_knative_status(
            &h,
            "ns1",
            "el-my-el",
            json!({"conditions": [{"type": "Ready", "status": "False"}]}),
        );

        let (result, _) = reconcile(&h, &el).await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
        assert_eq!(err.to_string(), "Service ns1/el-my-el is not ready yet");
    }

    #[tokio::test]
    async fn custom_object_ready_sets_conditions_and_address() {
        let h = harness();
        let el = knative_listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        set_knative_status(
            &h,
            "ns1",
            "el-my-el",
            json!({
                "url": "http://el-my-el.ns1.example.com",
                "conditions": [
                    {"type": "Ready", "status": "True"},
                    {"type": "RoutesReady", "status": "True"}
                ]
            }),
        );

        let (result, status) = reconcile(&h, &el).await;
        result.unwrap();
        assert_eq!(status.conditions.len(), 2);
        assert!(status.get_condition("RoutesReady").is_some());
        assert!(status.get_condition(condition_types::DEPLOYMENT_EXISTS).is_none());
        assert_eq!(
            status.address.map(|a| a.url),
            Some("http://el-my-el.ns1.example.com".to_string())
        );
    }

    fn knative_key() -> (String, String, String) {
        (
            knative_resource().plural,
            "ns1".to_string(),
            "el-my-el".to_string(),
        )
    }

    #[tokio::test]
    async fn unchanged_custom_object_is_not_updated() {
        let h = harness();
        let el = knative_listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        let before = h.client.writes();

        reconcile(&h, &el).await.0.unwrap();
        reconcile(&h, &el).await.0.unwrap();
        assert_eq!(h.client.writes(), before);
    }

    #[tokio::test]
    async fn custom_object_drift_is_reverted() {
        let h = harness();
        let mut el = knative_listener("my-el", "ns1");
        if let Some(Resources::CustomResource(template)) = el.spec.resources.as_mut() {
            template.runtime["metadata"] = json!({"annotations": {"team": "a"}});
        }
        reconcile(&h, &el).await.0.unwrap();

        let created = h.client.state().dynamic.get(&knative_key()).cloned().unwrap();
        {
            let mut s = h.client.state();
            let obj = s.dynamic.get_mut(&knative_key()).unwrap();
            obj.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert("foo".to_string(), "bar".to_string());
            obj.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert("serving.knative.dev/creator".to_string(), "admin".to_string());
            obj.data["spec"]["template"]["spec"]["containers"][0]["image"] = json!("other:latest");
        }
        let (_, updates_before, _) = h.client.writes();

        reconcile(&h, &el).await.0.unwrap();
        assert_eq!(h.client.writes().1, updates_before + 1);

        let obj = h.client.state().dynamic.get(&knative_key()).cloned().unwrap();
        assert_eq!(obj.metadata.labels, created.metadata.labels);
        assert_eq!(obj.data["spec"], created.data["spec"]);
        assert_eq!(
            obj.metadata.annotations,
            Some(labels(&[
                ("serving.knative.dev/creator", "admin"),
                ("team", "a")
            ]))
        );

        reconcile(&h, &el).await.0.unwrap();
        assert_eq!(h.client.writes().1, updates_before + 1);
    }

    #[tokio::test]
    async fn switching_to_custom_mode_clears_workload_status() {
        let h = harness();
        let el = listener("my-el", "ns1");
        let mut status = EventListenerStatus::default();
        h.reconciler.reconcile_kind(&el, &mut status).await.unwrap();
        assert!(status.address.is_some());

        let custom = knative_listener("my-el", "ns1");
        h.reconciler.reconcile_kind(&custom, &mut status).await.unwrap();
        h.reconciler.reconcile_kind(&custom, &mut status).await.unwrap();

        assert!(status.address.is_none());
        for type_ in [
            condition_types::READY,
            condition_types::DEPLOYMENT_EXISTS,
            condition_types::SERVICE_EXISTS,
        ] {
            assert_eq!(status.get_condition(type_).unwrap().status, STATUS_UNKNOWN);
        }
    }

    fn listener_with_limits(cpu: &str, memory: &str) -> EventListener {
        let mut el = listener("my-el", "ns1");
        el.spec.resources = Some(Resources::KubernetesResource(KubernetesResource {
            spec: Some(WithPodSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            resources: Some(ResourceRequirements {
                                limits: Some(BTreeMap::from([
                                    ("cpu".to_string(), Quantity(cpu.to_string())),
                                    ("memory".to_string(), Quantity(memory.to_string())),
                                ])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
            }),
            ..Default::default()
        }));
        el
    }

    /// Rewrite the stored limits the way the API server canonicalizes them
    fn store_limits(h: &Harness, cpu: &str, memory: &str) {
        let mut s = h.client.state();
        let d = s.deployments.get_mut(&key("ns1", "el-my-el")).unwrap();
        let pod = d.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        let limits = pod.containers[0]
            .resources
            .as_mut()
            .unwrap()
            .limits
            .as_mut()
            .unwrap();
        limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
        limits.insert("memory".to_string(), Quantity(memory.to_string()));
    }

    #[tokio::test]
    async fn canonical_quantities_do_not_trigger_updates() {
        let h = harness();
        let el = listener_with_limits("0.5", "1024Mi");
        reconcile(&h, &el).await.0.unwrap();
        let before = h.client.writes();

        for _ in 0..3 {
            store_limits(&h, "500m", "1Gi");
            reconcile(&h, &el).await.0.unwrap();
        }
        assert_eq!(h.client.writes(), before);

        // a real change is still picked up
        let el = listener_with_limits("0.6", "1024Mi");
        reconcile(&h, &el).await.0.unwrap();
        assert_eq!(h.client.writes().1, before.1 + 1);
    }

    #[tokio::test]
    async fn finalize_deletes_config_map_for_last_listener() {
        let h = harness();
        let el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        h.client.state().listeners.push(el.clone());

        assert_ok!(h.reconciler.finalize_kind(&el).await);
        assert!(!h
            .client
            .state()
            .config_maps
            .contains_key(&key("ns1", LOGGING_CONFIG_MAP)));

        // already gone is fine
        assert_ok!(h.reconciler.finalize_kind(&el).await);
    }

    #[tokio::test]
    async fn finalize_keeps_config_map_while_others_remain() {
        let h = harness();
        let el = listener("my-el", "ns1");
        reconcile(&h, &el).await.0.unwrap();
        {
            let mut s = h.client.state();
            s.listeners.push(el.clone());
            s.listeners.push(listener("other", "ns1"));
        }

        assert_ok!(h.reconciler.finalize_kind(&el).await);
        assert!(h
            .client
            .state()
            .config_maps
            .contains_key(&key("ns1", LOGGING_CONFIG_MAP)));
    }

    #[tokio::test]
    async fn finalize_keeps_config_map_in_system_namespace() {
        let h = harness();
        let el = listener("my-el", "tekton-pipelines");
        reconcile(&h, &el).await.0.unwrap();
        h.client.state().listeners.push(el.clone());

        assert_ok!(h.reconciler.finalize_kind(&el).await);
        assert!(h
            .client
            .state()
            .config_maps
            .contains_key(&key("tekton-pipelines", LOGGING_CONFIG_MAP)));
    }

    #[tokio::test]
    async fn both_branch_failures_are_reported() {
        let mut client = MockListenerKubeClient::new();
        client
            .expect_get_config_map()
            .returning(|_, _| Err(api_error(500)));
        client
            .expect_get_service()
            .returning(|_, _| Err(api_error(403)));

        let reconciler = Reconciler::new(
            Arc::new(client),
            Arc::new(MockDynamicWatcher::new()),
            Arc::new(ControllerConfig::default()),
        );
        let mut status = EventListenerStatus::default();
        let err = reconciler
            .reconcile_kind(&listener("my-el", "ns1"), &mut status)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Combined(_, _)));
        assert_eq!(
            err.to_string(),
            format!("{} : {}", api_error(500), api_error(403))
        );
    }

    #[tokio::test]
    async fn failed_service_create_is_recorded() {
        let mut client = MockListenerKubeClient::new();
        client
            .expect_get_config_map()
            .returning(|_, _| Ok(Some(ConfigMap::default())));
        client.expect_get_deployment().returning(|_, _| Ok(None));
        client
            .expect_create_deployment()
            .returning(|_, d| Ok(d.clone()));
        client.expect_get_service().returning(|_, _| Ok(None));
        client
            .expect_create_service()
            .returning(|_, _| Err(api_error(422)));

        let reconciler = Reconciler::new(
            Arc::new(client),
            Arc::new(MockDynamicWatcher::new()),
            Arc::new(ControllerConfig::default()),
        );
        let mut status = EventListenerStatus::default();
        let err = reconciler
            .reconcile_kind(&listener("my-el", "ns1"), &mut status)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::KubeError(_)));
        let condition = status
            .get_condition(condition_types::SERVICE_EXISTS)
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("CreateFailed"));
        assert!(status
            .get_condition(condition_types::DEPLOYMENT_EXISTS)
            .unwrap()
            .is_true());
        assert!(status.address.is_none());
    }

    #[tokio::test]
    async fn watch_registration_failure_aborts_custom_pass() {
        let mut watcher = MockDynamicWatcher::new();
        watcher
            .expect_watch_on_dynamic_object()
            .returning(|_| Err(api_error(404)));

        let mut client = MockListenerKubeClient::new();
        client
            .expect_get_config_map()
            .returning(|_, _| Ok(Some(ConfigMap::default())));

        let reconciler = Reconciler::new(
            Arc::new(client),
            Arc::new(watcher),
            Arc::new(ControllerConfig::default()),
        );
        let mut status = EventListenerStatus::default();
        let result = reconciler
            .reconcile_kind(&knative_listener("my-el", "ns1"), &mut status)
            .await;
        assert!(result.is_err());
    }
}
