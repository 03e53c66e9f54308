//! Kubernetes API access used by the EventListener reconciler
//!
//! The reconciler only talks to the cluster through [`ListenerKubeClient`] and
//! [`DynamicWatcher`], so tests can swap in fakes and mocks.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::{EventListener, EventListenerStatus};
use crate::Error;

/// Field manager name used for writes
pub const FIELD_MANAGER: &str = "event-listener-operator";

/// Client operations needed to reconcile an EventListener.
///
/// Gets return `Ok(None)` for objects that do not exist. Deletes surface the
/// API's 404 as an error; callers decide whether that matters.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ListenerKubeClient: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// All EventListeners in a namespace
    async fn list_event_listeners(&self, namespace: &str) -> Result<Vec<EventListener>, Error>;

    /// Merge-patch the status subresource of an EventListener
    async fn patch_event_listener_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EventListenerStatus,
    ) -> Result<(), Error>;

    async fn get_dynamic_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    async fn create_dynamic_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    async fn update_dynamic_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;
}

/// Starts watches on kinds only known at runtime (custom sink objects)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicWatcher: Send + Sync {
    /// Ensure changes to objects of this kind trigger a reconcile of their
    /// owning EventListener. Idempotent per kind.
    async fn watch_on_dynamic_object(&self, resource: &ApiResource) -> Result<(), Error>;
}

/// [`ListenerKubeClient`] backed by a real [`Client`]
#[derive(Clone)]
pub struct KubeListenerClient {
    client: Client,
}

impl KubeListenerClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ListenerKubeClient for KubeListenerClient {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&post_params(), deployment).await?)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&deployment.name_any(), &post_params(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&post_params(), service).await?)
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&service.name_any(), &post_params(), service)
            .await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&post_params(), config_map).await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_event_listeners(&self, namespace: &str) -> Result<Vec<EventListener>, Error> {
        let api: Api<EventListener> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn patch_event_listener_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EventListenerStatus,
    ) -> Result<(), Error> {
        let api: Api<EventListener> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn get_dynamic_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.get_opt(name).await?)
    }

    async fn create_dynamic_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.create(&post_params(), object).await?)
    }

    async fn update_dynamic_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api
            .replace(&object.name_any(), &post_params(), object)
            .await?)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}
