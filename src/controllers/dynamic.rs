//! Watches on sink object kinds discovered at runtime
//!
//! A listener in customResource mode can point at any kind (Knative Services
//! being the usual one), so those watches cannot be declared up front on the
//! controller. The first reconcile that needs a kind registers it here; events
//! for objects owned by an EventListener are forwarded to the controller as
//! reconcile requests for the owner.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::metadata::is_listener_owner;
use crate::crd::EventListener;
use crate::metrics::DYNAMIC_WATCHES;
use crate::reconcilers::DynamicWatcher;
use crate::Error;

/// Registry of watched kinds. Each kind is watched at most once per process.
pub struct DynamicObjectTracker {
    client: Client,
    watched: Mutex<HashSet<String>>,
    sender: UnboundedSender<ObjectRef<EventListener>>,
}

impl DynamicObjectTracker {
    /// Create the tracker and the stream of reconcile requests it produces
    pub fn new(client: Client) -> (Self, UnboundedReceiver<ObjectRef<EventListener>>) {
        let (sender, receiver) = unbounded();
        let tracker = Self {
            client,
            watched: Mutex::new(HashSet::new()),
            sender,
        };
        (tracker, receiver)
    }
}

/// Registry key of a kind: `group/version/plural`
pub fn kind_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.plural)
}

#[async_trait]
impl DynamicWatcher for DynamicObjectTracker {
    async fn watch_on_dynamic_object(&self, resource: &ApiResource) -> Result<(), Error> {
        let key = kind_key(resource);
        // held across the probe so concurrent reconciles register a kind once
        let mut watched = self.watched.lock().await;
        if watched.contains(&key) {
            return Ok(());
        }

        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
        api.list(&ListParams::default().limit(1)).await?;

        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .touched_objects();
        tokio::spawn(forward_owner_events(stream, self.sender.clone(), key.clone()));

        info!(kind = %key, "Watching custom sink objects");
        watched.insert(key);
        DYNAMIC_WATCHES.set(watched.len() as f64);
        Ok(())
    }
}

/// Turn object events into reconcile requests for their owning listener
pub async fn forward_owner_events<S>(
    stream: S,
    sender: UnboundedSender<ObjectRef<EventListener>>,
    kind: String,
) where
    S: Stream<Item = Result<DynamicObject, watcher::Error>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        let obj = match event {
            Ok(obj) => obj,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Watch error");
                continue;
            }
        };
        let Some(namespace) = obj.namespace() else {
            continue;
        };
        for owner in obj.owner_references().iter().filter(|o| is_listener_owner(o)) {
            debug!(kind = %kind, namespace = %namespace, owner = %owner.name, "Custom object changed");
            let request = ObjectRef::new(&owner.name).within(&namespace);
            if sender.unbounded_send(request).is_err() {
                debug!(kind = %kind, "Controller stopped, ending watch");
                return;
            }
        }
    }
}
