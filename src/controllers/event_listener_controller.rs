//! Controller for EventListener resources

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event},
        watcher::Config,
    },
    Api, Client, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::metadata::EVENT_LISTENER_LABEL;
use crate::config::ControllerConfig;
use crate::controllers::dynamic::DynamicObjectTracker;
use crate::controllers::Context;
use crate::crd::EventListener;
use crate::metrics::{RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::reconcilers::{KubeListenerClient, Reconciler};
use crate::Error;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "eventlisteners.triggers.tekton.dev";

/// Periodic resync of healthy listeners
const RESYNC_PERIOD: Duration = Duration::from_secs(300);

const KIND: &str = "EventListener";

/// Run the EventListener controller until a shutdown signal arrives
pub async fn run(client: Client, config: ControllerConfig) {
    let (tracker, dynamic_events) = DynamicObjectTracker::new(client.clone());
    let reconciler = Reconciler::new(
        Arc::new(KubeListenerClient::new(client.clone())),
        Arc::new(tracker),
        Arc::new(config),
    );
    let ctx = Context::new(client.clone(), reconciler);

    let listeners: Api<EventListener> = Api::all(client.clone());
    // every generated child carries the listener label
    let children = Config::default().labels(EVENT_LISTENER_LABEL);

    info!("Starting EventListener controller");

    Controller::new(listeners, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), children.clone())
        .owns(Api::<Service>::all(client), children)
        .reconcile_on(dynamic_events)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("Reconciled {:?}", o),
                Err(e) => warn!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("EventListener controller stopped");
}

/// Reconcile an EventListener resource
#[instrument(skip(el, ctx), fields(name = %el.name_any(), namespace = el.namespace().unwrap_or_default()))]
async fn reconcile(el: Arc<EventListener>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = std::time::Instant::now();
    let ns = el.namespace().unwrap_or_default();
    let name = el.name_any();

    RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let listeners: Api<EventListener> = Api::namespaced(ctx.client.clone(), &ns);

    let result = finalizer(&listeners, FINALIZER, el, |event| async {
        match event {
            Event::Apply(el) => apply(&el, &ctx).await,
            Event::Cleanup(el) => cleanup(&el, &ctx).await,
        }
    })
    .await;

    let duration = start.elapsed().as_secs_f64();
    RECONCILE_DURATION
        .with_label_values(&[KIND])
        .observe(duration);

    match &result {
        Ok(_) => debug!("Reconciled {}/{} in {:.2}s", ns, name, duration),
        Err(e) => {
            RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
            error!("Failed to reconcile {}/{}: {}", ns, name, e);
        }
    }

    Ok(result?)
}

/// Converge the listener and write back its status
async fn apply(el: &EventListener, ctx: &Context) -> Result<Action, Error> {
    let ns = el.namespace().unwrap_or_default();
    let name = el.name_any();

    let current = el.status.clone().unwrap_or_default();
    let mut status = current.clone();
    let result = ctx.reconciler.reconcile_kind(el, &mut status).await;

    // status is written even when reconcile failed so the failure is visible
    if status != current {
        ctx.reconciler
            .client()
            .patch_event_listener_status(&ns, &name, &status)
            .await?;
        debug!("Updated status of {}/{}", ns, name);
    }

    result?;
    Ok(Action::requeue(RESYNC_PERIOD))
}

/// Release namespace-wide resources when an EventListener is deleted.
/// Generated children go away through their owner references.
async fn cleanup(el: &EventListener, ctx: &Context) -> Result<Action, Error> {
    info!(
        "Cleaning up EventListener {}/{}",
        el.namespace().unwrap_or_default(),
        el.name_any()
    );
    ctx.reconciler.finalize_kind(el).await?;
    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(el: Arc<EventListener>, err: &Error, _ctx: Arc<Context>) -> Action {
    let ns = el.namespace().unwrap_or_default();
    let name = el.name_any();

    match err {
        Error::NotReady { .. } => info!("{}/{}: {}", ns, name, err),
        _ => error!("Reconciliation error for {}/{}: {:?}", ns, name, err),
    }

    Action::requeue(err.requeue_after())
}
