//! Controller implementations for watching and reconciling resources

pub mod dynamic;
pub mod event_listener_controller;

use kube::Client;
use std::sync::Arc;

use crate::reconcilers::Reconciler;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler driving listeners toward their desired state
    pub reconciler: Reconciler,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, reconciler: Reconciler) -> Arc<Self> {
        Arc::new(Self { client, reconciler })
    }
}
