//! Reconciliation logic for EventListener resources

pub mod client;
pub mod event_listener;

pub use client::{DynamicWatcher, KubeListenerClient, ListenerKubeClient};
pub use event_listener::Reconciler;
