//! EventListener Kubernetes Operator
//!
//! Reconciles `triggers.tekton.dev/v1beta1` EventListener resources into the
//! objects that run their event sink: a Deployment and Service, or a single
//! object of an arbitrary kind (such as a Knative Service).

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result};
