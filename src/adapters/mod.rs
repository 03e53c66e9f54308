//! Builders turning an EventListener into the Kubernetes objects that run its sink

pub mod conditions;
pub mod config_maps;
pub mod container_builder;
pub mod custom_object_builder;
pub mod deployment_builder;
pub mod metadata;
pub mod semantic;
pub mod service_builder;
