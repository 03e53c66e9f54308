//! Prometheus metrics for the EventListener Operator
//!
//! These describe the operator itself. Sinks expose their own metrics on the
//! `http-metrics` port of every listener.

pub mod prometheus;

pub use self::prometheus::*;
