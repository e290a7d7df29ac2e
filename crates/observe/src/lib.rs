//! Observability glue shared by the binaries and tests: tracing
//! initialization and the global metrics registry.

pub mod metrics;
pub mod tracing;
