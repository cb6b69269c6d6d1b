//! Observability setup for Bookmarch.

pub mod tracing_setup;
