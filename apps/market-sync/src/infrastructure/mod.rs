//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// STOMP-over-WebSocket stream adapter.
pub mod stomp;

/// reqwest-backed REST adapters.
pub mod http;

/// Client-local token persistence.
pub mod persistence;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
