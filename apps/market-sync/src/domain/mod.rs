//! Domain Layer - Core synchronization types and business logic.
//!
//! This layer contains the price record model, the canonical table, the
//! streaming session vocabulary, and credential types. Nothing here performs
//! I/O.

/// Credential and token types.
pub mod credentials;

/// Instrument price records and payload parsing.
pub mod market;

/// Streaming session types (state, events, subscriptions).
pub mod streaming;

/// Canonical price table (single writer, many readers).
pub mod table;
