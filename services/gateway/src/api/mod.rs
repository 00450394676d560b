//! HTTP handlers of the gateway.
//!
//! # Purpose
//! `stream` owns the two SSE endpoints, `publish` the event ingress, and
//! `identity` turns request headers into the connection identity.
pub mod error;
pub mod identity;
pub mod publish;
pub mod stream;
pub mod types;
