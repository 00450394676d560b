//! Gateway service library crate.
//!
//! # Purpose
//! Exposes the HTTP surface, configuration, and observability wiring of the
//! SSE gateway for use by the binary and integration tests.
pub mod api;
pub mod app;
pub mod config;
pub mod observability;
