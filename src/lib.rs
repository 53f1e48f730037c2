//! Turnstile - Store-Backed Request Throttling
//!
//! This crate implements a request throttling layer for multi-instance web
//! services. It offers three limiting strategies (fixed window, sliding
//! window, and token bucket) that all serialize their state through a
//! pluggable key-value store, so any number of stateless service instances
//! can enforce a shared quota. An axum middleware wires the limiter into an
//! HTTP request path and emits standard `X-RateLimit-*` headers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
