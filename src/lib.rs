//! Tollgate - Per-Key Token-Bucket Rate Limiting
//!
//! This crate implements a token-bucket rate limiter whose per-key state
//! lives behind a small cache abstraction. State can stay in process memory
//! or be gossiped across a peer mesh so several instances share buckets.
//! When the cache fails the limiter fails open and admits traffic.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod server;
