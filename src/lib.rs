//! Ratewarden - Abuse Control and Rate Limiting
//!
//! This crate enforces per-identifier, per-operation request quotas over
//! fixed time windows. Counters live either in process memory or in Redis,
//! and an HTTP guard turns decisions into consistent responses with quota
//! and hardening headers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
