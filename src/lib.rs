//! Bulwark - In-Memory Abuse Protection
//!
//! This crate implements a per-identifier, per-operation rate limiter with
//! escalating temporary blocks, administrative overrides, background cleanup
//! and snapshot export/import so counters survive a restart.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;
