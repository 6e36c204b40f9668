//! Sluice - Distributed Admission Control
//!
//! This crate decides, per client key, whether a request may proceed. It
//! combines a sliding-window request log with a token bucket, keeps all
//! per-key state in a shared store so every instance enforces one limit, and
//! swaps the active limiter without interruption when its configuration
//! changes.

pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod reload;
pub mod store;

pub use admission::Admission;
pub use error::{Result, SluiceError};
