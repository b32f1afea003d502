//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod context;
pub mod convert;
pub mod executor;
pub mod factory;
pub mod health;
pub mod io;
pub mod limits;
pub mod metrics;
pub mod modules;
pub mod pipeline;
pub mod pool;
pub mod security;
