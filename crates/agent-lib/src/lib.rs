//! Core library for the node-local pod QoS enforcement agent
//!
//! This crate provides:
//! - Cgroup addressing across v1/v2 hierarchies and cgroupfs/systemd drivers
//! - Resource enforcement backends (direct cgroupfs writes, systemd D-Bus)
//! - Event handlers for pod lifecycle and node CPU pressure events
//! - Health checks and observability

pub mod cgroup;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;
pub mod resource;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::AgentMetrics;
