//! The `upgrade.cattle.io/v1` `Plan` controller: resolves a desired version,
//! schedules per-node Jobs under a concurrency budget, and records progress
//! through node labels.

pub mod cluster_id;
pub mod controllers;
pub mod labels;
pub mod resources;

pub use resources::Plan;
