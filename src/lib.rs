//! Autopilot runner core library.
//!
//! Exposes the scheduler, cognitive cycle, guardrails, planner,
//! persistence contract, and supporting types so `main.rs` and
//! integration tests can drive the fleet without duplicating wiring.

pub mod api;
pub mod background_sync;
pub mod capability;
pub mod chain;
pub mod cognitive_cycle;
pub mod config;
pub mod errors;
pub mod factory;
pub mod guardrails;
pub mod middleware;
pub mod models;
pub mod persistence;
pub mod planner;
pub mod scheduler;
pub mod shadow;
