//! Capability traits: the five swappable modules a blueprint wires
//! together into an `Agent` (§3, §4.8, §9 "multiple heterogeneous
//! brains/actions -> capability traits").
//!
//! Concrete brains and concrete action encoders are out of scope for this
//! core (`spec.md` §1); what lives here is the contract the scheduler and
//! cognitive cycle depend on, plus the minimal reference implementations
//! needed to exercise and test the pipeline end to end.

pub mod actions;
pub mod brain;
pub mod memory;
pub mod perception;

pub use actions::{Action, ActionError, ActionField, ActionSchema};
pub use brain::Brain;
pub use memory::Memory;
pub use perception::Perception;

use std::sync::Arc;

use crate::models::AgentIdentity;

/// A fully wired agent: immutable identity plus its five capability
/// modules. Held by the scheduler's fleet map behind the singleflight lock.
pub struct Agent {
    pub identity: AgentIdentity,
    pub perception: Arc<dyn Perception>,
    pub memory: Arc<dyn Memory>,
    pub brain: Arc<dyn Brain>,
    pub actions: Vec<Arc<dyn Action>>,
    pub guardrails: Vec<Arc<dyn crate::guardrails::Guardrail>>,
}

impl Agent {
    pub fn find_action(&self, name: &str) -> Option<&Arc<dyn Action>> {
        self.actions.iter().find(|a| a.name() == name)
    }
}
