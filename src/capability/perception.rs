//! Perception capability: observes the world for one agent (§4.2 stage 1).

use async_trait::async_trait;

use crate::errors::RunnerError;
use crate::models::Observation;

#[async_trait]
pub trait Perception: Send + Sync {
    /// Produce an immutable snapshot of the agent's world. Never blocks
    /// indefinitely — implementations must honor the caller's per-call
    /// timeout (§5 "Cancellation & timeouts").
    async fn observe(&self) -> Result<Observation, RunnerError>;
}

/// Test-support perception, analogous to `crate::chain::mock::MockChain`:
/// returns a fixed, mutable `Observation` rather than reading a real
/// chain. Concrete perception (reading vault balances / prices over RPC)
/// is out of scope for this core.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct StaticPerception {
        pub observation: Mutex<Observation>,
    }

    impl StaticPerception {
        pub fn new(observation: Observation) -> Self {
            Self {
                observation: Mutex::new(observation),
            }
        }
    }

    #[async_trait]
    impl Perception for StaticPerception {
        async fn observe(&self) -> Result<Observation, RunnerError> {
            Ok(self.observation.lock().unwrap().clone())
        }
    }
}
