//! Brain capability: `think(obs, memories, actions) -> Decision` (§4.2
//! stage 2, §9 "capability traits"). Concrete brains (rule-based or
//! LLM-driven) are out of scope for this core; only the contract lives
//! here.

use async_trait::async_trait;

use crate::capability::actions::Action;
use crate::errors::RunnerError;
use crate::models::{Decision, MemoryEntry, Observation};

/// Context passed to a brain factory at agent-assembly time (§4.8).
#[derive(Debug, Clone, Default)]
pub struct BrainFactoryContext {
    pub llm_config: Option<serde_json::Value>,
    pub strategy_params: Option<serde_json::Value>,
}

#[async_trait]
pub trait Brain: Send + Sync {
    async fn think(
        &self,
        observation: &Observation,
        memories: &[MemoryEntry],
        actions: &[std::sync::Arc<dyn Action>],
    ) -> Result<Decision, RunnerError>;
}

/// Test-support brains, analogous to `crate::chain::mock::MockChain`.
/// Concrete rule-based / LLM-driven brains are out of scope for this core.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Always proposes `wait`. The safe default when no real brain is wired.
    #[derive(Debug, Default)]
    pub struct AlwaysWaitBrain;

    #[async_trait]
    impl Brain for AlwaysWaitBrain {
        async fn think(
            &self,
            _observation: &Observation,
            _memories: &[MemoryEntry],
            _actions: &[std::sync::Arc<dyn Action>],
        ) -> Result<Decision, RunnerError> {
            Ok(Decision::wait("no brain configured"))
        }
    }

    /// Returns a pre-scripted sequence of decisions, one per call, for
    /// deterministic scheduler/cycle tests.
    pub struct ScriptedBrain {
        script: Mutex<std::collections::VecDeque<Decision>>,
    }

    impl ScriptedBrain {
        pub fn new(decisions: Vec<Decision>) -> Self {
            Self {
                script: Mutex::new(decisions.into()),
            }
        }
    }

    #[async_trait]
    impl Brain for ScriptedBrain {
        async fn think(
            &self,
            _observation: &Observation,
            _memories: &[MemoryEntry],
            _actions: &[std::sync::Arc<dyn Action>],
        ) -> Result<Decision, RunnerError> {
            let mut script = self.script.lock().unwrap();
            Ok(script.pop_front().unwrap_or_else(|| Decision::wait("script exhausted")))
        }
    }

    /// Sleeps before proposing `wait` -- holds a cycle open long enough
    /// for scheduler singleflight-contention tests to observe a second,
    /// concurrent attempt for the same token.
    pub struct SlowBrain {
        delay: std::time::Duration,
    }

    impl SlowBrain {
        pub fn new(delay: std::time::Duration) -> Self {
            Self { delay }
        }
    }

    #[async_trait]
    impl Brain for SlowBrain {
        async fn think(
            &self,
            _observation: &Observation,
            _memories: &[MemoryEntry],
            _actions: &[std::sync::Arc<dyn Action>],
        ) -> Result<Decision, RunnerError> {
            tokio::time::sleep(self.delay).await;
            Ok(Decision::wait("slow brain finished"))
        }
    }
}
