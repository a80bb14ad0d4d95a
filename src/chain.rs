//! Chain service interface: RPC read/simulate/submit/receipt, plus the
//! on-chain "validate" view used by the hard guardrail layer (§1 "out of
//! scope: Chain I/O"; §4.4 hard policy; §4.2 stages 6-8).
//!
//! Only the trait and a deterministic in-memory mock (used by tests and by
//! the shadow runner's divergence tests) live in this core.

use async_trait::async_trait;
use num_bigint::BigInt;
use serde_json::Value as JsonValue;

use crate::errors::RunnerError;
use crate::models::TokenId;

/// Outcome of a hard-policy on-chain validate call (§4.4).
#[derive(Debug, Clone)]
pub struct HardPolicyResult {
    pub ok: bool,
    pub reason: Option<String>,
}

/// Outcome of `chain.simulate` (§4.2 stage 6).
#[derive(Debug, Clone)]
pub struct SimulateResult {
    pub ok: bool,
    pub revert_reason: Option<String>,
}

/// Outcome of `chain.receipt` (§4.2 stage 8).
#[derive(Debug, Clone)]
pub struct ReceiptResult {
    pub success: bool,
    pub gas_used: Option<BigInt>,
}

#[async_trait]
pub trait Chain: Send + Sync {
    async fn simulate(&self, payload: &JsonValue) -> Result<SimulateResult, RunnerError>;

    async fn submit(&self, payload: &JsonValue) -> Result<String, RunnerError>;

    async fn receipt(&self, tx_hash: &str) -> Result<ReceiptResult, RunnerError>;

    /// Hard-policy validator call (§4.4). The 6-field form is used per
    /// DESIGN.md's resolution of the open question in `spec.md` §9: it is
    /// a strict superset of the 5-field form.
    async fn validate(
        &self,
        token_id: TokenId,
        agent_type: &str,
        action_name: &str,
        target: &str,
        payload: &JsonValue,
        spend_amount: &BigInt,
    ) -> Result<HardPolicyResult, RunnerError>;

    /// The zero address signals "no hard validator configured" (§4.4: "If
    /// the hard validator address is the zero address, the hard layer is
    /// a no-op").
    fn hard_validator_address(&self) -> &str;
}

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Test-support mock, also used by integration tests in `tests/`.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A deterministic in-memory `Chain` used by tests. Behavior is
    /// configured up front rather than derived from any real network.
    pub struct MockChain {
        pub simulate_result: Mutex<SimulateResult>,
        pub hard_policy_result: Mutex<HardPolicyResult>,
        pub validator_address: String,
        pub tx_counter: AtomicU64,
        pub submitted: Mutex<Vec<JsonValue>>,
    }

    impl Default for MockChain {
        fn default() -> Self {
            Self {
                simulate_result: Mutex::new(SimulateResult {
                    ok: true,
                    revert_reason: None,
                }),
                hard_policy_result: Mutex::new(HardPolicyResult {
                    ok: true,
                    reason: None,
                }),
                validator_address: ZERO_ADDRESS.to_string(),
                tx_counter: AtomicU64::new(0),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Chain for MockChain {
        async fn simulate(&self, _payload: &JsonValue) -> Result<SimulateResult, RunnerError> {
            Ok(self.simulate_result.lock().unwrap().clone())
        }

        async fn submit(&self, payload: &JsonValue) -> Result<String, RunnerError> {
            self.submitted.lock().unwrap().push(payload.clone());
            let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("0xmocktx{n:064x}"))
        }

        async fn receipt(&self, _tx_hash: &str) -> Result<ReceiptResult, RunnerError> {
            Ok(ReceiptResult {
                success: true,
                gas_used: Some(BigInt::from(21_000)),
            })
        }

        async fn validate(
            &self,
            _token_id: TokenId,
            _agent_type: &str,
            _action_name: &str,
            _target: &str,
            _payload: &JsonValue,
            _spend_amount: &BigInt,
        ) -> Result<HardPolicyResult, RunnerError> {
            Ok(self.hard_policy_result.lock().unwrap().clone())
        }

        fn hard_validator_address(&self) -> &str {
            &self.validator_address
        }
    }
}
