//! Hard policy guardrail: on-chain "validate" view-call simulation of the
//! final payload against an external validator (§4.4).

use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{Chain, ZERO_ADDRESS};
use crate::errors::RunnerError;
use crate::guardrails::Guardrail;
use crate::models::ExecutionContext;

pub struct HardPolicyGuardrail {
    chain: Arc<dyn Chain>,
}

impl HardPolicyGuardrail {
    pub fn new(chain: Arc<dyn Chain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Guardrail for HardPolicyGuardrail {
    async fn check(&self, ctx: &ExecutionContext) -> Result<(), RunnerError> {
        if self.chain.hard_validator_address() == ZERO_ADDRESS {
            return Ok(());
        }

        let action_name = ctx.action_name.as_deref().unwrap_or("");
        let target = ctx.target.as_deref().unwrap_or("");
        let spend = ctx
            .spend_amount
            .clone()
            .unwrap_or_else(|| num_bigint::BigInt::from(0));

        let result = self
            .chain
            .validate(
                ctx.token_id,
                &ctx.agent_type,
                action_name,
                target,
                &serde_json::json!({ "vault": ctx.vault }),
                &spend,
            )
            .await;

        match result {
            Err(e) => Err(RunnerError::from_violation_code("HARD_SIMULATION_REVERTED").with_detail(e.to_string())),
            Ok(r) if !r.ok => {
                Err(RunnerError::from_violation_code("HARD_POLICY_REJECTED")
                    .with_detail(r.reason.unwrap_or_default()))
            }
            Ok(_) => Ok(()),
        }
    }
}
