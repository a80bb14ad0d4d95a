//! Two-layer guardrail pipeline (§4.4). Runs only for `write` plans and
//! composes the soft (local, DB-backed) and hard (on-chain simulation)
//! layers in series — the first failure short-circuits the rest (§8
//! "policy short-circuit").

pub mod hard;
pub mod soft;

use async_trait::async_trait;

use crate::errors::RunnerError;
use crate::models::ExecutionContext;

pub use hard::HardPolicyGuardrail;
pub use soft::SoftPolicyGuardrail;

#[async_trait]
pub trait Guardrail: Send + Sync {
    /// Returns `Ok(())` if the action may proceed, or a classified
    /// `RunnerError` (category `business_rejected`) naming the violation.
    async fn check(&self, ctx: &ExecutionContext) -> Result<(), RunnerError>;
}

/// Run `layers` in series; the first violation short-circuits the rest.
pub async fn run_pipeline(
    layers: &[std::sync::Arc<dyn Guardrail>],
    ctx: &ExecutionContext,
) -> Result<(), RunnerError> {
    for layer in layers {
        layer.check(ctx).await?;
    }
    Ok(())
}
