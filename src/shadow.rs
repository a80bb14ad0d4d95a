//! Shadow-mode divergence comparison (§4.7): the same `Decision` run
//! through both the canonical and legacy planners, never submitting the
//! legacy plan to chain unless explicitly configured to do so.

use chrono::Utc;

use crate::capability::Action;
use crate::errors::RunnerError;
use crate::models::{Decision, PlanKind, ShadowCompare};
use crate::planner::{CanonicalPlanner, LegacyPlanner, Planner};
use std::sync::Arc;

/// Build a `ShadowCompare` from one decision, without submitting
/// anything to chain. Divergence is a plain field comparison between the
/// two plans' `kind`/`action_name`/`error_code` (§4.7: "the divergence
/// check stays a plain field comparison").
pub fn compare(decision: &Decision, actions: &[Arc<dyn Action>]) -> ShadowCompare {
    let primary = CanonicalPlanner.build_execution_plan(decision, actions);
    let legacy = LegacyPlanner.build_execution_plan(decision, actions);

    let diverged = primary.kind != legacy.kind
        || primary.action_name != legacy.action_name
        || primary.error_code != legacy.error_code;

    let reason = diverged.then(|| {
        format!(
            "canonical={:?}/{:?} legacy={:?}/{:?}",
            primary.kind, primary.action_name, legacy.kind, legacy.action_name
        )
    });

    ShadowCompare {
        primary_kind: primary.kind,
        legacy_kind: legacy.kind,
        primary_action: primary.action_name,
        legacy_action: legacy.action_name,
        primary_error_code: primary.error_code,
        legacy_error_code: legacy.error_code,
        diverged,
        reason,
        at: Utc::now(),
    }
}

/// Optionally also executes the legacy plan's simulation against chain —
/// read-only, never submitted — when `shadow_execute_tx` is enabled, so
/// operators can see whether the legacy path would have actually
/// succeeded on-chain rather than just structurally diverged (§4.7:
/// "never submits the legacy plan to chain unless shadowExecuteTx is
/// true", which here means simulate-only, submission is never shadowed).
pub async fn compare_with_simulation(
    decision: &Decision,
    actions: &[Arc<dyn Action>],
    chain: &dyn crate::chain::Chain,
    shadow_execute_tx: bool,
) -> Result<ShadowCompare, RunnerError> {
    let mut cmp = compare(decision, actions);
    if !shadow_execute_tx {
        return Ok(cmp);
    }

    let legacy = LegacyPlanner.build_execution_plan(decision, actions);
    if legacy.kind == PlanKind::Write {
        match chain.simulate(&legacy.params).await {
            Ok(sim) if !sim.ok => {
                cmp.diverged = true;
                cmp.reason = Some(format!(
                    "{} legacy_simulation_reverted={:?}",
                    cmp.reason.clone().unwrap_or_default(),
                    sim.revert_reason
                ));
            }
            Err(e) => {
                cmp.diverged = true;
                cmp.reason = Some(format!(
                    "{} legacy_simulation_error={}",
                    cmp.reason.clone().unwrap_or_default(),
                    e
                ));
            }
            _ => {}
        }
    }
    Ok(cmp)
}
