//! Planner: a pure, deterministic function `Decision x Action[] ->
//! ExecutionPlan` (§4.3). Two implementations exist — the canonical
//! planner and a legacy planner used only for shadow-mode comparison
//! (§4.7) — sharing one trait so the shadow runner can hold both as trait
//! objects and the divergence check stays a plain field comparison.

use std::sync::Arc;

use crate::capability::Action;
use crate::errors::{ErrorCode, FailureCategory};
use crate::models::{Decision, ExecutionPlan, PlanKind};

pub trait Planner: Send + Sync {
    fn build_execution_plan(&self, decision: &Decision, actions: &[Arc<dyn Action>]) -> ExecutionPlan;
}

/// The canonical planner: validates the decision's params against the
/// resolved action's declared schema before allowing a write (§4.3).
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalPlanner;

impl Planner for CanonicalPlanner {
    fn build_execution_plan(&self, decision: &Decision, actions: &[Arc<dyn Action>]) -> ExecutionPlan {
        build_plan(decision, actions, true)
    }
}

/// The legacy planner: identical behavior to `CanonicalPlanner` except it
/// skips schema validation (§4.3). Exists only for shadow-mode comparison
/// (§4.7); its output is never submitted to the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyPlanner;

impl Planner for LegacyPlanner {
    fn build_execution_plan(&self, decision: &Decision, actions: &[Arc<dyn Action>]) -> ExecutionPlan {
        build_plan(decision, actions, false)
    }
}

fn build_plan(decision: &Decision, actions: &[Arc<dyn Action>], validate_schema: bool) -> ExecutionPlan {
    if decision.action == "wait" {
        return ExecutionPlan::wait(decision.reasoning.clone());
    }

    let Some(action) = actions.iter().find(|a| a.name() == decision.action) else {
        return ExecutionPlan::blocked(
            format!("unknown action `{}`", decision.action),
            FailureCategory::ModelOutputError,
            ErrorCode::ModelUnknownAction,
        );
    };

    if validate_schema {
        if let Err(e) = action.parameters_schema().validate(&decision.params) {
            return ExecutionPlan::blocked(
                format!("invalid action params: {e}"),
                FailureCategory::ModelOutputError,
                ErrorCode::ModelSchemaValidationFailed,
            );
        }
    }

    ExecutionPlan {
        kind: if action.readonly() {
            PlanKind::Readonly
        } else {
            PlanKind::Write
        },
        action_name: Some(action.name().to_string()),
        params: decision.params.clone(),
        reason: decision.reasoning.clone(),
        action_module: Some(action.name().to_string()),
        failure_category: None,
        error_code: None,
    }
}
