//! Action capability: named, schema-validated encoders for outbound
//! transactions (§4.3 planner validation, §9 "capability traits").
//! Concrete action encoders (swap, approve, wrap, transfer, ...) are out
//! of scope for this core.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// A declared, named, typed parameter field on an action's schema.
#[derive(Debug, Clone)]
pub struct ActionField {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub r#enum: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

/// An action's declared parameter schema (§4.3: "object of named typed
/// fields; `required[]`; optional `enum`; field names starting with `__`
/// are runtime-internal and exempt").
#[derive(Debug, Clone, Default)]
pub struct ActionSchema {
    pub fields: Vec<ActionField>,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{0}` has the wrong type")]
    WrongType(String),
    #[error("field `{0}` is not one of the allowed enum values")]
    InvalidEnumValue(String),
    #[error("action execution failed: {0}")]
    ExecutionFailed(String),
}

impl ActionSchema {
    /// Validate `params` against this schema. Keys starting with `__` are
    /// runtime-internal (carried via `RuntimeContext`, not the brain's
    /// output) and are exempt from validation — this preserves backward
    /// compatibility with existing traces per the REDESIGN FLAGS section.
    pub fn validate(&self, params: &JsonValue) -> Result<(), ActionError> {
        let obj = params.as_object();

        for field in &self.fields {
            if field.name.starts_with("__") {
                continue;
            }
            let value = obj.and_then(|o| o.get(&field.name));
            match value {
                None => {
                    if field.required {
                        return Err(ActionError::MissingField(field.name.clone()));
                    }
                }
                Some(v) => {
                    if !kind_matches(&field.kind, v) {
                        return Err(ActionError::WrongType(field.name.clone()));
                    }
                    if let Some(allowed) = &field.r#enum {
                        if let Some(s) = v.as_str() {
                            if !allowed.iter().any(|a| a == s) {
                                return Err(ActionError::InvalidEnumValue(field.name.clone()));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn kind_matches(kind: &FieldKind, value: &JsonValue) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Object => value.is_object(),
        FieldKind::Array => value.is_array(),
    }
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;
    fn readonly(&self) -> bool;
    fn parameters_schema(&self) -> &ActionSchema;

    /// Encode `params` into the chain payload `simulate`/`submit` consume.
    fn encode(&self, params: &JsonValue) -> Result<JsonValue, ActionError>;

    /// Execute a readonly action directly (no guardrails, no chain
    /// submission) — used by the cognitive cycle's `validate` stage for
    /// `PlanKind::Readonly` plans.
    async fn execute(&self, params: &JsonValue) -> Result<JsonValue, ActionError>;
}

/// Test-support action, analogous to `crate::chain::mock::MockChain`.
/// Concrete action encoders (swap, approve, wrap, transfer, ...) are out
/// of scope for this core.
pub mod mock {
    use super::*;

    pub struct EchoAction {
        pub name: String,
        pub readonly: bool,
        pub schema: ActionSchema,
    }

    impl EchoAction {
        pub fn new(name: impl Into<String>, readonly: bool, schema: ActionSchema) -> Self {
            Self {
                name: name.into(),
                readonly,
                schema,
            }
        }
    }

    #[async_trait]
    impl Action for EchoAction {
        fn name(&self) -> &str {
            &self.name
        }
        fn readonly(&self) -> bool {
            self.readonly
        }
        fn parameters_schema(&self) -> &ActionSchema {
            &self.schema
        }
        fn encode(&self, params: &JsonValue) -> Result<JsonValue, ActionError> {
            Ok(params.clone())
        }
        async fn execute(&self, params: &JsonValue) -> Result<JsonValue, ActionError> {
            Ok(params.clone())
        }
    }
}
