//! Agent factory + capability registries (§4.8).
//!
//! Pure construction: given on-chain metadata plus a resolved blueprint,
//! assemble a fully wired `Agent`. Registries are typed `HashMap`s keyed
//! by short strings, populated once at startup — the REDESIGN FLAGS
//! "blueprint registry" item, replacing stringly dynamic dispatch with a
//! lookup that returns an error (never panics) on a missing name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::capability::{Action, Agent, Brain, BrainFactoryContext, Memory, Perception};
use crate::chain::Chain;
use crate::errors::{ErrorCode, FailureCategory, RunnerError};
use crate::guardrails::{Guardrail, HardPolicyGuardrail, SoftPolicyGuardrail};
use crate::models::{AgentIdentity, Blueprint, ChainAgentData};
use crate::persistence::PersistenceStore;

pub type PerceptionCtor = Arc<dyn Fn(&ChainAgentData) -> Arc<dyn Perception> + Send + Sync>;
pub type BrainCtor =
    Arc<dyn Fn(&ChainAgentData, &BrainFactoryContext) -> Arc<dyn Brain> + Send + Sync>;
pub type ActionCtor = Arc<dyn Fn() -> Arc<dyn Action> + Send + Sync>;
pub type GuardrailCtor = Arc<dyn Fn() -> Arc<dyn Guardrail> + Send + Sync>;
pub type MemoryCtor = Arc<dyn Fn(&ChainAgentData) -> Arc<dyn Memory> + Send + Sync>;

/// Reader-writer protected reload cache for blueprints (§3, §9 "hot
/// reload uses a reader-writer protected map swap"). Loaded from the
/// persistent store on startup with a built-in fallback set.
pub struct BlueprintCache {
    store: Arc<dyn PersistenceStore>,
    cache: RwLock<HashMap<String, Blueprint>>,
}

impl BlueprintCache {
    pub async fn load(store: Arc<dyn PersistenceStore>) -> Result<Self, RunnerError> {
        let this = Self {
            store,
            cache: RwLock::new(built_in_blueprints()),
        };
        this.reload().await?;
        Ok(this)
    }

    /// Swap the cache with the persisted set merged over the built-in
    /// fallback (persisted rows win on key collision). Briefly acquires
    /// the writer lock; never holds it across I/O.
    pub async fn reload(&self) -> Result<(), RunnerError> {
        let persisted = self.store.list_blueprints().await?;
        let mut merged = built_in_blueprints();
        for bp in persisted {
            merged.insert(bp.agent_type.clone(), bp);
        }
        *self.cache.write() = merged;
        Ok(())
    }

    pub fn get(&self, agent_type: &str) -> Option<Blueprint> {
        self.cache.read().get(agent_type).cloned()
    }
}

fn built_in_blueprints() -> HashMap<String, Blueprint> {
    let mut map = HashMap::new();
    map.insert(
        "default".to_string(),
        Blueprint {
            agent_type: "default".to_string(),
            brain: "always_wait".to_string(),
            perception: "static".to_string(),
            actions: vec![],
            guardrails: vec!["soft_policy".to_string(), "hard_policy".to_string()],
            memory: "store".to_string(),
            llm_config: None,
        },
    );
    map
}

/// The five capability registries, populated once at startup (§4.8,
/// §9). Guardrail and memory constructors close over the shared
/// `PersistenceStore`/`Chain` at registration time since those two
/// capabilities' production implementations live in this core.
#[derive(Default)]
pub struct Registries {
    perception: HashMap<String, PerceptionCtor>,
    brain: HashMap<String, BrainCtor>,
    actions: HashMap<String, ActionCtor>,
    guardrails: HashMap<String, GuardrailCtor>,
    memory: HashMap<String, MemoryCtor>,
}

impl Registries {
    /// Registries pre-populated with this core's in-scope defaults: the
    /// `always_wait`/`static` safe fallbacks (so an unconfigured
    /// blueprint still assembles into a runnable, inert agent) and the
    /// real `soft_policy`/`hard_policy`/`store` implementations. Callers
    /// wire in concrete brains/perceptions/actions via `register_*`.
    pub fn with_defaults(store: Arc<dyn PersistenceStore>, chain: Arc<dyn Chain>) -> Self {
        let mut registries = Self::default();

        registries.register_brain("always_wait", |_data, _ctx| {
            Arc::new(crate::capability::brain::mock::AlwaysWaitBrain)
        });

        registries.register_perception("static", |_data| {
            Arc::new(crate::capability::perception::mock::StaticPerception::new(
                crate::models::Observation {
                    vault: String::new(),
                    vault_token_balances: vec![],
                    native_balance: num_bigint::BigInt::from(0),
                    prices: Default::default(),
                    gas_price: num_bigint::BigInt::from(0),
                    block_number: 0,
                    timestamp: chrono::Utc::now(),
                    paused: false,
                },
            ))
        });

        {
            let store = store.clone();
            registries.register_guardrail("soft_policy", move || {
                Arc::new(SoftPolicyGuardrail::new(store.clone())) as Arc<dyn Guardrail>
            });
        }
        {
            let chain = chain.clone();
            registries.register_guardrail("hard_policy", move || {
                Arc::new(HardPolicyGuardrail::new(chain.clone())) as Arc<dyn Guardrail>
            });
        }
        {
            let store = store.clone();
            registries.register_memory("store", move |data| {
                Arc::new(crate::capability::memory::StoreMemory::new(
                    store.clone(),
                    data.token_id,
                )) as Arc<dyn Memory>
            });
        }

        registries
    }

    pub fn register_perception(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn(&ChainAgentData) -> Arc<dyn Perception> + Send + Sync + 'static,
    ) {
        self.perception.insert(name.into(), Arc::new(ctor));
    }

    pub fn register_brain(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn(&ChainAgentData, &BrainFactoryContext) -> Arc<dyn Brain> + Send + Sync + 'static,
    ) {
        self.brain.insert(name.into(), Arc::new(ctor));
    }

    pub fn register_action(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn() -> Arc<dyn Action> + Send + Sync + 'static,
    ) {
        self.actions.insert(name.into(), Arc::new(ctor));
    }

    pub fn register_guardrail(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn() -> Arc<dyn Guardrail> + Send + Sync + 'static,
    ) {
        self.guardrails.insert(name.into(), Arc::new(ctor));
    }

    pub fn register_memory(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn(&ChainAgentData) -> Arc<dyn Memory> + Send + Sync + 'static,
    ) {
        self.memory.insert(name.into(), Arc::new(ctor));
    }
}

fn missing(kind: &str, name: &str) -> RunnerError {
    RunnerError::new(
        FailureCategory::InfrastructureError,
        ErrorCode::InfraRuntimeException,
        "Agent assembly failed; this agent cannot be started.",
    )
    .with_detail(format!("no {kind} registered under name `{name}`"))
}

pub struct AgentFactory {
    blueprints: Arc<BlueprintCache>,
    registries: Arc<Registries>,
}

impl AgentFactory {
    pub fn new(blueprints: Arc<BlueprintCache>, registries: Arc<Registries>) -> Self {
        Self {
            blueprints,
            registries,
        }
    }

    /// Assemble a fully wired `Agent` from on-chain metadata (§4.8):
    /// 1. lookup blueprint, 2. resolve module factories from the
    /// registries, 3. pass `strategy_params` to the brain factory,
    /// 4. return the wired agent.
    pub fn build(&self, data: ChainAgentData) -> Result<Agent, RunnerError> {
        let blueprint = self
            .blueprints
            .get(&data.agent_type)
            .or_else(|| self.blueprints.get("default"))
            .ok_or_else(|| missing("blueprint", &data.agent_type))?;

        let perception_ctor = self
            .registries
            .perception
            .get(&blueprint.perception)
            .ok_or_else(|| missing("perception", &blueprint.perception))?;
        let perception = perception_ctor(&data);

        let brain_ctor = self
            .registries
            .brain
            .get(&blueprint.brain)
            .ok_or_else(|| missing("brain", &blueprint.brain))?;
        let brain_ctx = BrainFactoryContext {
            llm_config: blueprint.llm_config.clone(),
            strategy_params: data.strategy_params.clone(),
        };
        let brain = brain_ctor(&data, &brain_ctx);

        let mut actions = Vec::with_capacity(blueprint.actions.len());
        for name in &blueprint.actions {
            let ctor = self
                .registries
                .actions
                .get(name)
                .ok_or_else(|| missing("action", name))?;
            actions.push(ctor());
        }

        let mut guardrails = Vec::with_capacity(blueprint.guardrails.len());
        for name in &blueprint.guardrails {
            let ctor = self
                .registries
                .guardrails
                .get(name)
                .ok_or_else(|| missing("guardrail", name))?;
            guardrails.push(ctor());
        }

        let memory_ctor = self
            .registries
            .memory
            .get(&blueprint.memory)
            .ok_or_else(|| missing("memory", &blueprint.memory))?;
        let memory = memory_ctor(&data);

        Ok(Agent {
            identity: AgentIdentity {
                token_id: data.token_id,
                agent_type: data.agent_type,
                owner: data.owner,
                renter: data.renter,
                vault: data.vault,
            },
            perception,
            memory,
            brain,
            actions,
            guardrails,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::persistence::sqlite::SqliteStore;

    fn chain_agent_data() -> ChainAgentData {
        ChainAgentData {
            token_id: 1,
            agent_type: "default".to_string(),
            owner: "0xowner".to_string(),
            renter: None,
            vault: "0xvault".to_string(),
            strategy_params: None,
        }
    }

    async fn factory() -> AgentFactory {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chain: Arc<dyn Chain> = Arc::new(MockChain::default());
        let blueprints = Arc::new(BlueprintCache::load(store.clone()).await.unwrap());
        let registries = Arc::new(Registries::with_defaults(store, chain));
        AgentFactory::new(blueprints, registries)
    }

    #[tokio::test]
    async fn builds_default_blueprint_with_two_guardrail_layers() {
        let factory = factory().await;
        let agent = factory.build(chain_agent_data()).unwrap();
        assert_eq!(agent.identity.token_id, 1);
        assert_eq!(agent.guardrails.len(), 2);
        assert!(agent.actions.is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_type_falls_back_to_default_blueprint() {
        let factory = factory().await;
        let mut data = chain_agent_data();
        data.agent_type = "never_registered".to_string();
        let agent = factory.build(data).unwrap();
        assert_eq!(agent.identity.agent_type, "never_registered");
        assert_eq!(agent.guardrails.len(), 2);
    }

    #[tokio::test]
    async fn missing_action_registration_errors_instead_of_panicking() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert_blueprint(&Blueprint {
                agent_type: "trader".to_string(),
                brain: "always_wait".to_string(),
                perception: "static".to_string(),
                actions: vec!["swap".to_string()],
                guardrails: vec![],
                memory: "store".to_string(),
                llm_config: None,
            })
            .await
            .unwrap();
        let chain: Arc<dyn Chain> = Arc::new(MockChain::default());
        let blueprints = Arc::new(BlueprintCache::load(store.clone()).await.unwrap());
        let registries = Arc::new(Registries::with_defaults(store, chain));
        let factory = AgentFactory::new(blueprints, registries);

        let mut data = chain_agent_data();
        data.agent_type = "trader".to_string();
        let err = factory.build(data).unwrap_err();
        assert_eq!(err.code, ErrorCode::InfraRuntimeException);
    }
}
