//! Subscription tier lookup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CadenceError, CadenceResult};
use crate::types::{Plan, TierContext};

/// Resolves the tier context of a user.
///
/// Implemented by the account/subscription system outside the engine.
#[async_trait]
pub trait PlanProvider: Send + Sync {
    /// Look up the plan and calendar anchor of a user.
    async fn context(&self, user_id: &str) -> CadenceResult<TierContext>;
}

/// In-process plan table.
///
/// Unknown users resolve to guests in `default_offset_seconds`.
pub struct StaticPlanProvider {
    contexts: RwLock<HashMap<String, TierContext>>,
    default_offset_seconds: i32,
}

impl StaticPlanProvider {
    pub fn new(default_offset_seconds: i32) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            default_offset_seconds,
        }
    }

    /// Register or replace a user's context (a subscription event).
    pub fn set(&self, context: TierContext) -> CadenceResult<()> {
        let mut contexts = self
            .contexts
            .write()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        contexts.insert(context.user_id.clone(), context);
        Ok(())
    }

    /// Change only the plan of a known user.
    pub fn set_plan(&self, user_id: &str, plan: Plan) -> CadenceResult<()> {
        let mut contexts = self
            .contexts
            .write()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        let offset = self.default_offset_seconds;
        contexts
            .entry(user_id.to_string())
            .and_modify(|ctx| ctx.plan = plan)
            .or_insert_with(|| TierContext::new(user_id, plan, offset));
        Ok(())
    }
}

#[async_trait]
impl PlanProvider for StaticPlanProvider {
    async fn context(&self, user_id: &str) -> CadenceResult<TierContext> {
        if user_id.trim().is_empty() {
            return Err(CadenceError::not_authenticated("no user id on the request"));
        }
        let contexts = self
            .contexts
            .read()
            .map_err(|e| CadenceError::internal(e.to_string()))?;
        Ok(contexts
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| TierContext::new(user_id, Plan::Guest, self.default_offset_seconds)))
    }
}
