use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::BackendError;
use super::cache::RoleCache;
use super::role::RoleSet;

/// Where role flags come from. The platform RPC in production; fakes in tests.
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn fetch_roles(&self, user_id: &str) -> Result<RoleSet, BackendError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { retries: 3, base: Duration::from_millis(100) } }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift)
    }
}

/// Resolves a user's role set through the cache, fetching on miss.
#[derive(Clone)]
pub struct RoleResolver {
    source: Arc<dyn RoleSource>,
    cache: RoleCache,
    retry: RetryPolicy,
}

impl RoleResolver {
    pub fn new(source: Arc<dyn RoleSource>, cache: RoleCache, retry: RetryPolicy) -> Self {
        Self { source, cache, retry }
    }

    pub fn cache(&self) -> &RoleCache { &self.cache }

    /// Never fails: after exhausting retries the user is treated as a viewer,
    /// and that fallback is cached briefly so a failing backend is not hammered.
    pub async fn roles_for(&self, user_id: &str) -> RoleSet {
        if let Some(hit) = self.cache.get(user_id) {
            return hit.roles;
        }
        let generation = self.cache.generation();
        let (roles, fallback) = match self.fetch_with_retry(user_id).await {
            Ok(roles) => (roles, false),
            Err(e) => {
                warn!(target: "roles", user_id, error = %e, "role fetch failed after retries; falling back to viewer");
                (RoleSet::least_privileged(), true)
            }
        };
        if !self.cache.insert_if_unchanged(user_id, roles, fallback, generation) {
            debug!(target: "roles", user_id, "roles invalidated during fetch; result not cached");
        }
        roles
    }

    async fn fetch_with_retry(&self, user_id: &str) -> Result<RoleSet, BackendError> {
        let mut attempt: u32 = 0;
        loop {
            match self.source.fetch_roles(user_id).await {
                Ok(roles) => return Ok(roles),
                Err(e) if attempt < self.retry.retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    debug!(target: "roles", user_id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "role fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
