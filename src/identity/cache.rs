use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::role::RoleSet;

#[derive(Debug, Clone)]
struct CacheEntry {
    roles: RoleSet,
    expires_at: Instant,
    fallback: bool,
}

/// A cached lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRoles {
    pub roles: RoleSet,
    /// True when the entry is a least-privilege fallback after a failed fetch.
    pub fallback: bool,
}

/// User id -> role set, with per-entry expiry. Best effort: stale reads are
/// bounded by the TTL and the platform re-checks authorization on every RPC.
///
/// Every `invalidate` and `clear` bumps a generation counter. A fetch that
/// started before an invalidation stores its result through
/// [`RoleCache::insert_if_unchanged`], which refuses to cache it.
#[derive(Clone)]
pub struct RoleCache {
    ttl: Duration,
    fallback_ttl: Duration,
    map: Arc<RwLock<HashMap<String, CacheEntry>>>,
    generation: Arc<AtomicU64>,
}

impl RoleCache {
    pub fn new(ttl: Duration, fallback_ttl: Duration) -> Self {
        Self {
            ttl,
            fallback_ttl,
            map: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current invalidation generation; read it before starting a fetch.
    pub fn generation(&self) -> u64 { self.generation.load(Ordering::Acquire) }

    pub fn ttl(&self) -> Duration { self.ttl }

    pub fn get(&self, user_id: &str) -> Option<CachedRoles> {
        self.get_at(user_id, Instant::now())
    }

    pub fn get_at(&self, user_id: &str, now: Instant) -> Option<CachedRoles> {
        let expired = {
            let map = self.map.read();
            match map.get(user_id) {
                Some(e) if e.expires_at > now => return Some(CachedRoles { roles: e.roles, fallback: e.fallback }),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut map = self.map.write();
            // Re-check under the write lock; a fresh insert may have raced us.
            if map.get(user_id).map(|e| e.expires_at <= now).unwrap_or(false) {
                map.remove(user_id);
            }
        }
        None
    }

    pub fn insert(&self, user_id: &str, roles: RoleSet) {
        self.insert_at(user_id, roles, false, Instant::now());
    }

    fn entry(&self, roles: RoleSet, fallback: bool, now: Instant) -> CacheEntry {
        let ttl = if fallback { self.fallback_ttl } else { self.ttl };
        CacheEntry { roles, expires_at: now + ttl, fallback }
    }

    pub fn insert_at(&self, user_id: &str, roles: RoleSet, fallback: bool, now: Instant) {
        let entry = self.entry(roles, fallback, now);
        self.map.write().insert(user_id.to_string(), entry);
    }

    /// Store a fetch result only if nothing was invalidated since `generation`
    /// was read. Returns whether the entry was stored.
    pub fn insert_if_unchanged(&self, user_id: &str, roles: RoleSet, fallback: bool, generation: u64) -> bool {
        let entry = self.entry(roles, fallback, Instant::now());
        let mut map = self.map.write();
        // Bumps happen under the write lock, so this check cannot race one
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        map.insert(user_id.to_string(), entry);
        true
    }

    /// Drop one user's entry. Returns whether an entry existed.
    pub fn invalidate(&self, user_id: &str) -> bool {
        let mut map = self.map.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        map.remove(user_id).is_some()
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut map = self.map.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let n = map.len();
        map.clear();
        n
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        before - map.len()
    }

    pub fn len(&self) -> usize { self.map.read().len() }

    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }
}
