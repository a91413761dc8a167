//! Caller-session to context association
//!
//! Front ends keep at most one live conversation per user session. The
//! registry makes the "a context already exists" case an explicit policy
//! instead of a silent overwrite.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::{debug, info};

use crate::context::Context;

/// What to do when a key already has a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Store the new context and hand back the old one
    Replace,
    /// Keep the old context and hand back the new one
    #[default]
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The key already has a context. Carries the rejected context so the
    /// caller can destroy or reuse it.
    #[error("a context is already registered for this session")]
    Occupied(Context),
}

/// Keyed store of conversation contexts
#[derive(Debug)]
pub struct ContextRegistry<K> {
    contexts: HashMap<K, Context>,
    policy: ConflictPolicy,
}

impl<K: Eq + Hash> ContextRegistry<K> {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            contexts: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Register a context under `key`.
    ///
    /// With [`ConflictPolicy::Replace`] the displaced context is returned.
    /// With [`ConflictPolicy::Reject`] an occupied key returns the new
    /// context inside the error.
    pub fn insert(&mut self, key: K, context: Context) -> Result<Option<Context>, RegistryError> {
        match self.policy {
            ConflictPolicy::Replace => {
                let ctx = context.id().to_string();
                let old = self.contexts.insert(key, context);
                if let Some(old) = &old {
                    info!(old = old.id(), new = %ctx, "Replaced session context");
                }
                Ok(old)
            }
            ConflictPolicy::Reject => {
                if self.contexts.contains_key(&key) {
                    debug!(ctx = context.id(), "Session already has a context");
                    return Err(RegistryError::Occupied(context));
                }
                self.contexts.insert(key, context);
                Ok(None)
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&Context> {
        self.contexts.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut Context> {
        self.contexts.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<Context> {
        self.contexts.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.contexts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.contexts.keys()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl<K: Eq + Hash> Default for ContextRegistry<K> {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}
