//! Message registry and version history.
//!
//! History navigation is cheap because versions are just ordered lists of
//! message IDs: the registry owns every message ever appended (strongly), a
//! [`Version`] is an immutable ID list, and the store's contents are defined
//! as the materialization of the head version. Appending is O(1); reverting
//! is O(|version|); message payloads are shared between versions.
//!
//! Reverting never destroys anything. Per the append-only policy, a revert
//! appends a *new* version whose ID list equals the target's, so history
//! remains a strict log — two versions may carry identical lists — and any
//! later version can still be restored.

use crate::types::{Message, MessageId};
use crate::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

// ============================================================================
// MESSAGE REGISTRY
// ============================================================================

/// Weak handle from a registered message back to the agent that owns it.
///
/// Type-erased so the registry does not depend on the kernel; the agent
/// downcasts on the way out. The reference is weak by design: the registry
/// must not keep a dropped agent alive, and a dropped agent must not leak
/// its messages (they are freed when the registry itself goes away).
pub type AgentBackRef = Weak<dyn Any + Send + Sync>;

struct RegistryEntry {
    message: Arc<Message>,
    agent: Option<AgentBackRef>,
}

/// Owns every message by ID.
///
/// Messages are never deleted, only dereferenced: a version that drops an ID
/// leaves the payload in place so earlier versions can still materialize.
/// The map is behind a read-write lock; lookups take the read side only.
#[derive(Default)]
pub struct MessageRegistry {
    entries: RwLock<HashMap<MessageId, RegistryEntry>>,
}

impl MessageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message, returning the shared handle. Re-inserting an
    /// existing ID returns the already-registered message unchanged.
    pub fn insert(&self, message: Message) -> Arc<Message> {
        self.insert_attached(message, None)
    }

    /// Register a message with a weak back-reference to its owning agent.
    pub fn insert_attached(&self, message: Message, agent: Option<AgentBackRef>) -> Arc<Message> {
        let mut entries = self.entries.write().expect("message registry poisoned");
        let entry = entries.entry(message.id).or_insert_with(|| RegistryEntry {
            message: Arc::new(message),
            agent: None,
        });
        if entry.agent.is_none() {
            entry.agent = agent;
        }
        Arc::clone(&entry.message)
    }

    /// Look up one message.
    pub fn get(&self, id: MessageId) -> Option<Arc<Message>> {
        self.entries
            .read()
            .expect("message registry poisoned")
            .get(&id)
            .map(|e| Arc::clone(&e.message))
    }

    /// Look up an ordered list of messages. Fails on the first unknown ID —
    /// a version referencing an unregistered message is a kernel bug.
    pub fn get_many(&self, ids: &[MessageId]) -> Result<Vec<Arc<Message>>> {
        let entries = self.entries.read().expect("message registry poisoned");
        ids.iter()
            .map(|id| {
                entries
                    .get(id)
                    .map(|e| Arc::clone(&e.message))
                    .ok_or_else(|| {
                        Error::invariant(format!("version references unknown message {id}"))
                    })
            })
            .collect()
    }

    /// The agent a message is attached to, if it is still alive.
    pub fn agent_of(&self, id: MessageId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .read()
            .expect("message registry poisoned")
            .get(&id)
            .and_then(|e| e.agent.as_ref())
            .and_then(Weak::upgrade)
    }

    /// Whether an ID is registered.
    pub fn contains(&self, id: MessageId) -> bool {
        self.entries
            .read()
            .expect("message registry poisoned")
            .contains_key(&id)
    }

    /// Number of registered messages.
    pub fn len(&self) -> usize {
        self.entries.read().expect("message registry poisoned").len()
    }

    /// Whether the registry holds no messages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("messages", &self.len())
            .finish()
    }
}

// ============================================================================
// VERSIONS
// ============================================================================

/// An immutable snapshot of the conversation: an ordered list of message IDs.
#[derive(Debug, Clone)]
pub struct Version {
    /// Monotonic version number; 0 is the empty initial version
    pub id: u64,
    /// Ordered message IDs this version materializes to
    pub message_ids: Vec<MessageId>,
    /// When the version was committed
    pub created_at: Instant,
}

/// Append-only version history with a head pointer.
///
/// Every store mutation commits a new version; the head always names the
/// live conversation. The full history is retained for revert.
pub struct VersioningManager {
    inner: RwLock<VersioningState>,
}

struct VersioningState {
    versions: Vec<Arc<Version>>,
    /// Index into `versions` of the current head
    head: usize,
}

impl Default for VersioningManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VersioningManager {
    /// Create a manager whose history starts at an empty version 0.
    pub fn new() -> Self {
        let initial = Arc::new(Version {
            id: 0,
            message_ids: Vec::new(),
            created_at: Instant::now(),
        });
        Self {
            inner: RwLock::new(VersioningState {
                versions: vec![initial],
                head: 0,
            }),
        }
    }

    /// The current head version.
    pub fn head(&self) -> Arc<Version> {
        let state = self.inner.read().expect("versioning poisoned");
        Arc::clone(&state.versions[state.head])
    }

    /// The current head version ID.
    pub fn head_id(&self) -> u64 {
        self.head().id
    }

    /// Commit a new version with the given ID list and move the head to it.
    pub fn commit(&self, message_ids: Vec<MessageId>) -> Arc<Version> {
        let mut state = self.inner.write().expect("versioning poisoned");
        let version = Arc::new(Version {
            id: state.versions.len() as u64,
            message_ids,
            created_at: Instant::now(),
        });
        state.versions.push(Arc::clone(&version));
        state.head = state.versions.len() - 1;
        version
    }

    /// Revert to an earlier (or later) version by ID.
    ///
    /// Appends a new version equal to the target rather than moving the head
    /// backwards, keeping the history append-only. Returns the new head.
    pub fn revert_to(&self, version_id: u64) -> Result<Arc<Version>> {
        let target_ids = {
            let state = self.inner.read().expect("versioning poisoned");
            state
                .versions
                .iter()
                .find(|v| v.id == version_id)
                .map(|v| v.message_ids.clone())
                .ok_or_else(|| Error::invalid_input(format!("unknown version {version_id}")))?
        };
        Ok(self.commit(target_ids))
    }

    /// Look up a version by ID.
    pub fn get(&self, version_id: u64) -> Option<Arc<Version>> {
        let state = self.inner.read().expect("versioning poisoned");
        state.versions.iter().find(|v| v.id == version_id).cloned()
    }

    /// The full version history, oldest first.
    pub fn history(&self) -> Vec<Arc<Version>> {
        self.inner
            .read()
            .expect("versioning poisoned")
            .versions
            .clone()
    }

    /// Number of committed versions (including the initial empty one).
    pub fn len(&self) -> usize {
        self.inner.read().expect("versioning poisoned").versions.len()
    }

    /// Whether only the initial empty version exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl std::fmt::Debug for VersioningManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read().expect("versioning poisoned");
        f.debug_struct("VersioningManager")
            .field("versions", &state.versions.len())
            .field("head", &state.versions[state.head].id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn test_initial_state_is_empty_version_zero() {
        let versioning = VersioningManager::new();
        assert_eq!(versioning.head_id(), 0);
        assert!(versioning.head().message_ids.is_empty());
        assert!(versioning.is_empty());
    }

    #[test]
    fn test_commit_advances_head() {
        let versioning = VersioningManager::new();
        let registry = MessageRegistry::new();

        let m1 = registry.insert(Message::user("one"));
        let v1 = versioning.commit(vec![m1.id]);
        assert_eq!(v1.id, 1);
        assert_eq!(versioning.head_id(), 1);

        let m2 = registry.insert(Message::user("two"));
        let v2 = versioning.commit(vec![m1.id, m2.id]);
        assert_eq!(v2.id, 2);
        assert_eq!(versioning.head().message_ids, vec![m1.id, m2.id]);
    }

    #[test]
    fn test_revert_appends_new_version() {
        let versioning = VersioningManager::new();
        let registry = MessageRegistry::new();

        let m1 = registry.insert(Message::user("one"));
        let m2 = registry.insert(Message::user("two"));
        versioning.commit(vec![m1.id]);
        versioning.commit(vec![m1.id, m2.id]);

        let head = versioning.revert_to(1).unwrap();
        // Head moved forward, not back: the history stays append-only.
        assert_eq!(head.id, 3);
        assert_eq!(head.message_ids, vec![m1.id]);
        assert_eq!(versioning.len(), 4);

        // The dropped message is still materializable through version 2.
        let v2 = versioning.get(2).unwrap();
        assert_eq!(registry.get_many(&v2.message_ids).unwrap().len(), 2);
    }

    #[test]
    fn test_revert_unknown_version_fails() {
        let versioning = VersioningManager::new();
        assert!(versioning.revert_to(99).is_err());
    }

    #[test]
    fn test_registry_reinsert_is_idempotent() {
        let registry = MessageRegistry::new();
        let msg = Message::user("hello");
        let id = msg.id;

        let first = registry.insert(msg.clone());
        let second = registry.insert(msg);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(id));
    }

    #[test]
    fn test_registry_get_many_preserves_order() {
        let registry = MessageRegistry::new();
        let a = registry.insert(Message::user("a"));
        let b = registry.insert(Message::user("b"));

        let out = registry.get_many(&[b.id, a.id]).unwrap();
        assert_eq!(out[0].text(), "b");
        assert_eq!(out[1].text(), "a");
    }

    #[test]
    fn test_registry_get_many_unknown_id_is_invariant_violation() {
        let registry = MessageRegistry::new();
        let unregistered = Message::user("ghost");
        let err = registry.get_many(&[unregistered.id]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_agent_backref_does_not_keep_agent_alive() {
        let registry = MessageRegistry::new();
        let agent: Arc<dyn std::any::Any + Send + Sync> = Arc::new(String::from("agent"));
        let weak = Arc::downgrade(&agent);

        let msg = Message::user("attached");
        let id = msg.id;
        registry.insert_attached(msg, Some(weak));

        assert!(registry.agent_of(id).is_some());
        drop(agent);
        assert!(registry.agent_of(id).is_none());
        // The message itself survives the agent.
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn test_replay_head_equals_commits() {
        // Invariant: the materialized store equals the replay of
        // head.message_ids through the registry, whatever the mutations.
        let versioning = VersioningManager::new();
        let registry = MessageRegistry::new();
        let mut ids = Vec::new();

        for i in 0..5 {
            let msg = registry.insert(Message::user(format!("m{i}")));
            ids.push(msg.id);
            versioning.commit(ids.clone());
        }
        // Replace in the middle
        let replacement = registry.insert(Message::user("mx"));
        ids[2] = replacement.id;
        versioning.commit(ids.clone());

        let replay = registry.get_many(&versioning.head().message_ids).unwrap();
        let texts: Vec<String> = replay.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m0", "m1", "mx", "m3", "m4"]);
    }
}
