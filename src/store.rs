//! Ordered, versioned conversation log.
//!
//! The store never holds messages directly: its contents are *defined* as
//! the materialization of the versioning head through the message registry.
//! Every mutation registers payloads, computes the next ID list, and commits
//! a new version, which makes snapshot/revert O(1) bookkeeping and gives
//! readers a consistent view without taking the agent's mutation guard —
//! they observe whatever head was current when they looked.
//!
//! Mutations themselves are serialized by the agent; the store's own locks
//! exist only for memory safety.
//!
//! # Pairing repair
//!
//! [`MessageStore::materialize_for_llm`] renders the log to the wire format
//! and repairs tool-call pairing on the way out: any assistant tool call
//! without a following tool response gets a synthetic
//! `{role:"tool", content:"{}"}` placeholder, because providers reject
//! unpaired calls. The store itself is never mutated by the repair pass, so
//! callers can always observe the pre-repair state.

use crate::render::ContentRenderer;
use crate::types::{FormattedMessage, Message, MessageId, MessageRole, ToolCallRequest};
use crate::versioning::{AgentBackRef, MessageRegistry, VersioningManager};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// The conversation log backing an agent.
///
/// Cheap to clone: all state lives behind shared handles, so the tool
/// executor and mode manager can carry their own copy.
#[derive(Clone)]
pub struct MessageStore {
    registry: Arc<MessageRegistry>,
    versioning: Arc<VersioningManager>,
    /// Weak handle to the owning agent, attached to every registered message.
    agent_backref: Arc<RwLock<Option<AgentBackRef>>>,
}

impl MessageStore {
    /// Create a store over the given registry and version history.
    pub fn new(registry: Arc<MessageRegistry>, versioning: Arc<VersioningManager>) -> Self {
        Self {
            registry,
            versioning,
            agent_backref: Arc::new(RwLock::new(None)),
        }
    }

    /// Attach the owning agent; subsequent registrations carry the back-ref.
    pub(crate) fn set_agent_backref(&self, backref: AgentBackRef) {
        *self.agent_backref.write().expect("store backref poisoned") = Some(backref);
    }

    /// The registry owning this store's messages.
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// The version history behind this store.
    pub fn versioning(&self) -> &Arc<VersioningManager> {
        &self.versioning
    }

    fn register(&self, message: Message) -> Arc<Message> {
        let backref = self
            .agent_backref
            .read()
            .expect("store backref poisoned")
            .clone();
        self.registry.insert_attached(message, backref)
    }

    fn head_ids(&self) -> Vec<MessageId> {
        self.versioning.head().message_ids.clone()
    }

    // ------------------------------------------------------------------
    // Mutations (serialized by the agent's guard)
    // ------------------------------------------------------------------

    /// Append one message; commits a new version. O(1) amortized.
    pub fn append(&self, message: Message) -> Arc<Message> {
        let msg = self.register(message);
        let mut ids = self.head_ids();
        ids.push(msg.id);
        self.versioning.commit(ids);
        msg
    }

    /// Append a batch under a single new version.
    pub fn extend(&self, messages: Vec<Message>) -> Vec<Arc<Message>> {
        let mut ids = self.head_ids();
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            let msg = self.register(message);
            ids.push(msg.id);
            out.push(msg);
        }
        self.versioning.commit(ids);
        out
    }

    /// Replace the message at `index`; the new version shares every other ID.
    pub fn replace_at(&self, index: usize, message: Message) -> Result<Arc<Message>> {
        let mut ids = self.head_ids();
        if index >= ids.len() {
            return Err(Error::invalid_input(format!(
                "replace_at index {index} out of bounds (len {})",
                ids.len()
            )));
        }
        let msg = self.register(message);
        ids[index] = msg.id;
        self.versioning.commit(ids);
        Ok(msg)
    }

    /// Insert a message at the front. O(n) copy of the ID list.
    pub fn prepend(&self, message: Message) -> Arc<Message> {
        let msg = self.register(message);
        let mut ids = vec![msg.id];
        ids.extend(self.head_ids());
        self.versioning.commit(ids);
        msg
    }

    /// Commit a new empty version. Messages stay in the registry.
    pub fn clear(&self) {
        self.versioning.commit(Vec::new());
    }

    /// Move the head to an existing version's contents (append-only).
    /// Returns the new head version ID.
    pub fn revert_to_version(&self, version_id: u64) -> Result<u64> {
        Ok(self.versioning.revert_to(version_id)?.id)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Materialize the current contents, oldest first.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.registry
            .get_many(&self.versioning.head().message_ids)
            .expect("head version references unknown message")
    }

    /// Number of messages in the current version.
    pub fn len(&self) -> usize {
        self.versioning.head().message_ids.len()
    }

    /// Whether the current version is empty.
    pub fn is_empty(&self) -> bool {
        self.versioning.head().message_ids.is_empty()
    }

    /// The most recent message, if any.
    pub fn last(&self) -> Option<Arc<Message>> {
        let head = self.versioning.head();
        head.message_ids.last().and_then(|id| self.registry.get(*id))
    }

    /// Read-only view of messages with the given role, in log order.
    pub fn filter_by_role(&self, role: MessageRole) -> Vec<Arc<Message>> {
        self.messages()
            .into_iter()
            .filter(|m| m.role == role)
            .collect()
    }

    /// User messages, in order.
    pub fn user(&self) -> Vec<Arc<Message>> {
        self.filter_by_role(MessageRole::User)
    }

    /// Assistant messages, in order.
    pub fn assistant(&self) -> Vec<Arc<Message>> {
        self.filter_by_role(MessageRole::Assistant)
    }

    /// System messages, in order.
    pub fn system(&self) -> Vec<Arc<Message>> {
        self.filter_by_role(MessageRole::System)
    }

    /// Tool messages, in order.
    pub fn tool(&self) -> Vec<Arc<Message>> {
        self.filter_by_role(MessageRole::Tool)
    }

    /// The last assistant message together with its unanswered tool calls,
    /// when it is still pending.
    ///
    /// An assistant is pending when it carries tool calls and is either the
    /// last message or is followed only by tool messages that do not cover
    /// all of its call IDs.
    pub fn pending_tool_calls(&self) -> Option<(Arc<Message>, Vec<ToolCallRequest>)> {
        let messages = self.messages();
        let assistant_idx = messages
            .iter()
            .rposition(|m| m.role == MessageRole::Assistant)?;
        let assistant = &messages[assistant_idx];
        let calls = assistant.tool_calls.as_ref()?;
        if calls.is_empty() {
            return None;
        }

        // Only tool messages may sit between a pending assistant and the
        // end of the log; anything else means the turn moved on.
        let followers = &messages[assistant_idx + 1..];
        if followers.iter().any(|m| m.role != MessageRole::Tool) {
            return None;
        }

        let answered: HashSet<&str> = followers
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let unanswered: Vec<ToolCallRequest> = calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .cloned()
            .collect();
        if unanswered.is_empty() {
            None
        } else {
            Some((Arc::clone(assistant), unanswered))
        }
    }

    /// Advisory pairing check; returns one description per violation.
    ///
    /// Orphan tool messages and unanswered assistant calls are legal in the
    /// store (materialization repairs the latter), so this reports rather
    /// than rejects.
    pub fn validate_message_sequence(&self) -> Vec<String> {
        let messages = self.messages();
        let mut issues = Vec::new();
        let mut known_call_ids: HashSet<String> = HashSet::new();
        let mut open_calls: Vec<String> = Vec::new();

        for message in &messages {
            match message.role {
                MessageRole::Assistant => {
                    for id in open_calls.drain(..) {
                        issues.push(format!("tool call '{id}' unanswered before next assistant"));
                    }
                    if let Some(calls) = &message.tool_calls {
                        for call in calls {
                            known_call_ids.insert(call.id.clone());
                            open_calls.push(call.id.clone());
                        }
                    }
                }
                MessageRole::Tool => {
                    match message.tool_call_id.as_deref() {
                        Some(id) => {
                            if !known_call_ids.contains(id) {
                                issues.push(format!(
                                    "tool message answers unknown call '{id}'"
                                ));
                            }
                            open_calls.retain(|open| open != id);
                        }
                        None => issues.push("tool message missing tool_call_id".to_string()),
                    }
                }
                MessageRole::User => {
                    for id in open_calls.drain(..) {
                        issues.push(format!("tool call '{id}' unanswered before next user"));
                    }
                }
                MessageRole::System => {}
            }
        }
        issues
    }

    /// Render the log to the wire format, running the pairing-repair pass.
    ///
    /// For every assistant tool call not answered by a following tool
    /// message, a synthetic `{role:"tool", content:"{}"}` response is
    /// inserted before the next non-tool message. Orphan tool messages pass
    /// through untouched. The store is not mutated.
    pub fn materialize_for_llm(
        &self,
        renderer: &dyn ContentRenderer,
    ) -> Result<Vec<FormattedMessage>> {
        let messages = self.messages();
        let mut out = Vec::with_capacity(messages.len());
        let mut i = 0;

        while i < messages.len() {
            let message = &messages[i];
            out.push(message.format_for_wire(renderer)?);
            i += 1;

            let Some(calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) else {
                continue;
            };
            if message.role != MessageRole::Assistant {
                continue;
            }

            // Consume the run of tool messages answering this assistant,
            // then synthesize responses for whatever is left uncovered.
            let mut covered: HashSet<&str> = HashSet::new();
            while i < messages.len() && messages[i].role == MessageRole::Tool {
                if let Some(id) = messages[i].tool_call_id.as_deref() {
                    if let Some(call) = calls.iter().find(|c| c.id == id) {
                        covered.insert(call.id.as_str());
                    }
                }
                out.push(messages[i].format_for_wire(renderer)?);
                i += 1;
            }
            for call in calls {
                if !covered.contains(call.id.as_str()) {
                    out.push(FormattedMessage::synthetic_tool_response(call.id.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Store-level persistence snapshot: ordered message dicts plus the
    /// current version head.
    pub fn snapshot_for_storage(&self) -> Result<Value> {
        let messages: Result<Vec<Value>> = self
            .messages()
            .iter()
            .map(|m| m.serialize_for_storage())
            .collect();
        Ok(serde_json::json!({
            "version_id": self.versioning.head_id(),
            "messages": messages?,
        }))
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("len", &self.len())
            .field("version", &self.versioning.head_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::PassthroughRenderer;
    use crate::types::{FormattedContent, ToolCallRequest};
    use serde_json::json;

    fn store() -> MessageStore {
        MessageStore::new(
            Arc::new(MessageRegistry::new()),
            Arc::new(VersioningManager::new()),
        )
    }

    #[test]
    fn test_append_preserves_insertion_order() {
        let store = store();
        store.append(Message::system("sys"));
        store.append(Message::user("one"));
        store.append(Message::user("two"));

        let texts: Vec<String> = store.messages().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["sys", "one", "two"]);
        assert_eq!(store.versioning().head_id(), 3);
    }

    #[test]
    fn test_extend_commits_single_version() {
        let store = store();
        store.extend(vec![Message::user("a"), Message::user("b")]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.versioning().head_id(), 1);
    }

    #[test]
    fn test_replace_at_shares_other_ids() {
        let store = store();
        let a = store.append(Message::user("a"));
        store.append(Message::user("b"));

        store.replace_at(1, Message::user("b2")).unwrap();
        let messages = store.messages();
        assert_eq!(messages[0].id, a.id);
        assert_eq!(messages[1].text(), "b2");
    }

    #[test]
    fn test_replace_at_out_of_bounds() {
        let store = store();
        assert!(store.replace_at(0, Message::user("x")).is_err());
    }

    #[test]
    fn test_prepend_and_clear() {
        let store = store();
        store.append(Message::user("later"));
        store.prepend(Message::system("first"));
        assert_eq!(store.messages()[0].text(), "first");

        store.clear();
        assert!(store.is_empty());
        // Cleared messages stay materializable through history.
        assert_eq!(store.registry().len(), 2);
    }

    #[test]
    fn test_role_filtered_views() {
        let store = store();
        store.append(Message::system("s"));
        store.append(Message::user("u1"));
        store.append(Message::assistant("a1"));
        store.append(Message::user("u2"));

        assert_eq!(store.user().len(), 2);
        assert_eq!(store.assistant().len(), 1);
        assert_eq!(store.system().len(), 1);
        assert!(store.tool().is_empty());
    }

    #[test]
    fn test_revert_then_append_mints_new_id() {
        let store = store();
        store.append(Message::user("keep"));
        let checkpoint = store.versioning().head_id();
        let first = store.append(Message::user("again"));

        store.revert_to_version(checkpoint).unwrap();
        let second = store.append(Message::user("again"));

        assert_ne!(first.id, second.id);
        assert_eq!(first.text(), second.text());
    }

    #[test]
    fn test_pending_tool_calls_detection() {
        let store = store();
        store.append(Message::user("go"));
        store.append(Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCallRequest::new("a", "slow", json!({})),
                ToolCallRequest::new("b", "fast", json!({})),
            ],
        ));

        let (_, pending) = store.pending_tool_calls().unwrap();
        assert_eq!(pending.len(), 2);

        // Answer one call; the other remains pending.
        store.append(Message::tool("a", "slow", json!("A")));
        let (_, pending) = store.pending_tool_calls().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");

        // Answer the rest; nothing pending.
        store.append(Message::tool("b", "fast", json!("B")));
        assert!(store.pending_tool_calls().is_none());
    }

    #[test]
    fn test_pending_ignored_after_user_message() {
        let store = store();
        store.append(Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("a", "t", json!({}))],
        ));
        store.append(Message::user("moving on"));
        assert!(store.pending_tool_calls().is_none());
    }

    #[test]
    fn test_materialize_inserts_synthetic_pair() {
        // Store: Assistant(tool_calls=[a]), User("next") →
        // wire: [Assistant, Tool{"{}"}, User]; store unchanged.
        let store = store();
        store.append(Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("a", "t", json!({}))],
        ));
        store.append(Message::user("next"));

        let wire = store.materialize_for_llm(&PassthroughRenderer).unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "assistant");
        assert_eq!(wire[1].role, "tool");
        assert_eq!(wire[1].content, FormattedContent::Text("{}".to_string()));
        assert_eq!(wire[1].tool_call_id.as_deref(), Some("a"));
        assert_eq!(wire[2].role, "user");

        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_materialize_synthesizes_only_missing_pairs() {
        let store = store();
        store.append(Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCallRequest::new("a", "t", json!({})),
                ToolCallRequest::new("b", "t", json!({})),
            ],
        ));
        store.append(Message::tool("b", "t", json!("answered")));

        let wire = store.materialize_for_llm(&PassthroughRenderer).unwrap();
        // assistant, real tool(b), synthetic tool(a)
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1].tool_call_id.as_deref(), Some("b"));
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(wire[2].content, FormattedContent::Text("{}".to_string()));
    }

    #[test]
    fn test_materialize_leaves_orphan_tools_alone() {
        let store = store();
        store.append(Message::tool("ghost", "t", json!("orphan")));
        store.append(Message::user("hi"));

        let wire = store.materialize_for_llm(&PassthroughRenderer).unwrap();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "tool");
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("ghost"));
    }

    #[test]
    fn test_validate_message_sequence_reports_issues() {
        let store = store();
        store.append(Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("a", "t", json!({}))],
        ));
        store.append(Message::user("skipped the tool"));
        store.append(Message::tool("ghost", "t", json!("orphan")));

        let issues = store.validate_message_sequence();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("'a' unanswered"));
        assert!(issues[1].contains("unknown call 'ghost'"));
    }

    #[test]
    fn test_validate_clean_sequence() {
        let store = store();
        store.append(Message::user("go"));
        store.append(Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("a", "t", json!({}))],
        ));
        store.append(Message::tool("a", "t", json!("ok")));
        store.append(Message::assistant("done"));

        assert!(store.validate_message_sequence().is_empty());
    }

    #[test]
    fn test_snapshot_for_storage_roundtrip() {
        let store = store();
        store.append(Message::user("persist me"));
        let snapshot = store.snapshot_for_storage().unwrap();

        assert_eq!(snapshot["version_id"], json!(1));
        let restored = Message::from_storage(snapshot["messages"][0].clone()).unwrap();
        assert_eq!(restored.text(), "persist me");
    }
}
