//! Per-conversation correlation state.
//!
//! A conversation is an opaque id supplied by the client (or minted per
//! request). It carries the previous upstream response id, used as a parent
//! pointer for the next turn, and the tool-id bindings that let a
//! `tool_result` from the client find its way back to the upstream
//! `call_id`.
//!
//! Concurrency model: one mutex around the whole map, short critical
//! sections, copy-on-read snapshots handed to request handlers. The sweep
//! task rechecks idle time under the lock, so an entry touched by an
//! in-flight request never disappears out from under it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Records idle longer than this are evicted.
pub const IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One upstream/downstream identity pair for a single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinding {
    pub call_id: String,
    pub tool_use_id: String,
    pub name: String,
}

/// Bidirectional `call_id` ⇄ `tool_use_id` map. Both lookups are O(1) and
/// the pairing stays one-to-one: inserting a binding removes any stale
/// partner entries first.
#[derive(Debug, Clone, Default)]
pub struct ToolBindings {
    by_call: HashMap<String, ToolBinding>,
    call_by_tool_use: HashMap<String, String>,
}

impl ToolBindings {
    /// Insert a binding. Newer wins on collision, with a warning, since a
    /// re-issued tool call supersedes the stale identity.
    pub fn insert(&mut self, binding: ToolBinding) {
        if let Some(existing) = self.by_call.get(&binding.call_id) {
            if existing.tool_use_id != binding.tool_use_id {
                tracing::warn!(
                    call_id = %binding.call_id,
                    old = %existing.tool_use_id,
                    new = %binding.tool_use_id,
                    "tool binding collision, newer wins"
                );
                self.call_by_tool_use.remove(&existing.tool_use_id);
            }
        }
        if let Some(old_call) = self.call_by_tool_use.get(&binding.tool_use_id) {
            if *old_call != binding.call_id {
                self.by_call.remove(old_call);
            }
        }
        self.call_by_tool_use
            .insert(binding.tool_use_id.clone(), binding.call_id.clone());
        self.by_call.insert(binding.call_id.clone(), binding);
    }

    pub fn call_id_for(&self, tool_use_id: &str) -> Option<&str> {
        self.call_by_tool_use.get(tool_use_id).map(String::as_str)
    }

    pub fn tool_use_for(&self, call_id: &str) -> Option<&ToolBinding> {
        self.by_call.get(call_id)
    }

    pub fn merge(&mut self, bindings: impl IntoIterator<Item = ToolBinding>) {
        for binding in bindings {
            self.insert(binding);
        }
    }

    pub fn len(&self) -> usize {
        self.by_call.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_call.is_empty()
    }
}

/// Stored per-conversation record.
#[derive(Debug)]
struct Conversation {
    last_response_id: Option<String>,
    bindings: ToolBindings,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_accessed: Instant,
}

impl Conversation {
    fn new() -> Self {
        Self {
            last_response_id: None,
            bindings: ToolBindings::default(),
            created_at: Utc::now(),
            last_accessed: Instant::now(),
        }
    }
}

/// Copy handed to a request handler; safe to hold across await points.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub last_response_id: Option<String>,
    pub bindings: ToolBindings,
}

/// Process-wide conversation store.
#[derive(Debug, Default)]
pub struct ConversationStore {
    inner: Mutex<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fetch (creating if absent) and touch a conversation, returning a
    /// snapshot of its state.
    pub fn get_or_create(&self, id: &str) -> ConversationSnapshot {
        let mut inner = self.inner.lock().expect("conversation store poisoned");
        let record = inner
            .entry(id.to_string())
            .or_insert_with(Conversation::new);
        record.last_accessed = Instant::now();
        ConversationSnapshot {
            last_response_id: record.last_response_id.clone(),
            bindings: record.bindings.clone(),
        }
    }

    /// Refresh the idle clock without copying state.
    pub fn touch(&self, id: &str) {
        let mut inner = self.inner.lock().expect("conversation store poisoned");
        if let Some(record) = inner.get_mut(id) {
            record.last_accessed = Instant::now();
        }
    }

    /// Merge turn results into a conversation. Re-creates the record if the
    /// sweep removed it mid-flight.
    pub fn update(
        &self,
        id: &str,
        last_response_id: Option<String>,
        new_bindings: Vec<ToolBinding>,
    ) {
        let mut inner = self.inner.lock().expect("conversation store poisoned");
        let record = inner
            .entry(id.to_string())
            .or_insert_with(Conversation::new);
        if last_response_id.is_some() {
            record.last_response_id = last_response_id;
        }
        record.bindings.merge(new_bindings);
        record.last_accessed = Instant::now();
    }

    pub fn destroy(&self, id: &str) {
        let mut inner = self.inner.lock().expect("conversation store poisoned");
        inner.remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("conversation store poisoned").len()
    }

    /// Remove records idle longer than `max_idle`. Returns how many were
    /// evicted.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.lock().expect("conversation store poisoned");
        let before = inner.len();
        inner.retain(|_, record| record.last_accessed.elapsed() <= max_idle);
        let evicted = before - inner.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = inner.len(), "swept idle conversations");
        }
        evicted
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep(IDLE_TTL);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(call_id: &str, tool_use_id: &str) -> ToolBinding {
        ToolBinding {
            call_id: call_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            name: "calc".to_string(),
        }
    }

    #[test]
    fn bindings_look_up_both_directions() {
        let mut bindings = ToolBindings::default();
        bindings.insert(binding("c1", "f1"));

        assert_eq!(bindings.call_id_for("f1"), Some("c1"));
        assert_eq!(bindings.tool_use_for("c1").unwrap().tool_use_id, "f1");
        assert_eq!(bindings.call_id_for("missing"), None);
    }

    #[test]
    fn collision_newer_wins_and_stays_one_to_one() {
        let mut bindings = ToolBindings::default();
        bindings.insert(binding("c1", "f1"));
        bindings.insert(binding("c1", "f2"));

        assert_eq!(bindings.call_id_for("f2"), Some("c1"));
        assert_eq!(bindings.call_id_for("f1"), None);
        assert_eq!(bindings.len(), 1);

        // Rebinding the tool_use side drops the stale call entry too.
        bindings.insert(binding("c2", "f2"));
        assert_eq!(bindings.call_id_for("f2"), Some("c2"));
        assert!(bindings.tool_use_for("c1").is_none());
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn get_or_create_then_update_round_trips() {
        let store = ConversationStore::new();

        let snapshot = store.get_or_create("conv-a");
        assert!(snapshot.last_response_id.is_none());
        assert!(snapshot.bindings.is_empty());

        store.update(
            "conv-a",
            Some("resp_1".to_string()),
            vec![binding("c1", "f1")],
        );

        let snapshot = store.get_or_create("conv-a");
        assert_eq!(snapshot.last_response_id.as_deref(), Some("resp_1"));
        assert_eq!(snapshot.bindings.call_id_for("f1"), Some("c1"));
    }

    #[test]
    fn update_without_response_id_keeps_previous() {
        let store = ConversationStore::new();
        store.update("conv-a", Some("resp_1".to_string()), Vec::new());
        store.update("conv-a", None, vec![binding("c2", "f2")]);

        let snapshot = store.get_or_create("conv-a");
        assert_eq!(snapshot.last_response_id.as_deref(), Some("resp_1"));
        assert_eq!(snapshot.bindings.call_id_for("f2"), Some("c2"));
    }

    #[test]
    fn update_recreates_record_after_eviction() {
        let store = ConversationStore::new();
        store.get_or_create("conv-a");
        store.destroy("conv-a");
        store.update("conv-a", Some("resp_9".to_string()), Vec::new());
        assert_eq!(
            store.get_or_create("conv-a").last_response_id.as_deref(),
            Some("resp_9")
        );
    }

    #[test]
    fn sweep_evicts_only_idle_records() {
        let store = ConversationStore::new();
        store.get_or_create("stale");
        std::thread::sleep(Duration::from_millis(50));
        store.get_or_create("fresh");

        // A TTL between the two ages evicts only the stale record.
        let evicted = store.sweep(Duration::from_millis(25));
        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get_or_create("fresh").last_response_id,
            None,
            "fresh record survived the sweep"
        );
    }

    #[test]
    fn touch_resets_the_idle_clock() {
        let store = ConversationStore::new();
        store.get_or_create("a");
        std::thread::sleep(Duration::from_millis(50));
        store.touch("a");
        assert_eq!(store.sweep(Duration::from_millis(25)), 0);
    }
}
