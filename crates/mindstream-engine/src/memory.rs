use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::debug;

use mindstream_core::event::Event;
use mindstream_core::ids::SessionId;

use crate::config::RetentionPolicy;

/// Ordered event log for one session.
#[derive(Debug, Default)]
struct SessionMemory {
    events: VecDeque<Event>,
    bytes: usize,
}

impl SessionMemory {
    fn append(&mut self, events: Vec<Event>, policy: &RetentionPolicy) -> usize {
        for event in events {
            self.bytes += event.approx_bytes();
            self.events.push_back(event);
        }

        let mut evicted = 0;
        while self.events.len() > 1
            && (self.events.len() > policy.max_events || self.bytes > policy.max_bytes)
        {
            if let Some(old) = self.events.pop_front() {
                self.bytes = self.bytes.saturating_sub(old.approx_bytes());
                evicted += 1;
            }
        }
        evicted
    }
}

/// Process-lifetime memory for every session, keyed by session id.
///
/// A session's log is created on its first commit. Each agent call commits
/// once, so concurrent readers never observe a half-written turn.
pub struct MemoryStore {
    sessions: DashMap<SessionId, SessionMemory>,
    policy: RetentionPolicy,
}

impl MemoryStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Copy of the session's events, oldest first. Empty for unknown sessions.
    pub fn snapshot(&self, session_id: &SessionId) -> Vec<Event> {
        self.sessions
            .get(session_id)
            .map(|m| m.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append `events` in one step, then apply retention. Returns how many
    /// old events were evicted.
    pub fn commit(&self, session_id: &SessionId, events: Vec<Event>) -> usize {
        if events.is_empty() {
            return 0;
        }
        let mut memory = self.sessions.entry(session_id.clone()).or_default();
        let evicted = memory.append(events, &self.policy);
        if evicted > 0 {
            debug!(
                session_id = %session_id,
                evicted,
                retained = memory.events.len(),
                "memory retention evicted events"
            );
        }
        evicted
    }

    pub fn len(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |m| m.events.len())
    }

    pub fn is_empty(&self, session_id: &SessionId) -> bool {
        self.len(session_id) == 0
    }

    /// Drop a session's memory, returning what it held.
    pub fn remove(&self, session_id: &SessionId) -> Option<Vec<Event>> {
        self.sessions
            .remove(session_id)
            .map(|(_, m)| m.events.into_iter().collect())
    }

    /// Known session ids, sorted.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}
