//! Ordered, deduplicated per-conversation message cache read by the rendering layer.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ConversationKey, MessageId},
    protocol::ChatMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Unchanged,
    Appended,
    Replaced { position: usize },
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<ChatMessage>,
    /// Confirmed id -> store revision it was applied at.
    confirmed: HashMap<MessageId, u64>,
}

impl ConversationLog {
    fn contains(&self, id: &MessageId) -> bool {
        if id.is_temporary() {
            self.messages.iter().any(|m| &m.id == id)
        } else {
            self.confirmed.contains_key(id)
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationKey, ConversationLog>,
    revision: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every mutation. Capture it before issuing a refetch and hand it
    /// to [`MessageStore::replace_history`].
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains_confirmed(&self, key: &ConversationKey, id: &MessageId) -> bool {
        self.conversations
            .get(key)
            .is_some_and(|log| log.confirmed.contains_key(id))
    }

    /// Inserts at the tail unless a message with the same id is already present.
    pub fn append(&mut self, message: ChatMessage) -> StoreOutcome {
        let log = self
            .conversations
            .entry(message.conversation_key())
            .or_default();
        if log.contains(&message.id) {
            return StoreOutcome::Unchanged;
        }
        self.revision += 1;
        if !message.is_temporary() {
            log.confirmed.insert(message.id.clone(), self.revision);
        }
        log.messages.push(message);
        StoreOutcome::Appended
    }

    /// Overwrites the newest temporary message accepted by `matches` in place,
    /// or appends `confirmed` when nothing matches.
    pub fn replace_optimistic<F>(&mut self, confirmed: ChatMessage, matches: F) -> StoreOutcome
    where
        F: Fn(&ChatMessage) -> bool,
    {
        let log = self
            .conversations
            .entry(confirmed.conversation_key())
            .or_default();
        if log.contains(&confirmed.id) {
            return StoreOutcome::Unchanged;
        }

        let position = log
            .messages
            .iter()
            .rposition(|candidate| candidate.is_temporary() && matches(candidate));
        match position {
            Some(position) if !confirmed.is_temporary() => {
                self.revision += 1;
                log.confirmed.insert(confirmed.id.clone(), self.revision);
                log.messages[position] = confirmed;
                StoreOutcome::Replaced { position }
            }
            _ => self.append(confirmed),
        }
    }

    /// Drops a still-unconfirmed message; confirmed messages are never removed here.
    pub fn remove_temporary(&mut self, key: &ConversationKey, id: &MessageId) -> Option<ChatMessage> {
        if !id.is_temporary() {
            return None;
        }
        let log = self.conversations.get_mut(key)?;
        let position = log.messages.iter().position(|m| &m.id == id)?;
        self.revision += 1;
        Some(log.messages.remove(position))
    }

    /// Installs a server refetch whose request was issued at revision `since`.
    ///
    /// Confirmed messages the snapshot lacks are dropped only if they were applied
    /// at or before `since`; anything applied later is newer than the snapshot and
    /// stays, after the refetched list. Temporary entries the refetch newly
    /// confirmed (per `matches(temporary, confirmed)`) are dropped and the rest
    /// stay at the tail.
    pub fn replace_history<F>(
        &mut self,
        key: &ConversationKey,
        history: Vec<ChatMessage>,
        since: u64,
        matches: F,
    ) -> bool
    where
        F: Fn(&ChatMessage, &ChatMessage) -> bool,
    {
        let stamp = self.revision + 1;
        let log = self.conversations.entry(key.clone()).or_default();
        let previous = std::mem::take(&mut log.messages);
        let previously_confirmed = std::mem::take(&mut log.confirmed);
        let listed: HashSet<&MessageId> = history.iter().map(|m| &m.id).collect();

        let mut pending = Vec::new();
        let mut newer = Vec::new();
        for message in &previous {
            if message.is_temporary() {
                pending.push(message.clone());
            } else if !listed.contains(&message.id)
                && previously_confirmed
                    .get(&message.id)
                    .is_some_and(|applied| *applied > since)
            {
                newer.push(message.clone());
            }
        }
        drop(listed);

        let mut messages = Vec::with_capacity(history.len() + newer.len() + pending.len());
        for message in history {
            if message.is_temporary()
                || &message.conversation_key() != key
                || log.confirmed.contains_key(&message.id)
            {
                continue;
            }
            let applied = match previously_confirmed.get(&message.id) {
                Some(applied) => *applied,
                None => {
                    if let Some(position) = pending.iter().position(|temp| matches(temp, &message)) {
                        pending.remove(position);
                    }
                    stamp
                }
            };
            log.confirmed.insert(message.id.clone(), applied);
            messages.push(message);
        }
        for message in newer {
            if let Some(applied) = previously_confirmed.get(&message.id) {
                log.confirmed.insert(message.id.clone(), *applied);
            }
            messages.push(message);
        }
        messages.extend(pending);

        let changed = messages != previous;
        log.messages = messages;
        if changed {
            self.revision = stamp;
        }
        changed
    }

    pub fn get(&self, key: &ConversationKey) -> &[ChatMessage] {
        self.conversations
            .get(key)
            .map(|log| log.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn pending_count(&self, key: &ConversationKey) -> usize {
        self.get(key).iter().filter(|m| m.is_temporary()).count()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
