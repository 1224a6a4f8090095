use std::collections::HashMap;

use shared::{
    domain::{MessageId, UserId},
    protocol::Reaction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionChange {
    Added(Reaction),
    Replaced { previous: String, reaction: Reaction },
    Removed(Reaction),
}

/// At most one reaction per (message, user). A different value replaces the old one,
/// repeating the current value takes it back.
#[derive(Debug, Default)]
pub struct ReactionBook {
    by_message: HashMap<MessageId, Vec<Reaction>>,
}

impl ReactionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, message_id: &MessageId, user_id: &UserId, reaction: &str) -> ReactionChange {
        let next = Reaction {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            reaction: reaction.to_string(),
        };
        match self.current(message_id, user_id) {
            Some(existing) if existing.reaction == reaction => ReactionChange::Removed(next),
            Some(existing) => ReactionChange::Replaced {
                previous: existing.reaction.clone(),
                reaction: next,
            },
            None => ReactionChange::Added(next),
        }
    }

    pub fn apply(&mut self, change: &ReactionChange) {
        match change {
            ReactionChange::Added(reaction) | ReactionChange::Replaced { reaction, .. } => {
                let entries = self.by_message.entry(reaction.message_id.clone()).or_default();
                entries.retain(|r| r.user_id != reaction.user_id);
                entries.push(reaction.clone());
            }
            ReactionChange::Removed(reaction) => {
                if let Some(entries) = self.by_message.get_mut(&reaction.message_id) {
                    entries.retain(|r| r.user_id != reaction.user_id);
                    if entries.is_empty() {
                        self.by_message.remove(&reaction.message_id);
                    }
                }
            }
        }
    }

    pub fn reactions(&self, message_id: &MessageId) -> &[Reaction] {
        self.by_message
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn current(&self, message_id: &MessageId, user_id: &UserId) -> Option<&Reaction> {
        self.reactions(message_id)
            .iter()
            .find(|r| &r.user_id == user_id)
    }
}
