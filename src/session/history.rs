//! Bounded conversation history.

use std::collections::VecDeque;

use crate::models::ChatMessage;

/// The last `window` turns of a conversation, oldest first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ChatMessage>,
    window: usize,
}

impl ConversationHistory {
    /// `window` is clamped to at least one turn.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            turns: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Append a turn, dropping the oldest ones beyond the window.
    pub fn push(&mut self, turn: ChatMessage) {
        self.turns.push_back(turn);
        while self.turns.len() > self.window {
            self.turns.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.turns.back()
    }
}
