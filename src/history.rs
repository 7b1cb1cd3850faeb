//! Bounded conversation history.
//!
//! Turns are kept in chronological order. When the log grows past its
//! capacity the oldest turns are dropped first. A capacity of `0` means
//! unbounded.

use serde::Serialize;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

impl HistoryTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct HistoryManager {
    turns: VecDeque<HistoryTurn>,
    max_turns: usize,
}

impl HistoryManager {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push_back(HistoryTurn::new(role, text));
        if self.max_turns > 0 {
            while self.turns.len() > self.max_turns {
                self.turns.pop_front();
            }
        }
    }

    /// Append a user turn followed by the model's answer.
    pub fn push_exchange(&mut self, user: impl Into<String>, answer: impl Into<String>) {
        self.push(Role::User, user);
        self.push(Role::Model, answer);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Chronological copy of the current turns.
    pub fn snapshot(&self) -> Vec<HistoryTurn> {
        self.turns.iter().cloned().collect()
    }

    /// Build a retrieval query from the most recent turns.
    ///
    /// Turns are taken newest first and joined with newlines until
    /// `max_chars` is reached; the oldest turn that still fits partially is
    /// truncated. An empty history yields an empty string.
    pub fn recent_query(&self, max_chars: usize) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut used = 0;

        for turn in self.turns.iter().rev() {
            let separator = usize::from(!parts.is_empty());
            let remaining = max_chars.saturating_sub(used + separator);
            if remaining == 0 {
                break;
            }

            let len = turn.text.chars().count();
            if len <= remaining {
                parts.push(turn.text.clone());
                used += separator + len;
            } else {
                parts.push(turn.text.chars().take(remaining).collect());
                break;
            }
        }

        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_keeps_latest_in_order() {
        let mut history = HistoryManager::new(4);
        for i in 0..6 {
            history.push(Role::User, format!("turn {}", i));
        }
        let texts: Vec<String> = history.snapshot().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4", "turn 5"]);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let mut history = HistoryManager::new(0);
        for i in 0..100 {
            history.push(Role::Model, i.to_string());
        }
        assert_eq!(history.len(), 100);
    }

    #[test]
    fn exchange_appends_user_then_model() {
        let mut history = HistoryManager::new(10);
        history.push_exchange("question", "answer");
        let turns = history.snapshot();
        assert_eq!(turns[0], HistoryTurn::new(Role::User, "question"));
        assert_eq!(turns[1], HistoryTurn::new(Role::Model, "answer"));
    }

    #[test]
    fn query_is_newest_first() {
        let mut history = HistoryManager::new(10);
        history.push_exchange("first", "second");
        history.push(Role::User, "third");
        assert_eq!(history.recent_query(100), "third\nsecond\nfirst");
    }

    #[test]
    fn query_truncates_oldest_included_turn() {
        let mut history = HistoryManager::new(10);
        history.push(Role::User, "abcdefghij");
        history.push(Role::Model, "12345");
        // "12345" (5) + "\n" (1) leaves 4 characters for the older turn.
        assert_eq!(history.recent_query(10), "12345\nabcd");
    }

    #[test]
    fn query_stops_when_budget_exhausted() {
        let mut history = HistoryManager::new(10);
        history.push(Role::User, "older");
        history.push(Role::Model, "12345");
        assert_eq!(history.recent_query(5), "12345");
        assert_eq!(history.recent_query(3), "123");
    }

    #[test]
    fn empty_history_empty_query() {
        assert_eq!(HistoryManager::new(4).recent_query(100), "");
    }
}
