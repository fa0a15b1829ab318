//! Context window assembly with escalating eviction.
//!
//! The buffer is trimmed in place until `[preamble] + buffer` fits the token
//! budget:
//!
//! 1. Round cap: keep at most `max_history_rounds * 2` entries, oldest first out.
//! 2. Stop once the estimated cost fits.
//! 3. Drop the oldest (user, assistant) pair, or the oldest entry alone when it
//!    is not a pair. When a single pair is all that is left, its answer goes
//!    and the question stays.
//! 4. A single oversized entry is cut down to its trailing characters.
//!
//! Every step strictly shrinks the buffer or its last entry, so the loop ends.

use crate::message::{Message, Role};
use crate::tokenizer::FallbackEstimator;
use parley_common::util::tail_chars;
use parley_common::MemoryConfig;
use std::sync::Arc;

/// Budgets applied when building a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBudget {
    pub max_context_tokens: usize,
    pub max_history_rounds: usize,
    pub truncate_floor_chars: usize,
}

impl Default for WindowBudget {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

impl WindowBudget {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            max_context_tokens: config.max_context_tokens,
            max_history_rounds: config.max_history_rounds,
            truncate_floor_chars: config.truncate_floor_chars,
        }
    }

    fn max_entries(&self) -> usize {
        self.max_history_rounds.max(1).saturating_mul(2)
    }
}

/// One trim applied to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// Two oldest entries dropped by the round cap.
    RoundCap,
    /// Oldest (user, assistant) pair dropped for the token budget.
    DroppedRound,
    /// Oldest single entry dropped for the token budget.
    DroppedEntry,
    /// The last remaining entry was cut to its trailing characters.
    Truncated { from_chars: usize, to_chars: usize },
}

/// Messages submitted to generation, with what it took to get there.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub evictions: Vec<Eviction>,
    pub within_budget: bool,
}

/// Builds context windows from a session buffer.
#[derive(Debug, Clone)]
pub struct ContextWindowBuilder {
    estimator: Arc<FallbackEstimator>,
    preamble: Message,
    budget: WindowBudget,
}

impl ContextWindowBuilder {
    pub fn new(
        estimator: Arc<FallbackEstimator>,
        system_prompt: impl Into<String>,
        budget: WindowBudget,
    ) -> Self {
        Self {
            estimator,
            preamble: Message::system(system_prompt),
            budget,
        }
    }

    pub fn from_config(estimator: Arc<FallbackEstimator>, config: &MemoryConfig) -> Self {
        Self::new(
            estimator,
            config.system_prompt.clone(),
            WindowBudget::from_config(config),
        )
    }

    pub fn budget(&self) -> WindowBudget {
        self.budget
    }

    pub fn estimator(&self) -> &Arc<FallbackEstimator> {
        &self.estimator
    }

    /// Trim `buffer` in place and assemble the window.
    pub fn build(&self, buffer: &mut Vec<Message>) -> ContextWindow {
        let mut evictions = Vec::new();

        let max_entries = self.budget.max_entries();
        while buffer.len() > max_entries {
            buffer.drain(..2);
            evictions.push(Eviction::RoundCap);
        }

        let preamble_tokens = self.estimator.count(&self.preamble.content);
        let mut estimated_tokens;
        loop {
            estimated_tokens = preamble_tokens + self.estimator.count_messages(buffer);
            if estimated_tokens <= self.budget.max_context_tokens {
                break;
            }

            match trim_step(buffer, self.budget.truncate_floor_chars) {
                Some(eviction @ Eviction::Truncated { .. }) => {
                    evictions.push(eviction);
                    estimated_tokens = preamble_tokens + self.estimator.count_messages(buffer);
                    break;
                }
                Some(eviction) => evictions.push(eviction),
                None => break,
            }
        }

        let within_budget = estimated_tokens <= self.budget.max_context_tokens;
        if !evictions.is_empty() {
            tracing::debug!(
                evictions = evictions.len(),
                tokens = estimated_tokens,
                remaining = buffer.len(),
                within_budget,
                "Trimmed context window"
            );
        }
        if !within_budget {
            tracing::warn!(
                tokens = estimated_tokens,
                budget = self.budget.max_context_tokens,
                "Context window still over budget after trimming"
            );
        }

        let mut messages = Vec::with_capacity(buffer.len() + 1);
        messages.push(self.preamble.clone());
        messages.extend(buffer.iter().cloned());

        ContextWindow {
            messages,
            estimated_tokens,
            evictions,
            within_budget,
        }
    }
}

/// Apply one token-budget trim to `buffer`.
///
/// Returns `None` when nothing can shrink any further.
pub fn trim_step(buffer: &mut Vec<Message>, truncate_floor_chars: usize) -> Option<Eviction> {
    match buffer.len() {
        0 => None,
        1 => {
            let entry = &mut buffer[0];
            let from_chars = entry.char_len();
            if from_chars <= truncate_floor_chars {
                return None;
            }
            entry.content = tail_chars(&entry.content, truncate_floor_chars).to_string();
            Some(Eviction::Truncated {
                from_chars,
                to_chars: entry.char_len(),
            })
        }
        len => {
            let is_round = buffer[0].role == Role::User && buffer[1].role == Role::Assistant;
            if !is_round {
                buffer.remove(0);
                Some(Eviction::DroppedEntry)
            } else if len > 2 {
                buffer.drain(..2);
                Some(Eviction::DroppedRound)
            } else {
                // a lone round keeps its question so the buffer still opens on a user turn
                buffer.truncate(1);
                Some(Eviction::DroppedEntry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn builder(max_tokens: usize, rounds: usize, floor: usize) -> ContextWindowBuilder {
        ContextWindowBuilder::new(
            Arc::new(FallbackEstimator::heuristic(1.0)),
            "sys",
            WindowBudget {
                max_context_tokens: max_tokens,
                max_history_rounds: rounds,
                truncate_floor_chars: floor,
            },
        )
    }

    /// Alternating user/assistant history ending with a pending user message.
    fn conversation(rounds: usize, len: usize) -> Vec<Message> {
        let mut buffer = Vec::new();
        for i in 0..rounds {
            buffer.push(Message::user(format!("{i:0>len$}")));
            buffer.push(Message::assistant(format!("{i:0>len$}")));
        }
        buffer.push(Message::user("x".repeat(len)));
        buffer
    }

    #[test]
    fn fits_without_trimming() {
        let mut buffer = conversation(2, 5);
        let window = builder(1000, 20, 1000).build(&mut buffer);

        assert!(window.evictions.is_empty());
        assert!(window.within_budget);
        assert_eq!(window.messages.len(), 6);
        assert_eq!(window.messages[0], Message::system("sys"));
        assert_eq!(window.estimated_tokens, 3 + 25);
    }

    #[test]
    fn round_cap_keeps_at_most_two_entries() {
        let mut buffer = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
            Message::assistant("d"),
            Message::user("e"),
            Message::assistant("f"),
        ];
        let window = builder(8000, 1, 1000).build(&mut buffer);

        assert!(buffer.len() <= 2);
        assert_eq!(buffer, vec![Message::user("e"), Message::assistant("f")]);
        assert_eq!(window.evictions, vec![Eviction::RoundCap, Eviction::RoundCap]);
    }

    #[test]
    fn round_cap_applies_even_under_budget() {
        let mut buffer = conversation(5, 1);
        let window = builder(usize::MAX, 2, 1000).build(&mut buffer);
        assert!(buffer.len() <= 4);
        assert!(window.within_budget);
        assert_eq!(buffer[0].role, Role::User);
    }

    #[test]
    fn huge_single_message_is_truncated_to_floor() {
        let mut buffer = vec![Message::user(format!("HEAD{}TAIL", "x".repeat(50_000)))];
        let window = builder(8000, 20, 1000).build(&mut buffer);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].char_len(), 1000);
        assert!(buffer[0].content.ends_with("TAIL"));
        assert!(matches!(
            window.evictions.last(),
            Some(Eviction::Truncated { to_chars: 1000, .. })
        ));
        assert!(window.within_budget);
    }

    #[test]
    fn huge_message_drops_history_first() {
        let mut buffer = conversation(3, 10);
        buffer.pop();
        buffer.push(Message::user("y".repeat(5000)));

        let window = builder(2000, 20, 1000).build(&mut buffer);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].role, Role::User);
        assert_eq!(buffer[0].char_len(), 1000);
        assert_eq!(window.messages.len(), 2);
    }

    #[test]
    fn oversized_preamble_reports_over_budget() {
        let builder = ContextWindowBuilder::new(
            Arc::new(FallbackEstimator::heuristic(1.0)),
            "p".repeat(100),
            WindowBudget {
                max_context_tokens: 50,
                max_history_rounds: 20,
                truncate_floor_chars: 10,
            },
        );
        let mut buffer = conversation(2, 20);
        let window = builder.build(&mut buffer);

        assert_eq!(buffer.len(), 1);
        assert!(buffer[0].char_len() <= 10);
        assert!(!window.within_budget);
    }

    #[test]
    fn trim_step_prefers_pairs() {
        let mut buffer = conversation(1, 1);
        assert_eq!(trim_step(&mut buffer, 10), Some(Eviction::DroppedRound));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn trim_step_lone_round_keeps_question() {
        let mut buffer = vec![Message::user("q"), Message::assistant("a")];
        assert_eq!(trim_step(&mut buffer, 10), Some(Eviction::DroppedEntry));
        assert_eq!(buffer, vec![Message::user("q")]);
    }

    #[test]
    fn lone_round_over_budget_keeps_user_turn() {
        let mut buffer = vec![
            Message::user("u".repeat(50)),
            Message::assistant("a".repeat(50)),
        ];
        let window = builder(60, 20, 1000).build(&mut buffer);

        let roles: Vec<Role> = window.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
        assert_eq!(buffer, vec![Message::user("u".repeat(50))]);
        assert!(window.within_budget);
    }

    #[test]
    fn trim_step_drops_orphan_singly() {
        let mut buffer = vec![
            Message::assistant("orphan"),
            Message::user("q"),
            Message::assistant("a"),
        ];
        assert_eq!(trim_step(&mut buffer, 10), Some(Eviction::DroppedEntry));
        assert_eq!(buffer[0].role, Role::User);
    }

    #[test]
    fn trim_step_stops_at_floor() {
        let mut buffer = vec![Message::user("short")];
        assert_eq!(trim_step(&mut buffer, 10), None);
        let mut empty = Vec::new();
        assert_eq!(trim_step(&mut empty, 10), None);
    }

    fn arb_buffer() -> impl Strategy<Value = Vec<Message>> {
        prop::collection::vec(("[a-z ]{0,300}", any::<bool>()), 0..30).prop_map(|entries| {
            entries
                .into_iter()
                .map(|(text, is_user)| {
                    if is_user {
                        Message::user(text)
                    } else {
                        Message::assistant(text)
                    }
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn build_converges(
            mut buffer in arb_buffer(),
            max_tokens in 1usize..3000,
            rounds in 1usize..10,
            floor in 1usize..500,
        ) {
            let window = builder(max_tokens, rounds, floor).build(&mut buffer);

            prop_assert!(buffer.len() <= rounds * 2);
            prop_assert_eq!(window.messages.len(), buffer.len() + 1);
            if !window.within_budget {
                // only a lone entry at the floor (or nothing) can remain over budget
                prop_assert!(buffer.len() <= 1);
                if let Some(last) = buffer.last() {
                    prop_assert!(last.char_len() <= floor);
                }
            }
        }

        #[test]
        fn trim_step_strictly_shrinks(mut buffer in arb_buffer(), floor in 1usize..200) {
            let before_len = buffer.len();
            let before_chars = buffer.last().map(Message::char_len);

            if trim_step(&mut buffer, floor).is_some() {
                let shrunk = buffer.len() < before_len
                    || buffer.last().map(Message::char_len) < before_chars;
                prop_assert!(shrunk);
            }
        }

        #[test]
        fn trims_keep_leading_user_turn(
            rounds in 1usize..8,
            len in 1usize..200,
            max_tokens in 1usize..2000,
        ) {
            // completed rounds only, no pending message
            let mut buffer = conversation(rounds, len);
            buffer.pop();
            builder(max_tokens, 20, 1000).build(&mut buffer);

            prop_assert!(!buffer.is_empty());
            prop_assert_eq!(buffer[0].role, Role::User);
            for (i, message) in buffer.iter().enumerate() {
                let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
                prop_assert_eq!(message.role, expected);
            }
        }

        #[test]
        fn trims_keep_round_alignment(
            rounds in 0usize..15,
            len in 1usize..200,
            max_tokens in 1usize..2000,
        ) {
            let mut buffer = conversation(rounds, len);
            builder(max_tokens, 20, 1000).build(&mut buffer);

            prop_assert_eq!(buffer.len() % 2, 1);
            for (i, message) in buffer.iter().enumerate() {
                let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
                prop_assert_eq!(message.role, expected);
            }
        }
    }
}
