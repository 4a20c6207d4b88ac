//! Choosing where a compression round cuts the active history
use crate::error::{ContextError, Result};
use crate::memory_db::{Message, Role};
use tracing::debug;

/// Where to cut, plus the numbers that led there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPoint {
    /// Messages `[0, index)` are compressed, `[index, len)` kept verbatim.
    pub index: usize,
    pub total_tokens: i64,
    pub target_preserve: i64,
    pub preserved_tokens: i64,
}

impl SplitPoint {
    pub fn compressed_tokens(&self) -> i64 {
        self.total_tokens - self.preserved_tokens
    }
}

/// Scan backwards until the tail would reach `floor(total * preserve_ratio)`
/// tokens, then snap the cut to just after an assistant turn.
///
/// A candidate that is an assistant message is cut right after itself. Any
/// other candidate (user or an earlier summary) falls back to the nearest
/// assistant message before it; if there is none the round cannot proceed.
pub fn find_split_point(messages: &[Message], preserve_ratio: f64) -> Result<SplitPoint> {
    if messages.is_empty() {
        return Err(ContextError::EmptyMessages);
    }

    let total_tokens: i64 = messages.iter().map(|m| m.token_count).sum();
    let target_preserve = (total_tokens as f64 * preserve_ratio).floor() as i64;

    let mut accumulated = 0i64;
    let mut candidate = None;
    for (i, msg) in messages.iter().enumerate().rev() {
        if accumulated + msg.token_count >= target_preserve {
            candidate = Some(i);
            break;
        }
        accumulated += msg.token_count;
    }
    let candidate = candidate.ok_or(ContextError::BoundaryNotFound)?;

    let index = if messages[candidate].role == Role::Assistant {
        candidate + 1
    } else {
        let assistant = messages[..candidate]
            .iter()
            .rposition(|m| m.role == Role::Assistant)
            .ok_or(ContextError::BoundaryNotFound)?;
        assistant + 1
    };

    if index == 0 || index >= messages.len() {
        return Err(ContextError::InvalidSplit { index, len: messages.len() });
    }

    let preserved_tokens: i64 = messages[index..].iter().map(|m| m.token_count).sum();
    debug!(
        "Split at {} of {} (candidate {}, preserve {}/{} tokens, target {})",
        index,
        messages.len(),
        candidate,
        preserved_tokens,
        total_tokens,
        target_preserve
    );

    Ok(SplitPoint {
        index,
        total_tokens,
        target_preserve,
        preserved_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn history(spec: &[(Role, i64)]) -> Vec<Message> {
        spec.iter()
            .enumerate()
            .map(|(i, (role, tokens))| {
                let mut m = Message::new_turn("s", *role, "x", *tokens);
                m.sequence_number = Some(i as i64);
                m
            })
            .collect()
    }

    fn alternating(n: usize, tokens: i64) -> Vec<Message> {
        let spec: Vec<_> = (0..n)
            .map(|i| (if i % 2 == 0 { Role::User } else { Role::Assistant }, tokens))
            .collect();
        history(&spec)
    }

    #[test]
    fn test_user_candidate_snaps_to_prior_assistant() {
        // target 18: the tail reaches it at index 4 (user), so cut after index 3
        let split = find_split_point(&alternating(6, 10), 0.3).unwrap();
        assert_eq!(split.index, 4);
        assert_eq!(split.target_preserve, 18);
        assert_eq!(split.preserved_tokens, 20);
        assert_eq!(split.compressed_tokens(), 40);
    }

    #[test]
    fn test_assistant_candidate_cuts_after_itself() {
        let msgs = history(&[
            (Role::User, 10),
            (Role::Assistant, 10),
            (Role::User, 10),
            (Role::Assistant, 50),
            (Role::User, 5),
            (Role::Assistant, 5),
        ]);
        // total 90, target 27; index 3 is the first to reach it
        let split = find_split_point(&msgs, 0.3).unwrap();
        assert_eq!(split.index, 4);
        assert_eq!(split.preserved_tokens, 10);
    }

    #[test]
    fn test_large_session_scenario() {
        let mut spec: Vec<_> = (0..6)
            .map(|i| (if i % 2 == 0 { Role::User } else { Role::Assistant }, 15_000))
            .collect();
        spec.push((Role::Assistant, 5_000));
        let split = find_split_point(&history(&spec), 0.3).unwrap();
        assert_eq!(split.total_tokens, 95_000);
        assert_eq!(split.target_preserve, 28_500);
        assert_eq!(split.index, 4);
        assert_eq!(split.compressed_tokens(), 60_000);
    }

    #[test]
    fn test_summary_candidate_is_treated_like_user() {
        let msgs = history(&[
            (Role::CompressionSummary, 10),
            (Role::User, 10),
            (Role::Assistant, 10),
            (Role::User, 10),
            (Role::Assistant, 10),
        ]);
        // target 15, candidate index 3 (user) -> cut after index 2
        let split = find_split_point(&msgs, 0.3).unwrap();
        assert_eq!(split.index, 3);
    }

    #[test]
    fn test_no_assistant_before_candidate() {
        let msgs = history(&[(Role::User, 10), (Role::User, 10), (Role::User, 10)]);
        assert!(matches!(
            find_split_point(&msgs, 0.3),
            Err(ContextError::BoundaryNotFound)
        ));
    }

    #[test]
    fn test_cut_that_preserves_nothing_is_rejected() {
        // The last message alone reaches the target and it is an assistant turn.
        let msgs = history(&[(Role::User, 1), (Role::Assistant, 100)]);
        assert!(matches!(
            find_split_point(&msgs, 0.3),
            Err(ContextError::InvalidSplit { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(find_split_point(&[], 0.3), Err(ContextError::EmptyMessages)));
    }

    fn arb_history() -> impl Strategy<Value = Vec<Message>> {
        prop::collection::vec((any::<bool>(), 0i64..5_000), 1..40).prop_map(|items| {
            let spec: Vec<_> = items
                .into_iter()
                .map(|(is_user, tokens)| (if is_user { Role::User } else { Role::Assistant }, tokens))
                .collect();
            history(&spec)
        })
    }

    proptest! {
        #[test]
        fn prop_cut_always_follows_an_assistant_turn(msgs in arb_history(), ratio in 0.05f64..0.95) {
            if let Ok(split) = find_split_point(&msgs, ratio) {
                prop_assert!(split.index > 0 && split.index < msgs.len());
                prop_assert_eq!(msgs[split.index - 1].role, Role::Assistant);
                let kept: i64 = msgs[split.index..].iter().map(|m| m.token_count).sum();
                prop_assert_eq!(kept, split.preserved_tokens);
                prop_assert_eq!(split.compressed_tokens() + kept, split.total_tokens);
            }
        }
    }
}
