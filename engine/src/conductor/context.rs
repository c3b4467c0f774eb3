//! Context Assembler
//!
//! Packs stage instructions and the material a stage wants the reasoner to see
//! (plan JSON, catalog summary, critique history, partial results) into a
//! bounded prompt. Also home to the run-scoped id generator.

use crate::reasoner::Message;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rough characters-per-token ratio used for budgeting
const CHARS_PER_TOKEN: usize = 4;

const TRUNCATION_MARKER: &str = "\n[... truncated ...]";

/// Builds reasoner conversations within a token budget
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_tokens: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(6000)
    }
}

impl ContextAssembler {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Assemble a system message (instructions followed by titled sections)
    /// and a final user message.
    ///
    /// Instructions and the query are always kept whole. Sections are added in
    /// order; the first one that does not fit is truncated and the rest are
    /// dropped.
    pub fn assemble(
        &self,
        system_instructions: &str,
        sections: &[(&str, String)],
        query: &str,
    ) -> Vec<Message> {
        let budget = self.max_tokens * CHARS_PER_TOKEN;
        let mut remaining = budget.saturating_sub(system_instructions.len() + query.len());

        let mut sys_prompt = String::with_capacity(budget.min(64 * 1024));
        sys_prompt.push_str(system_instructions);

        for (title, body) in sections {
            if body.trim().is_empty() {
                continue;
            }
            let header = format!("\n\n--- {} ---\n", title);
            if remaining <= header.len() + TRUNCATION_MARKER.len() {
                tracing::debug!(section = *title, "Context budget exhausted, dropping section");
                break;
            }
            remaining -= header.len();
            sys_prompt.push_str(&header);

            if body.len() <= remaining {
                sys_prompt.push_str(body);
                remaining -= body.len();
            } else {
                let keep = floor_char_boundary(body, remaining - TRUNCATION_MARKER.len());
                sys_prompt.push_str(&body[..keep]);
                sys_prompt.push_str(TRUNCATION_MARKER);
                remaining = 0;
            }
        }

        vec![Message::system(sys_prompt), Message::user(query)]
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Identifier source scoped to one run.
///
/// Passed explicitly into every stage that mints ids, so two conductors in the
/// same process never share a counter.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering after `start` (used when resuming a saved session)
    pub fn starting_at(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Make sure later ids number above `n`
    pub fn advance_past(&self, n: u64) {
        self.counter.fetch_max(n, Ordering::Relaxed);
    }

    /// Next id with the given prefix, e.g. `q-3`
    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::MessageRole;

    #[test]
    fn test_assemble_includes_sections() {
        let assembler = ContextAssembler::new(1000);
        let messages = assembler.assemble(
            "You are the plan critic.",
            &[("Plan", "{\"steps\": []}".to_string()), ("Empty", "  ".to_string())],
            "Critique this plan.",
        );

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert!(messages[0].content.contains("--- Plan ---"));
        assert!(!messages[0].content.contains("--- Empty ---"));
        assert_eq!(messages[1].role, MessageRole::User);
        assert_eq!(messages[1].content, "Critique this plan.");
    }

    #[test]
    fn test_assemble_truncates_to_budget() {
        let assembler = ContextAssembler::new(50);
        let big = "x".repeat(10_000);
        let messages = assembler.assemble(
            "sys",
            &[("Big", big), ("Dropped", "later".to_string())],
            "q",
        );

        let content = &messages[0].content;
        assert!(content.len() <= 50 * CHARS_PER_TOKEN);
        assert!(content.ends_with("[... truncated ...]"));
        assert!(!content.contains("Dropped"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let assembler = ContextAssembler::new(20);
        let body = "é".repeat(200);
        let messages = assembler.assemble("s", &[("Accents", body)], "q");
        assert!(messages[0].content.contains("truncated"));
    }

    #[test]
    fn test_id_generator_is_sequential_and_scoped() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next("q"), "q-1");
        assert_eq!(ids.next("q"), "q-2");
        assert_eq!(ids.next("step"), "step-3");

        let other = IdGenerator::new();
        assert_eq!(other.next("q"), "q-1");

        let resumed = IdGenerator::starting_at(5);
        assert_eq!(resumed.next("q"), "q-6");

        resumed.advance_past(3);
        assert_eq!(resumed.next("q"), "q-7");
        resumed.advance_past(10);
        assert_eq!(resumed.next("q"), "q-11");
    }
}
