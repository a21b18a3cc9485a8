//! Ordered merge passes that assemble the flat prompt context.
//!
//! Each pass contributes key/value entries under a policy. Passes are applied
//! in order; a key written by a locking pass is never touched again.

use std::collections::{BTreeMap, HashSet};

use crate::storage::CyclePick;

/// Flat key -> text mapping consumed by template substitution.
///
/// Ordered so that serializing the same context twice is byte-identical.
pub type PromptContext = BTreeMap<String, String>;

/// How a pass treats keys that already have a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Replace earlier values.
    Overwrite,
    /// Replace earlier values and protect the key from later passes.
    OverwriteAndLock,
    /// Only set keys nothing has set yet.
    FillIfAbsent,
}

/// One named set of entries merged under a single policy.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePass {
    pub name: &'static str,
    pub policy: MergePolicy,
    pub entries: Vec<(String, String)>,
}

impl MergePass {
    pub fn new(name: &'static str, policy: MergePolicy) -> Self {
        Self {
            name,
            policy,
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Apply passes in order.
pub fn merge_passes(passes: &[MergePass]) -> PromptContext {
    let mut context = PromptContext::new();
    let mut locked: HashSet<&str> = HashSet::new();

    for pass in passes {
        for (key, value) in &pass.entries {
            if locked.contains(key.as_str()) {
                continue;
            }
            match pass.policy {
                MergePolicy::Overwrite => {
                    context.insert(key.clone(), value.clone());
                }
                MergePolicy::OverwriteAndLock => {
                    context.insert(key.clone(), value.clone());
                    locked.insert(key.as_str());
                }
                MergePolicy::FillIfAbsent => {
                    context.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }

    context
}

/// A single value is used bare; several become a 1-based numbered list
/// separated by blank lines.
pub fn join_answers<S: AsRef<str>>(values: &[S]) -> String {
    match values {
        [] => String::new(),
        [single] => single.as_ref().to_string(),
        many => many
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{}. {}", i + 1, v.as_ref()))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// `[situation] text` blocks separated by blank lines.
pub fn format_picks(picks: &[CyclePick]) -> String {
    picks
        .iter()
        .map(|p| format!("[{}] {}", p.situation, p.answer_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}
