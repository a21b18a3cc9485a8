//! Lineage resolution: "current" pointers and linked-answer expansion.
//!
//! Answers point at the intent and problem they were recorded under. The
//! resolver turns those pointers into concrete answer sets, optionally
//! limited to one cycle.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageResult;
use crate::situations::{DEFINING_INTENT, INTENT_MARKER, PROBLEM_MARKER, SELECTING_PROBLEM};
use crate::storage::{Answer, AnswerStore, Cycle, SqliteStore};

/// Which linkage column to expand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum LineageKey {
    /// Answers recorded under this intent.
    Intent(i64),
    /// Answers recorded under this problem.
    Problem(i64),
}

/// A completed cycle together with everything recorded in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: Cycle,
    /// Answers in recording order.
    pub answers: Vec<Answer>,
}

/// Resolves current intent/problem/cycle and expands lineage links.
#[derive(Clone)]
pub struct LineageResolver {
    storage: SqliteStore,
}

impl LineageResolver {
    pub fn new(storage: SqliteStore) -> Self {
        Self { storage }
    }

    /// Most recent intent answer, if any.
    pub async fn current_intent_id(&self) -> StorageResult<Option<i64>> {
        Ok(self
            .storage
            .latest_marked_answer(DEFINING_INTENT, INTENT_MARKER)
            .await?
            .map(|a| a.id))
    }

    /// Most recent problem answer, if any.
    pub async fn current_problem_id(&self) -> StorageResult<Option<i64>> {
        Ok(self
            .storage
            .latest_marked_answer(SELECTING_PROBLEM, PROBLEM_MARKER)
            .await?
            .map(|a| a.id))
    }

    /// The active cycle's id, if any.
    pub async fn current_cycle_id(&self) -> StorageResult<Option<i64>> {
        Ok(self.storage.active_cycle().await?.map(|c| c.id))
    }

    /// All answers linked to `key`, oldest first.
    ///
    /// With a cycle filter each candidate is re-checked against the
    /// per-situation answers of that cycle instead of trusting the linked
    /// row alone, which keeps rows written before cycles existed out.
    pub async fn expand(
        &self,
        key: LineageKey,
        cycle_filter: Option<i64>,
    ) -> StorageResult<Vec<Answer>> {
        let candidates = match key {
            LineageKey::Intent(id) => self.storage.answers_by_intent(id).await?,
            LineageKey::Problem(id) => self.storage.answers_by_problem(id).await?,
        };

        let Some(cycle_id) = cycle_filter else {
            return Ok(candidates);
        };

        let mut members: HashMap<String, HashSet<i64>> = HashMap::new();
        let mut kept = Vec::with_capacity(candidates.len());
        for answer in candidates {
            if !members.contains_key(&answer.situation) {
                let ids = self
                    .storage
                    .answers_by_situation(&answer.situation, Some(cycle_id))
                    .await?
                    .into_iter()
                    .map(|a| a.id)
                    .collect();
                members.insert(answer.situation.clone(), ids);
            }
            if members
                .get(&answer.situation)
                .map_or(false, |ids| ids.contains(&answer.id))
            {
                kept.push(answer);
            }
        }

        debug!(key = ?key, cycle_id, kept = kept.len(), "Expanded lineage");
        Ok(kept)
    }

    /// Whether an answer belongs to a cycle, checked the same way `expand` filters.
    pub async fn is_in_cycle(&self, answer: &Answer, cycle_id: i64) -> StorageResult<bool> {
        Ok(self
            .storage
            .answers_by_situation(&answer.situation, Some(cycle_id))
            .await?
            .iter()
            .any(|a| a.id == answer.id))
    }

    /// Highest-numbered completed cycle with its full answer dump.
    pub async fn previous_completed_cycle(&self) -> StorageResult<Option<CycleSummary>> {
        let Some(cycle) = self.storage.latest_completed_cycle().await? else {
            return Ok(None);
        };
        let answers = self.storage.answers_by_cycle(cycle.id).await?;
        Ok(Some(CycleSummary { cycle, answers }))
    }
}
