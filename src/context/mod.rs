//! Prompt context aggregation.
//!
//! Builds the flat mapping handed to template substitution. The result is a
//! fixed sequence of merge passes, lowest precedence first:
//!
//! 1. lineage groups (intent, problem and answers linked to them)
//! 2. every answer per question id across the situation catalog
//! 3. the selected problem and its acceptance criteria (locked)
//! 4. `selectedContext` from cross-cycle picks (locked)
//! 5. carry-forward from the previous completed cycle (fill if absent)
//! 6. request metadata (fill if absent)
//!
//! Boolean answers never reach the context.

mod merge;

pub use merge::*;

use std::collections::HashMap;

use tracing::debug;

use crate::error::StorageResult;
use crate::lineage::{LineageKey, LineageResolver};
use crate::situations::{
    COLLECTING_FEEDBACK, DEFINING_ACCEPTANCE_CRITERIA, DEFINING_INTENT, DESIGNING,
    EMPTINESS_PROBE, IMPLEMENTING, INTENT_MARKER, LEARNING, PROBLEM_MARKER, SELECTING_PROBLEM,
    SITUATION_CATALOG,
};
use crate::storage::{Answer, AnswerStore, SqliteStore};

/// Key under which picked cross-cycle answers are exposed.
pub const SELECTED_CONTEXT_KEY: &str = "selectedContext";

/// Situations whose lineage-linked answers are grouped under a context key.
pub const LINEAGE_GROUPS: [(&str, &str); 5] = [
    (DESIGNING, "design"),
    (DEFINING_ACCEPTANCE_CRITERIA, "acceptanceCriteria"),
    (IMPLEMENTING, "implementation"),
    (COLLECTING_FEEDBACK, "feedback"),
    (LEARNING, "improvements"),
];

fn prose(answers: impl IntoIterator<Item = Answer>) -> Vec<Answer> {
    answers.into_iter().filter(|a| !a.is_boolean()).collect()
}

fn values(answers: &[Answer]) -> Vec<&str> {
    answers.iter().map(|a| a.value.as_str()).collect()
}

/// Assembles answers into the flat prompt context.
#[derive(Clone)]
pub struct ContextAggregator {
    storage: SqliteStore,
    lineage: LineageResolver,
}

impl ContextAggregator {
    pub fn new(storage: SqliteStore) -> Self {
        let lineage = LineageResolver::new(storage.clone());
        Self { storage, lineage }
    }

    /// Build the context for `situation`.
    ///
    /// `problem_id` narrows problem-specific keys; `cycle_id` pins the cycle
    /// instead of resolving it from the active one.
    pub async fn build_prompt_context(
        &self,
        situation: &str,
        problem_id: Option<i64>,
        cycle_id: Option<i64>,
    ) -> StorageResult<PromptContext> {
        let effective = self.effective_cycle_id(cycle_id).await?;

        let passes = vec![
            self.lineage_pass(effective).await?,
            self.situation_pass(effective).await?,
            self.problem_pass(problem_id, effective).await?,
            self.selected_context_pass().await?,
            self.carry_forward_pass(effective).await?,
            self.metadata_pass(situation, effective).await?,
        ];

        let context = merge_passes(&passes);
        debug!(
            situation = %situation,
            effective_cycle = ?effective,
            keys = context.len(),
            "Built prompt context"
        );
        Ok(context)
    }

    /// Cycle whose answers feed the context.
    ///
    /// An explicit cycle wins. Otherwise the active cycle, unless it has
    /// nothing in the probe situations yet, in which case the most recent
    /// completed cycle stands in for it.
    pub async fn effective_cycle_id(&self, explicit: Option<i64>) -> StorageResult<Option<i64>> {
        if explicit.is_some() {
            return Ok(explicit);
        }

        let previous = self.storage.latest_completed_cycle().await?.map(|c| c.id);
        let Some(active) = self.storage.active_cycle().await? else {
            return Ok(previous);
        };

        if self.has_probe_data(active.id).await? {
            return Ok(Some(active.id));
        }
        Ok(previous.or(Some(active.id)))
    }

    async fn has_probe_data(&self, cycle_id: i64) -> StorageResult<bool> {
        for situation in EMPTINESS_PROBE {
            if !self
                .storage
                .answers_by_situation(situation, Some(cycle_id))
                .await?
                .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The current marked answer if it is in scope, else the latest marked
    /// answer inside the scope.
    async fn scoped_marked_answer(
        &self,
        current: Option<i64>,
        situation: &str,
        marker: &str,
        cycle_id: Option<i64>,
    ) -> StorageResult<Option<Answer>> {
        if let Some(id) = current {
            if let Some(answer) = self.storage.get_answer(id).await? {
                let in_scope = match cycle_id {
                    Some(c) => self.lineage.is_in_cycle(&answer, c).await?,
                    None => true,
                };
                if in_scope && !answer.is_boolean() {
                    return Ok(Some(answer));
                }
            }
        }

        Ok(self
            .storage
            .answers_by_situation(situation, cycle_id)
            .await?
            .into_iter()
            .find(|a| a.question_id.contains(marker) && !a.is_boolean()))
    }

    async fn lineage_pass(&self, cycle_id: Option<i64>) -> StorageResult<MergePass> {
        let mut pass = MergePass::new("lineage", MergePolicy::Overwrite);

        let intent = self
            .scoped_marked_answer(
                self.lineage.current_intent_id().await?,
                DEFINING_INTENT,
                INTENT_MARKER,
                cycle_id,
            )
            .await?;
        let problem = self
            .scoped_marked_answer(
                self.lineage.current_problem_id().await?,
                SELECTING_PROBLEM,
                PROBLEM_MARKER,
                cycle_id,
            )
            .await?;

        if let Some(intent) = &intent {
            pass.push("intent", intent.value.clone());
        }
        if let Some(problem) = &problem {
            pass.push("problem", problem.value.clone());
        }

        let key = match (&problem, &intent) {
            (Some(p), _) => LineageKey::Problem(p.id),
            (None, Some(i)) => LineageKey::Intent(i.id),
            (None, None) => return Ok(pass),
        };
        let linked = prose(self.lineage.expand(key, cycle_id).await?);

        for (situation, context_key) in LINEAGE_GROUPS {
            let group: Vec<&str> = linked
                .iter()
                .filter(|a| a.situation == situation)
                .map(|a| a.value.as_str())
                .collect();
            if !group.is_empty() {
                pass.push(context_key, join_answers(&group));
            }
        }

        Ok(pass)
    }

    async fn situation_pass(&self, cycle_id: Option<i64>) -> StorageResult<MergePass> {
        let mut pass = MergePass::new("situations", MergePolicy::Overwrite);

        let mut order: Vec<String> = Vec::new();
        let mut by_question: HashMap<String, Vec<Answer>> = HashMap::new();
        for situation in SITUATION_CATALOG {
            let answers = prose(self.storage.answers_by_situation(situation, cycle_id).await?);
            for answer in answers {
                if !by_question.contains_key(&answer.question_id) {
                    order.push(answer.question_id.clone());
                }
                by_question
                    .entry(answer.question_id.clone())
                    .or_default()
                    .push(answer);
            }
        }

        for question_id in order {
            let mut answers = by_question.remove(&question_id).unwrap_or_default();
            answers.sort_by(|a, b| a.answered_at.cmp(&b.answered_at).then(a.id.cmp(&b.id)));
            pass.push(question_id, join_answers(&values(&answers)));
        }

        Ok(pass)
    }

    async fn problem_pass(
        &self,
        explicit: Option<i64>,
        cycle_id: Option<i64>,
    ) -> StorageResult<MergePass> {
        let mut pass = MergePass::new("selected-problem", MergePolicy::OverwriteAndLock);

        let problem_id = match explicit {
            Some(id) => Some(id),
            None => self.lineage.current_problem_id().await?,
        };
        let Some(problem_id) = problem_id else {
            return Ok(pass);
        };

        if let Some(problem) = self.storage.get_answer(problem_id).await? {
            if !problem.is_boolean() {
                pass.push("problem", problem.value);
            }
        }

        let mut criteria: Vec<Answer> = prose(
            self.lineage
                .expand(LineageKey::Problem(problem_id), cycle_id)
                .await?,
        )
        .into_iter()
        .filter(|a| a.situation == DEFINING_ACCEPTANCE_CRITERIA)
        .collect();

        if criteria.is_empty() {
            let mut all = prose(
                self.storage
                    .answers_by_situation(DEFINING_ACCEPTANCE_CRITERIA, cycle_id)
                    .await?,
            );
            all.reverse();
            criteria = all;
        }

        if !criteria.is_empty() {
            pass.push("acceptanceCriteria", join_answers(&values(&criteria)));
        }

        Ok(pass)
    }

    async fn selected_context_pass(&self) -> StorageResult<MergePass> {
        let picks = match self.storage.active_cycle().await? {
            Some(cycle) => self.storage.cycle_picks(cycle.id).await?,
            None => Vec::new(),
        };
        Ok(
            MergePass::new("selected-context", MergePolicy::OverwriteAndLock)
                .with_entry(SELECTED_CONTEXT_KEY, format_picks(&picks)),
        )
    }

    async fn carry_forward_pass(&self, cycle_id: Option<i64>) -> StorageResult<MergePass> {
        let mut pass = MergePass::new("carry-forward", MergePolicy::FillIfAbsent);

        let Some(previous) = self.lineage.previous_completed_cycle().await? else {
            return Ok(pass);
        };
        if Some(previous.cycle.id) == cycle_id {
            return Ok(pass);
        }

        pass.push("previousCycleNumber", previous.cycle.cycle_number.to_string());
        let answers = prose(previous.answers);
        for (situation, key) in [
            (COLLECTING_FEEDBACK, "previousFeedback"),
            (LEARNING, "previousImprovements"),
        ] {
            let group: Vec<&str> = answers
                .iter()
                .filter(|a| a.situation == situation)
                .map(|a| a.value.as_str())
                .collect();
            if !group.is_empty() {
                pass.push(key, join_answers(&group));
            }
        }

        Ok(pass)
    }

    async fn metadata_pass(
        &self,
        situation: &str,
        cycle_id: Option<i64>,
    ) -> StorageResult<MergePass> {
        let mut pass =
            MergePass::new("metadata", MergePolicy::FillIfAbsent).with_entry("situation", situation);

        if let Some(id) = cycle_id {
            if let Some(cycle) = self.storage.get_cycle(id).await? {
                pass.push("cycleNumber", cycle.cycle_number.to_string());
            }
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewAnswer;
    use pretty_assertions::assert_eq;

    async fn setup() -> (SqliteStore, ContextAggregator) {
        let store = SqliteStore::new_in_memory().await.unwrap();
        (store.clone(), ContextAggregator::new(store))
    }

    async fn save(store: &SqliteStore, question: &str, situation: &str, value: &str) -> i64 {
        store
            .save_answer(&NewAnswer::new(question, situation, value))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_effective_cycle_without_cycles_is_unscoped() {
        let (_, aggregator) = setup().await;
        assert_eq!(aggregator.effective_cycle_id(None).await.unwrap(), None);
        assert_eq!(aggregator.effective_cycle_id(Some(4)).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_effective_cycle_falls_back_to_previous_when_active_empty() {
        let (store, aggregator) = setup().await;
        let first = store.create_cycle().await.unwrap();
        save(&store, "intent-summary-text", DEFINING_INTENT, "Reduce churn").await;
        let second = store.create_cycle().await.unwrap();

        assert_eq!(
            aggregator.effective_cycle_id(None).await.unwrap(),
            Some(first.id)
        );

        save(&store, "approach-text", DESIGNING, "new design").await;
        assert_eq!(
            aggregator.effective_cycle_id(None).await.unwrap(),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_probe_ignores_late_situations() {
        let (store, aggregator) = setup().await;
        let first = store.create_cycle().await.unwrap();
        save(&store, "intent-text", DEFINING_INTENT, "i").await;
        store.create_cycle().await.unwrap();
        save(&store, "went-well-text", COLLECTING_FEEDBACK, "fast").await;

        // Feedback is outside the probe, so the new cycle still counts as empty.
        assert_eq!(
            aggregator.effective_cycle_id(None).await.unwrap(),
            Some(first.id)
        );
    }

    #[tokio::test]
    async fn test_lineage_pass_groups_linked_answers() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        save(&store, "intent-text", DEFINING_INTENT, "Reduce churn").await;
        save(&store, "problem-text", SELECTING_PROBLEM, "Slow onboarding").await;
        save(&store, "approach-text", DESIGNING, "Guided tour").await;
        save(&store, "risks-text", DESIGNING, "Too long").await;
        save(&store, "ready-yesno", DESIGNING, "true").await;

        let pass = aggregator.lineage_pass(None).await.unwrap();
        let context = merge_passes(&[pass]);
        assert_eq!(context["intent"], "Reduce churn");
        assert_eq!(context["problem"], "Slow onboarding");
        assert_eq!(context["design"], "1. Guided tour\n\n2. Too long");
        assert!(!context.contains_key("implementation"));
    }

    #[tokio::test]
    async fn test_situation_pass_numbers_repeated_questions() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        save(&store, "dump-thoughts-text", DESIGNING, "first").await;
        save(&store, "dump-thoughts-text", DESIGNING, "second").await;
        save(&store, "dump-thoughts-text", DESIGNING, "third").await;
        save(&store, "single-text", DESIGNING, "alone").await;
        save(&store, "continue-yesno", DESIGNING, "false").await;

        let cycle = aggregator.effective_cycle_id(None).await.unwrap();
        let context = merge_passes(&[aggregator.situation_pass(cycle).await.unwrap()]);
        assert_eq!(
            context["dump-thoughts-text"],
            "1. first\n\n2. second\n\n3. third"
        );
        assert_eq!(context["single-text"], "alone");
        assert!(!context.contains_key("continue-yesno"));
    }

    #[tokio::test]
    async fn test_problem_pass_narrows_acceptance_criteria() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        save(&store, "intent-text", DEFINING_INTENT, "i").await;
        let first = save(&store, "problem-text", SELECTING_PROBLEM, "first problem").await;
        save(&store, "criteria-text", DEFINING_ACCEPTANCE_CRITERIA, "first criteria").await;
        let second = save(&store, "problem-text", SELECTING_PROBLEM, "second problem").await;
        save(&store, "criteria-text", DEFINING_ACCEPTANCE_CRITERIA, "second criteria").await;

        let context =
            merge_passes(&[aggregator.problem_pass(Some(first), None).await.unwrap()]);
        assert_eq!(context["problem"], "first problem");
        assert_eq!(context["acceptanceCriteria"], "first criteria");

        // Without an explicit id the current problem is used.
        let current = merge_passes(&[aggregator.problem_pass(None, None).await.unwrap()]);
        assert_eq!(current["problem"], "second problem");
        assert_eq!(current["acceptanceCriteria"], "second criteria");

        let explicit =
            merge_passes(&[aggregator.problem_pass(Some(second), None).await.unwrap()]);
        assert_eq!(explicit, current);
    }

    #[tokio::test]
    async fn test_problem_pass_falls_back_to_all_criteria() {
        let (store, aggregator) = setup().await;
        let cycle = store.create_cycle().await.unwrap();
        save(&store, "intent-text", DEFINING_INTENT, "i").await;
        let problem = save(&store, "problem-text", SELECTING_PROBLEM, "p").await;
        store
            .save_answer(
                &NewAnswer::new("criteria-text", DEFINING_ACCEPTANCE_CRITERIA, "c1")
                    .with_problem(None),
            )
            .await
            .unwrap();
        store
            .save_answer(
                &NewAnswer::new("criteria-text", DEFINING_ACCEPTANCE_CRITERIA, "c2")
                    .with_problem(None),
            )
            .await
            .unwrap();

        let pass = aggregator
            .problem_pass(Some(problem), Some(cycle.id))
            .await
            .unwrap();
        let context = merge_passes(&[pass]);
        assert_eq!(context["acceptanceCriteria"], "1. c1\n\n2. c2");
    }

    #[tokio::test]
    async fn test_selected_context_empty_without_picks() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        let context = merge_passes(&[aggregator.selected_context_pass().await.unwrap()]);
        assert_eq!(context[SELECTED_CONTEXT_KEY], "");
    }

    #[tokio::test]
    async fn test_selected_context_formats_picks() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        let old = save(&store, "lesson-text", LEARNING, "Ship smaller").await;
        let active = store.create_cycle().await.unwrap();
        store.add_cycle_pick(active.id, old).await.unwrap();

        let context = merge_passes(&[aggregator.selected_context_pass().await.unwrap()]);
        assert_eq!(context[SELECTED_CONTEXT_KEY], "[Learning] Ship smaller");
    }

    #[tokio::test]
    async fn test_carry_forward_fills_previous_cycle_keys() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        save(&store, "went-well-text", COLLECTING_FEEDBACK, "fast").await;
        save(&store, "lesson-text", LEARNING, "Ship smaller").await;
        let second = store.create_cycle().await.unwrap();

        let pass = aggregator.carry_forward_pass(Some(second.id)).await.unwrap();
        let context = merge_passes(&[pass]);
        assert_eq!(context["previousCycleNumber"], "1");
        assert_eq!(context["previousFeedback"], "fast");
        assert_eq!(context["previousImprovements"], "Ship smaller");
    }

    #[tokio::test]
    async fn test_carry_forward_skips_effective_cycle() {
        let (store, aggregator) = setup().await;
        let first = store.create_cycle().await.unwrap();
        store.complete_cycle(first.id).await.unwrap();

        let pass = aggregator.carry_forward_pass(Some(first.id)).await.unwrap();
        assert!(pass.is_empty());
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let (store, aggregator) = setup().await;
        store.create_cycle().await.unwrap();
        save(&store, "intent-text", DEFINING_INTENT, "i").await;
        save(&store, "problem-text", SELECTING_PROBLEM, "p").await;

        let first = aggregator
            .build_prompt_context(DESIGNING, None, None)
            .await
            .unwrap();
        let second = aggregator
            .build_prompt_context(DESIGNING, None, None)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(first["situation"], DESIGNING);
        assert_eq!(first["cycleNumber"], "1");
    }
}
