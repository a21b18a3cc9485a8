//! Flow navigator: records answers and walks the question graph.
//!
//! # Outcomes
//!
//! - **Question**: next question in the same situation, pushed onto history
//! - **Situation**: a new situation; history restarts at its first question
//! - **LimitReached**: the Verifying->Implementing guard blocked a loop back
//! - `None`: nothing follows, the flow is complete
//!
//! The guard counter only survives an uninterrupted ping-pong between
//! Verifying and Implementing. Any other move out of either resets it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::catalog::{
    FlowCatalog, Question, QuestionKind, CYCLE_COMPLETE, LIMIT_REACHED, RETURN_TO_IMPLEMENTATION,
};
use crate::error::{AppResult, FlowError, FlowResult};
use crate::situations::{
    guarded_counter_key, is_intent_answer, COLLECTING_FEEDBACK, DEFINING_ACCEPTANCE_CRITERIA,
    DEFINING_INTENT, DESIGNING, GUARDED_FROM, GUARDED_TO, LEARNING, SELECTING_PROBLEM, VERIFYING,
};
use crate::storage::{AnswerStore, NewAnswer, SqliteStore};

/// Multiple-choice options that jump straight to a situation.
pub const OPTION_SITUATIONS: [(&str, &str); 6] = [
    ("Refine the intent", DEFINING_INTENT),
    ("Choose another problem", SELECTING_PROBLEM),
    ("Revise acceptance criteria", DEFINING_ACCEPTANCE_CRITERIA),
    ("Rework the design", DESIGNING),
    ("Verify the work", VERIFYING),
    ("Collect feedback", COLLECTING_FEEDBACK),
];

/// Situation a canonical option leads to, if any.
pub fn option_situation(option: &str) -> Option<&'static str> {
    OPTION_SITUATIONS
        .iter()
        .find(|(label, _)| *label == option)
        .map(|(_, situation)| *situation)
}

/// Whether moving `from -> to` interrupts the guarded ping-pong.
pub fn resets_guard(from: &str, to: &str) -> bool {
    (from == GUARDED_FROM && to != GUARDED_TO) || (from == GUARDED_TO && to != GUARDED_FROM)
}

/// A submitted answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum AnswerValue {
    Text(String),
    YesNo(bool),
    Choice(String),
}

impl AnswerValue {
    /// Parse raw input for a question of `kind`.
    pub fn parse(kind: QuestionKind, raw: &str) -> Option<Self> {
        match kind {
            QuestionKind::Text => Some(AnswerValue::Text(raw.to_string())),
            QuestionKind::MultipleChoice => Some(AnswerValue::Choice(raw.to_string())),
            QuestionKind::YesNo => match raw.trim().to_lowercase().as_str() {
                "y" | "yes" | "true" => Some(AnswerValue::YesNo(true)),
                "n" | "no" | "false" => Some(AnswerValue::YesNo(false)),
                _ => None,
            },
        }
    }

    /// Text as persisted; booleans become "true"/"false".
    pub fn as_stored(&self) -> String {
        match self {
            AnswerValue::Text(s) | AnswerValue::Choice(s) => s.clone(),
            AnswerValue::YesNo(b) => b.to_string(),
        }
    }
}

/// Where the flow went after an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Navigation {
    /// Next question in the current situation.
    Question(String),
    /// New situation entered.
    Situation(String),
    /// Loop back blocked; the named question explains it.
    LimitReached(String),
}

impl Navigation {
    pub fn next_question_id(&self) -> Option<&str> {
        match self {
            Navigation::Question(id) | Navigation::LimitReached(id) => Some(id),
            Navigation::Situation(_) => None,
        }
    }

    pub fn next_situation(&self) -> Option<&str> {
        match self {
            Navigation::Situation(name) => Some(name),
            _ => None,
        }
    }
}

/// Graph step chosen from a question's pointers, before side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Question(String),
    Situation(String),
    Done,
}

fn text_step(question: &Question) -> Step {
    if let Some(situation) = &question.on_answer_next_situation {
        Step::Situation(situation.clone())
    } else if let Some(id) = &question.next_question_id {
        Step::Question(id.clone())
    } else if let Some(situation) = &question.next_situation {
        Step::Situation(situation.clone())
    } else {
        Step::Done
    }
}

/// Pick the next step from the question graph alone.
pub fn resolve(question: &Question, answer: &AnswerValue) -> Step {
    match (question.kind, answer) {
        (QuestionKind::YesNo, AnswerValue::YesNo(yes)) => {
            let (next_question, next_situation) = if *yes {
                (&question.on_yes_next_question_id, &question.on_yes_next_situation)
            } else {
                (&question.on_no_next_question_id, &question.on_no_next_situation)
            };
            match (next_question, next_situation) {
                (Some(id), _) => Step::Question(id.clone()),
                (None, Some(situation)) => Step::Situation(situation.clone()),
                (None, None) => Step::Done,
            }
        }
        (QuestionKind::MultipleChoice, AnswerValue::Choice(option) | AnswerValue::Text(option)) => {
            match option_situation(option) {
                Some(situation) => Step::Situation(situation.to_string()),
                None => text_step(question),
            }
        }
        _ => text_step(question),
    }
}

fn validate(question: &Question, answer: &AnswerValue) -> FlowResult<()> {
    let invalid = |reason: &str| {
        Err(FlowError::InvalidAnswer {
            question_id: question.id.clone(),
            reason: reason.to_string(),
        })
    };

    match (question.kind, answer) {
        (QuestionKind::YesNo, AnswerValue::YesNo(_)) => Ok(()),
        (QuestionKind::YesNo, _) => invalid("expected yes or no"),
        (QuestionKind::Text, AnswerValue::Text(text)) if !text.trim().is_empty() => Ok(()),
        (QuestionKind::Text, AnswerValue::Text(_)) => invalid("answer is empty"),
        (QuestionKind::Text, _) => invalid("expected free text"),
        (QuestionKind::MultipleChoice, AnswerValue::Choice(option) | AnswerValue::Text(option)) => {
            if question.options.iter().any(|o| o == option) {
                Ok(())
            } else {
                invalid("not one of the offered options")
            }
        }
        (QuestionKind::MultipleChoice, _) => invalid("expected one of the offered options"),
    }
}

/// State machine over the question graph.
pub struct FlowNavigator {
    store: SqliteStore,
    catalog: Arc<FlowCatalog>,
    transition_limit: i64,
    situation: String,
    question_id: String,
    history: Vec<String>,
}

impl FlowNavigator {
    /// Position at the first question of the catalog's first situation.
    ///
    /// Nothing is written until [`enter_situation`](Self::enter_situation) or
    /// [`advance`](Self::advance) is called.
    pub fn new(
        store: SqliteStore,
        catalog: Arc<FlowCatalog>,
        transition_limit: i64,
    ) -> FlowResult<Self> {
        let situation = catalog
            .situations()
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| FlowError::InvalidCatalog {
                message: "Catalog has no situations".to_string(),
            })?;
        let start = catalog.start_question(&situation)?.id.clone();

        Ok(Self {
            store,
            catalog,
            transition_limit,
            situation,
            question_id: start.clone(),
            history: vec![start],
        })
    }

    pub fn situation(&self) -> &str {
        &self.situation
    }

    pub fn question_id(&self) -> &str {
        &self.question_id
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn transition_limit(&self) -> i64 {
        self.transition_limit
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    pub fn current_question(&self) -> FlowResult<&Question> {
        self.catalog.question(&self.situation, &self.question_id)
    }

    /// Restore a position without side effects.
    pub fn resume(&mut self, situation: &str, question_id: &str) -> FlowResult<()> {
        let start = self.catalog.start_question(situation)?.id.clone();
        self.catalog.question(situation, question_id)?;

        self.history = if start == question_id {
            vec![start]
        } else {
            vec![start, question_id.to_string()]
        };
        self.situation = situation.to_string();
        self.question_id = question_id.to_string();
        Ok(())
    }

    /// Jump to a situation on behalf of a collaborator.
    pub async fn enter_situation(&mut self, situation: &str) -> AppResult<Navigation> {
        self.change_situation(situation).await
    }

    /// Record an answer, then move to whatever follows it.
    pub async fn advance(
        &mut self,
        question_id: &str,
        answer: AnswerValue,
    ) -> AppResult<Option<Navigation>> {
        let question = self.catalog.question(&self.situation, question_id)?.clone();
        validate(&question, &answer)?;

        let id = self.record(&question, answer.as_stored(), None).await?;
        debug!(answer_id = id, question_id = %question.id, "Answer recorded");

        self.navigate(&question, &answer).await
    }

    /// Record several free-text entries as separate answers and navigate on
    /// the last one. Blank entries are skipped.
    pub async fn advance_entries(
        &mut self,
        question_id: &str,
        entries: &[String],
    ) -> AppResult<Option<Navigation>> {
        let question = self.catalog.question(&self.situation, question_id)?.clone();
        let invalid = |reason: &str| FlowError::InvalidAnswer {
            question_id: question.id.clone(),
            reason: reason.to_string(),
        };

        if question.kind != QuestionKind::Text {
            return Err(invalid("only text questions accept entries").into());
        }
        let values: Vec<&str> = entries
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();
        let Some(last) = values.last().map(|v| v.to_string()) else {
            return Err(invalid("at least one non-empty entry is required").into());
        };
        if values.len() > 1 && !question.allow_multiple {
            return Err(invalid("question accepts a single entry").into());
        }

        let mut previous: Option<DateTime<Utc>> = None;
        for value in &values {
            let mut at = Utc::now();
            if let Some(prev) = previous {
                if at <= prev {
                    at = prev + Duration::microseconds(1);
                }
            }
            self.record(&question, value.to_string(), Some(at)).await?;
            previous = Some(at);
        }
        debug!(question_id = %question.id, entries = values.len(), "Entries recorded");

        self.navigate(&question, &AnswerValue::Text(last)).await
    }

    /// Step back one question. The situation's first question stays put.
    pub fn go_back(&mut self) -> Option<String> {
        if self.history.len() <= 1 {
            return None;
        }
        self.history.pop();
        let previous = self.history.last()?.clone();
        self.question_id = previous.clone();
        Some(previous)
    }

    async fn record(
        &self,
        question: &Question,
        value: String,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<i64> {
        let mut answer = NewAnswer::new(question.id.as_str(), self.situation.as_str(), value);
        if let Some(at) = at {
            answer = answer.at(at);
        }
        let active = if is_intent_answer(&self.situation, &question.id) {
            Some(self.ensure_active_cycle().await?)
        } else {
            self.store.active_cycle().await?.map(|c| c.id)
        };
        // Feedback and learning happen after the cycle closes; keep them in it.
        if active.is_none() && matches!(self.situation.as_str(), COLLECTING_FEEDBACK | LEARNING) {
            if let Some(previous) = self.store.latest_completed_cycle().await? {
                answer = answer.with_cycle(Some(previous.id));
            }
        }
        Ok(self.store.save_answer(&answer).await?)
    }

    /// Id of the active cycle, starting the next one if none is open.
    async fn ensure_active_cycle(&self) -> AppResult<i64> {
        if let Some(cycle) = self.store.active_cycle().await? {
            return Ok(cycle.id);
        }
        let cycle = self.store.create_cycle().await?;
        info!(cycle_id = cycle.id, cycle_number = cycle.cycle_number, "Cycle started");
        Ok(cycle.id)
    }

    async fn navigate(
        &mut self,
        question: &Question,
        answer: &AnswerValue,
    ) -> AppResult<Option<Navigation>> {
        match (question.id.as_str(), answer) {
            (RETURN_TO_IMPLEMENTATION, AnswerValue::YesNo(true)) => {
                return self.return_to_implementation().await.map(Some);
            }
            (CYCLE_COMPLETE, AnswerValue::YesNo(true)) => {
                self.complete_active_cycle().await?;
                return self.change_situation(COLLECTING_FEEDBACK).await.map(Some);
            }
            _ => {}
        }

        match resolve(question, answer) {
            Step::Question(id) => Ok(Some(self.move_to_question(id))),
            Step::Situation(situation) => self.change_situation(&situation).await.map(Some),
            Step::Done => {
                info!(situation = %self.situation, question_id = %question.id, "Flow complete");
                Ok(None)
            }
        }
    }

    async fn return_to_implementation(&mut self) -> AppResult<Navigation> {
        let key = guarded_counter_key();
        let count = self.store.get_counter(&key).await?.map_or(0, |c| c.count);

        if count >= self.transition_limit {
            self.catalog.question(&self.situation, LIMIT_REACHED)?;
            info!(
                count,
                limit = self.transition_limit,
                "Loop back to implementation blocked"
            );
            self.move_to_question(LIMIT_REACHED.to_string());
            return Ok(Navigation::LimitReached(LIMIT_REACHED.to_string()));
        }

        let count = self.store.increment_counter(&key).await?;
        debug!(count, limit = self.transition_limit, "Loop back to implementation");
        self.change_situation(GUARDED_TO).await
    }

    async fn complete_active_cycle(&self) -> AppResult<()> {
        if let Some(cycle) = self.store.active_cycle().await? {
            self.store.complete_cycle(cycle.id).await?;
            info!(cycle_id = cycle.id, cycle_number = cycle.cycle_number, "Cycle completed");
        }
        Ok(())
    }

    fn move_to_question(&mut self, id: String) -> Navigation {
        self.question_id = id.clone();
        self.history.push(id.clone());
        Navigation::Question(id)
    }

    async fn change_situation(&mut self, to: &str) -> AppResult<Navigation> {
        let start = self.catalog.start_question(to)?.id.clone();
        let from = self.situation.clone();

        if from != to && resets_guard(&from, to) {
            let key = guarded_counter_key();
            if let Some(counter) = self.store.get_counter(&key).await? {
                if counter.count > 0 {
                    self.store.reset_counter(&key).await?;
                    debug!(from = %from, to = %to, "Transition guard reset");
                }
            }
        }

        if to == DEFINING_INTENT {
            self.ensure_active_cycle().await?;
        }

        self.situation = to.to_string();
        self.question_id = start.clone();
        self.history = vec![start];
        info!(from = %from, to = %to, "Situation changed");
        Ok(Navigation::Situation(to.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::situations::IMPLEMENTING;

    fn catalog() -> FlowCatalog {
        FlowCatalog::builtin().unwrap()
    }

    #[test]
    fn test_resets_guard() {
        assert!(!resets_guard(VERIFYING, IMPLEMENTING));
        assert!(!resets_guard(IMPLEMENTING, VERIFYING));
        assert!(resets_guard(VERIFYING, COLLECTING_FEEDBACK));
        assert!(resets_guard(IMPLEMENTING, DESIGNING));
        assert!(!resets_guard(DESIGNING, IMPLEMENTING));
    }

    #[test]
    fn test_resolve_yes_no_branches() {
        let catalog = catalog();
        let question = catalog.question(DESIGNING, "design-ready-yesno").unwrap();
        assert_eq!(
            resolve(question, &AnswerValue::YesNo(true)),
            Step::Situation(IMPLEMENTING.to_string())
        );
        assert_eq!(
            resolve(question, &AnswerValue::YesNo(false)),
            Step::Question("dump-thoughts-text".to_string())
        );
    }

    #[test]
    fn test_resolve_text_pointer_order() {
        let mut question = catalog()
            .question(DEFINING_INTENT, "intent-summary-text")
            .unwrap()
            .clone();
        let answer = AnswerValue::Text("x".to_string());
        assert_eq!(
            resolve(&question, &answer),
            Step::Question("motivation-text".to_string())
        );

        question.on_answer_next_situation = Some(DESIGNING.to_string());
        assert_eq!(
            resolve(&question, &answer),
            Step::Situation(DESIGNING.to_string())
        );

        question.on_answer_next_situation = None;
        question.next_question_id = None;
        assert_eq!(resolve(&question, &answer), Step::Done);
        question.next_situation = Some(VERIFYING.to_string());
        assert_eq!(
            resolve(&question, &answer),
            Step::Situation(VERIFYING.to_string())
        );
    }

    #[test]
    fn test_resolve_multiple_choice() {
        let catalog = catalog();
        let question = catalog
            .question(IMPLEMENTING, "implementation-next-choice")
            .unwrap();
        assert_eq!(
            resolve(question, &AnswerValue::Choice("Verify the work".to_string())),
            Step::Situation(VERIFYING.to_string())
        );
        assert_eq!(
            resolve(question, &AnswerValue::Choice("Keep implementing".to_string())),
            Step::Question("build-notes-text".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_mismatched_answers() {
        let catalog = catalog();
        let yes_no = catalog.question(DESIGNING, "design-ready-yesno").unwrap();
        assert!(validate(yes_no, &AnswerValue::Text("yes".to_string())).is_err());

        let text = catalog.question(DESIGNING, "approach-text").unwrap();
        assert!(validate(text, &AnswerValue::Text("   ".to_string())).is_err());
        assert!(validate(text, &AnswerValue::YesNo(true)).is_err());

        let choice = catalog
            .question(IMPLEMENTING, "implementation-next-choice")
            .unwrap();
        assert!(validate(choice, &AnswerValue::Choice("Dance".to_string())).is_err());
        assert!(validate(choice, &AnswerValue::Text("Rework the design".to_string())).is_ok());
    }

    #[test]
    fn test_answer_value_parse() {
        assert_eq!(
            AnswerValue::parse(QuestionKind::YesNo, "Yes"),
            Some(AnswerValue::YesNo(true))
        );
        assert_eq!(
            AnswerValue::parse(QuestionKind::YesNo, "n"),
            Some(AnswerValue::YesNo(false))
        );
        assert_eq!(AnswerValue::parse(QuestionKind::YesNo, "maybe"), None);
        assert_eq!(AnswerValue::YesNo(false).as_stored(), "false");
    }

    #[test]
    fn test_navigation_accessors() {
        let nav = Navigation::Situation(DESIGNING.to_string());
        assert_eq!(nav.next_situation(), Some(DESIGNING));
        assert_eq!(nav.next_question_id(), None);
        let limit = Navigation::LimitReached(LIMIT_REACHED.to_string());
        assert_eq!(limit.next_question_id(), Some(LIMIT_REACHED));
    }

    #[tokio::test]
    async fn test_go_back_keeps_start_question() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let mut nav = FlowNavigator::new(store, Arc::new(catalog()), 5).unwrap();
        nav.enter_situation(DESIGNING).await.unwrap();
        assert_eq!(nav.go_back(), None);

        nav.advance_entries("dump-thoughts-text", &["idea".to_string()])
            .await
            .unwrap();
        assert_eq!(nav.question_id(), "approach-text");
        assert_eq!(nav.go_back().as_deref(), Some("dump-thoughts-text"));
        assert_eq!(nav.go_back(), None);
    }
}
