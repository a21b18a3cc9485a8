//! Storage layer for workflow answers and cycle bookkeeping.
//!
//! This module provides the relational answer store: answers with their
//! intent/problem lineage, numbered cycles, transition counters, cross-cycle
//! context picks and manual snapshots. The working copy is a SQLite database
//! that is exported as one blob and written through a [`ByteStore`] after
//! every mutation.
//!
//! [`ByteStore`]: crate::transport::ByteStore

mod schema;
mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::situations;

/// One recorded response to a catalog question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Store-assigned, strictly increasing identifier.
    pub id: i64,
    /// Key into the question catalog.
    pub question_id: String,
    /// Situation the question belongs to.
    pub situation: String,
    /// Answer text; booleans are stored as "true"/"false".
    pub value: String,
    /// When the answer was recorded.
    pub answered_at: DateTime<Utc>,
    /// Intent this answer belongs to.
    pub intent_id: Option<i64>,
    /// Problem this answer belongs to.
    pub problem_id: Option<i64>,
    /// Optional parent answer.
    pub parent_id: Option<i64>,
    /// Cycle active when the answer was recorded.
    pub cycle_id: Option<i64>,
}

impl Answer {
    /// Whether this answer only carries control-flow meaning.
    pub fn is_boolean(&self) -> bool {
        situations::is_boolean_value(&self.value)
    }
}

/// An answer to be written, with optional lineage overrides.
///
/// Overrides use `Some(None)` to force a null link and `None` to let the
/// store resolve the link from the current intent, problem and cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnswer {
    pub question_id: String,
    pub situation: String,
    pub value: String,
    pub answered_at: DateTime<Utc>,
    pub intent_id: Option<Option<i64>>,
    pub problem_id: Option<Option<i64>>,
    pub parent_id: Option<i64>,
    pub cycle_id: Option<Option<i64>>,
}

impl NewAnswer {
    /// Create a new answer stamped with the current time.
    pub fn new(
        question_id: impl Into<String>,
        situation: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            question_id: question_id.into(),
            situation: situation.into(),
            value: value.into(),
            answered_at: Utc::now(),
            intent_id: None,
            problem_id: None,
            parent_id: None,
            cycle_id: None,
        }
    }

    /// Create a yes/no answer.
    pub fn boolean(
        question_id: impl Into<String>,
        situation: impl Into<String>,
        value: bool,
    ) -> Self {
        Self::new(question_id, situation, value.to_string())
    }

    pub fn at(mut self, answered_at: DateTime<Utc>) -> Self {
        self.answered_at = answered_at;
        self
    }

    pub fn with_intent(mut self, intent_id: Option<i64>) -> Self {
        self.intent_id = Some(intent_id);
        self
    }

    pub fn with_problem(mut self, problem_id: Option<i64>) -> Self {
        self.problem_id = Some(problem_id);
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_cycle(mut self, cycle_id: Option<i64>) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }
}

/// Status of a workflow cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// The cycle answers are currently recorded against.
    #[default]
    Active,
    /// A finished cycle.
    Completed,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Active => write!(f, "active"),
            CycleStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(CycleStatus::Active),
            "completed" => Ok(CycleStatus::Completed),
            _ => Err(format!("Unknown cycle status: {}", s)),
        }
    }
}

/// One end-to-end pass through the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: i64,
    /// 1-based, strictly increasing.
    pub cycle_number: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: CycleStatus,
    /// Set when the cycle goes dormant.
    pub unconscious_entered_at: Option<DateTime<Utc>>,
    /// Set when the cycle wakes up again.
    pub unconscious_exited_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn is_active(&self) -> bool {
        self.status == CycleStatus::Active
    }

    /// Dormant: entered the unconscious state and not yet exited.
    pub fn is_unconscious(&self) -> bool {
        match (self.unconscious_entered_at, self.unconscious_exited_at) {
            (Some(entered), Some(exited)) => entered > exited,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Consecutive-loop guard for one `from->to` situation pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionCounter {
    pub key: String,
    pub count: i64,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// An answer from an earlier cycle pulled into the active cycle's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclePick {
    pub id: i64,
    pub target_cycle_id: i64,
    pub source_cycle_id: Option<i64>,
    pub source_answer_id: i64,
    pub question_id: String,
    pub answer_text: String,
    pub situation: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot metadata without the answer payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: i64,
    /// Situation active when the snapshot was taken.
    pub situation: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answer_count: i64,
}

/// Storage operations for the workflow answer store.
#[async_trait]
pub trait AnswerStore: Send + Sync {
    // Schema

    /// Create the schema on first run, migrate it on reopen. Idempotent.
    async fn initialize(&self) -> StorageResult<()>;
    /// Add any missing columns and tables. Returns the steps applied.
    async fn migrate(&self) -> StorageResult<Vec<String>>;

    // Answers

    /// Resolve lineage, stamp the active cycle, insert and return the new id.
    async fn save_answer(&self, answer: &NewAnswer) -> StorageResult<i64>;
    async fn get_answer(&self, id: i64) -> StorageResult<Option<Answer>>;
    /// Most recent answer to a question.
    async fn latest_answer_by_question(&self, question_id: &str)
        -> StorageResult<Option<Answer>>;
    /// All answers to a question, newest first.
    async fn answers_by_question(&self, question_id: &str) -> StorageResult<Vec<Answer>>;
    /// Answers in a situation, newest first, optionally limited to one cycle.
    async fn answers_by_situation(
        &self,
        situation: &str,
        cycle_id: Option<i64>,
    ) -> StorageResult<Vec<Answer>>;
    /// Most recent answer in `situation` whose question id contains `marker`.
    async fn latest_marked_answer(
        &self,
        situation: &str,
        marker: &str,
    ) -> StorageResult<Option<Answer>>;
    /// Answers linked to an intent, oldest first.
    async fn answers_by_intent(&self, intent_id: i64) -> StorageResult<Vec<Answer>>;
    /// Answers linked to a problem, oldest first.
    async fn answers_by_problem(&self, problem_id: i64) -> StorageResult<Vec<Answer>>;
    /// Full cycle dump, oldest first.
    async fn answers_by_cycle(&self, cycle_id: i64) -> StorageResult<Vec<Answer>>;
    /// Every answer, by id.
    async fn all_answers(&self) -> StorageResult<Vec<Answer>>;
    /// Delete answers, cycles, counters and picks. Snapshots are kept.
    async fn clear_all(&self) -> StorageResult<()>;

    // Cycles

    /// Start the next numbered cycle, completing any other active one.
    async fn create_cycle(&self) -> StorageResult<Cycle>;
    async fn get_cycle(&self, id: i64) -> StorageResult<Option<Cycle>>;
    async fn active_cycle(&self) -> StorageResult<Option<Cycle>>;
    /// All cycles by number.
    async fn list_cycles(&self) -> StorageResult<Vec<Cycle>>;
    /// Highest-numbered completed cycle.
    async fn latest_completed_cycle(&self) -> StorageResult<Option<Cycle>>;
    async fn complete_cycle(&self, id: i64) -> StorageResult<()>;
    /// Complete every other active cycle and reactivate this one.
    async fn activate_cycle(&self, id: i64) -> StorageResult<()>;
    async fn record_unconscious_entry(&self, id: i64) -> StorageResult<()>;
    async fn record_unconscious_exit(&self, id: i64) -> StorageResult<()>;

    // Transition counters

    async fn get_counter(&self, key: &str) -> StorageResult<Option<TransitionCounter>>;
    /// Insert with count 1 or add one. Returns the new count.
    async fn increment_counter(&self, key: &str) -> StorageResult<i64>;
    /// Set the count to 0 and stamp the reset time.
    async fn reset_counter(&self, key: &str) -> StorageResult<()>;

    // Cycle picks

    /// Copy an answer into a cycle's context. `None` if already picked.
    async fn add_cycle_pick(
        &self,
        target_cycle_id: i64,
        source_answer_id: i64,
    ) -> StorageResult<Option<CyclePick>>;
    async fn cycle_picks(&self, target_cycle_id: i64) -> StorageResult<Vec<CyclePick>>;
    async fn remove_cycle_pick(&self, id: i64) -> StorageResult<bool>;
    async fn clear_cycle_picks(&self, target_cycle_id: i64) -> StorageResult<u64>;

    // Snapshots

    async fn save_snapshot(
        &self,
        situation: &str,
        description: Option<&str>,
    ) -> StorageResult<i64>;
    /// Replace every answer with the snapshot's. Returns the saved situation.
    async fn restore_snapshot(&self, id: i64) -> StorageResult<String>;
    async fn list_snapshots(&self) -> StorageResult<Vec<SnapshotSummary>>;
    async fn delete_snapshot(&self, id: i64) -> StorageResult<bool>;
    async fn snapshot_details(&self, id: i64) -> StorageResult<Option<SnapshotSummary>>;
}
