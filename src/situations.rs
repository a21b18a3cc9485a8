//! Workflow situation names and the fixed lists derived from them.
//!
//! Situations are string keys into the external catalog. The core only
//! hard-codes the ones it attaches behavior to.

/// Stating what the user wants to achieve.
pub const DEFINING_INTENT: &str = "DefiningIntent";
/// Picking the problem to work on for the current intent.
pub const SELECTING_PROBLEM: &str = "SelectingProblem";
/// Writing acceptance criteria for the selected problem.
pub const DEFINING_ACCEPTANCE_CRITERIA: &str = "DefiningAcceptanceCriteria";
/// Designing a solution.
pub const DESIGNING: &str = "Designing";
/// Building it.
pub const IMPLEMENTING: &str = "Implementing";
/// Checking the result against the acceptance criteria.
pub const VERIFYING: &str = "Verifying";
/// Gathering feedback once a cycle is complete.
pub const COLLECTING_FEEDBACK: &str = "CollectingFeedback";
/// Recording improvements for the next cycle.
pub const LEARNING: &str = "Learning";

/// Every situation in workflow order. Aggregation walks this list.
pub const SITUATION_CATALOG: [&str; 8] = [
    DEFINING_INTENT,
    SELECTING_PROBLEM,
    DEFINING_ACCEPTANCE_CRITERIA,
    DESIGNING,
    IMPLEMENTING,
    VERIFYING,
    COLLECTING_FEEDBACK,
    LEARNING,
];

/// Early-stage situations probed to decide whether a cycle has recorded anything.
pub const EMPTINESS_PROBE: [&str; 5] = [
    DEFINING_INTENT,
    SELECTING_PROBLEM,
    DEFINING_ACCEPTANCE_CRITERIA,
    DESIGNING,
    IMPLEMENTING,
];

/// Question ids containing this marker in `DefiningIntent` are intents.
pub const INTENT_MARKER: &str = "intent-";
/// Question ids containing this marker in `SelectingProblem` are problems.
pub const PROBLEM_MARKER: &str = "problem-";

/// Source of the guarded loop-back transition.
pub const GUARDED_FROM: &str = VERIFYING;
/// Target of the guarded loop-back transition.
pub const GUARDED_TO: &str = IMPLEMENTING;

/// Key of the transition counter for a `from -> to` pair.
pub fn counter_key(from: &str, to: &str) -> String {
    format!("{}->{}", from, to)
}

/// Key of the Verifying->Implementing guard counter.
pub fn guarded_counter_key() -> String {
    counter_key(GUARDED_FROM, GUARDED_TO)
}

/// Returns true for answers that carry control-flow meaning only.
pub fn is_boolean_value(value: &str) -> bool {
    value == "true" || value == "false"
}

/// Whether an answer is an intent, i.e. owns its lineage rather than joining one.
pub fn is_intent_answer(situation: &str, question_id: &str) -> bool {
    situation == DEFINING_INTENT && question_id.contains(INTENT_MARKER)
}

/// Whether an answer is a problem statement.
pub fn is_problem_answer(situation: &str, question_id: &str) -> bool {
    situation == SELECTING_PROBLEM && question_id.contains(PROBLEM_MARKER)
}
