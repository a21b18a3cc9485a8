//! Unit tests for storage types and builder methods.

use super::*;
use chrono::Duration;

// ============================================================================
// NewAnswer tests
// ============================================================================

#[test]
fn test_new_answer_defaults() {
    let answer = NewAnswer::new("dump-thoughts-text", "Designing", "first idea");
    assert_eq!(answer.question_id, "dump-thoughts-text");
    assert_eq!(answer.situation, "Designing");
    assert_eq!(answer.value, "first idea");
    assert!(answer.intent_id.is_none());
    assert!(answer.problem_id.is_none());
    assert!(answer.parent_id.is_none());
    assert!(answer.cycle_id.is_none());
}

#[test]
fn test_new_answer_boolean_serialization() {
    assert_eq!(NewAnswer::boolean("q", "Verifying", true).value, "true");
    assert_eq!(NewAnswer::boolean("q", "Verifying", false).value, "false");
}

#[test]
fn test_new_answer_overrides() {
    let answer = NewAnswer::new("q", "Designing", "v")
        .with_intent(Some(3))
        .with_problem(None)
        .with_parent(9)
        .with_cycle(Some(2));
    assert_eq!(answer.intent_id, Some(Some(3)));
    assert_eq!(answer.problem_id, Some(None));
    assert_eq!(answer.parent_id, Some(9));
    assert_eq!(answer.cycle_id, Some(Some(2)));
}

#[test]
fn test_new_answer_at() {
    let when = Utc::now() - Duration::days(1);
    let answer = NewAnswer::new("q", "Designing", "v").at(when);
    assert_eq!(answer.answered_at, when);
}

// ============================================================================
// Answer tests
// ============================================================================

fn answer(value: &str) -> Answer {
    Answer {
        id: 1,
        question_id: "q".to_string(),
        situation: "Designing".to_string(),
        value: value.to_string(),
        answered_at: Utc::now(),
        intent_id: None,
        problem_id: None,
        parent_id: None,
        cycle_id: None,
    }
}

#[test]
fn test_answer_is_boolean() {
    assert!(answer("true").is_boolean());
    assert!(answer("false").is_boolean());
    assert!(!answer("truely spoken").is_boolean());
}

#[test]
fn test_answer_serialization_round_trip() {
    let original = answer("text");
    let json = serde_json::to_string(&original).unwrap();
    let parsed: Answer = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, original);
}

// ============================================================================
// CycleStatus tests
// ============================================================================

#[test]
fn test_cycle_status_display() {
    assert_eq!(CycleStatus::Active.to_string(), "active");
    assert_eq!(CycleStatus::Completed.to_string(), "completed");
}

#[test]
fn test_cycle_status_from_str() {
    assert_eq!("active".parse::<CycleStatus>().unwrap(), CycleStatus::Active);
    assert_eq!(
        "COMPLETED".parse::<CycleStatus>().unwrap(),
        CycleStatus::Completed
    );
    assert!("paused".parse::<CycleStatus>().is_err());
}

#[test]
fn test_cycle_status_serde() {
    assert_eq!(
        serde_json::to_string(&CycleStatus::Completed).unwrap(),
        "\"completed\""
    );
}

// ============================================================================
// Cycle tests
// ============================================================================

fn cycle() -> Cycle {
    Cycle {
        id: 1,
        cycle_number: 1,
        started_at: Utc::now(),
        completed_at: None,
        status: CycleStatus::Active,
        unconscious_entered_at: None,
        unconscious_exited_at: None,
    }
}

#[test]
fn test_cycle_is_active() {
    let mut c = cycle();
    assert!(c.is_active());
    c.status = CycleStatus::Completed;
    assert!(!c.is_active());
}

#[test]
fn test_cycle_unconscious_state() {
    let mut c = cycle();
    assert!(!c.is_unconscious());

    let entered = Utc::now();
    c.unconscious_entered_at = Some(entered);
    assert!(c.is_unconscious());

    c.unconscious_exited_at = Some(entered + Duration::minutes(5));
    assert!(!c.is_unconscious());

    c.unconscious_entered_at = Some(entered + Duration::minutes(10));
    assert!(c.is_unconscious());
}
