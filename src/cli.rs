//! CLI commands for operating the workflow store.
//!
//! Every command opens the store, does one thing and persists. Flow
//! position is not kept between invocations, so `answer` takes the
//! situation and question explicitly.

use clap::Subcommand;

use crate::engine::WorkflowEngine;
use crate::error::{AppError, AppResult, FlowError};
use crate::flow::{AnswerValue, Navigation, QuestionKind};
use crate::situations::guarded_counter_key;
use crate::storage::{Cycle, CycleStatus};

const RULE: &str =
    "═══════════════════════════════════════════════════════════════════════════════";

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show the active cycle, guard counter and storage location
    Status,

    /// Print the prompt context for a situation as JSON
    Context {
        /// Situation to build the context for
        situation: String,

        /// Narrow to this problem answer id
        #[arg(long)]
        problem: Option<i64>,

        /// Use this cycle instead of resolving the active one
        #[arg(long)]
        cycle: Option<i64>,
    },

    /// Answer a question and print where the flow goes next
    Answer {
        /// Situation the question belongs to
        situation: String,

        /// Question id
        question: String,

        /// Answer text; several values are saved as separate entries
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Manage cycles
    #[command(subcommand)]
    Cycle(CycleCommands),

    /// Save and restore snapshots of all answers
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Inspect transition counters
    #[command(subcommand)]
    Counter(CounterCommands),

    /// Manage answers picked from earlier cycles
    #[command(subcommand)]
    Pick(PickCommands),

    /// Manage the configured storage location
    #[command(subcommand)]
    Location(LocationCommands),

    /// Delete all answers, cycles, counters and picks
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

/// Cycle subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum CycleCommands {
    /// List all cycles
    List,
    /// Start a new cycle, completing the active one
    New,
    /// Complete a cycle (default: the active one)
    Complete { id: Option<i64> },
    /// Make a cycle active again
    Activate { id: i64 },
    /// Mark a cycle as dormant (default: the active one)
    Sleep { id: Option<i64> },
    /// Wake a dormant cycle (default: the active one)
    Wake { id: Option<i64> },
}

/// Snapshot subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum SnapshotCommands {
    /// Save every answer
    Save {
        /// Situation to record with the snapshot
        #[arg(long)]
        situation: String,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },
    /// List snapshots, newest first
    List,
    /// Show one snapshot
    Show { id: i64 },
    /// Replace all answers with a snapshot
    Restore { id: i64 },
    /// Delete a snapshot
    Delete { id: i64 },
}

/// Counter subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum CounterCommands {
    /// Show a counter (default: the Verifying->Implementing guard)
    Show { key: Option<String> },
    /// Reset a counter to zero
    Reset { key: Option<String> },
}

/// Pick subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum PickCommands {
    /// Pick an answer into the active cycle
    Add { answer_id: i64 },
    /// List picks of the active cycle
    List,
    /// Remove a pick
    Remove { id: i64 },
}

/// Location subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum LocationCommands {
    /// Show the configured location
    Get,
    /// Configure a location; the transport becomes authoritative
    Set { location: String },
    /// Forget the configured location
    Clear,
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a CLI command against an open engine.
pub async fn execute_command(command: Commands, engine: &mut WorkflowEngine) -> CliResult {
    let result = match command {
        Commands::Status => execute_status(engine).await,
        Commands::Context {
            situation,
            problem,
            cycle,
        } => execute_context(engine, &situation, problem, cycle).await,
        Commands::Answer {
            situation,
            question,
            values,
        } => execute_answer(engine, &situation, &question, values).await,
        Commands::Cycle(command) => execute_cycle(engine, command).await,
        Commands::Snapshot(command) => execute_snapshot(engine, command).await,
        Commands::Counter(command) => execute_counter(engine, command).await,
        Commands::Pick(command) => execute_pick(engine, command).await,
        Commands::Location(command) => execute_location(engine, command).await,
        Commands::Clear { yes } => execute_clear(engine, yes).await,
    };

    match result {
        Ok(output) => CliResult::success(output),
        Err(e) => CliResult::error(format!("Error: {}", e)),
    }
}

async fn execute_status(engine: &WorkflowEngine) -> AppResult<String> {
    let mut output = String::new();
    output.push_str("\nWorkflow Status\n");
    output.push_str(RULE);
    output.push_str("\n\n");

    let cycles = engine.list_cycles().await?;
    match cycles.iter().find(|c| c.is_active()) {
        Some(cycle) => output.push_str(&format!("Active cycle: {}\n", describe_cycle(cycle))),
        None => output.push_str("Active cycle: none\n"),
    }
    output.push_str(&format!("Cycles recorded: {}\n", cycles.len()));

    let key = guarded_counter_key();
    let count = engine.get_counter(&key).await?.map_or(0, |c| c.count);
    output.push_str(&format!(
        "Guard {}: {}/{}\n",
        key,
        count,
        engine.navigator().transition_limit()
    ));

    output.push_str(&format!("Picks in active cycle: {}\n", engine.picks().await?.len()));
    output.push_str(&format!(
        "Snapshots: {}\n",
        engine.list_snapshots().await?.len()
    ));
    output.push_str(&format!(
        "Storage location: {}\n",
        engine.location().await?.as_deref().unwrap_or("(default)")
    ));

    Ok(output)
}

async fn execute_context(
    engine: &WorkflowEngine,
    situation: &str,
    problem: Option<i64>,
    cycle: Option<i64>,
) -> AppResult<String> {
    engine.navigator().catalog().situation(situation)?;
    let context = engine.build_prompt_context(situation, problem, cycle).await?;
    serde_json::to_string_pretty(&context).map_err(|e| AppError::Internal {
        message: format!("Failed to render context: {}", e),
    })
}

async fn execute_answer(
    engine: &mut WorkflowEngine,
    situation: &str,
    question_id: &str,
    values: Vec<String>,
) -> AppResult<String> {
    engine.resume(situation, question_id)?;
    let kind = engine.navigator().current_question()?.kind;

    let navigation = if kind == QuestionKind::Text {
        engine.advance_entries(question_id, &values).await?
    } else {
        let raw = values.join(" ");
        let answer = AnswerValue::parse(kind, &raw).ok_or_else(|| FlowError::InvalidAnswer {
            question_id: question_id.to_string(),
            reason: format!("cannot read '{}' as yes or no", raw),
        })?;
        engine.advance(question_id, answer).await?
    };

    let next = engine.navigator();
    Ok(match navigation {
        Some(Navigation::Question(id)) => format!("Next question: {} ({})", id, next.situation()),
        Some(Navigation::Situation(name)) => {
            format!("Next situation: {} (starts at {})", name, next.question_id())
        }
        Some(Navigation::LimitReached(id)) => format!(
            "Loop back to implementation blocked after {} attempts. Next question: {}",
            next.transition_limit(),
            id
        ),
        None => "Flow complete".to_string(),
    })
}

async fn resolve_cycle_id(engine: &WorkflowEngine, id: Option<i64>) -> AppResult<i64> {
    if let Some(id) = id {
        return Ok(id);
    }
    engine
        .current_cycle_id()
        .await?
        .ok_or_else(|| AppError::Config {
            message: "No active cycle; pass a cycle id".to_string(),
        })
}

async fn execute_cycle(engine: &WorkflowEngine, command: CycleCommands) -> AppResult<String> {
    match command {
        CycleCommands::List => {
            let cycles = engine.list_cycles().await?;
            if cycles.is_empty() {
                return Ok("No cycles recorded".to_string());
            }
            let mut output = String::new();
            for cycle in &cycles {
                output.push_str(&describe_cycle(cycle));
                output.push('\n');
            }
            Ok(output)
        }
        CycleCommands::New => {
            let cycle = engine.create_cycle().await?;
            Ok(format!("Started {}", describe_cycle(&cycle)))
        }
        CycleCommands::Complete { id } => {
            let id = resolve_cycle_id(engine, id).await?;
            engine.complete_cycle(id).await?;
            Ok(format!("Completed cycle {}", id))
        }
        CycleCommands::Activate { id } => {
            engine.activate_cycle(id).await?;
            Ok(format!("Activated cycle {}", id))
        }
        CycleCommands::Sleep { id } => {
            let id = resolve_cycle_id(engine, id).await?;
            engine.sleep_cycle(id).await?;
            Ok(format!("Cycle {} is dormant", id))
        }
        CycleCommands::Wake { id } => {
            let id = resolve_cycle_id(engine, id).await?;
            engine.wake_cycle(id).await?;
            Ok(format!("Cycle {} is awake", id))
        }
    }
}

async fn execute_snapshot(
    engine: &mut WorkflowEngine,
    command: SnapshotCommands,
) -> AppResult<String> {
    match command {
        SnapshotCommands::Save {
            situation,
            description,
        } => {
            let start = engine
                .navigator()
                .catalog()
                .start_question(&situation)?
                .id
                .clone();
            engine.resume(&situation, &start)?;
            let id = engine.save_snapshot(description.as_deref()).await?;
            Ok(format!("Saved snapshot {}", id))
        }
        SnapshotCommands::List => {
            let snapshots = engine.list_snapshots().await?;
            if snapshots.is_empty() {
                return Ok("No snapshots".to_string());
            }
            Ok(snapshots
                .iter()
                .map(|s| {
                    format!(
                        "#{} {} {} answers in {}{}",
                        s.id,
                        s.created_at.format("%Y-%m-%d %H:%M"),
                        s.answer_count,
                        s.situation,
                        s.description
                            .as_deref()
                            .map(|d| format!(" - {}", d))
                            .unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        SnapshotCommands::Show { id } => match engine.snapshot_details(id).await? {
            Some(s) => Ok(format!(
                "Snapshot #{}\n  Created:     {}\n  Situation:   {}\n  Answers:     {}\n  Description: {}",
                s.id,
                s.created_at.to_rfc3339(),
                s.situation,
                s.answer_count,
                s.description.as_deref().unwrap_or("-")
            )),
            None => Ok(format!("Snapshot {} not found", id)),
        },
        SnapshotCommands::Restore { id } => {
            let situation = engine.restore_snapshot(id).await?;
            Ok(format!("Restored snapshot {}; situation is {}", id, situation))
        }
        SnapshotCommands::Delete { id } => Ok(if engine.delete_snapshot(id).await? {
            format!("Deleted snapshot {}", id)
        } else {
            format!("Snapshot {} not found", id)
        }),
    }
}

async fn execute_counter(engine: &WorkflowEngine, command: CounterCommands) -> AppResult<String> {
    match command {
        CounterCommands::Show { key } => {
            let key = key.unwrap_or_else(guarded_counter_key);
            Ok(match engine.get_counter(&key).await? {
                Some(counter) => format!(
                    "{}: {} (last reset: {})",
                    counter.key,
                    counter.count,
                    counter
                        .last_reset_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                ),
                None => format!("{}: 0 (never incremented)", key),
            })
        }
        CounterCommands::Reset { key } => {
            let key = key.unwrap_or_else(guarded_counter_key);
            engine.reset_counter(&key).await?;
            Ok(format!("Reset {}", key))
        }
    }
}

async fn execute_pick(engine: &WorkflowEngine, command: PickCommands) -> AppResult<String> {
    match command {
        PickCommands::Add { answer_id } => Ok(match engine.add_pick(answer_id).await? {
            Some(pick) => format!("Picked answer {} as #{}", answer_id, pick.id),
            None => format!(
                "Answer {} not picked: already picked or no active cycle",
                answer_id
            ),
        }),
        PickCommands::List => {
            let picks = engine.picks().await?;
            if picks.is_empty() {
                return Ok("No picks in the active cycle".to_string());
            }
            Ok(picks
                .iter()
                .map(|p| format!("#{} [{}] {}", p.id, p.situation, p.answer_text))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        PickCommands::Remove { id } => Ok(if engine.remove_pick(id).await? {
            format!("Removed pick {}", id)
        } else {
            format!("Pick {} not found", id)
        }),
    }
}

async fn execute_location(
    engine: &WorkflowEngine,
    command: LocationCommands,
) -> AppResult<String> {
    match command {
        LocationCommands::Get => Ok(engine
            .location()
            .await?
            .unwrap_or_else(|| "(default)".to_string())),
        LocationCommands::Set { location } => {
            engine.set_location(&location).await?;
            Ok(format!("Location set to {}", location))
        }
        LocationCommands::Clear => {
            engine.clear_location().await?;
            Ok("Location cleared".to_string())
        }
    }
}

async fn execute_clear(engine: &WorkflowEngine, yes: bool) -> AppResult<String> {
    if !yes {
        return Ok("Refusing to clear without --yes".to_string());
    }
    engine.clear_all().await?;
    Ok("Cleared answers, cycles, counters and picks".to_string())
}

fn describe_cycle(cycle: &Cycle) -> String {
    let status = match (cycle.status, cycle.is_unconscious()) {
        (CycleStatus::Active, true) => "active, dormant".to_string(),
        (status, _) => status.to_string(),
    };
    format!(
        "#{} (id {}) {} since {}",
        cycle.cycle_number,
        cycle.id,
        status,
        cycle.started_at.format("%Y-%m-%d %H:%M")
    )
}
