//! # devflow-store
//!
//! Persistent answer store and flow engine for a cyclic development
//! workflow: intent, problem, acceptance criteria, design, implementation,
//! verification, feedback and learning, repeated in numbered cycles.
//!
//! ## Components
//!
//! - **AnswerStore**: relational answer store with additive self-migration
//! - **LineageResolver**: current intent/problem/cycle and linked answers
//! - **ContextAggregator**: flat prompt context built from ordered merge passes
//! - **FlowNavigator**: question-graph state machine with a loop guard
//!
//! ## Architecture
//!
//! ```text
//! FlowNavigator ──writes──▶ AnswerStore (SQLite) ──blob──▶ ByteStore (HTTP | file)
//!                                │
//!                   LineageResolver ─▶ ContextAggregator ─▶ template substitution
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use devflow_store::{Config, WorkflowEngine};
//! use devflow_store::flow::AnswerValue;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let mut engine = WorkflowEngine::open(&config).await?;
//!     engine.start().await?;
//!     engine
//!         .advance("intent-summary-text", AnswerValue::Text("Reduce churn".into()))
//!         .await?;
//!     let context = engine.build_prompt_context("SelectingProblem", None, None).await?;
//!     println!("{}", context["intent"]);
//!     Ok(())
//! }
//! ```

/// Operator command line.
pub mod cli;
/// Configuration loaded from the environment.
pub mod config;
/// Prompt context aggregation.
pub mod context;
/// Caller-facing engine wiring every component together.
pub mod engine;
/// Error types and result aliases.
pub mod error;
/// Question catalog and flow navigation.
pub mod flow;
/// Lineage resolution over stored answers.
pub mod lineage;
/// Situation names and derived constants.
pub mod situations;
/// SQLite answer store.
pub mod storage;
/// Byte-store transports persisting the exported store.
pub mod transport;

pub use config::Config;
pub use engine::WorkflowEngine;
pub use error::{AppError, AppResult};
