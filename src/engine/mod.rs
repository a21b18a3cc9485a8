//! Caller-facing workflow engine.
//!
//! Wires the answer store, lineage resolver, context aggregator and flow
//! navigator behind one handle. Construct it explicitly and pass it around;
//! nothing here is process-global.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, FlowConfig};
use crate::context::{ContextAggregator, PromptContext};
use crate::error::{AppError, AppResult, FlowError};
use crate::flow::{AnswerValue, FlowCatalog, FlowNavigator, Navigation};
use crate::lineage::{CycleSummary, LineageResolver};
use crate::storage::{
    Answer, AnswerStore, Cycle, CyclePick, NewAnswer, SnapshotSummary, SqliteStore,
    TransitionCounter,
};
use crate::transport::{ByteStore, FileByteStore, HttpByteStore, MemoryByteStore};

/// Default number of consecutive loop backs to implementation.
pub const DEFAULT_TRANSITION_LIMIT: i64 = 5;

/// One user session over the workflow store.
pub struct WorkflowEngine {
    store: SqliteStore,
    lineage: LineageResolver,
    context: ContextAggregator,
    navigator: FlowNavigator,
}

impl WorkflowEngine {
    /// Open the persisted store described by `config`.
    pub async fn open(config: &Config) -> AppResult<Self> {
        let transport = build_transport(config)?;
        let cache: Arc<dyn ByteStore> =
            Arc::new(FileByteStore::new(config.transport.cache_path.clone()));

        let store = SqliteStore::open(&config.database, transport, cache).await?;
        let catalog = load_catalog(&config.flow)?;

        info!(
            remote = config.transport.remote_url.is_some(),
            transition_limit = config.flow.transition_limit,
            "Workflow engine ready"
        );
        Self::with_store(store, catalog, config.flow.transition_limit)
    }

    /// Engine over an ephemeral store and the built-in catalog.
    pub async fn in_memory() -> AppResult<Self> {
        let store = SqliteStore::new_in_memory_with(
            Arc::new(MemoryByteStore::new()),
            Arc::new(MemoryByteStore::new()),
        )
        .await?;
        Self::with_store(store, FlowCatalog::builtin()?, DEFAULT_TRANSITION_LIMIT)
    }

    pub fn with_store(
        store: SqliteStore,
        catalog: FlowCatalog,
        transition_limit: i64,
    ) -> AppResult<Self> {
        let navigator = FlowNavigator::new(store.clone(), Arc::new(catalog), transition_limit)?;
        Ok(Self {
            lineage: LineageResolver::new(store.clone()),
            context: ContextAggregator::new(store.clone()),
            store,
            navigator,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn lineage(&self) -> &LineageResolver {
        &self.lineage
    }

    pub fn navigator(&self) -> &FlowNavigator {
        &self.navigator
    }

    // ------------------------------------------------------------------
    // Answers
    // ------------------------------------------------------------------

    pub async fn save_answer(&self, answer: &NewAnswer) -> AppResult<i64> {
        Ok(self.store.save_answer(answer).await?)
    }

    pub async fn answers_by_situation(
        &self,
        situation: &str,
        cycle_id: Option<i64>,
    ) -> AppResult<Vec<Answer>> {
        Ok(self.store.answers_by_situation(situation, cycle_id).await?)
    }

    pub async fn current_cycle_id(&self) -> AppResult<Option<i64>> {
        Ok(self.lineage.current_cycle_id().await?)
    }

    /// Remove answers, cycles, counters and picks. Snapshots are kept.
    pub async fn clear_all(&self) -> AppResult<()> {
        Ok(self.store.clear_all().await?)
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    pub async fn create_cycle(&self) -> AppResult<Cycle> {
        Ok(self.store.create_cycle().await?)
    }

    pub async fn complete_cycle(&self, id: i64) -> AppResult<()> {
        Ok(self.store.complete_cycle(id).await?)
    }

    pub async fn activate_cycle(&self, id: i64) -> AppResult<()> {
        Ok(self.store.activate_cycle(id).await?)
    }

    pub async fn list_cycles(&self) -> AppResult<Vec<Cycle>> {
        Ok(self.store.list_cycles().await?)
    }

    pub async fn get_cycle(&self, id: i64) -> AppResult<Option<Cycle>> {
        Ok(self.store.get_cycle(id).await?)
    }

    pub async fn previous_completed_cycle(&self) -> AppResult<Option<CycleSummary>> {
        Ok(self.lineage.previous_completed_cycle().await?)
    }

    /// Mark a cycle as dormant.
    pub async fn sleep_cycle(&self, id: i64) -> AppResult<()> {
        Ok(self.store.record_unconscious_entry(id).await?)
    }

    /// Bring a dormant cycle back.
    pub async fn wake_cycle(&self, id: i64) -> AppResult<()> {
        Ok(self.store.record_unconscious_exit(id).await?)
    }

    // ------------------------------------------------------------------
    // Transition counters
    // ------------------------------------------------------------------

    pub async fn get_counter(&self, key: &str) -> AppResult<Option<TransitionCounter>> {
        Ok(self.store.get_counter(key).await?)
    }

    pub async fn increment_counter(&self, key: &str) -> AppResult<i64> {
        Ok(self.store.increment_counter(key).await?)
    }

    pub async fn reset_counter(&self, key: &str) -> AppResult<()> {
        Ok(self.store.reset_counter(key).await?)
    }

    // ------------------------------------------------------------------
    // Cross-cycle picks
    // ------------------------------------------------------------------

    /// Pick an earlier answer into the active cycle.
    ///
    /// `None` when there is no active cycle or the answer is already picked.
    pub async fn add_pick(&self, source_answer_id: i64) -> AppResult<Option<CyclePick>> {
        let Some(cycle) = self.store.active_cycle().await? else {
            return Ok(None);
        };
        Ok(self.store.add_cycle_pick(cycle.id, source_answer_id).await?)
    }

    /// Picks attached to the active cycle.
    pub async fn picks(&self) -> AppResult<Vec<CyclePick>> {
        match self.store.active_cycle().await? {
            Some(cycle) => Ok(self.store.cycle_picks(cycle.id).await?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn remove_pick(&self, id: i64) -> AppResult<bool> {
        Ok(self.store.remove_cycle_pick(id).await?)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Save every answer together with the current situation.
    pub async fn save_snapshot(&self, description: Option<&str>) -> AppResult<i64> {
        Ok(self
            .store
            .save_snapshot(self.navigator.situation(), description)
            .await?)
    }

    /// Replace all answers with a snapshot and return to its situation.
    pub async fn restore_snapshot(&mut self, id: i64) -> AppResult<String> {
        let situation = self.store.restore_snapshot(id).await?;
        let start = self.navigator.catalog().start_question(&situation)?.id.clone();
        self.navigator.resume(&situation, &start)?;
        Ok(situation)
    }

    pub async fn list_snapshots(&self) -> AppResult<Vec<SnapshotSummary>> {
        Ok(self.store.list_snapshots().await?)
    }

    pub async fn snapshot_details(&self, id: i64) -> AppResult<Option<SnapshotSummary>> {
        Ok(self.store.snapshot_details(id).await?)
    }

    pub async fn delete_snapshot(&self, id: i64) -> AppResult<bool> {
        Ok(self.store.delete_snapshot(id).await?)
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    pub async fn build_prompt_context(
        &self,
        situation: &str,
        problem_id: Option<i64>,
        cycle_id: Option<i64>,
    ) -> AppResult<PromptContext> {
        Ok(self
            .context
            .build_prompt_context(situation, problem_id, cycle_id)
            .await?)
    }

    // ------------------------------------------------------------------
    // Flow
    // ------------------------------------------------------------------

    /// Enter the catalog's first situation.
    pub async fn start(&mut self) -> AppResult<Navigation> {
        let first = self
            .navigator
            .catalog()
            .situations()
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| FlowError::InvalidCatalog {
                message: "Catalog has no situations".to_string(),
            })?;
        self.navigator.enter_situation(&first).await
    }

    pub async fn enter_situation(&mut self, situation: &str) -> AppResult<Navigation> {
        self.navigator.enter_situation(situation).await
    }

    /// Restore a flow position without writing anything.
    pub fn resume(&mut self, situation: &str, question_id: &str) -> AppResult<()> {
        Ok(self.navigator.resume(situation, question_id)?)
    }

    pub async fn advance(
        &mut self,
        question_id: &str,
        answer: AnswerValue,
    ) -> AppResult<Option<Navigation>> {
        self.navigator.advance(question_id, answer).await
    }

    pub async fn advance_entries(
        &mut self,
        question_id: &str,
        entries: &[String],
    ) -> AppResult<Option<Navigation>> {
        self.navigator.advance_entries(question_id, entries).await
    }

    pub fn go_back(&mut self) -> Option<String> {
        self.navigator.go_back()
    }

    // ------------------------------------------------------------------
    // Storage location
    // ------------------------------------------------------------------

    pub async fn location(&self) -> AppResult<Option<String>> {
        Ok(self.store.transport().configured_location().await?)
    }

    pub async fn set_location(&self, location: &str) -> AppResult<()> {
        self.store.transport().set_configured_location(location).await?;
        info!(location = %location, "Storage location configured");
        Ok(())
    }

    pub async fn clear_location(&self) -> AppResult<()> {
        self.store.transport().clear_configured_location().await?;
        info!("Storage location cleared");
        Ok(())
    }
}

fn build_transport(config: &Config) -> AppResult<Arc<dyn ByteStore>> {
    let transport = &config.transport;
    match &transport.remote_url {
        Some(url) => {
            let store = HttpByteStore::new(url, config.request.clone())?
                .with_known_location(transport.location.clone());
            Ok(Arc::new(store))
        }
        None => {
            let mut store = FileByteStore::new(transport.store_path.clone());
            if let Some(location) = &transport.location {
                store = store.with_location(PathBuf::from(location));
            }
            Ok(Arc::new(store))
        }
    }
}

/// Load the catalog file if one is configured, else the built-in catalog.
pub fn load_catalog(config: &FlowConfig) -> AppResult<FlowCatalog> {
    let Some(path) = &config.catalog_path else {
        return Ok(FlowCatalog::builtin()?);
    };
    let json = std::fs::read_to_string(path).map_err(|e| AppError::Config {
        message: format!("Failed to read flow catalog {}: {}", path.display(), e),
    })?;
    Ok(FlowCatalog::from_json(&json)?)
}
