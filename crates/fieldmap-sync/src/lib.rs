//! Sync pipeline orchestration: field pages → mapping state → rewritten record pages.
//!
//! Per entity, the stored state is loaded, every field page is folded into it
//! and the result is saved before any record is touched. Entities are synced
//! one after another, so a run is the only writer of each state key. Record
//! pages are then rewritten concurrently against a frozen snapshot of the
//! merged state and handed to a [`LoadSink`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldmap_adapters::{load_page_file, Entity, EntitySource, FixtureSource};
use fieldmap_core::{
    merge_pages, rewrite, FieldDefinition, MappingState, MergeReport, NamingConvention, RawRecord,
    RewrittenRecord, SnakeCaseNaming,
};
use fieldmap_storage::{JsonFileStateStore, SaveOutcome, StateStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldmap-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRegistry {
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub entity: Entity,
    pub enabled: bool,
    /// Bundle path relative to the workspace root; defaults to
    /// `<fixtures>/<entity>/sample/bundle.json`.
    #[serde(default)]
    pub bundle: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl EntityRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing entity registry")
    }

    pub fn enabled(&self) -> impl Iterator<Item = &EntityConfig> {
        self.entities.iter().filter(|e| e.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_path: PathBuf,
    pub fixtures_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            state_path: workspace_root.join("state").join("fieldmap_state.json"),
            fixtures_dir: workspace_root.join("fixtures"),
            output_dir: workspace_root.join("reports"),
            workspace_root,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::for_workspace(
            std::env::var("FIELDMAP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        );
        Self {
            state_path: std::env::var("FIELDMAP_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_path),
            fixtures_dir: std::env::var("FIELDMAP_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            output_dir: std::env::var("FIELDMAP_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            workspace_root: defaults.workspace_root,
        }
    }
}

/// Downstream stage receiving rewritten pages.
#[async_trait]
pub trait LoadSink: Send + Sync {
    async fn load(
        &self,
        run_id: Uuid,
        entity: Entity,
        pages: &[Vec<RewrittenRecord>],
    ) -> Result<()>;
}

/// Writes `<root>/<run_id>/<entity>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, run_id: Uuid, entity: Entity) -> PathBuf {
        self.root
            .join(run_id.to_string())
            .join(format!("{}.json", entity.as_str()))
    }
}

#[async_trait]
impl LoadSink for JsonDirSink {
    async fn load(
        &self,
        run_id: Uuid,
        entity: Entity,
        pages: &[Vec<RewrittenRecord>],
    ) -> Result<()> {
        let path = self.path_for(run_id, entity);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "entity": entity,
            "pages": pages,
        }))
        .with_context(|| format!("serializing {entity} pages"))?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    loaded: Mutex<Vec<(Entity, Vec<Vec<RewrittenRecord>>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records_for(&self, entity: Entity) -> Vec<RewrittenRecord> {
        self.loaded
            .lock()
            .await
            .iter()
            .filter(|(e, _)| *e == entity)
            .flat_map(|(_, pages)| pages.iter().flatten().cloned())
            .collect()
    }

    pub async fn loads(&self) -> usize {
        self.loaded.lock().await.len()
    }
}

#[async_trait]
impl LoadSink for MemorySink {
    async fn load(
        &self,
        _run_id: Uuid,
        entity: Entity,
        pages: &[Vec<RewrittenRecord>],
    ) -> Result<()> {
        self.loaded.lock().await.push((entity, pages.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySyncSummary {
    pub entity: Entity,
    pub state_key: String,
    pub field_pages: usize,
    pub definitions: usize,
    pub merge: MergeReport,
    pub state_entries: usize,
    pub state_digest: String,
    pub state_unchanged: bool,
    pub record_pages: usize,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<EntitySyncSummary>,
    /// Enabled entities without a bundle.
    pub skipped: Vec<Entity>,
    pub summary_path: String,
}

impl SyncRunSummary {
    pub fn records(&self) -> usize {
        self.entities.iter().map(|e| e.records).sum()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn LoadSink>,
    naming: Arc<dyn NamingConvention>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(JsonFileStateStore::new(config.state_path.clone()));
        let sink = Arc::new(JsonDirSink::new(config.output_dir.clone()));
        Self {
            config,
            store,
            sink,
            naming: Arc::new(SnakeCaseNaming),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LoadSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_naming(mut self, naming: Arc<dyn NamingConvention>) -> Self {
        self.naming = naming;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_registry().await?;

        let mut entities = Vec::new();
        let mut skipped = Vec::new();
        for entry in registry.enabled() {
            let bundle_path = self.bundle_path_for(entry);
            let exists = fs::try_exists(&bundle_path)
                .await
                .with_context(|| format!("checking {}", bundle_path.display()))?;
            if !exists {
                warn!(
                    entity = %entry.entity,
                    path = %bundle_path.display(),
                    "no bundle for enabled entity; skipping"
                );
                skipped.push(entry.entity);
                continue;
            }
            let source = FixtureSource::from_path(entry.entity, &bundle_path)?;
            entities.push(self.sync_entity(run_id, &source).await?);
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            entities,
            skipped,
            summary_path: String::new(),
        };
        let summary_path = self.write_summary(&summary).await?;
        summary.summary_path = summary_path.display().to_string();
        Ok(summary)
    }

    pub async fn sync_entity(
        &self,
        run_id: Uuid,
        source: &dyn EntitySource,
    ) -> Result<EntitySyncSummary> {
        let entity = source.entity();
        let span = info_span!("entity_sync", %run_id, %entity);
        self.sync_entity_inner(run_id, source).instrument(span).await
    }

    async fn sync_entity_inner(
        &self,
        run_id: Uuid,
        source: &dyn EntitySource,
    ) -> Result<EntitySyncSummary> {
        let entity = source.entity();
        let state_key = entity.state_key();

        let state = self
            .store
            .load(&state_key)
            .await
            .with_context(|| format!("loading mapping state {state_key}"))?;
        let field_pages = source
            .field_pages()
            .await
            .with_context(|| format!("reading {} pages", entity.fields_endpoint()))?;
        let definitions: usize = field_pages.iter().map(Vec::len).sum();
        let (state, merge) = merge_pages(&field_pages, state, self.naming.as_ref());
        let saved = self
            .store
            .save(&state_key, &state)
            .await
            .with_context(|| format!("saving mapping state {state_key}"))?;

        let record_pages = source
            .record_pages()
            .await
            .with_context(|| format!("reading {entity} pages"))?;
        let page_count = record_pages.len();
        let rewritten = rewrite_pages(Arc::new(state), record_pages).await?;
        let records: usize = rewritten.iter().map(Vec::len).sum();
        self.sink
            .load(run_id, entity, &rewritten)
            .await
            .with_context(|| format!("loading rewritten {entity} pages"))?;

        info!(
            created = merge.created,
            extended = merge.extended,
            options_added = merge.options_added,
            state_entries = saved.entries,
            state_unchanged = saved.unchanged,
            records,
            "entity synced"
        );

        Ok(EntitySyncSummary {
            entity,
            state_key,
            field_pages: field_pages.len(),
            definitions,
            merge,
            state_entries: saved.entries,
            state_digest: saved.digest,
            state_unchanged: saved.unchanged,
            record_pages: page_count,
            records,
        })
    }

    /// Merge one page file (envelope or bare array) into the stored state.
    pub async fn merge_field_file(
        &self,
        entity: Entity,
        path: impl AsRef<Path>,
    ) -> Result<(MergeReport, SaveOutcome)> {
        let definitions: Vec<FieldDefinition> = load_page_file(path)?;
        let state_key = entity.state_key();
        let state = self.store.load(&state_key).await?;
        let (state, report) = merge_pages(&[definitions], state, self.naming.as_ref());
        let saved = self.store.save(&state_key, &state).await?;
        Ok((report, saved))
    }

    /// Rewrite one record page file with the stored state; the state is not modified.
    pub async fn rewrite_record_file(
        &self,
        entity: Entity,
        path: impl AsRef<Path>,
    ) -> Result<Vec<RewrittenRecord>> {
        let records: Vec<RawRecord> = load_page_file(path)?;
        let state = self.store.load(&entity.state_key()).await?;
        Ok(rewrite(records, &state))
    }

    pub async fn stored_states(
        &self,
        entity: Option<Entity>,
    ) -> Result<BTreeMap<String, MappingState>> {
        let keys = match entity {
            Some(entity) => vec![entity.state_key()],
            None => self.store.keys().await?,
        };
        let mut states = BTreeMap::new();
        for key in keys {
            let state = self.store.load(&key).await?;
            states.insert(key, state);
        }
        Ok(states)
    }

    async fn load_registry(&self) -> Result<EntityRegistry> {
        let path = self.config.workspace_root.join("entities.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        EntityRegistry::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn bundle_path_for(&self, entry: &EntityConfig) -> PathBuf {
        match &entry.bundle {
            Some(path) => self.config.workspace_root.join(path),
            None => self
                .config
                .fixtures_dir
                .join(entry.entity.as_str())
                .join("sample")
                .join("bundle.json"),
        }
    }

    async fn write_summary(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let run_dir = self.config.output_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Rewrite pages on blocking tasks against one shared snapshot; output keeps page order.
pub async fn rewrite_pages(
    state: Arc<MappingState>,
    pages: Vec<Vec<RawRecord>>,
) -> Result<Vec<Vec<RewrittenRecord>>> {
    let handles = pages
        .into_iter()
        .map(|page| {
            let state = Arc::clone(&state);
            tokio::task::spawn_blocking(move || rewrite(page, &state))
        })
        .collect::<Vec<_>>();

    let mut rewritten = Vec::with_capacity(handles.len());
    for handle in handles {
        rewritten.push(handle.await.context("rewrite task failed")?);
    }
    Ok(rewritten)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env()).run_once().await
}
