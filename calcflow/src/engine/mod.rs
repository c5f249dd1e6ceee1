//! The polling engine.
//!
//! One [`Engine::tick`] reads every material's stage records, asks the
//! scheduler once per material about live jobs, advances each stage by at
//! most one transition and writes the changed records back. Ticks are
//! idempotent: a tick that observes nothing new changes nothing.

mod machine;
pub mod record;
pub mod retry;
pub mod store;

pub use record::{Deformation, JobRecord, Remediation, RunRecord, StageBody, StageRecord, SubStage};
pub use retry::{decide, RetryDecision, RetryPolicy};
pub use store::{ArchiveStatus, FsStore, MaterialStore, StageLocation};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{
    CalcConfig, SiteConfig, WorkflowConfig, CALC_CONFIG_FILE, COMPUTING_CONFIG_FILE,
    POTENTIAL_TABLE_FILE,
};
use crate::core::{files, MaterialStatus, StageKind, StageState};
use crate::deck::PseudopotentialTable;
use crate::errors::{ConfigError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::results::{MaterialReport, ResultsDocument, StageReport};
use crate::scheduler::Scheduler;
use crate::script::JobScriptRenderer;
use crate::structure::Structure;

use machine::MaterialPass;

/// Configuration shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    /// Calculations directory.
    pub base_dir: PathBuf,
    /// Run-wide settings.
    pub workflow: WorkflowConfig,
    /// Global parameter layer.
    pub calc: CalcConfig,
    /// Computer settings.
    pub site: SiteConfig,
    /// Pseudopotentials for every element in the calculations directory.
    pub potentials: PseudopotentialTable,
    /// Job script renderer.
    pub renderer: JobScriptRenderer,
    /// Identifier of this driver invocation.
    pub run_id: Uuid,
}

impl WorkflowContext {
    /// Loads every configuration document under `base_dir`.
    pub fn load(base_dir: impl Into<PathBuf>, workflow: WorkflowConfig) -> std::result::Result<Self, ConfigError> {
        let base_dir = base_dir.into();
        workflow.validate()?;
        let calc = CalcConfig::load(&base_dir.join(CALC_CONFIG_FILE))?;
        let site = SiteConfig::load(&base_dir.join(COMPUTING_CONFIG_FILE))?;
        let renderer = JobScriptRenderer::for_site(&site, &base_dir)?;
        let potentials = PseudopotentialTable::load(
            &base_dir.join(&site.potcar_dir),
            &base_dir.join(POTENTIAL_TABLE_FILE),
            &elements_under(&base_dir),
        )?;
        Ok(Self::new(base_dir, workflow, calc, site, potentials).with_renderer(renderer))
    }

    /// Assembles a context from already loaded parts.
    #[must_use]
    pub fn new(
        base_dir: impl Into<PathBuf>,
        workflow: WorkflowConfig,
        calc: CalcConfig,
        site: SiteConfig,
        potentials: PseudopotentialTable,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            workflow,
            calc,
            site,
            potentials,
            renderer: JobScriptRenderer::default(),
            run_id: Uuid::now_v7(),
        }
    }

    /// Sets the job script renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: JobScriptRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Retry limits for this run.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(&self.workflow, &self.site)
    }

    /// Path of the results document.
    #[must_use]
    pub fn results_path(&self) -> PathBuf {
        self.base_dir.join(&self.workflow.results_file)
    }
}

fn elements_under(base_dir: &Path) -> BTreeSet<String> {
    let mut elements = BTreeSet::new();
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return elements;
    };
    for entry in entries.flatten() {
        let poscar = entry.path().join(files::POSCAR);
        if !poscar.is_file() {
            continue;
        }
        match Structure::read(&poscar) {
            Ok(structure) => elements.extend(structure.elements()),
            Err(e) => warn!(path = %poscar.display(), error = %e, "Skipping unreadable POSCAR"),
        }
    }
    elements
}

/// Drives materials through their stages.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<WorkflowContext>,
    store: Arc<dyn MaterialStore>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("base_dir", &self.ctx.base_dir)
            .field("run_id", &self.ctx.run_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine that discards events.
    #[must_use]
    pub fn new(
        ctx: Arc<WorkflowContext>,
        store: Arc<dyn MaterialStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            ctx,
            store,
            scheduler,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shared configuration.
    #[must_use]
    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    /// The store the engine works on.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MaterialStore> {
        &self.store
    }

    /// Every material in the store.
    pub fn materials(&self) -> Result<Vec<String>> {
        self.store.materials()
    }

    /// Advances one material by one polling pass.
    pub async fn tick_material(&self, material: &str) -> MaterialReport {
        let span = info_span!("material", material = %material);
        self.tick_inner(material).instrument(span).await
    }

    async fn tick_inner(&self, material: &str) -> MaterialReport {
        let stages = self.ctx.workflow.ordered_stages();
        let (mut records, load_error) = self.load_records(material, &stages);
        if let Some(e) = load_error {
            error!(error = %e, "Cannot read stage records");
            return self.report(material, &stages, &records, Some(e));
        }

        if self.store.is_stopped(material) {
            for record in records.values_mut() {
                let before = record.clone();
                self.stop_stage(material, record).await;
                self.save_if_changed(material, &before, record);
            }
            return self.report(material, &stages, &records, None);
        }

        let live: Vec<_> = records.values().flat_map(StageRecord::live_jobs).collect();
        let statuses = if live.is_empty() {
            HashMap::new()
        } else {
            match self.scheduler.query(&live).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    warn!(error = %e, "Queue query failed; leaving stages untouched");
                    return self.report(material, &stages, &records, None);
                }
            }
        };

        let pass = match MaterialPass::load(self, material, statuses) {
            Ok(pass) => pass,
            Err(e) => {
                error!(error = %e, "Material inputs are invalid");
                return self.report(material, &stages, &records, Some(e.to_string()));
            }
        };

        let mut material_error = None;
        for &kind in &stages {
            let location = StageLocation::stage(material, kind);
            match records.get(&kind) {
                None => {
                    let ready = kind
                        .prerequisite(&stages)
                        .map_or(true, |p| records.get(&p).is_some_and(|r| r.state == StageState::Converged));
                    if !ready {
                        continue;
                    }
                    match pass.start(kind, &records, &stages).await {
                        Ok(record) => {
                            self.save(material, &record);
                            records.insert(kind, record);
                        }
                        Err(e) => {
                            error!(stage = %kind, error = %e, "Stage configuration is invalid");
                            material_error = Some(e.to_string());
                            break;
                        }
                    }
                }
                Some(record) if record.state.is_terminal() => {}
                Some(_) if self.store.archive_status(&location) == ArchiveStatus::Zipped => {}
                Some(record) => {
                    let before = record.clone();
                    let mut record = before.clone();
                    pass.advance(&mut record).await;
                    self.save_if_changed(material, &before, &record);
                    records.insert(kind, record);
                }
            }
        }

        self.report(material, &stages, &records, material_error)
    }

    /// Loads every readable record; unreadable ones are reported in the
    /// returned message and left out of the map.
    fn load_records(
        &self,
        material: &str,
        stages: &[StageKind],
    ) -> (BTreeMap<StageKind, StageRecord>, Option<String>) {
        let mut records = BTreeMap::new();
        let mut errors = Vec::new();
        for &kind in stages {
            match self.store.load_record(&StageLocation::stage(material, kind)) {
                Ok(Some(record)) => {
                    records.insert(kind, record);
                }
                Ok(None) => {}
                Err(e) => errors.push(format!("{kind}: {e}")),
            }
        }
        let error = (!errors.is_empty()).then(|| errors.join("; "));
        (records, error)
    }

    fn save(&self, material: &str, record: &StageRecord) {
        let location = StageLocation::stage(material, record.kind);
        if let Err(e) = self.store.save_record(&location, record) {
            error!(stage = %record.kind, error = %e, "Cannot save stage record");
        }
    }

    fn save_if_changed(&self, material: &str, before: &StageRecord, after: &StageRecord) {
        if before != after {
            self.save(material, after);
        }
    }

    fn report(
        &self,
        material: &str,
        stages: &[StageKind],
        records: &BTreeMap<StageKind, StageRecord>,
        error: Option<String>,
    ) -> MaterialReport {
        let status = material_status(self.store.is_stopped(material), stages, records, error.is_some());
        let stages = stages
            .iter()
            .map(|kind| {
                let report = records.get(kind).map_or_else(StageReport::not_ready, StageReport::from_record);
                (*kind, report)
            })
            .collect();
        MaterialReport {
            status,
            stages,
            error,
        }
    }

    /// Builds a material's report from its stored records without polling.
    pub fn collect(&self, material: &str) -> MaterialReport {
        let stages = self.ctx.workflow.ordered_stages();
        let (records, error) = self.load_records(material, &stages);
        self.report(material, &stages, &records, error)
    }

    /// Ticks every named material, at most `workers` at a time.
    pub async fn tick(&self, materials: &[String]) -> BTreeMap<String, MaterialReport> {
        let timer = SpanTimer::start("tick");
        let permits = Arc::new(Semaphore::new(self.ctx.workflow.workers.max(1)));
        let mut tasks = FuturesUnordered::new();
        for material in materials {
            let engine = self.clone();
            let permits = Arc::clone(&permits);
            let name = material.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                engine.tick_material(&name).await
            });
            tasks.push(async move { (material.clone(), handle.await) });
        }

        let stages = self.ctx.workflow.ordered_stages();
        let mut reports = BTreeMap::new();
        while let Some((material, joined)) = tasks.next().await {
            let report = match joined {
                Ok(report) => report,
                Err(join_error) => {
                    error!(material = %material, error = %join_error, "Material task join error");
                    MaterialReport::errored(&stages, format!("task join error: {join_error}"))
                }
            };
            reports.insert(material, report);
        }
        info!(
            materials = reports.len(),
            duration_ms = timer.finish(),
            "Tick complete"
        );
        reports
    }

    /// Ticks every material in the store and writes the results document.
    pub async fn run(&self) -> Result<ResultsDocument> {
        let materials = self.materials()?;
        info!(materials = materials.len(), run_id = %self.ctx.run_id, "Polling materials");
        let reports = self.tick(&materials).await;
        let document = ResultsDocument {
            run_id: self.ctx.run_id,
            generated_at: Utc::now(),
            materials: reports,
        };
        document.write(&self.ctx.results_path())?;
        Ok(document)
    }

    /// Cancels a stage's live jobs and deletes its directory.
    pub async fn reset_stage(&self, material: &str, kind: StageKind) -> Result<()> {
        let location = StageLocation::stage(material, kind);
        if let Some(record) = self.store.load_record(&location)? {
            for id in record.live_jobs() {
                if let Err(e) = self.scheduler.cancel(id).await {
                    warn!(material = %material, stage = %kind, job_id = %id, error = %e, "Cancel failed");
                }
            }
        }
        self.store.remove_stage(&location)?;
        info!(material = %material, stage = %kind, "Stage reset");
        Ok(())
    }
}

fn material_status(
    stopped: bool,
    stages: &[StageKind],
    records: &BTreeMap<StageKind, StageRecord>,
    errored: bool,
) -> MaterialStatus {
    if stopped {
        return MaterialStatus::Stopped;
    }
    if errored {
        return MaterialStatus::Active;
    }
    let pending = stages.iter().any(|kind| match records.get(kind) {
        Some(record) => !record.state.is_terminal(),
        None => kind
            .prerequisite(stages)
            .map_or(true, |p| records.get(&p).is_some_and(|r| r.state == StageState::Converged)),
    });
    if pending {
        MaterialStatus::Active
    } else {
        MaterialStatus::Done
    }
}
