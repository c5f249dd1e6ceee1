//! Stage transitions for one material within one tick.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

use super::record::{Deformation, JobRecord, RunRecord, StageBody, StageRecord, SubStage};
use super::retry::{decide, RetryDecision};
use super::store::StageLocation;
use super::Engine;
use crate::analysis::{
    self, elastic_strain_set, fit_birch_murnaghan, fit_elastic_tensor, outputs, stress_from_kbar,
    StageResult, StressSample,
};
use crate::config::{resolve_stage_parameters, CalcConfig, StageParameters};
use crate::core::{
    diagnose, files, ConvergenceRule, Diagnostic, RunLogs, StageKind, StageState, Walltime,
};
use crate::deck::{build_deck, DeckRequest};
use crate::errors::{AnalysisError, CalcflowError, ConfigError, Result};
use crate::events::{EventKind, WorkflowEvent};
use crate::scheduler::{JobId, JobStatus};
use crate::script::ScriptRequest;
use crate::structure::Structure;

/// One job directory being advanced: a plain stage or a sub-run.
struct RunTarget<'t> {
    kind: StageKind,
    location: StageLocation,
    params: &'t StageParameters,
    use_spin: bool,
    substage: Option<&'t str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Pending,
    Converged,
    Failed,
    Stopped,
}

impl RunOutcome {
    fn of(run: &RunRecord) -> Self {
        match run.state {
            StageState::Converged => Self::Converged,
            StageState::Failed => Self::Failed,
            StageState::Stopped => Self::Stopped,
            _ => Self::Pending,
        }
    }
}

/// What a converged single-job stage turned out to need.
enum Verdict {
    Accept(StageResult),
    SpinOverride { magmom_per_atom: f64 },
    VolumeChanged { relative_change: f64 },
}

impl Engine {
    async fn emit(&self, event: WorkflowEvent) {
        self.sink.emit(&event).await;
    }

    /// Halts a stage: cancels its jobs and marks every unfinished run stopped.
    pub(super) async fn stop_stage(&self, material: &str, record: &mut StageRecord) {
        if record.state.is_terminal() {
            return;
        }
        for id in record.live_jobs() {
            if let Err(e) = self.scheduler.cancel(id).await {
                warn!(stage = %record.kind, job_id = %id, error = %e, "Best-effort cancel failed");
            }
        }
        for run in record.runs_mut() {
            if !run.state.is_terminal() {
                run.state = StageState::Stopped;
                run.job = None;
            }
        }
        record.state = StageState::Stopped;
        info!(stage = %record.kind, state = %record.state, "Stage stopped");
        self.emit(WorkflowEvent::new(EventKind::StageStopped, material).with_stage(record.kind))
            .await;
    }
}

/// State loaded once per material per tick.
pub(super) struct MaterialPass<'a> {
    engine: &'a Engine,
    material: &'a str,
    input: Structure,
    overrides: Option<CalcConfig>,
    statuses: HashMap<JobId, JobStatus>,
}

impl<'a> MaterialPass<'a> {
    /// Reads the material's POSCAR and per-material overrides.
    pub(super) fn load(
        engine: &'a Engine,
        material: &'a str,
        statuses: HashMap<JobId, JobStatus>,
    ) -> Result<Self> {
        let root = StageLocation::material_root(material);
        let input = engine
            .store
            .read_structure(&root, files::POSCAR)?
            .ok_or_else(|| ConfigError::new(format!("material '{material}' has no POSCAR")))?;
        let overrides = engine.store.material_overrides(material)?;
        Ok(Self {
            engine,
            material,
            input,
            overrides,
            statuses,
        })
    }

    async fn emit(&self, kind: EventKind, stage: StageKind, data: serde_json::Value) {
        self.engine
            .emit(
                WorkflowEvent::new(kind, self.material)
                    .with_stage(stage)
                    .with_data(data),
            )
            .await;
    }

    /// Creates a stage whose prerequisite has converged, writes its inputs
    /// and submits it. Only configuration errors escape; anything else
    /// fails the new stage.
    pub(super) async fn start(
        &self,
        kind: StageKind,
        records: &BTreeMap<StageKind, StageRecord>,
        stages: &[StageKind],
    ) -> std::result::Result<StageRecord, ConfigError> {
        let ctx = &self.engine.ctx;
        let location = StageLocation::stage(self.material, kind);
        let stage_layer = self.engine.store.stage_overrides(&location)?;
        let params = resolve_stage_parameters(
            kind,
            &ctx.calc,
            self.overrides.as_ref(),
            stage_layer.as_ref(),
        )?;
        if params.walltime > ctx.workflow.max_walltime {
            return Err(ConfigError::new(format!(
                "{kind} walltime {} exceeds max_walltime {}",
                params.walltime, ctx.workflow.max_walltime
            )));
        }

        let use_spin = if kind.is_relaxation() {
            true
        } else {
            [StageKind::Relax, StageKind::CoarseRelax]
                .iter()
                .find_map(|k| records.get(k))
                .map_or(true, |r| r.use_spin)
        };
        let walltime = params.walltime;
        let body = match kind {
            StageKind::BulkModulus => {
                StageBody::Strained(bulk_substages(&ctx.workflow.bulk_modulus_strains, walltime))
            }
            StageKind::Elastic => {
                StageBody::Strained(elastic_substages(&ctx.workflow.elastic_strains, walltime))
            }
            _ => StageBody::Single(RunRecord::new(walltime)),
        };
        let mut record = StageRecord::new(kind, params, use_spin, body);
        info!(stage = %kind, use_spin, walltime = %walltime, "Starting stage");

        let launched = match self.starting_structure(kind, stages) {
            Ok(structure) => self.launch(&mut record, &structure).await,
            Err(e) => Err(e),
        };
        if let Err(e) = launched {
            self.fail_stage(&mut record, e.to_string()).await;
        }
        Ok(record)
    }

    fn starting_structure(&self, kind: StageKind, stages: &[StageKind]) -> Result<Structure> {
        if let Some(prerequisite) = kind.prerequisite(stages) {
            let location = StageLocation::stage(self.material, prerequisite);
            if let Some(structure) = self.engine.store.read_structure(&location, files::CONTCAR)? {
                return Ok(structure);
            }
        }
        Ok(self.input.clone())
    }

    async fn launch(&self, record: &mut StageRecord, structure: &Structure) -> Result<()> {
        let StageRecord {
            kind,
            params,
            use_spin,
            body,
            ..
        } = &mut *record;
        let location = StageLocation::stage(self.material, *kind);
        match body {
            StageBody::Single(run) => {
                let target = RunTarget {
                    kind: *kind,
                    location,
                    params: &*params,
                    use_spin: *use_spin,
                    substage: None,
                };
                self.prepare_run(&target, structure, run)?;
                self.submit_run(&target, run).await;
            }
            StageBody::Strained(subs) => {
                for (name, sub) in subs.iter_mut() {
                    let target = RunTarget {
                        kind: *kind,
                        location: location.sub_stage(name),
                        params: &*params,
                        use_spin: *use_spin,
                        substage: Some(name.as_str()),
                    };
                    let strained = sub.deformation.apply(structure);
                    self.prepare_run(&target, &strained, &mut sub.run)?;
                    self.submit_run(&target, &mut sub.run).await;
                }
            }
        }
        Ok(())
    }

    /// Renders the deck and script for the run's next submission.
    fn prepare_run(&self, target: &RunTarget<'_>, structure: &Structure, run: &mut RunRecord) -> Result<()> {
        let ctx = &self.engine.ctx;
        let params = run.effective_params(target.params);
        let deck = build_deck(
            &DeckRequest {
                kind: target.kind,
                params: &params,
                structure,
                site: &ctx.site,
                use_spin: target.use_spin,
            },
            &ctx.potentials,
        )?;
        let script = ctx.renderer.render(&ScriptRequest {
            kind: target.kind,
            name: self.material,
            site: &ctx.site,
            num_atoms: structure.num_atoms(),
            walltime: run.walltime,
            memory_reserve: run.memory_reserve(&ctx.site),
        })?;
        self.engine.store.write_inputs(&target.location, &deck, &script)?;
        run.deck_fingerprint = Some(deck.fingerprint());
        Ok(())
    }

    /// Submits a queued run that has no job. A rejected submission leaves
    /// the run queued for the next tick and costs no retry.
    async fn submit_run(&self, target: &RunTarget<'_>, run: &mut RunRecord) {
        if !self.engine.ctx.workflow.submit || run.job.is_some() || run.state != StageState::Queued {
            return;
        }
        let script = self.engine.store.script_path(&target.location);
        match self.engine.scheduler.submit(&script).await {
            Ok(id) => {
                run.job = Some(JobRecord {
                    id,
                    submitted_at: Utc::now(),
                });
                info!(
                    stage = %target.kind,
                    substage = target.substage.unwrap_or_default(),
                    job_id = %id,
                    walltime = %run.walltime,
                    retry_count = run.retry_count,
                    "Submitted"
                );
                self.emit(
                    EventKind::StageSubmitted,
                    target.kind,
                    json!({
                        "job_id": id,
                        "substage": target.substage,
                        "walltime": run.walltime.to_string(),
                    }),
                )
                .await;
            }
            Err(e) => {
                warn!(
                    stage = %target.kind,
                    substage = target.substage.unwrap_or_default(),
                    error = %e,
                    "Submission failed; will try again on the next poll"
                );
            }
        }
    }

    /// Moves one stage forward by at most one transition.
    pub(super) async fn advance(&self, record: &mut StageRecord) {
        match record.body {
            StageBody::Single(_) => self.advance_single(record).await,
            StageBody::Strained(_) => self.advance_strained(record).await,
        }
    }

    async fn advance_run(&self, target: &RunTarget<'_>, run: &mut RunRecord) -> RunOutcome {
        match run.state {
            StageState::Converged | StageState::Failed | StageState::Stopped => {
                return RunOutcome::of(run);
            }
            StageState::NeedsRetry => {
                self.resubmit(target, run).await;
                return RunOutcome::of(run);
            }
            StageState::NotReady | StageState::Queued | StageState::Running => {}
        }

        let Some(job_id) = run.job.as_ref().map(|job| job.id) else {
            self.submit_run(target, run).await;
            return RunOutcome::Pending;
        };
        let status = self.statuses.get(&job_id).copied().unwrap_or(JobStatus::Absent);
        if status != JobStatus::Absent {
            if run.state != StageState::Running {
                run.state = StageState::Running;
                info!(stage = %target.kind, substage = target.substage.unwrap_or_default(), job_id = %job_id, status = %status, "Job in queue");
            }
            return RunOutcome::Pending;
        }

        let logs = self.read_logs(&target.location);
        let params = run.effective_params(target.params);
        let diagnostic = match diagnose(&logs, params.convergence_rule()) {
            Some(diagnostic) => diagnostic,
            None if run.undiagnosable_passes == 0 => {
                run.undiagnosable_passes = 1;
                run.state = StageState::Running;
                debug!(stage = %target.kind, job_id = %job_id, "Job left the queue before its output appeared");
                return RunOutcome::Pending;
            }
            None => Diagnostic::CrashedUnknown,
        };
        run.undiagnosable_passes = 0;
        run.last_diagnostic = Some(diagnostic.clone());
        run.job = None;

        let ctx = &self.engine.ctx;
        let reserve = run.memory_reserve(&ctx.site);
        match decide(&diagnostic, run, &params, reserve, &ctx.retry_policy()) {
            RetryDecision::Accept => {
                run.state = StageState::Converged;
                info!(
                    stage = %target.kind,
                    substage = target.substage.unwrap_or_default(),
                    job_id = %job_id,
                    diagnostic = %diagnostic,
                    "Run converged"
                );
                RunOutcome::Converged
            }
            RetryDecision::Continue {
                walltime,
                remediation,
                crashed,
            } => {
                run.retry_count += 1;
                if crashed {
                    run.crash_count += 1;
                }
                if let Some(remediation) = &remediation {
                    run.remediations.push(remediation.clone());
                }
                run.walltime = walltime;
                run.state = StageState::NeedsRetry;
                warn!(
                    stage = %target.kind,
                    substage = target.substage.unwrap_or_default(),
                    diagnostic = %diagnostic,
                    retry_count = run.retry_count,
                    walltime = %walltime,
                    "Retrying run"
                );
                self.emit(
                    EventKind::StageRetry,
                    target.kind,
                    json!({
                        "substage": target.substage,
                        "diagnostic": diagnostic.label(),
                        "retry_count": run.retry_count,
                        "walltime": walltime.to_string(),
                        "remediation": remediation,
                    }),
                )
                .await;
                self.resubmit(target, run).await;
                RunOutcome::of(run)
            }
            RetryDecision::Fail(reason) => {
                error!(
                    stage = %target.kind,
                    substage = target.substage.unwrap_or_default(),
                    diagnostic = %diagnostic,
                    retry_count = run.retry_count,
                    reason = %reason,
                    "Run failed"
                );
                debug!(
                    stage = %target.kind,
                    tail = %logs.stdout_tail(ctx.workflow.tail_lines),
                    "Last lines of stdout"
                );
                run.fail(reason);
                RunOutcome::Failed
            }
        }
    }

    fn read_logs(&self, location: &StageLocation) -> RunLogs {
        let read = |file: &str| match self.engine.store.read_text(location, file) {
            Ok(text) => text,
            Err(e) => {
                warn!(file, error = %e, "Cannot read run output");
                None
            }
        };
        RunLogs::new(read(files::STDOUT), read(files::STDERR))
    }

    /// Archives the outputs and resubmits from the continuation structure.
    async fn resubmit(&self, target: &RunTarget<'_>, run: &mut RunRecord) {
        match self.prepare_continuation(target, run) {
            Ok(()) => self.submit_run(target, run).await,
            Err(e) => {
                error!(stage = %target.kind, error = %e, "Cannot prepare continuation");
                run.fail(format!("cannot prepare continuation: {e}"));
            }
        }
    }

    fn prepare_continuation(&self, target: &RunTarget<'_>, run: &mut RunRecord) -> Result<()> {
        let store = &self.engine.store;
        let n = store.archive_outputs(&target.location)?;
        run.attempts = n;
        let archive = target.location.archive(n);

        let relaxing =
            run.effective_params(target.params).convergence_rule() == ConvergenceRule::IonicRelaxation;
        let contcar = if relaxing {
            match store.read_structure(&archive, files::CONTCAR) {
                Ok(contcar) => contcar,
                Err(e) => {
                    warn!(
                        stage = %target.kind,
                        substage = target.substage.unwrap_or_default(),
                        error = %e,
                        "Unreadable CONTCAR; continuing from the archived POSCAR"
                    );
                    None
                }
            }
        } else {
            None
        };
        let structure = match contcar {
            Some(structure) => structure,
            None => store.read_structure(&archive, files::POSCAR)?.ok_or_else(|| {
                AnalysisError::new(target.kind.to_string(), "no structure to continue from")
            })?,
        };

        run.state = StageState::Queued;
        run.job = None;
        self.prepare_run(target, &structure, run)
    }

    async fn fail_stage(&self, record: &mut StageRecord, reason: String) {
        error!(stage = %record.kind, reason = %reason, "Stage failed");
        self.emit(EventKind::StageFailed, record.kind, json!({ "reason": reason }))
            .await;
        record.fail(reason);
    }

    async fn accept_stage(&self, record: &mut StageRecord, result: StageResult) {
        record.result = Some(result);
        record.state = StageState::Converged;
        record.failure = None;
        info!(
            stage = %record.kind,
            state = %record.state,
            retry_count = record.retry_count(),
            "Stage converged"
        );
        self.emit(
            EventKind::StageConverged,
            record.kind,
            json!({ "retry_count": record.retry_count() }),
        )
        .await;
    }

    async fn advance_single(&self, record: &mut StageRecord) {
        let kind = record.kind;
        let StageRecord {
            params,
            use_spin,
            body: StageBody::Single(run),
            ..
        } = &mut *record
        else {
            return;
        };
        let target = RunTarget {
            kind,
            location: StageLocation::stage(self.material, kind),
            params: &*params,
            use_spin: *use_spin,
            substage: None,
        };
        let outcome = self.advance_run(&target, run).await;
        let (state, failure) = (run.state, run.failure.clone());

        match outcome {
            RunOutcome::Pending => record.state = state,
            RunOutcome::Stopped => record.state = StageState::Stopped,
            RunOutcome::Failed => {
                let reason = failure.unwrap_or_else(|| "run failed".to_string());
                self.fail_stage(record, reason).await;
            }
            RunOutcome::Converged => self.finish_single(record).await,
        }
    }

    async fn finish_single(&self, record: &mut StageRecord) {
        match self.analyze_single(record) {
            Ok(Verdict::Accept(result)) => self.accept_stage(record, result).await,
            Ok(Verdict::SpinOverride { magmom_per_atom }) => {
                record.use_spin = false;
                record.spin_override_applied = true;
                warn!(
                    stage = %record.kind,
                    magmom_per_atom,
                    "Moment below cutoff; rerunning without spin polarisation"
                );
                self.emit(
                    EventKind::StageSpinOverride,
                    record.kind,
                    json!({ "magmom_per_atom": magmom_per_atom }),
                )
                .await;
                self.continue_single(record).await;
            }
            Ok(Verdict::VolumeChanged { relative_change }) => {
                let max_retries = self.engine.ctx.workflow.max_retries;
                if record.retry_count() >= max_retries {
                    self.fail_stage(
                        record,
                        format!("volume still changing by {relative_change:.4} after {max_retries} retries"),
                    )
                    .await;
                    return;
                }
                if let StageBody::Single(run) = &mut record.body {
                    run.retry_count += 1;
                }
                warn!(
                    stage = %record.kind,
                    relative_change,
                    retry_count = record.retry_count(),
                    "Volume changed beyond tolerance; continuing relaxation"
                );
                self.emit(
                    EventKind::StageRetry,
                    record.kind,
                    json!({
                        "diagnostic": "volume_change",
                        "relative_change": relative_change,
                        "retry_count": record.retry_count(),
                    }),
                )
                .await;
                self.continue_single(record).await;
            }
            Err(e) => self.fail_stage(record, e.to_string()).await,
        }
    }

    fn analyze_single(&self, record: &StageRecord) -> Result<Verdict> {
        let kind = record.kind;
        let store = &self.engine.store;
        let location = StageLocation::stage(self.material, kind);
        let stdout = store.read_text(&location, files::STDOUT)?.unwrap_or_default();
        let run_input = store
            .read_structure(&location, files::POSCAR)?
            .unwrap_or_else(|| self.input.clone());

        if !kind.is_relaxation() {
            let outcar = store.read_text(&location, files::OUTCAR)?;
            let result = analysis::analyze_static(&stdout, outcar.as_deref(), &run_input, record.use_spin)?;
            return Ok(Verdict::Accept(StageResult::Static(result)));
        }

        let relaxed = store
            .read_structure(&location, files::CONTCAR)?
            .ok_or_else(|| AnalysisError::new(kind.to_string(), "CONTCAR is missing or empty"))?;
        let result = analysis::analyze_relax(kind, &stdout, &self.input, &relaxed, record.use_spin)?;

        if kind == StageKind::Relax {
            let workflow = &self.engine.ctx.workflow;
            if let (Some(cutoff), Some(magmom)) = (workflow.magmom_per_atom_cutoff, result.magmom_per_atom) {
                if record.use_spin && !record.spin_override_applied && magmom.abs() < cutoff {
                    return Ok(Verdict::SpinOverride {
                        magmom_per_atom: magmom,
                    });
                }
            }
            let relative_change = (relaxed.volume() - run_input.volume()).abs() / run_input.volume();
            let tolerance = workflow.relax_volume_tolerance;
            if tolerance > 0.0 && relative_change >= tolerance {
                return Ok(Verdict::VolumeChanged { relative_change });
            }
        }
        Ok(Verdict::Accept(StageResult::Relax(result)))
    }

    /// Resubmits a converged single run as a continuation.
    async fn continue_single(&self, record: &mut StageRecord) {
        let kind = record.kind;
        let StageRecord {
            params,
            use_spin,
            body: StageBody::Single(run),
            ..
        } = &mut *record
        else {
            return;
        };
        run.state = StageState::NeedsRetry;
        let target = RunTarget {
            kind,
            location: StageLocation::stage(self.material, kind),
            params: &*params,
            use_spin: *use_spin,
            substage: None,
        };
        self.resubmit(&target, run).await;
        let (state, failure) = (run.state, run.failure.clone());
        if state == StageState::Failed {
            let reason = failure.unwrap_or_else(|| "continuation failed".to_string());
            self.fail_stage(record, reason).await;
        } else {
            record.state = state;
        }
    }

    async fn advance_strained(&self, record: &mut StageRecord) {
        let kind = record.kind;
        let location = StageLocation::stage(self.material, kind);
        let StageRecord {
            params,
            use_spin,
            body: StageBody::Strained(subs),
            ..
        } = &mut *record
        else {
            return;
        };

        let mut failed = None;
        for (name, sub) in subs.iter_mut() {
            if sub.run.state.is_terminal() {
                continue;
            }
            let target = RunTarget {
                kind,
                location: location.sub_stage(name),
                params: &*params,
                use_spin: *use_spin,
                substage: Some(name.as_str()),
            };
            match self.advance_run(&target, &mut sub.run).await {
                RunOutcome::Converged => {
                    self.emit(EventKind::SubstageConverged, kind, json!({ "substage": name }))
                        .await;
                }
                RunOutcome::Failed => {
                    let reason = sub.run.failure.clone().unwrap_or_default();
                    self.emit(
                        EventKind::SubstageFailed,
                        kind,
                        json!({ "substage": name, "reason": reason }),
                    )
                    .await;
                    failed = Some(format!("sub-stage {name} failed: {reason}"));
                    break;
                }
                RunOutcome::Pending | RunOutcome::Stopped => {}
            }
        }

        if let Some(reason) = failed {
            for (name, sub) in subs.iter_mut() {
                if sub.run.state.is_terminal() {
                    continue;
                }
                if let Some(job) = sub.run.job.take() {
                    if let Err(e) = self.engine.scheduler.cancel(job.id).await {
                        warn!(stage = %kind, substage = %name, job_id = %job.id, error = %e, "Best-effort cancel failed");
                    }
                }
                sub.run.state = StageState::Stopped;
            }
            self.fail_stage(record, reason).await;
            return;
        }

        let states: Vec<StageState> = record.runs().map(|run| run.state).collect();
        if states.iter().all(|s| *s == StageState::Converged) {
            match self.fit_strained(record) {
                Ok(result) => self.accept_stage(record, result).await,
                Err(e) => self.fail_stage(record, e.to_string()).await,
            }
        } else if states.contains(&StageState::Running) {
            record.state = StageState::Running;
        } else if states.contains(&StageState::NeedsRetry) {
            record.state = StageState::NeedsRetry;
        } else {
            record.state = StageState::Queued;
        }
    }

    fn fit_strained(&self, record: &StageRecord) -> Result<StageResult> {
        let kind = record.kind;
        let store = &self.engine.store;
        let location = StageLocation::stage(self.material, kind);
        let StageBody::Strained(subs) = &record.body else {
            return Err(AnalysisError::new(kind.to_string(), "stage has no strained sub-runs").into());
        };
        let missing = |name: &str, what: &str| -> CalcflowError {
            AnalysisError::new(kind.to_string(), format!("{name}: {what}")).into()
        };

        match kind {
            StageKind::BulkModulus => {
                let mut points = Vec::with_capacity(subs.len());
                for name in subs.keys() {
                    let sub_location = location.sub_stage(name);
                    let structure = match store.read_structure(&sub_location, files::CONTCAR)? {
                        Some(structure) => structure,
                        None => store
                            .read_structure(&sub_location, files::POSCAR)?
                            .ok_or_else(|| missing(name, "no structure"))?,
                    };
                    let stdout = store.read_text(&sub_location, files::STDOUT)?.unwrap_or_default();
                    let energy =
                        outputs::final_energy(&stdout).ok_or_else(|| missing(name, "no final energy"))?;
                    points.push((structure.volume(), energy));
                }
                points.sort_by(|a, b| a.0.total_cmp(&b.0));
                let (volumes, energies): (Vec<f64>, Vec<f64>) = points.into_iter().unzip();
                Ok(StageResult::BulkModulus(fit_birch_murnaghan(&volumes, &energies)?))
            }
            StageKind::Elastic => {
                let mut samples = Vec::with_capacity(subs.len());
                for (name, sub) in subs {
                    let Deformation::Voigt(strain) = sub.deformation else {
                        return Err(missing(name, "not a Voigt strain"));
                    };
                    let outcar = store
                        .read_text(&location.sub_stage(name), files::OUTCAR)?
                        .ok_or_else(|| missing(name, "OUTCAR is missing"))?;
                    let kbar = outputs::final_stress(&outcar).ok_or_else(|| missing(name, "no stress in OUTCAR"))?;
                    samples.push(StressSample {
                        strain,
                        stress: stress_from_kbar(kbar),
                    });
                }
                Ok(StageResult::Elastic(fit_elastic_tensor(&samples)?))
            }
            other => Err(missing(&other.to_string(), "stage has no strained sub-runs")),
        }
    }
}

/// Bulk-modulus sub-runs, named by offset from the unstrained middle.
fn bulk_substages(strains: &[f64], walltime: Walltime) -> BTreeMap<String, SubStage> {
    let middle = strains.len() / 2;
    strains
        .iter()
        .enumerate()
        .map(|(i, &scale)| {
            #[allow(clippy::cast_possible_wrap)]
            let offset = i as i64 - middle as i64;
            (
                format!("strain_{offset}"),
                SubStage {
                    deformation: Deformation::Volume { scale },
                    run: RunRecord::new(walltime),
                },
            )
        })
        .collect()
}

fn elastic_substages(magnitudes: &[f64], walltime: Walltime) -> BTreeMap<String, SubStage> {
    elastic_strain_set(magnitudes)
        .into_iter()
        .map(|strain| {
            (
                strain.label(),
                SubStage {
                    deformation: Deformation::Voigt(strain),
                    run: RunRecord::new(walltime),
                },
            )
        })
        .collect()
}
