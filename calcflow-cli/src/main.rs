//! `calcflow`: one polling pass over a calculations directory per invocation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use calcflow::config::WORKFLOW_CONFIG_FILE;
use calcflow::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "calcflow", version, about = "Drive materials through VASP stages on SLURM")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Calculations directory, one material per subdirectory.
    #[arg(long, short = 'd', default_value = ".", global = true)]
    base_dir: PathBuf,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// More log output; repeat for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll every material once and write the results document.
    Run(RunArgs),
    /// Print progress from the stored stage records without polling.
    Summary,
    /// Place the stop sentinel for a material.
    Stop {
        /// Material directory name.
        material: String,
    },
    /// Cancel a stage's job and delete its directory so it starts over.
    Reset {
        /// Material directory name.
        material: String,
        /// Stage kind, e.g. `relax` or `bulkmod`.
        #[arg(value_parser = parse_stage)]
        stage: StageKind,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Stages to run, comma separated; overrides workflow.json.
    #[arg(long, value_delimiter = ',', value_parser = parse_stage)]
    stages: Vec<StageKind>,

    /// Materials polled concurrently.
    #[arg(long)]
    workers: Option<usize>,

    /// Render inputs but leave jobs unsubmitted.
    #[arg(long)]
    no_submit: bool,

    /// Rerun relaxations without spin below this moment per atom.
    #[arg(long)]
    magmom_cutoff: Option<f64>,
}

fn parse_stage(s: &str) -> Result<StageKind, String> {
    s.parse::<StageKind>().map_err(|e| e.to_string())
}

impl GlobalArgs {
    fn log_config(&self) -> LogConfig {
        let level = match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        LogConfig::default().with_level(level).with_json(self.json_logs)
    }

    fn workflow(&self) -> Result<WorkflowConfig> {
        let path = self.base_dir.join(WORKFLOW_CONFIG_FILE);
        WorkflowConfig::load_or_default(&path)
            .with_context(|| format!("reading {}", path.display()))
    }

    fn engine(&self, workflow: WorkflowConfig) -> Result<Engine> {
        let ctx = WorkflowContext::load(&self.base_dir, workflow)
            .with_context(|| format!("loading configuration from {}", self.base_dir.display()))?;
        let store = Arc::new(FsStore::new(&self.base_dir, ctx.workflow.stop_file.clone()));
        let scheduler = match &ctx.site.user_id {
            Some(user) => SlurmScheduler::new().with_user(user.clone()),
            None => SlurmScheduler::new(),
        };
        Ok(Engine::new(Arc::new(ctx), store, Arc::new(scheduler))
            .with_event_sink(Arc::new(LoggingEventSink::debug())))
    }
}

impl RunArgs {
    fn apply(&self, mut workflow: WorkflowConfig) -> WorkflowConfig {
        if !self.stages.is_empty() {
            workflow = workflow.with_stages(&self.stages);
        }
        if let Some(workers) = self.workers {
            workflow = workflow.with_workers(workers);
        }
        if let Some(cutoff) = self.magmom_cutoff {
            workflow = workflow.with_magmom_cutoff(cutoff);
        }
        if self.no_submit {
            workflow = workflow.with_submit(false);
        }
        workflow
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.log_config());

    match &cli.command {
        Command::Run(args) => {
            let workflow = args.apply(cli.global.workflow()?);
            workflow.validate()?;
            let engine = cli.global.engine(workflow)?;
            let document = engine.run().await?;
            info!(
                run_id = %document.run_id,
                path = %engine.context().results_path().display(),
                "Results written"
            );
            println!("{}", document.summary());
        }
        Command::Summary => {
            let engine = cli.global.engine(cli.global.workflow()?)?;
            let reports: BTreeMap<_, _> = engine
                .materials()?
                .into_iter()
                .map(|material| {
                    let report = engine.collect(&material);
                    (material, report)
                })
                .collect();
            println!("{}", Summary::from_reports(&reports));
        }
        Command::Stop { material } => {
            let workflow = cli.global.workflow()?;
            FsStore::new(&cli.global.base_dir, workflow.stop_file).set_stopped(material)?;
            info!(material = %material, "Stop sentinel placed");
        }
        Command::Reset { material, stage } => {
            let engine = cli.global.engine(cli.global.workflow()?)?;
            engine.reset_stage(material, *stage).await?;
        }
    }
    Ok(())
}
