//! Job script rendering.
//!
//! Templates use `{name}` placeholders. `${NAME}` shell expansions are left
//! alone, so templates can carry ordinary bash.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::config::SiteConfig;
use crate::core::{files, StageKind, Walltime};
use crate::errors::{ConfigError, DeckError};

/// Atoms per node before another node is requested.
pub const ATOMS_PER_NODE: usize = 32;

/// Built-in SLURM template.
pub const DEFAULT_SLURM_TEMPLATE: &str = "#!/bin/bash
#SBATCH -J {jobname}
#SBATCH -N {n_nodes}
#SBATCH --ntasks-per-node={ncore_per_node}
#SBATCH -t {walltime}
#SBATCH -o {stdout}
#SBATCH -e {stderr}
{directives}
{modules}
{run_command}
";

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\$?)\{([a-z_][a-z0-9_]*)\}").expect("valid placeholder pattern")
});

/// Nodes and tasks for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePlan {
    /// Nodes requested.
    pub n_nodes: usize,
    /// MPI tasks per node.
    pub tasks_per_node: usize,
    /// Total MPI tasks.
    pub n_procs: usize,
}

impl ResourcePlan {
    /// One node per 32 atoms (rounded up past each multiple) times the site
    /// multiplier; each node keeps `memory_reserve` cores idle, twice that
    /// for elastic runs.
    #[must_use]
    pub fn for_job(kind: StageKind, num_atoms: usize, site: &SiteConfig, memory_reserve: u32) -> Self {
        let n_nodes = (num_atoms / ATOMS_PER_NODE + 1) * site.node_multiplier as usize;
        let reserve = if kind == StageKind::Elastic {
            memory_reserve.saturating_mul(2)
        } else {
            memory_reserve
        };
        let tasks_per_node = site.ncore_per_node.saturating_sub(reserve).max(1) as usize;
        Self {
            n_nodes,
            tasks_per_node,
            n_procs: n_nodes * tasks_per_node,
        }
    }
}

/// Everything specific to one job script.
#[derive(Debug, Clone)]
pub struct ScriptRequest<'a> {
    /// Stage kind, for the job-name prefix and memory reserve.
    pub kind: StageKind,
    /// Job name suffix, usually the material name.
    pub name: &'a str,
    /// Computer settings.
    pub site: &'a SiteConfig,
    /// Atom count of the input structure.
    pub num_atoms: usize,
    /// Walltime request.
    pub walltime: Walltime,
    /// Idle cores per node currently in effect.
    pub memory_reserve: u32,
}

/// Fills a job-script template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScriptRenderer {
    template: String,
}

impl Default for JobScriptRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_SLURM_TEMPLATE)
    }
}

impl JobScriptRenderer {
    /// Creates a renderer for a template.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Uses the site's template if it names one, the built-in otherwise.
    pub fn for_site(site: &SiteConfig, base_dir: &Path) -> Result<Self, ConfigError> {
        match &site.script_template {
            Some(relative) => {
                let path = base_dir.join(relative);
                let template = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::new(format!("cannot read template: {e}")).with_path(&path))?;
                Ok(Self::new(template))
            }
            None => Ok(Self::default()),
        }
    }

    /// Renders the script for one job.
    pub fn render(&self, request: &ScriptRequest<'_>) -> Result<String, DeckError> {
        let site = request.site;
        let plan = ResourcePlan::for_job(request.kind, request.num_atoms, site, request.memory_reserve);

        let mut values = BTreeMap::new();
        values.insert("jobname", format!("{}{}", request.kind.job_prefix(), request.name));
        values.insert("allocation", site.allocation.clone().unwrap_or_default());
        values.insert("queue", site.queue.clone().unwrap_or_default());
        values.insert("constraint", site.constraint.clone().unwrap_or_default());
        values.insert("n_nodes", plan.n_nodes.to_string());
        values.insert("n_procs", plan.n_procs.to_string());
        values.insert("ncore_per_node", plan.tasks_per_node.to_string());
        values.insert("walltime", request.walltime.to_string());
        values.insert("stdout", files::STDOUT.to_string());
        values.insert("stderr", files::STDERR.to_string());
        values.insert("directives", directives(site));
        values.insert("modules", site.modules.join("\n"));

        let run_command = substitute(&site.run_command, &values)?;
        values.insert("run_command", run_command);
        substitute(&self.template, &values)
    }
}

fn directives(site: &SiteConfig) -> String {
    let mut lines = Vec::new();
    if let Some(allocation) = &site.allocation {
        lines.push(format!("#SBATCH -A {allocation}"));
    }
    if let Some(queue) = &site.queue {
        lines.push(format!("#SBATCH -p {queue}"));
    }
    if let Some(constraint) = &site.constraint {
        lines.push(format!("#SBATCH --constraint={constraint}"));
    }
    lines.join("\n")
}

fn substitute(template: &str, values: &BTreeMap<&str, String>) -> Result<String, DeckError> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        if !caps[1].is_empty() {
            return caps[0].to_string();
        }
        let name = &caps[2];
        values.get(name).cloned().unwrap_or_else(|| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });
    match missing {
        Some(name) => Err(DeckError::UnknownPlaceholder(name)),
        None => Ok(rendered.into_owned()),
    }
}
