//! Command-line surface

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use arbitration::config::PoolConfig;
use arbitration::{ArbitrationConfig, Problem};
use clap::{Args, Parser, Subcommand};

/// Arbitrate between multiple solver models
#[derive(Parser, Debug)]
#[command(name = "arbiter", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Arbitrate one problem and print the decision record as JSON
    Run(RunArgs),

    /// Inspect or reset the persisted model quality memory
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,

        /// Output directory holding model_quality.json (overrides config)
        #[arg(long, global = true)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum MemoryCommand {
    /// Print every model's reliability record
    Show,

    /// Reset one model (or all models) to the neutral prior
    Reset {
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Problem text
    #[arg(long, conflicts_with = "problem_file")]
    pub problem: Option<String>,

    /// Read the problem text from a file
    #[arg(long)]
    pub problem_file: Option<PathBuf>,

    /// Problem identifier recorded in the artifacts
    #[arg(long, default_value = "problem")]
    pub problem_id: String,

    /// Task identifier (random when omitted)
    #[arg(long)]
    pub task_id: Option<String>,

    /// Problem domain (defaults to the pool name)
    #[arg(long)]
    pub domain: Option<String>,

    /// Solver pool preset: science, math, med or econ
    #[arg(long)]
    pub pool: Option<String>,

    /// Maximum pipeline repeats
    #[arg(long)]
    pub repeats: Option<u32>,

    /// Candidates merged in consensus mode (2 or 3)
    #[arg(long)]
    pub topk: Option<usize>,

    /// Arbiter score gap below which consensus is preferred
    #[arg(long)]
    pub epsilon: Option<f64>,

    /// Never run a rebuttal round
    #[arg(long, default_value_t = false)]
    pub no_rebuttal: bool,

    /// Always hard-select the top-ranked answer
    #[arg(long, default_value_t = false)]
    pub hard_only: bool,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output directory for artifacts and quality memory
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Cache successful model replies for the duration of the process
    #[arg(long, default_value_t = false)]
    pub cache: bool,
}

impl RunArgs {
    /// Defaults, then the TOML file, then `ARBITER_*` variables, then flags
    pub fn build_config(&self) -> Result<ArbitrationConfig> {
        self.build_config_with(|var| std::env::var(var).ok())
    }

    pub fn build_config_with<F>(&self, lookup: F) -> Result<ArbitrationConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = match &self.config {
            Some(path) => ArbitrationConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ArbitrationConfig::default(),
        };
        let mut config = config
            .apply_env_from(lookup)
            .context("Invalid ARBITER_* environment override")?;

        if let Some(pool) = &self.pool {
            config.pool = PoolConfig::preset(pool);
        }
        if let Some(repeats) = self.repeats {
            config.max_runs = repeats;
            config.min_runs = config.min_runs.min(repeats);
        }
        if let Some(topk) = self.topk {
            config.consensus_topk = topk;
        }
        if let Some(epsilon) = self.epsilon {
            config.epsilon = epsilon;
        }
        if self.no_rebuttal {
            config.rebuttal_enabled = false;
        }
        if self.hard_only {
            config.hard_only = true;
        }
        if let Some(out) = &self.out {
            config.out_dir = out.clone();
        }

        config.validate().context("Invalid arbitration configuration")?;
        Ok(config)
    }

    /// Problem from `--problem` or `--problem-file`
    pub fn problem(&self, config: &ArbitrationConfig) -> Result<Problem> {
        let text = match (&self.problem, &self.problem_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read problem from {}", path.display()))?,
            (None, None) => bail!("one of --problem or --problem-file is required"),
        };
        if text.trim().is_empty() {
            bail!("problem text is empty");
        }

        let domain = self.domain.clone().unwrap_or_else(|| config.pool.name.clone());
        Ok(Problem::new(self.problem_id.clone(), domain, text.trim()))
    }
}
