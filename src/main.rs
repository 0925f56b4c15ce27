use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gantry::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version, about = "Phase-gated story orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .gantry/ and start a fresh workflow session
    Start {
        /// Forget completed phases so planning starts over
        #[arg(long)]
        reset: bool,
    },
    /// Show phases, planning mode, the active story, and story states
    Status,
    /// Enter a workflow phase (its prerequisites must be complete and fresh)
    SetPhase { name: String },
    /// Record a phase as complete
    CompletePhase { name: String },
    /// Populate the workflow intent from a JSON file
    SetIntent {
        file: PathBuf,
        /// Replace an existing intent
        #[arg(long)]
        overwrite: bool,
    },
    /// Run the typed intake interview and merge the resulting intent
    Interview {
        /// One-line problem statement
        #[arg(long)]
        problem: String,
        /// Read answers from a JSON file instead of prompting
        #[arg(long)]
        answers: Option<PathBuf>,
        /// Replace an existing intent
        #[arg(long)]
        overwrite: bool,
    },
    /// Add tasks and stories from a converted PRD JSON file
    ImportPrd { file: PathBuf },
    /// Make a story the active story
    SetStory { id: String },
    /// Drive one story through TEST_WRITE, BUILD, VALIDATE, CLEANUP
    RunStory {
        /// Story ID (defaults to the active story)
        id: Option<String>,
    },
    /// Run every story that has not passed, one at a time
    Run {
        /// Stop at the first story that does not pass
        #[arg(long)]
        fail_fast: bool,
    },
    /// Run only the cleanup commands against a story
    Cleanup { id: String },
    /// Accept a story as passed and commit the workspace
    MarkStoryPass { id: String },
    /// Revert the workspace to a story's last checkpoint
    Rollback { id: String },
    /// Add a pattern to the learned denylist
    Learn {
        pattern: String,
        /// Why the pattern is denied
        #[arg(long)]
        reason: String,
        /// Treat the pattern as a regular expression
        #[arg(long)]
        regex: bool,
    },
    /// Show per-story metrics and write .gantry/metrics.json
    Metrics {
        /// Print the metrics record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Exit non-zero while planning mode forbids source edits
    CheckEdit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose)?;
    let _log_guard = gantry::logging::init_tracing(cli.verbose, Some(&config.log_dir));

    match &cli.command {
        Commands::Start { reset } => cmd::cmd_start(&config, *reset)?,
        Commands::Status => cmd::cmd_status(&config)?,
        Commands::SetPhase { name } => cmd::cmd_set_phase(&config, name)?,
        Commands::CompletePhase { name } => cmd::cmd_complete_phase(&config, name)?,
        Commands::SetIntent { file, overwrite } => cmd::cmd_set_intent(&config, file, *overwrite)?,
        Commands::Interview {
            problem,
            answers,
            overwrite,
        } => cmd::cmd_interview(&config, problem, answers.as_deref(), *overwrite)?,
        Commands::ImportPrd { file } => cmd::cmd_import_prd(&config, file)?,
        Commands::SetStory { id } => cmd::cmd_set_story(&config, id)?,
        Commands::RunStory { id } => cmd::cmd_run_story(&config, id.as_deref()).await?,
        Commands::Run { fail_fast } => cmd::cmd_run(&config, *fail_fast).await?,
        Commands::Cleanup { id } => cmd::cmd_cleanup(&config, id).await?,
        Commands::MarkStoryPass { id } => cmd::cmd_mark_story_pass(&config, id).await?,
        Commands::Rollback { id } => cmd::cmd_rollback(&config, id).await?,
        Commands::Learn {
            pattern,
            reason,
            regex,
        } => cmd::cmd_learn(&config, pattern, reason, *regex)?,
        Commands::Metrics { json } => cmd::cmd_metrics(&config, *json)?,
        Commands::CheckEdit => cmd::cmd_check_edit(&config)?,
    }

    Ok(())
}
