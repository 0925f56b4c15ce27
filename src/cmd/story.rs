//! Story execution commands.
//!
//! Each verb builds a [`StoryRunner`] from `gantry.toml` (command-backed
//! collaborators plus git) and holds the cross-process [`StoryLock`] while
//! it mutates the story.

use anyhow::{Result, bail};
use console::style;
use std::sync::Arc;

use gantry::config::Config;
use gantry::document::{StoryState, WorkflowDocument};
use gantry::errors::StoryError;
use gantry::gantry_config::GantryToml;
use gantry::learnings::{LearningEnforcer, LearningsRecord};
use gantry::metrics::MetricsRecord;
use gantry::runner::{
    CommandAgent, CommandCleaner, CommandValidator, Collaborators, StoryLock, StoryRunner,
};
use gantry::session::Session;
use gantry::tracker::GitTracker;
use gantry::ui::StoryProgress;
use gantry::ui::icons::{CHECK, ROLLBACK, WARN};

use super::load_gate;

/// Which collaborators a verb actually invokes.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Needs {
    /// The full TEST_WRITE/BUILD loop: agent commands must be configured.
    Agents,
    /// Cleanup, commit, or revert only.
    Workspace,
}

fn build_runner(config: &Config, toml: &GantryToml, needs: Needs) -> Result<StoryRunner> {
    let (test_author, implementer) = match needs {
        Needs::Agents => (toml.test_author_command()?, toml.implementer_command()?),
        Needs::Workspace => (
            toml.test_author_command().unwrap_or_default(),
            toml.implementer_command().unwrap_or_default(),
        ),
    };
    let dir = &config.project_dir;

    let mut collaborators = Collaborators::new(
        Arc::new(CommandAgent::new(test_author, dir)),
        Arc::new(CommandAgent::new(implementer, dir)),
        Arc::new(CommandCleaner::new(toml.cleanup.commands.clone(), dir)),
        Arc::new(GitTracker::new(dir)),
    );
    for (name, validator) in &toml.validators {
        collaborators = collaborators.with_validator(Arc::new(CommandValidator::new(
            name,
            validator.command.clone(),
            dir,
        )));
    }

    let learnings = LearningsRecord::load_or_default(&config.learnings_file)?;
    let enforcer = LearningEnforcer::from_record(&learnings)?;

    Ok(StoryRunner::new(collaborators, enforcer).with_document_path(&config.workflow_file))
}

fn save_metrics(config: &Config, doc: &WorkflowDocument) -> Result<()> {
    MetricsRecord::from_document(doc).save(&config.metrics_file)
}

/// A different active story blocks work on `id`.
fn ensure_no_conflict(session: &Session, id: &str) -> Result<(), StoryError> {
    match &session.active_story {
        Some(active) if active != id => Err(StoryError::ConcurrentStoryConflict {
            active: active.clone(),
            requested: id.to_string(),
        }),
        _ => Ok(()),
    }
}

fn require_story(doc: &WorkflowDocument, id: &str) -> Result<(), StoryError> {
    if doc.story(id).is_none() {
        return Err(StoryError::StoryNotFound { id: id.to_string() });
    }
    Ok(())
}

pub fn cmd_set_story(config: &Config, id: &str) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let doc = WorkflowDocument::load(&config.workflow_file)?;
    let (_, gate) = load_gate(config)?;

    gate.require_execution_ready()?;
    require_story(&doc, id)?;
    session.claim_story(id)?;
    session.save(&config.session_file)?;

    println!("{} Active story is now {}", CHECK, style(id).yellow().bold());
    Ok(())
}

pub async fn cmd_run_story(config: &Config, id: Option<&str>) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let mut doc = WorkflowDocument::load(&config.workflow_file)?;
    let (toml, gate) = load_gate(config)?;

    let id = match id.map(str::to_string).or_else(|| session.active_story.clone()) {
        Some(id) => id,
        None => bail!("No story given and no active story; run 'gantry set-story <id>' first"),
    };

    gate.require_execution_ready()?;
    session.guard_source_mutation()?;
    require_story(&doc, &id)?;
    ensure_no_conflict(&session, &id)?;
    let ui = Arc::new(StoryProgress::new(1, config.verbose));
    let runner = build_runner(config, &toml, Needs::Agents)?.with_ui(Arc::clone(&ui));
    runner.require_validators(&doc)?;
    let _lock = StoryLock::acquire(&config.lock_file, &id)?;

    session.claim_story(&id)?;
    session.save(&config.session_file)?;

    // Only an UNRECOVERABLE outcome keeps the claim; it waits for a rollback.
    let result = runner.run_story(&mut doc, &id).await;
    let keep_claim = matches!(&result, Ok(o) if o.state == StoryState::Unrecoverable);
    if !keep_claim {
        session.release_story(&id);
        session.save(&config.session_file)?;
    }
    let outcome = result?;
    ui.finish(usize::from(outcome.passed), 1);
    save_metrics(config, &doc)?;

    if outcome.passed {
        return Ok(());
    }
    match outcome.state {
        StoryState::Unrecoverable => bail!(
            "Story {} is UNRECOVERABLE: {}. Restore the workspace by hand, then run 'gantry rollback {}'",
            id,
            outcome.reason.as_deref().unwrap_or("rollback failed"),
            id
        ),
        state => bail!(
            "Story {} did not pass ({}) after {} attempt(s): {}",
            id,
            state,
            outcome.attempts_used,
            outcome.reason.as_deref().unwrap_or("no reason recorded")
        ),
    }
}

pub async fn cmd_run(config: &Config, fail_fast: bool) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let mut doc = WorkflowDocument::load(&config.workflow_file)?;
    let (toml, gate) = load_gate(config)?;

    gate.require_execution_ready()?;
    session.guard_source_mutation()?;
    if let Some(active) = &session.active_story {
        bail!(
            "Story {active} is active; finish it with 'gantry run-story' or 'gantry rollback {active}' before 'gantry run'"
        );
    }

    let pending = doc
        .stories()
        .filter(|s| s.status != StoryState::Passed)
        .count();
    if pending == 0 {
        println!("{} All stories have passed", CHECK);
        return Ok(());
    }

    let ui = Arc::new(StoryProgress::new(pending as u64, config.verbose));
    let runner = build_runner(config, &toml, Needs::Agents)?.with_ui(Arc::clone(&ui));
    runner.require_validators(&doc)?;
    let _lock = StoryLock::acquire(&config.lock_file, "run")?;

    let outcomes = runner.run_all(&mut doc, fail_fast).await?;
    let passed = outcomes.iter().filter(|o| o.passed).count();
    ui.finish(passed, pending);
    save_metrics(config, &doc)?;

    if let Some(stuck) = outcomes
        .iter()
        .find(|o| o.state == StoryState::Unrecoverable)
    {
        session.claim_story(&stuck.id)?;
        session.save(&config.session_file)?;
        bail!(
            "Story {} is UNRECOVERABLE: {}. Restore the workspace by hand, then run 'gantry rollback {}'",
            stuck.id,
            stuck.reason.as_deref().unwrap_or("rollback failed"),
            stuck.id
        );
    }
    let failed = outcomes.len() - passed;
    let skipped = pending - outcomes.len();
    if skipped > 0 {
        bail!("{failed} of {pending} stories did not pass; {skipped} not attempted after --fail-fast");
    }
    if failed > 0 {
        bail!("{failed} of {pending} stories did not pass");
    }
    Ok(())
}

pub async fn cmd_cleanup(config: &Config, id: &str) -> Result<()> {
    let session = Session::load(&config.session_file)?;
    let mut doc = WorkflowDocument::load(&config.workflow_file)?;
    let toml = config.load_toml()?;

    session.guard_source_mutation()?;
    ensure_no_conflict(&session, id)?;
    require_story(&doc, id)?;

    let _lock = StoryLock::acquire(&config.lock_file, id)?;
    let runner = build_runner(config, &toml, Needs::Workspace)?;
    let report = runner.run_cleanup(&mut doc, id).await?;
    save_metrics(config, &doc)?;

    if !report.passed {
        bail!("Cleanup failed for story {}:\n{}", id, report.diagnostics);
    }
    println!("{} Cleanup passed for {}", CHECK, style(id).green().bold());
    Ok(())
}

pub async fn cmd_mark_story_pass(config: &Config, id: &str) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let mut doc = WorkflowDocument::load(&config.workflow_file)?;
    let toml = config.load_toml()?;

    ensure_no_conflict(&session, id)?;
    let _lock = StoryLock::acquire(&config.lock_file, id)?;
    let runner = build_runner(config, &toml, Needs::Workspace)?;
    let rev = runner.mark_story_pass(&mut doc, id).await?;
    save_metrics(config, &doc)?;

    session.release_story(id);
    session.save(&config.session_file)?;

    println!(
        "{} Story {} marked as passed (commit {})",
        CHECK,
        style(id).green().bold(),
        style(rev).dim()
    );
    Ok(())
}

pub async fn cmd_rollback(config: &Config, id: &str) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let mut doc = WorkflowDocument::load(&config.workflow_file)?;
    let toml = config.load_toml()?;

    ensure_no_conflict(&session, id)?;
    let _lock = StoryLock::acquire(&config.lock_file, id)?;
    let runner = build_runner(config, &toml, Needs::Workspace)?;
    let rev = match runner.rollback_story(&mut doc, id).await {
        Ok(rev) => rev,
        Err(e @ StoryError::RevertFailed { .. }) => {
            eprintln!("{} The workspace may be partially reverted", WARN);
            return Err(e.into());
        }
        Err(e @ StoryError::NoRollbackPoint { .. }) => {
            // Nothing was ever checkpointed, so nothing holds the story.
            if session.active_story.as_deref() == Some(id) {
                session.release_story(id);
                session.save(&config.session_file)?;
                eprintln!("{} Story {} is no longer active", WARN, id);
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    save_metrics(config, &doc)?;

    session.release_story(id);
    session.save(&config.session_file)?;

    println!(
        "{} Story {} rolled back to {}",
        ROLLBACK,
        style(id).yellow().bold(),
        style(rev).dim()
    );
    Ok(())
}
