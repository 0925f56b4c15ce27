//! Workflow document commands: `set-intent`, `interview`, `import-prd`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use gantry::config::Config;
use gantry::document::{Intent, PrdImport, WorkflowDocument};
use gantry::interview::{DialoguerAgent, QuestionAgent, ScriptedAgent, run_intake};
use gantry::ui::icons::CHECK;

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what} file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {what} file: {}", path.display()))
}

fn save_intent(config: &Config, intent: Intent, overwrite: bool) -> Result<()> {
    let doc = WorkflowDocument::load(&config.workflow_file)?;
    let next = doc.merge_intent(intent, overwrite)?;
    next.save(&config.workflow_file)?;
    Ok(())
}

pub fn cmd_set_intent(config: &Config, file: &Path, overwrite: bool) -> Result<()> {
    let intent: Intent = read_json(file, "intent")?;
    save_intent(config, intent, overwrite)?;
    println!("{} Intent written to {}", CHECK, config.workflow_file.display());
    Ok(())
}

pub fn cmd_interview(
    config: &Config,
    problem: &str,
    answers: Option<&Path>,
    overwrite: bool,
) -> Result<()> {
    // Fail before asking anything if the answers could not be stored.
    let doc = WorkflowDocument::load(&config.workflow_file)?;
    if doc.intent.is_some() && !overwrite {
        return Err(gantry::errors::DocumentError::AlreadyPopulated.into());
    }

    let mut agent: Box<dyn QuestionAgent> = match answers {
        Some(path) => Box::new(ScriptedAgent::from_file(path)?),
        None => Box::new(DialoguerAgent::default()),
    };
    let intent = run_intake(agent.as_mut(), problem)?;
    save_intent(config, intent, overwrite)?;
    println!("{} Interview answers merged into the intent", CHECK);
    Ok(())
}

pub fn cmd_import_prd(config: &Config, file: &Path) -> Result<()> {
    let import: PrdImport = read_json(file, "PRD")?;
    let doc = WorkflowDocument::load(&config.workflow_file)?;
    let before: std::collections::HashSet<String> = doc.story_ids().into_iter().collect();

    let next = doc.add_tasks_from_prd(import.tasks)?;
    next.save(&config.workflow_file)?;

    let added: Vec<String> = next
        .story_ids()
        .into_iter()
        .filter(|id| !before.contains(id))
        .collect();
    tracing::info!(stories = added.len(), "imported PRD stories");
    println!(
        "{} Imported {} stor{}: {}",
        CHECK,
        added.len(),
        if added.len() == 1 { "y" } else { "ies" },
        style(added.join(", ")).yellow()
    );
    Ok(())
}
