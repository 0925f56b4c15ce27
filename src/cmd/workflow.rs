//! Session and phase commands: `start`, `status`, `set-phase`,
//! `complete-phase`, `check-edit`.

use anyhow::{Context, Result};
use console::style;

use gantry::checkpoint::CheckpointStore;
use gantry::config::Config;
use gantry::document::WorkflowDocument;
use gantry::errors::SessionError;
use gantry::gantry_config::DEFAULT_TOML;
use gantry::gate::GateStatus;
use gantry::session::{PlanningMode, Session};
use gantry::ui::icons::{BLOCKER, CHECK, CLOCK, LOCK, SPARKLE};

use super::load_gate;

pub fn cmd_start(config: &Config, reset: bool) -> Result<()> {
    if reset {
        CheckpointStore::new(&config.checkpoints_dir).clear()?;
        tracing::info!("phase checkpoints cleared");
    }
    config.ensure_directories()?;

    let gitignore = config.state_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, "*\n")
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }

    let created_document = !config.workflow_file.exists();
    if created_document {
        WorkflowDocument::default().save(&config.workflow_file)?;
    } else {
        // Refuse to start over a document this build cannot read.
        WorkflowDocument::load(&config.workflow_file)?;
    }

    if !config.config_file.exists() {
        std::fs::write(&config.config_file, DEFAULT_TOML)
            .with_context(|| format!("Failed to write {}", config.config_file.display()))?;
    }

    let session = Session::new();
    session.save(&config.session_file)?;
    tracing::info!(run_id = %session.run_id, "workflow session started");

    println!(
        "{} Started gantry session {} at {}",
        SPARKLE,
        style(session.run_id).dim(),
        config.state_dir.display()
    );
    if created_document {
        println!("  Created .gantry/workflow.json");
    }
    if reset {
        println!("  Cleared completed phases; planning starts over");
    }
    println!();
    println!("Next steps:");
    println!("  1. Run `gantry set-phase codebase_mapped` to begin planning");
    println!("  2. Run `gantry complete-phase <name>` as each phase finishes");
    println!("  3. Run `gantry run` once conversion_complete is recorded");
    Ok(())
}

pub fn cmd_status(config: &Config) -> Result<()> {
    let session = Session::load(&config.session_file)?;
    let doc = WorkflowDocument::load(&config.workflow_file)?;
    let (_, gate) = load_gate(config)?;

    println!();
    println!("Gantry Workflow Status");
    println!("======================");
    println!();
    println!("Session:  {}", style(session.run_id).dim());
    match &session.planning {
        PlanningMode::Off => println!("Planning: off"),
        PlanningMode::On { phase, since } => println!(
            "Planning: {} {} (since {})",
            LOCK,
            style(phase).yellow(),
            since.format("%Y-%m-%d %H:%M:%S")
        ),
    }
    println!(
        "Active:   {}",
        session.active_story.as_deref().unwrap_or("(none)")
    );

    println!();
    println!("{:<26} {:<22} Gate", "Phase", "Completed");
    println!("{:<26} {:<22} ----", "-".repeat(26), "-".repeat(22));
    for phase in gate.status()? {
        let completed = phase
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let gate_text = match &phase.gate {
            GateStatus::Open => format!("{}", style("open").green()),
            GateStatus::Blocked(reasons) => format!(
                "{}{}",
                BLOCKER,
                style(
                    reasons
                        .iter()
                        .map(|r| r.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                )
                .red()
            ),
        };
        println!("{:<26} {:<22} {}", phase.name, completed, gate_text);
    }

    println!();
    let stories: Vec<_> = doc.stories().collect();
    if stories.is_empty() {
        println!("No stories yet. Run `gantry import-prd <file.json>` to add some.");
    } else {
        println!(
            "{:<10} {:<14} {:<10} Title",
            "Story", "State", "Attempts"
        );
        println!("{:<10} {:<14} {:<10} -----", "-----", "-----", "--------");
        for story in stories {
            println!(
                "{:<10} {:<14} {:<10} {}",
                story.id,
                story.status.to_string(),
                story.metrics.iterations,
                story.title
            );
        }
    }
    println!();
    Ok(())
}

pub fn cmd_set_phase(config: &Config, name: &str) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let (_, gate) = load_gate(config)?;

    gate.enter(&mut session, name)?;
    session.save(&config.session_file)?;

    if session.is_planning() {
        println!(
            "{} Entered phase {} (planning mode on, source edits blocked)",
            LOCK,
            style(name).yellow().bold()
        );
    } else {
        println!("{} Entered phase {}", CLOCK, style(name).bold());
    }
    Ok(())
}

pub fn cmd_complete_phase(config: &Config, name: &str) -> Result<()> {
    let mut session = Session::load(&config.session_file)?;
    let (_, gate) = load_gate(config)?;

    let record = gate.complete(&mut session, name)?;
    session.save(&config.session_file)?;

    println!(
        "{} Phase {} complete at {}",
        CHECK,
        style(name).green().bold(),
        record.completed_at.format("%Y-%m-%d %H:%M:%S")
    );
    if !session.is_planning() && gate.require_execution_ready().is_ok() {
        println!("  Planning is complete; stories can now run.");
    }
    Ok(())
}

/// Exit status for editor hooks: non-zero while planning mode is on.
pub fn cmd_check_edit(config: &Config) -> Result<()> {
    let session = match Session::load(&config.session_file) {
        Ok(s) => s,
        Err(SessionError::NotStarted { .. }) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    session.guard_source_mutation()?;
    Ok(())
}
