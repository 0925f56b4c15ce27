//! Denylist and metrics commands: `gantry learn` and `gantry metrics`.

use anyhow::Result;
use console::style;

use gantry::config::Config;
use gantry::document::WorkflowDocument;
use gantry::learnings::LearningsRecord;
use gantry::metrics::MetricsRecord;
use gantry::ui::icons::CHECK;

pub fn cmd_learn(config: &Config, pattern: &str, reason: &str, regex: bool) -> Result<()> {
    let mut record = LearningsRecord::load_or_default(&config.learnings_file)?;
    let learning = record.add(pattern, reason, regex)?.clone();
    record.save(&config.learnings_file)?;

    tracing::info!(pattern, regex, "learning recorded");
    println!(
        "{} Learned {} {}: {}",
        CHECK,
        if learning.regex { "regex" } else { "pattern" },
        style(&learning.pattern).yellow(),
        learning.reason
    );
    println!(
        "  {} pattern(s) now denied in agent output",
        record.learnings.len()
    );
    Ok(())
}

pub fn cmd_metrics(config: &Config, json: bool) -> Result<()> {
    let doc = WorkflowDocument::load(&config.workflow_file)?;
    let record = MetricsRecord::from_document(&doc);
    record.save(&config.metrics_file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    if record.stories.is_empty() {
        println!("No stories in the workflow document.");
        println!();
        return Ok(());
    }
    println!(
        "{:<10} {:<11} {:<10} Last checkpoint",
        "Story", "Iterations", "Failures"
    );
    println!(
        "{:<10} {:<11} {:<10} ---------------",
        "-----", "----------", "--------"
    );
    for (id, summary) in &record.stories {
        let checkpoint = summary
            .last_checkpoint_ref
            .as_deref()
            .map(|r| r.chars().take(12).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<11} {:<10} {}",
            id, summary.iterations, summary.failures, checkpoint
        );
    }
    println!();
    println!(
        "Total iterations: {}  ({})",
        record.total_iterations(),
        style(config.metrics_file.display()).dim()
    );
    println!();
    Ok(())
}
