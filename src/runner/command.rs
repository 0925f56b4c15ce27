//! Collaborators backed by external commands from `gantry.toml`.
//!
//! Every command runs in the project directory with `GANTRY_STORY_ID` set.
//! Agents get the rendered prompt on stdin; validators get the story as
//! JSON. Exit status decides pass/fail, and stdout/stderr become the
//! diagnostics.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::collaborators::{Agent, AgentOutput, AgentRequest, CheckReport, Cleaner, Validator};
use crate::document::Story;

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, _) => self.stderr.trim_end().to_string(),
        }
    }
}

async fn run_command(
    argv: &[String],
    dir: &Path,
    input: &str,
    envs: &[(&str, String)],
) -> Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        bail!("Empty command line");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", argv.join(" ")))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A command that ignores stdin may exit before we finish writing.
        if let Err(e) = stdin.write_all(input.as_bytes()).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e).context("Failed to write to command stdin");
        }
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("Failed to wait for '{}'", argv.join(" ")))?;

    tracing::debug!(
        command = %argv.join(" "),
        status = ?output.status.code(),
        "command finished"
    );

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Test author or implementer backed by an external command.
pub struct CommandAgent {
    argv: Vec<String>,
    dir: PathBuf,
}

impl CommandAgent {
    pub fn new(argv: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn run(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let envs = [
            ("GANTRY_STORY_ID", request.story.id.clone()),
            ("GANTRY_ATTEMPT", request.attempt.to_string()),
            ("GANTRY_ROLE", request.role.to_string()),
        ];
        let out = run_command(&self.argv, &self.dir, &request.to_prompt(), &envs).await?;
        Ok(AgentOutput {
            success: out.success,
            content: if out.success {
                out.stdout
            } else {
                out.combined()
            },
        })
    }
}

pub struct CommandValidator {
    name: String,
    argv: Vec<String>,
    dir: PathBuf,
}

impl CommandValidator {
    pub fn new(name: &str, argv: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            argv,
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, story: &Story) -> Result<CheckReport> {
        let input = serde_json::to_string_pretty(story)?;
        let envs = [
            ("GANTRY_STORY_ID", story.id.clone()),
            ("GANTRY_VALIDATOR", self.name.clone()),
        ];
        let out = run_command(&self.argv, &self.dir, &input, &envs).await?;
        Ok(CheckReport {
            passed: out.success,
            diagnostics: out.combined(),
        })
    }
}

/// Runs formatter/type-check commands in order, stopping at the first
/// failure. No commands means cleanup trivially passes.
pub struct CommandCleaner {
    commands: Vec<Vec<String>>,
    dir: PathBuf,
}

impl CommandCleaner {
    pub fn new(commands: Vec<Vec<String>>, dir: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl Cleaner for CommandCleaner {
    async fn cleanup(&self, story: &Story) -> Result<CheckReport> {
        let envs = [("GANTRY_STORY_ID", story.id.clone())];
        for argv in &self.commands {
            let out = run_command(argv, &self.dir, "", &envs).await?;
            if !out.success {
                return Ok(CheckReport::fail(format!(
                    "'{}' failed:\n{}",
                    argv.join(" "),
                    out.combined()
                )));
            }
        }
        Ok(CheckReport::pass())
    }
}
