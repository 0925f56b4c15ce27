//! Learned anti-patterns that agent output must not contain.
//!
//! Each learning is a literal substring or, with `regex: true`, a regular
//! expression. The enforcer compiles them once and is consulted after every
//! TEST_WRITE and BUILD output.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::util::atomic_write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learning {
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    pub reason: String,
    pub learned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningsRecord {
    #[serde(default)]
    pub learnings: Vec<Learning>,
}

impl LearningsRecord {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read learnings file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse learnings file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &json)
            .with_context(|| format!("Failed to write learnings file: {}", path.display()))
    }

    /// Append a learning. Regex patterns are compiled up front so a bad
    /// pattern never reaches disk.
    pub fn add(&mut self, pattern: &str, reason: &str, regex: bool) -> Result<&Learning> {
        if pattern.is_empty() {
            anyhow::bail!("Learning pattern must not be empty");
        }
        if regex {
            Regex::new(pattern).with_context(|| format!("Invalid regex pattern: {pattern}"))?;
        }
        self.learnings.push(Learning {
            pattern: pattern.to_string(),
            regex,
            reason: reason.to_string(),
            learned_at: Utc::now(),
        });
        Ok(&self.learnings[self.learnings.len() - 1])
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Regex(Regex),
}

/// A denylisted pattern found in agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub pattern: String,
    pub reason: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "output matches learned pattern '{}' ({})", self.pattern, self.reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LearningEnforcer {
    rules: Vec<(Matcher, Learning)>,
}

impl LearningEnforcer {
    pub fn from_record(record: &LearningsRecord) -> Result<Self> {
        let rules = record
            .learnings
            .iter()
            .map(|l| {
                let matcher = if l.regex {
                    Matcher::Regex(
                        Regex::new(&l.pattern)
                            .with_context(|| format!("Invalid learned regex: {}", l.pattern))?,
                    )
                } else {
                    Matcher::Literal(l.pattern.clone())
                };
                Ok((matcher, l.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// The raw patterns, for inclusion in agent prompts.
    pub fn patterns(&self) -> Vec<String> {
        self.rules.iter().map(|(_, l)| l.pattern.clone()).collect()
    }

    pub fn find_violations(&self, text: &str) -> Vec<Violation> {
        self.rules
            .iter()
            .filter(|(m, _)| match m {
                Matcher::Literal(s) => text.contains(s.as_str()),
                Matcher::Regex(re) => re.is_match(text),
            })
            .map(|(_, l)| Violation {
                pattern: l.pattern.clone(),
                reason: l.reason.clone(),
            })
            .collect()
    }
}
