//! Serialized shape of the workflow document.
//!
//! Field names are part of the on-disk contract: downstream tools read
//! `tasks[].stories[]`, `acceptanceCriteria`, `failureLog` and friends
//! directly, so renames here are breaking changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Schema version written by this build.
pub const SCHEMA_VERSION: &str = "3.0";

/// Every schema version this build can read. Anything else is rejected.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &[SCHEMA_VERSION];

/// Suffix marking a config toggle as a validator switch
/// (`whitebox-validation-enabled` enables validator `whitebox`).
pub const VALIDATOR_TOGGLE_SUFFIX: &str = "-validation-enabled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(alias = "schemaVersion")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl Default for WorkflowDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            intent: None,
            tasks: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub problem_statement: String,
    #[serde(default)]
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub risks: Vec<Risk>,
    #[serde(default)]
    pub success_metrics: SuccessMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub technical: Vec<String>,
    #[serde(default)]
    pub compliance: Vec<String>,
    #[serde(default)]
    pub business: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub description: String,
    pub probability: Level,
    pub impact: Level,
    #[serde(default)]
    pub mitigation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessMetrics {
    #[serde(default)]
    pub quantitative: Vec<String>,
    #[serde(default)]
    pub qualitative: Vec<String>,
    #[serde(default)]
    pub business: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stories: Vec<Story>,
}

/// Execution state of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryState {
    #[default]
    Pending,
    TestWrite,
    Build,
    Validate,
    Cleanup,
    Passed,
    RolledBack,
    /// Rollback itself failed; the workspace needs manual attention.
    Unrecoverable,
}

impl std::fmt::Display for StoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoryState::Pending => "PENDING",
            StoryState::TestWrite => "TEST_WRITE",
            StoryState::Build => "BUILD",
            StoryState::Validate => "VALIDATE",
            StoryState::Cleanup => "CLEANUP",
            StoryState::Passed => "PASSED",
            StoryState::RolledBack => "ROLLED_BACK",
            StoryState::Unrecoverable => "UNRECOVERABLE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub given: Vec<String>,
    #[serde(default)]
    pub when: Vec<String>,
    #[serde(default)]
    pub then: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub status: StoryState,
    #[serde(default)]
    pub checkpoints: StoryCheckpoints,
    #[serde(default)]
    pub metrics: StoryMetrics,
}

impl Story {
    /// A story is complete when every checkpoint flag is set.
    pub fn is_complete(&self) -> bool {
        self.checkpoints.all_complete()
    }
}

/// Per-step completion flags of a story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryCheckpoints {
    #[serde(default)]
    pub tests_written: bool,
    #[serde(default)]
    pub build_complete: bool,
    /// One flag per enabled validator.
    #[serde(default)]
    pub validators: BTreeMap<String, bool>,
    #[serde(default)]
    pub cleanup_complete: bool,
}

impl StoryCheckpoints {
    /// Fresh flags, all false, with one validator slot per name.
    pub fn new<I, S>(validator_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tests_written: false,
            build_complete: false,
            validators: validator_names
                .into_iter()
                .map(|n| (n.into(), false))
                .collect(),
            cleanup_complete: false,
        }
    }

    pub fn all_complete(&self) -> bool {
        self.tests_written
            && self.build_complete
            && self.validators.values().all(|v| *v)
            && self.cleanup_complete
    }

    pub fn mark_all(&mut self) {
        self.tests_written = true;
        self.build_complete = true;
        self.validators.values_mut().for_each(|v| *v = true);
        self.cleanup_complete = true;
    }

    pub fn reset(&mut self) {
        self.tests_written = false;
        self.build_complete = false;
        self.validators.values_mut().for_each(|v| *v = false);
        self.cleanup_complete = false;
    }

    /// Make sure a slot exists for each of `names`, keeping existing values.
    pub fn ensure_validators(&mut self, names: &[String]) {
        for name in names {
            self.validators.entry(name.clone()).or_insert(false);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryMetrics {
    #[serde(default)]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_ref: Option<String>,
    #[serde(default)]
    pub failure_log: Vec<FailureEntry>,
    #[serde(default)]
    pub timestamps: Vec<TimestampEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub attempt: u32,
    pub stage: StoryState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryEvent {
    CheckpointTaken,
    AttemptStarted,
    TestsWritten,
    BuildComplete,
    Validated,
    CleanupComplete,
    AttemptFailed,
    CleanupFailed,
    Passed,
    RolledBack,
    RevertFailed,
    MarkedPass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub event: StoryEvent,
    pub at: DateTime<Utc>,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_validator_timeout_secs() -> u64 {
    600
}

/// Named toggles controlling story execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_story: u32,
    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,
    #[serde(default = "default_validator_timeout_secs")]
    pub validator_timeout_secs: u64,
    /// Remaining toggles, including `<name>-validation-enabled` switches.
    #[serde(flatten)]
    pub toggles: BTreeMap<String, serde_json::Value>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let mut toggles = BTreeMap::new();
        toggles.insert(
            format!("whitebox{VALIDATOR_TOGGLE_SUFFIX}"),
            serde_json::Value::Bool(true),
        );
        Self {
            max_attempts_per_story: default_max_attempts(),
            cleanup_enabled: default_cleanup_enabled(),
            validator_timeout_secs: default_validator_timeout_secs(),
            toggles,
        }
    }
}

impl WorkflowConfig {
    /// Names of validators switched on, in sorted order.
    pub fn enabled_validators(&self) -> Vec<String> {
        self.toggles
            .iter()
            .filter(|(_, v)| v.as_bool() == Some(true))
            .filter_map(|(k, _)| k.strip_suffix(VALIDATOR_TOGGLE_SUFFIX))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn set_validator(&mut self, name: &str, enabled: bool) {
        self.toggles.insert(
            format!("{name}{VALIDATOR_TOGGLE_SUFFIX}"),
            serde_json::Value::Bool(enabled),
        );
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_secs(self.validator_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_enables_whitebox() {
        let config = WorkflowConfig::default();
        assert_eq!(config.max_attempts_per_story, 5);
        assert!(config.cleanup_enabled);
        assert_eq!(config.enabled_validators(), vec!["whitebox".to_string()]);
    }

    #[test]
    fn test_config_kebab_case_roundtrip_keeps_unknown_toggles() {
        let json = r#"{
            "max-attempts-per-story": 3,
            "cleanup-enabled": false,
            "whitebox-validation-enabled": true,
            "blackbox-validation-enabled": false,
            "coverage-validation-enabled": true,
            "team-notes": "keep me"
        }"#;
        let config: WorkflowConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_attempts_per_story, 3);
        assert!(!config.cleanup_enabled);
        assert_eq!(config.validator_timeout_secs, 600);
        assert_eq!(
            config.enabled_validators(),
            vec!["coverage".to_string(), "whitebox".to_string()]
        );

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["team-notes"], "keep me");
        assert_eq!(back["max-attempts-per-story"], 3);
        assert_eq!(back["blackbox-validation-enabled"], false);
    }

    #[test]
    fn test_checkpoints_lifecycle() {
        let mut cps = StoryCheckpoints::new(["whitebox", "blackbox"]);
        assert!(!cps.all_complete());
        cps.tests_written = true;
        cps.build_complete = true;
        cps.cleanup_complete = true;
        cps.validators.insert("whitebox".into(), true);
        assert!(!cps.all_complete());
        cps.mark_all();
        assert!(cps.all_complete());
        cps.reset();
        assert!(!cps.tests_written);
        assert!(cps.validators.values().all(|v| !v));
        assert_eq!(cps.validators.len(), 2);
    }

    #[test]
    fn test_story_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&StoryState::RolledBack).unwrap();
        assert_eq!(json, "\"ROLLED_BACK\"");
        assert_eq!(StoryState::TestWrite.to_string(), "TEST_WRITE");
    }

    #[test]
    fn test_story_uses_camel_case_fields() {
        let story = Story {
            id: "US-001".into(),
            title: "Login".into(),
            acceptance_criteria: vec!["works".into()],
            scenarios: vec![],
            status: StoryState::Pending,
            checkpoints: StoryCheckpoints::new(["whitebox"]),
            metrics: StoryMetrics {
                last_checkpoint_ref: Some("abc".into()),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&story).unwrap();
        assert!(value.get("acceptanceCriteria").is_some());
        assert_eq!(value["metrics"]["lastCheckpointRef"], "abc");
        assert!(value["metrics"].get("failureLog").is_some());
        assert_eq!(value["checkpoints"]["tests_written"], false);
        assert_eq!(value["checkpoints"]["validators"]["whitebox"], false);
    }
}
