//! Phase gating over checkpoint markers.
//!
//! A phase may be entered (or completed) only when every prerequisite has a
//! checkpoint, and freshness-sensitive prerequisites are no older than the
//! staleness window. The phase name doubles as its checkpoint name.
//!
//! There is no bypass flag: a blocked phase stays blocked until its
//! prerequisites are (re)completed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::errors::{CheckpointError, GateError};
use crate::session::Session;

/// Pseudo-phase reported when story execution is attempted too early.
pub const STORY_EXECUTION: &str = "story_execution";

pub const DEFAULT_STALENESS_DAYS: i64 = 30;

/// Largest configurable staleness window, about a century.
pub const MAX_STALENESS_DAYS: i64 = 36_500;

fn default_planning() -> bool {
    true
}

/// One phase and what it needs before it can start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Prerequisites must also be fresh, not just present.
    #[serde(default)]
    pub fresh: bool,
    /// Entering this phase turns planning mode on.
    #[serde(default = "default_planning")]
    pub planning: bool,
}

impl PhaseDefinition {
    pub fn new(name: &str, prerequisites: &[&str], fresh: bool) -> Self {
        Self {
            name: name.to_string(),
            prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
            fresh,
            planning: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRegistry {
    phases: Vec<PhaseDefinition>,
}

impl Default for PhaseRegistry {
    fn default() -> Self {
        Self::default_planning()
    }
}

impl PhaseRegistry {
    pub fn new(phases: Vec<PhaseDefinition>) -> Self {
        Self { phases }
    }

    /// The five planning phases, in order.
    pub fn default_planning() -> Self {
        Self::new(vec![
            PhaseDefinition::new("codebase_mapped", &[], false),
            PhaseDefinition::new("intent_complete", &["codebase_mapped"], true),
            PhaseDefinition::new("prd_complete", &["intent_complete"], false),
            PhaseDefinition::new("user_stories_complete", &["prd_complete"], false),
            PhaseDefinition::new("conversion_complete", &["user_stories_complete"], false),
        ])
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// The last planning phase; completing it ends planning mode.
    pub fn final_planning_phase(&self) -> Option<&PhaseDefinition> {
        self.phases.iter().rev().find(|p| p.planning)
    }
}

/// Why a phase is blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Missing {
        prerequisite: String,
    },
    Stale {
        prerequisite: String,
        age_days: i64,
        window_days: i64,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Missing { prerequisite } => {
                write!(f, "prerequisite '{prerequisite}' has not been completed")
            }
            BlockReason::Stale {
                prerequisite,
                age_days,
                window_days,
            } => write!(
                f,
                "prerequisite '{prerequisite}' is STALE ({age_days} days old, window is {window_days} days)"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Open,
    Blocked(Vec<BlockReason>),
}

impl GateStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, GateStatus::Open)
    }
}

/// A phase's row in `gantry status`.
#[derive(Debug, Clone)]
pub struct PhaseStatus {
    pub name: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub gate: GateStatus,
}

pub struct PhaseGate {
    store: CheckpointStore,
    registry: PhaseRegistry,
    staleness_window: Duration,
}

impl PhaseGate {
    /// `staleness_days` is clamped to `0..=MAX_STALENESS_DAYS`.
    pub fn new(store: CheckpointStore, registry: PhaseRegistry, staleness_days: i64) -> Self {
        let days = staleness_days.clamp(0, MAX_STALENESS_DAYS);
        Self {
            store,
            registry,
            staleness_window: Duration::try_days(days).unwrap_or(Duration::MAX),
        }
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn definition(&self, phase: &str) -> Result<&PhaseDefinition, GateError> {
        self.registry
            .get(phase)
            .ok_or_else(|| GateError::UnknownPhase {
                phase: phase.to_string(),
            })
    }

    pub fn check(&self, phase: &str) -> Result<GateStatus, GateError> {
        self.check_at(phase, Utc::now())
    }

    /// Evaluate every prerequisite of `phase` as of `now`, collecting all
    /// reasons rather than stopping at the first.
    pub fn check_at(&self, phase: &str, now: DateTime<Utc>) -> Result<GateStatus, GateError> {
        let def = self.definition(phase)?;
        let mut reasons = Vec::new();

        for prerequisite in &def.prerequisites {
            let record = match self.store.read(prerequisite) {
                Ok(r) => r,
                Err(CheckpointError::NotFound { .. }) => {
                    reasons.push(BlockReason::Missing {
                        prerequisite: prerequisite.clone(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if def.fresh {
                let age = (now - record.completed_at).max(Duration::zero());
                if age > self.staleness_window {
                    reasons.push(BlockReason::Stale {
                        prerequisite: prerequisite.clone(),
                        age_days: age.num_days(),
                        window_days: self.staleness_window.num_days(),
                    });
                }
            }
        }

        if reasons.is_empty() {
            Ok(GateStatus::Open)
        } else {
            Ok(GateStatus::Blocked(reasons))
        }
    }

    /// True only for a known phase whose gate is open.
    pub fn can_enter(&self, phase: &str) -> bool {
        matches!(self.check(phase), Ok(GateStatus::Open))
    }

    fn require_open(&self, phase: &str) -> Result<(), GateError> {
        match self.check(phase)? {
            GateStatus::Open => Ok(()),
            GateStatus::Blocked(reasons) => Err(GateError::OutOfOrderPhase {
                phase: phase.to_string(),
                reasons,
            }),
        }
    }

    /// Start `phase`. The session is only touched when the gate is open.
    pub fn enter(&self, session: &mut Session, phase: &str) -> Result<(), GateError> {
        self.require_open(phase)?;
        let def = self.definition(phase)?;
        if def.planning {
            session.enter_planning(phase);
        } else {
            session.current_phase = Some(phase.to_string());
        }
        tracing::info!(phase, planning = def.planning, "entered phase");
        Ok(())
    }

    /// Mark `phase` done. Rewriting an existing checkpoint refreshes its
    /// timestamp. Completing the final planning phase ends planning mode.
    pub fn complete(
        &self,
        session: &mut Session,
        phase: &str,
    ) -> Result<CheckpointRecord, GateError> {
        self.require_open(phase)?;
        let record = self.store.write(phase)?;

        let is_final = self
            .registry
            .final_planning_phase()
            .is_some_and(|p| p.name == phase);
        if is_final {
            session.exit_planning();
            session.current_phase = None;
            tracing::info!(phase, "planning complete, source edits re-enabled");
        } else {
            tracing::info!(phase, "phase completed");
        }
        Ok(record)
    }

    /// Story execution may only begin once planning has been completed.
    pub fn require_execution_ready(&self) -> Result<(), GateError> {
        let Some(last) = self.registry.final_planning_phase() else {
            return Ok(());
        };
        if self.store.exists(&last.name) {
            Ok(())
        } else {
            Err(GateError::OutOfOrderPhase {
                phase: STORY_EXECUTION.to_string(),
                reasons: vec![BlockReason::Missing {
                    prerequisite: last.name.clone(),
                }],
            })
        }
    }

    pub fn status(&self) -> Result<Vec<PhaseStatus>, GateError> {
        let now = Utc::now();
        self.registry
            .phases()
            .iter()
            .map(|def| {
                let completed_at = match self.store.read(&def.name) {
                    Ok(r) => Some(r.completed_at),
                    Err(CheckpointError::NotFound { .. }) => None,
                    Err(e) => return Err(e.into()),
                };
                Ok(PhaseStatus {
                    name: def.name.clone(),
                    completed_at,
                    gate: self.check_at(&def.name, now)?,
                })
            })
            .collect()
    }
}
