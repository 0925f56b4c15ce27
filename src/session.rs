//! The workflow session: planning mode and the active story.
//!
//! A session is created by `gantry start` and persisted at
//! `.gantry/session.json`. It is passed explicitly to the phase gate and the
//! story commands rather than discovered through ambient flag files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::errors::{SessionError, StoryError};
use crate::util::atomic_write;

/// Whether source edits are currently forbidden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PlanningMode {
    #[default]
    Off,
    On {
        phase: String,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub planning: PlanningMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_story: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A fresh session with planning mode off and no active story.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            planning: PlanningMode::Off,
            current_phase: None,
            active_story: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotStarted {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(SessionError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| SessionError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| SessionError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write(path, &json).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn is_planning(&self) -> bool {
        matches!(self.planning, PlanningMode::On { .. })
    }

    pub fn enter_planning(&mut self, phase: &str) {
        self.planning = PlanningMode::On {
            phase: phase.to_string(),
            since: Utc::now(),
        };
        self.current_phase = Some(phase.to_string());
    }

    pub fn exit_planning(&mut self) {
        self.planning = PlanningMode::Off;
    }

    /// Reject source mutations while planning mode is on.
    pub fn guard_source_mutation(&self) -> Result<(), SessionError> {
        match &self.planning {
            PlanningMode::Off => Ok(()),
            PlanningMode::On { phase, .. } => Err(SessionError::PlanningModeActive {
                phase: phase.clone(),
            }),
        }
    }

    /// Record `id` as the active story. Re-claiming the same story is a
    /// no-op; claiming a different one while another is active fails.
    pub fn claim_story(&mut self, id: &str) -> Result<(), StoryError> {
        match &self.active_story {
            Some(active) if active != id => Err(StoryError::ConcurrentStoryConflict {
                active: active.clone(),
                requested: id.to_string(),
            }),
            _ => {
                self.active_story = Some(id.to_string());
                Ok(())
            }
        }
    }

    /// Clear the active story if it is `id`.
    pub fn release_story(&mut self, id: &str) {
        if self.active_story.as_deref() == Some(id) {
            self.active_story = None;
        }
    }
}
