//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                                |
//! |------------|-----------------------------------------------------------------|
//! | `workflow` | `Start`, `Status`, `SetPhase`, `CompletePhase`, `CheckEdit`     |
//! | `document` | `SetIntent`, `Interview`, `ImportPrd`                           |
//! | `story`    | `SetStory`, `RunStory`, `Run`, `Cleanup`, `MarkStoryPass`, `Rollback` |
//! | `learn`    | `Learn`, `Metrics`                                              |

pub mod document;
pub mod learn;
pub mod story;
pub mod workflow;

pub use document::{cmd_import_prd, cmd_interview, cmd_set_intent};
pub use learn::{cmd_learn, cmd_metrics};
pub use story::{
    cmd_cleanup, cmd_mark_story_pass, cmd_rollback, cmd_run, cmd_run_story, cmd_set_story,
};
pub use workflow::{cmd_check_edit, cmd_complete_phase, cmd_set_phase, cmd_start, cmd_status};

use anyhow::Result;
use gantry::checkpoint::CheckpointStore;
use gantry::config::Config;
use gantry::gantry_config::GantryToml;
use gantry::gate::PhaseGate;

/// Build the phase gate from the project's configured registry.
pub(crate) fn phase_gate(config: &Config, toml: &GantryToml) -> PhaseGate {
    PhaseGate::new(
        CheckpointStore::new(&config.checkpoints_dir),
        toml.registry(),
        toml.gate.staleness_days,
    )
}

/// Load `gantry.toml` and the gate in one go.
pub(crate) fn load_gate(config: &Config) -> Result<(GantryToml, PhaseGate)> {
    let toml = config.load_toml()?;
    let gate = phase_gate(config, &toml);
    Ok((toml, gate))
}
