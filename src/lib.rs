pub mod checkpoint;
pub mod config;
pub mod document;
pub mod errors;
pub mod gantry_config;
pub mod gate;
pub mod interview;
pub mod learnings;
pub mod logging;
pub mod metrics;
pub mod runner;
pub mod session;
pub mod tracker;
pub mod ui;
pub mod util;
