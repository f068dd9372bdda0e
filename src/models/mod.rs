//! Core data models for reelforge.
//!
//! - `state`: the workflow state record and its lifecycle
//! - `output`: typed per-stage outputs and the patches stages return
//! - `stage_id`: the fixed, ordered set of stages
//! - `error`: stage failure classification and crate errors
//! - `config`: TOML configuration

mod config;
mod error;
mod output;
mod stage_id;
mod state;

pub use config::*;
pub use error::*;
pub use output::*;
pub use stage_id::*;
pub use state::*;
