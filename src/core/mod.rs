//! Core pipeline logic.
//!
//! This module contains:
//! - Orchestrator: runs a processing cycle for each queue message
//! - Settings: limits and resilience tunables for a cycle

pub mod orchestrator;
pub mod settings;

// Re-export commonly used types
pub use orchestrator::{Collaborators, CycleError, Orchestrator};
pub use settings::{InvalidSetting, PipelineSettings};
