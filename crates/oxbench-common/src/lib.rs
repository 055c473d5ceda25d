//! Data model shared by the oxbench agent and its counter emitters.

pub mod types;
