//! Shared types for the outpost agent: trace and process data, configuration,
//! payload sealing, and the collaborator traits the other crates plug into.

pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod types;
