//! Shared domain types for the AroMCP workflow engine.
//!
//! This crate defines the canonical intermediate representation that workflow
//! YAML deserializes into, the runtime status and payload types exchanged
//! with polling clients, and the public error taxonomy. It depends only on
//! serde and friends -- never on the engine or any IO crate.

pub mod api;
pub mod error;
pub mod workflow;
