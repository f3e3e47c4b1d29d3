//! Shared domain types for the undoable daemon: the error taxonomy, the
//! launch configuration, the provider-agnostic LLM message model, and the
//! `callLLM` contract every executor depends on.

pub mod config;
pub mod error;
pub mod llm;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
