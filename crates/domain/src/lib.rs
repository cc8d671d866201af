//! Shared domain types for the Ghost agent runtime: the error taxonomy,
//! OpenAI chat-completion wire types, and the runtime configuration.

pub mod chat;
pub mod config;
pub mod error;

pub use error::{Error, Result};
