//! Command-line runner for the arbitration pipeline
//!
//! Wires an OpenAI-compatible model endpoint, the lexical embedder and
//! the arbiter model into [`arbitration::StabilityEngine`].

pub mod cli;
pub mod client;
pub mod config;

pub use cli::{Cli, Command, MemoryCommand, RunArgs};
pub use client::{parse_chat_response, status_error, OpenAiCompatClient};
pub use config::{RunnerConfig, RunnerConfigError};
