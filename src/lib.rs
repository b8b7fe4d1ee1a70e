//! `scriptclone` clones the structure of a successful video script onto a new topic.
//!
//! This crate provides:
//! - A two-stage pipeline: analyze a transcript's "success formula", then synthesize a new
//!   script for a chosen topic that mirrors the original's section breakdown
//! - A finite-state machine that decides what a session may do next and where `retry` resumes
//! - A shape-agnostic structured generation client that validates every reply against a
//!   closed schema before decoding it
//! - A Gemini backend, credential providers, and script encoders (JSON, plain text)
//!
//! The library is designed to be used by both the CLI and the HTTP server, with the generation
//! service pluggable so tests never touch the network.

// High-level API (most consumers should start here).
pub mod opts;
pub mod pipeline;

// The two stages.
pub mod analysis;
pub mod script;

// Structured generation and its backends.
pub mod backends;
pub mod generation;
pub mod schema;

// External capabilities.
pub mod credential;

// Output selection and encoders.
pub mod output_type;
pub mod script_encoder;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub mod error;

pub use analysis::{Analysis, AnalysisResponse, SuggestedTopics};
#[cfg(feature = "gemini")]
pub use backends::gemini::{GeminiConfig, GeminiService};
pub use credential::{CredentialProvider, EnvCredential, FileCredential, MemoryCredential};
pub use error::{Error, GenerationFailure, Result};
pub use generation::{GenerationService, Prompt, StructuredClient};
pub use opts::Opts;
pub use output_type::OutputType;
pub use pipeline::{
    Command, Event, Intent, Phase, Pipeline, PipelineState, Stage, StageFailure, StageRunner,
};
pub use schema::{Schema, SchemaViolation};
pub use script::{Script, Section};
