//! Ollama integration for the Logos local-provider facade
//!
//! - [`OllamaConfig`]: the Ollama environment settings that matter for
//!   scheduling (`OLLAMA_NUM_PARALLEL` seeds the provider parallel capacity).
//! - [`OllamaClient`]: polls `GET /api/ps` and feeds the loaded-model
//!   snapshot through [`logos_core::LoadedModelSource`].

mod client;
mod config;

pub use client::{parse_ps, OllamaClient, PsModel, PsResponse};
pub use config::{OllamaConfig, DEFAULT_OLLAMA_HOST};
