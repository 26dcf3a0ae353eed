//! Prompt Architect: merges a model portrait with a product shot into commercial photography
//! prompts via Gemini, then renders a preview for the chosen prompt.

pub mod config;
pub mod data_uri;
pub mod gemini;
pub mod models;
pub mod prompts;
pub mod routes;
pub mod workflow;
