//! Bridgeway: an Anthropic Messages gateway that translates requests for
//! Azure OpenAI and OpenAI-compatible backends, validates outbound URLs and
//! fails over between a primary and a fallback backend.

pub mod cli;
pub mod models;
pub mod providers;
pub mod security;
pub mod server;
pub mod translate;
