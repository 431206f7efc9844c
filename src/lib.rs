//! Multi-account Amazon Q / Kiro API gateway
//!
//! Exposes OpenAI- and Anthropic-compatible chat endpoints backed by a pool
//! of upstream accounts with OAuth token lifecycle, API-key management,
//! request translation, stream post-processing and account fail-over.

pub mod amazonq;
pub mod anthropic;
pub mod common;
pub mod core;
pub mod dispatch;
pub mod http_client;
pub mod keys;
pub mod model;
pub mod oauth;
pub mod openai;
pub mod store;

#[cfg(test)]
mod test;
