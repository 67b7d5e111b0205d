//! Skema - chat with your database schema, locally
//!
//! Turns crawled relational-database schema metadata into a locally-stored,
//! semantically-indexed knowledge base, and answers natural-language
//! questions about it with retrieval-augmented generation against a local
//! model service.

pub mod cancel;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod context;
pub mod embed;
pub mod enrich;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod schema;
pub mod store;

pub use error::{Result, SkemaError};
