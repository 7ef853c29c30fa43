//! pgmcp: multi-tenant MCP server for PostgreSQL.
//!
//! The binary in `main.rs` wires these modules together; integration tests in
//! `tests/` drive them directly.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod kb;
pub mod llm;
pub mod mcp;
pub mod models;
pub mod store;
pub mod tools;
pub mod vault;
