//! Dynamic MCP tool-discovery orchestrator.
//!
//! A natural-language request is routed to an LLM that may call tools exposed
//! by one or more Model Context Protocol (MCP) servers. When the LLM lacks a
//! needed capability, the orchestrator discovers, authenticates, installs and
//! integrates a new MCP server mid-conversation, then retries.

pub mod agent;
pub mod config;
pub mod discovery;
pub mod error;
pub mod installer;
pub mod mcp;
pub mod message;
pub mod model;
pub mod oauth;
pub mod orchestrator;
pub mod registry;
pub mod server_spec;
pub mod token_store;
pub mod util;
