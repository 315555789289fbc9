pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod session;
