pub mod assembler;
pub mod book;
pub mod config;
pub mod error;
pub mod generator;
pub mod llm;
pub mod planner;
pub mod prompt;
pub mod quota;
pub mod retry;
pub mod setup;
pub mod state;
pub mod workflow;
