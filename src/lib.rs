pub mod config;
pub mod llm;
pub mod notify;
pub mod shared;
pub mod tickets;
pub mod workflow;
