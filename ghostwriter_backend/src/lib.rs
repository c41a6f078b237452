pub mod config;
pub mod conversation;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod orchestrator;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod transport;
pub mod typing;

#[cfg(test)]
mod testing;
