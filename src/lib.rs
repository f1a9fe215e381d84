pub mod clarification;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod generator;
pub mod guardrail;
pub mod intent;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod org;
pub mod pipeline;
pub mod schema_index;
pub mod selector;
pub mod voting;

pub use config::Settings;
pub use error::{QueryError, Result};
pub use orchestrator::{Collaborators, Orchestrator, QueryRequest, QueryResponse};
