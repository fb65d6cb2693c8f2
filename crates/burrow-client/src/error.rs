use burrow_agent::AgentError;
use thiserror::Error;

/// Errors from relaying one public request through a tunnel
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No tunnel socket available: {0}")]
    Agent(#[from] AgentError),

    #[error("HTTP error on tunnel connection: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
