use burrow_agent::AgentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to bind tunnel listener on {address}: {reason}\n\nTroubleshooting:\n  • Check that {address} is an address of this host\n  • Check that ephemeral ports are available (port {port} means OS-assigned)")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Tunnel agent error: {0}")]
    Agent(AgentError),

    #[error("Invalid subdomain: {0}")]
    InvalidTenantId(String),
}

impl From<AgentError> for ControlError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Bind {
                address,
                port,
                reason,
            } => ControlError::Bind {
                address,
                port,
                reason,
            },
            other => ControlError::Agent(other),
        }
    }
}
