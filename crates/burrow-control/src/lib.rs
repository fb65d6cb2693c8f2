//! Tenant lifecycle for burrow
pub mod error;
pub mod ids;
pub mod manager;

pub use error::ControlError;
pub use ids::{generate_tenant_id, validate_tenant_id};
pub use manager::{ClientManager, ManagerConfig, ManagerStats, TunnelInfo};
