use pmon_core::{GatewayError, InstanceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("instance {0} is not in the instance list")]
    UnknownInstance(InstanceId),
    #[error("unsupported pipeline instance state '{0}'")]
    UnsupportedInstanceState(String),
    #[error("background step failed: {0}")]
    Background(String),
}
