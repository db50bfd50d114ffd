//! Simulator errors.

use ecu_core::IdError;
use ecu_runtime::RegistryError;

/// Failures connecting simulated devices.
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    /// No listener is attached, or it was dropped.
    #[error("simulator is not attached to a gateway")]
    Detached,

    /// The gateway refused the session.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A generated device id is invalid.
    #[error(transparent)]
    InvalidId(#[from] IdError),

    /// The fleet was shut down.
    #[error("simulator is shut down")]
    ShutDown,
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SimulatorError>;
