use thiserror::Error;

use fleet_provider::ProviderError;
use fleet_state::StateError;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl SupervisorError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State(e) => e.kind(),
            Self::Provider(e) => e.kind(),
        }
    }
}
