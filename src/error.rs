//! Run-level error taxonomy.
//!
//! Only the variants that end a run live here; component errors carry their
//! own enums and are folded in by the orchestrator.

use thiserror::Error;

use crate::brain::ProviderError;
use crate::executor::ExecutionError;
use crate::protocol::ParseError;
use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("page snapshot not ready after {attempts} attempts")]
    ObservationNotReady { attempts: u32 },

    #[error("reasoning service unavailable after {attempts} attempts: {message}")]
    ProviderTransient { attempts: u32, message: String },

    #[error("reasoning service error: {0}")]
    ProviderFatal(String),

    #[error("{0}")]
    ActionParse(#[from] ParseError),

    #[error("action failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("could not attach to the page: {0}")]
    ResourceAttach(RemoteError),

    #[error("step limit of {limit} reached")]
    StepCeilingExceeded { limit: usize },

    #[error("agent gave up after {attempts} attempts")]
    AgentGaveUp { attempts: u32 },
}

impl RunError {
    pub(crate) fn from_provider(err: ProviderError, attempts: u32) -> Self {
        match err {
            ProviderError::Transient(message) => RunError::ProviderTransient { attempts, message },
            ProviderError::Fatal(message) => RunError::ProviderFatal(message),
        }
    }
}

pub type RunResult<T> = Result<T, RunError>;
