//! Run-level error reporting: `RunError` wraps the model-level
//! `EngineError` with the scheduling context (timestep, substep, patch) the
//! resolver itself cannot see.

use patchsim_core::entity::EntityId;
use patchsim_core::error::EngineError;
use patchsim_core::handler::Event;
use thiserror::Error;

/// Errors raised by the stepper itself, outside of attribute resolution:
/// invalid configuration and external-data exhaustion.
#[derive(Debug, Error, Clone)]
pub enum StepperError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("external data source exhausted its retries fetching `{name}`: {reason}")]
    ExternalExhausted { name: String, reason: String },
}

/// The run-level failure a `Stepper::run` call surfaces: either one of its
/// own scheduling errors, or a model error pinpointed to exactly where it
/// happened (timestep, substep, entity id, attribute, error).
#[derive(Debug, Error, Clone)]
pub enum RunError {
    #[error(transparent)]
    Stepper(#[from] StepperError),

    #[error("at timestep {timestep} during {event:?} on entity {entity:?}: {source}")]
    Model {
        timestep: u64,
        event: Event,
        entity: EntityId,
        #[source]
        source: EngineError,
    },
}

/// Returned by a completed, aborted, or cancelled `Stepper::run` call. On
/// success, `failure` is `None`, `cancelled` is `false`, and
/// `last_good_timestep` is the final timestep of the requested range; on
/// failure or cancellation, `last_good_timestep` is the last timestep whose
/// `end` substep fully published — no partial results are published beyond
/// it.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub last_good_timestep: u64,
    pub failure: Option<RunError>,
    /// True iff the run stopped because a `CancellationToken` was observed at
    /// a substep barrier rather than because of a model or scheduling error
    /// (spec.md §5: cancellation "terminates cleanly", it is not a failure).
    pub cancelled: bool,
}

impl RunReport {
    pub fn success(last_good_timestep: u64) -> Self {
        RunReport { last_good_timestep, failure: None, cancelled: false }
    }

    pub fn failed(last_good_timestep: u64, failure: RunError) -> Self {
        RunReport { last_good_timestep, failure: Some(failure), cancelled: false }
    }

    pub fn cancelled(last_good_timestep: u64) -> Self {
        RunReport { last_good_timestep, failure: None, cancelled: true }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }
}
