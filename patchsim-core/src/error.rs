//! Error taxonomy for the value model, handler table, and resolver.
//!
//! Compile-time errors, type errors, circular dependencies, domain errors,
//! and failed assertions all originate here. `ExternalError` lives in
//! `patchsim-stepper` since only the stepper talks to external data.

use thiserror::Error;

use crate::entity::EntityId;

/// Errors raised while constructing or type-checking values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("incompatible units: {lhs} vs {rhs}")]
    IncompatibleUnits { lhs: String, rhs: String },

    #[error("selector did not evaluate to a boolean")]
    NonBooleanSelector,

    #[error("cast from {from} to {to} is lossy; use `force as` to permit it")]
    LossyCast { from: String, to: String },

    #[error("no conversion registered from {from} to {to}")]
    UnknownConversion { from: String, to: String },

    #[error("expected {expected}, found {found}")]
    Mismatch { expected: &'static str, found: &'static str },
}

/// Errors raised while compiling a model's handler table or unit registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("undefined identifier: {0}")]
    UndefinedIdentifier(String),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("duplicate attribute declared on entity type {entity_type}: {attribute}")]
    DuplicateAttribute { entity_type: String, attribute: String },

    #[error("state-scoped handler declared for attribute {attribute}, which is not `state`")]
    StateScopedOnNonStateAttribute { attribute: String },
}

/// The top-level error type for resolution and evaluation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("circular dependency resolving `{attribute}` (path: {path:?})")]
    CircularDependency { attribute: String, path: Vec<String> },

    #[error("domain error: {0}")]
    Domain(String),

    #[error("assertion `{attribute}` failed on entity {entity:?} at timestep {timestep}: {message}")]
    AssertionFailed {
        entity: EntityId,
        attribute: String,
        timestep: u64,
        message: String,
    },
}

/// Errors that can occur while evaluating a callable or selector inside a [`crate::scope::Scope`].
///
/// This is a narrower alias of [`EngineError`] exposed to the (out-of-scope) DSL
/// callables so they do not need to know about every engine error variant.
pub type EvalError = EngineError;
