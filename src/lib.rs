//! `patchsim`: the public facade over `patchsim-core` (value model, handler
//! tables, entity instances, scope, the resolver) and `patchsim-stepper` (the
//! timestep phase machine, patch-parallel scheduling, and the external-data /
//! export / assertion seams).
//!
//! A DSL compiler (out of scope here) builds a [`patchsim_core::model::Model`]
//! and a [`patchsim_stepper::config::SimConfig`], then drives the engine
//! through [`patchsim_stepper::stepper::Stepper`]. Everything this crate adds
//! over re-exporting its two members is the combined prelude below.

pub use patchsim_core as core;
pub use patchsim_stepper as stepper;

pub mod prelude {
    pub use patchsim_core::prelude::*;
    pub use patchsim_stepper::prelude::*;
}
