//! The timestep phase machine, patch-parallel worker pool, and the
//! out-of-scope-collaborator seams (external data, export, assertions) one
//! layer above `patchsim-core`'s value/handler/resolver model: entity storage
//! and resolution below, scheduling above.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod external;
pub mod patchset;
pub mod stepper;

pub mod prelude {
    pub use crate::concurrency::{CancellationToken, RngStream};
    pub use crate::config::SimConfig;
    pub use crate::error::{RunError, RunReport, StepperError};
    pub use crate::external::{
        AssertionSink, ExportSink, NullAssertionSink, NullExportSink, RetryingExternalDataSource,
    };
    pub use crate::patchset::{Extent, PatchCoord, PatchSet};
    pub use crate::stepper::Stepper;
}
