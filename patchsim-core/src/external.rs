//! The external-data collaborator seam.
//!
//! Raster/geospatial caches and reprojection are out of scope; this module
//! only defines the trait the [`crate::scope::Scope`] calls through for
//! `external NAME` lookups. `patchsim-stepper` provides a retry-with-backoff
//! decorator on top of it.

use thiserror::Error;

use crate::geometry::Geometry;
use crate::value::Distribution;

/// Raised when an external fetch fails.
#[derive(Debug, Error, Clone)]
#[error("external data fetch failed for `{name}`: {reason}")]
pub struct ExternalError {
    pub name: String,
    pub reason: String,
}

/// `fetch(name, geometry, timestep) -> Distribution`.
///
/// The engine makes no assumption about idempotency across timesteps but
/// does assume determinism within a timestep for a fixed `(name, geometry)`.
pub trait ExternalDataSource: Send + Sync {
    fn fetch(&self, name: &str, geometry: &Geometry, timestep: u64) -> Result<Distribution, ExternalError>;
}

/// A source that never has any data; useful for models that declare no
/// `external` lookups and for unit tests.
pub struct NoExternalData;

impl ExternalDataSource for NoExternalData {
    fn fetch(&self, name: &str, _geometry: &Geometry, _timestep: u64) -> Result<Distribution, ExternalError> {
        Err(ExternalError { name: name.to_string(), reason: "no external data source configured".to_string() })
    }
}
