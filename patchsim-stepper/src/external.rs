//! Out-of-scope collaborators for export and assertion reporting, plus the
//! retry decorator around `patchsim_core::external::ExternalDataSource`.

use std::thread;
use std::time::Duration;

use patchsim_core::entity::EntityId;
use patchsim_core::external::{ExternalDataSource, ExternalError};
use patchsim_core::geometry::Geometry;
use patchsim_core::value::{Distribution, Value};
use tracing::warn;

/// Receives every `export.`-prefixed attribute value at publish time. A
/// concrete CSV/NetCDF/GeoTIFF writer is out of scope; this is just the
/// seam.
pub trait ExportSink: Send + Sync {
    fn emit(&self, patch: (i64, i64), timestep: u64, attribute: &str, value: &Value);
}

/// An `ExportSink` that discards everything; useful when a model declares no
/// `export.` attributes and for unit tests that only care about assertions.
pub struct NullExportSink;

impl ExportSink for NullExportSink {
    fn emit(&self, _patch: (i64, i64), _timestep: u64, _attribute: &str, _value: &Value) {}
}

/// Receives every assertion evaluation, pass or fail. The stepper is
/// responsible for deciding that an `ok = false` result terminates the run;
/// this trait only observes.
pub trait AssertionSink: Send + Sync {
    fn assertion_result(&self, entity: EntityId, attribute: &str, timestep: u64, ok: bool, message: &str);
}

/// An `AssertionSink` that discards everything.
pub struct NullAssertionSink;

impl AssertionSink for NullAssertionSink {
    fn assertion_result(&self, _entity: EntityId, _attribute: &str, _timestep: u64, _ok: bool, _message: &str) {}
}

/// Wraps an `ExternalDataSource`, retrying a failed fetch once with
/// exponential backoff before giving up fatally.
pub struct RetryingExternalDataSource<T> {
    inner: T,
    backoff: Duration,
}

impl<T: ExternalDataSource> RetryingExternalDataSource<T> {
    pub fn new(inner: T, backoff: Duration) -> Self {
        RetryingExternalDataSource { inner, backoff }
    }
}

impl<T: ExternalDataSource> ExternalDataSource for RetryingExternalDataSource<T> {
    fn fetch(&self, name: &str, geometry: &Geometry, timestep: u64) -> Result<Distribution, ExternalError> {
        match self.inner.fetch(name, geometry, timestep) {
            Ok(value) => Ok(value),
            Err(first_error) => {
                warn!(name, timestep, error = %first_error, "external fetch failed, retrying once");
                thread::sleep(self.backoff);
                self.inner.fetch(name, geometry, timestep).map_err(|_| first_error)
            }
        }
    }
}
