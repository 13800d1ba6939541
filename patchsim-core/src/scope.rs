//! The variable-resolution environment handed to every callable and selector
//! evaluation.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};

use crate::entity::{EntityId, EntityInstance};
use crate::error::EvalError;
use crate::external::ExternalDataSource;
use crate::geometry::Geometry;
use crate::handler::{AttrId, Event};
use crate::value::{Distribution, Value};

/// Creates child entities on behalf of a handler callable. Implemented by the
/// stepper,
/// which alone knows how to look up an `EntityType` by name and register the
/// new instance for discovery — `patchsim-core` only consumes it, the same
/// seam pattern as [`AllEntities`] and [`ExternalDataSource`].
pub trait EntitySpawner: Send + Sync {
    fn spawn(
        &self,
        entity_type: &str,
        parent: &Arc<EntityInstance>,
        geometry: Option<Geometry>,
    ) -> Result<EntityId, EvalError>;
}

/// A spawner that always refuses; useful for entity types that never create
/// children and for unit tests.
pub struct NoSpawning;

impl EntitySpawner for NoSpawning {
    fn spawn(&self, entity_type: &str, _parent: &Arc<EntityInstance>, _geometry: Option<Geometry>) -> Result<EntityId, EvalError> {
        Err(EvalError::Domain(format!("spawning is not configured for this run (tried to spawn `{entity_type}`)")))
    }
}

/// The unrestricted distribution of all realized-in-sight entities (`all`),
/// used in spatial queries. Implemented by whatever owns the
/// patch set — `patchsim-core` only consumes it through this trait so it does
/// not depend on `patchsim-stepper`'s concrete `PatchSet`.
pub trait AllEntities: Send + Sync {
    fn all(&self) -> Distribution;
}

/// Receives every assertion evaluation, pass or fail, as it occurs.
/// Implemented by the stepper, which
/// bridges to its own `AssertionSink` — `patchsim-core` only reports through
/// this seam so the resolver never depends on `patchsim-stepper`.
pub trait AssertionReporter: Send + Sync {
    fn report(&self, entity: EntityId, attribute: &str, timestep: u64, ok: bool, message: &str);
}

/// An `AssertionReporter` that discards every report; used for unit tests and
/// entity types that declare no `assert.*` attributes.
pub struct NoAssertionReporting;

impl AssertionReporter for NoAssertionReporting {
    fn report(&self, _entity: EntityId, _attribute: &str, _timestep: u64, _ok: bool, _message: &str) {}
}

/// An `AllEntities` that never has anything in sight; used for unit tests and
/// for entity types that never reference `all`.
pub struct EmptyAllEntities;

impl AllEntities for EmptyAllEntities {
    fn all(&self) -> Distribution {
        Distribution::Realized(Arc::new(Vec::new()), crate::units::Units::dimensionless())
    }
}

/// Which name a handler/selector callable is asking the [`Scope`] to
/// resolve. This is the contract the (out-of-scope) DSL compiler's generated
/// closures are written against.
#[derive(Clone, Debug)]
pub enum ScopeRef {
    /// `current.X` or bare `X`.
    Current(AttrId),
    /// `prior.X`.
    Prior(AttrId),
    /// `here.X`.
    Here(AttrId),
    /// `meta.X`.
    Meta(AttrId),
    /// `all`.
    All,
    /// a `const`-bound free variable.
    Local(String),
}

/// The per-evaluation environment: the entity under resolution, its patch
/// (`here`), the simulation entity (`meta`), the unrestricted entity
/// distribution (`all`), the external-data hook, the current timestep/event,
/// and a stack of block scopes for `const` bindings.
pub struct Scope {
    pub(crate) entity: Arc<EntityInstance>,
    pub(crate) patch: Arc<EntityInstance>,
    pub(crate) simulation: Arc<EntityInstance>,
    pub(crate) all: Arc<dyn AllEntities>,
    pub(crate) external: Arc<dyn ExternalDataSource>,
    pub(crate) spawner: Arc<dyn EntitySpawner>,
    pub(crate) rng: Arc<Mutex<dyn RngCore + Send>>,
    pub(crate) assertions: Arc<dyn AssertionReporter>,
    pub(crate) event: Event,
    pub(crate) timestep: u64,
    /// Whether freshly-sampled numeric values (`Scope::sample` over a
    /// `Uniform`/`Normal` distribution) are represented as `Decimal` rather
    /// than `Double`. Sourced from `SimParams::favor_big_decimal` at `Model`
    /// construction; a plain arithmetic expression never consults this, only
    /// the act of drawing a new number from nothing does.
    pub(crate) favor_big_decimal: bool,
    locals: Vec<FxHashMap<String, Value>>,
}

impl Scope {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity: Arc<EntityInstance>,
        patch: Arc<EntityInstance>,
        simulation: Arc<EntityInstance>,
        all: Arc<dyn AllEntities>,
        external: Arc<dyn ExternalDataSource>,
        event: Event,
        timestep: u64,
    ) -> Self {
        Scope::full(
            entity,
            patch,
            simulation,
            all,
            external,
            Arc::new(NoSpawning),
            Arc::new(Mutex::new(rand::rngs::StdRng::seed_from_u64(0))),
            Arc::new(NoAssertionReporting),
            event,
            timestep,
            true,
        )
    }

    /// Constructs a `Scope` with every collaborator explicit; the stepper
    /// uses this to plug in its own spawner, per-patch deterministic RNG,
    /// assertion-result sink, and the model's `favor_big_decimal` setting.
    #[allow(clippy::too_many_arguments)]
    pub fn full(
        entity: Arc<EntityInstance>,
        patch: Arc<EntityInstance>,
        simulation: Arc<EntityInstance>,
        all: Arc<dyn AllEntities>,
        external: Arc<dyn ExternalDataSource>,
        spawner: Arc<dyn EntitySpawner>,
        rng: Arc<Mutex<dyn RngCore + Send>>,
        assertions: Arc<dyn AssertionReporter>,
        event: Event,
        timestep: u64,
        favor_big_decimal: bool,
    ) -> Self {
        Scope {
            entity,
            patch,
            simulation,
            all,
            external,
            spawner,
            rng,
            assertions,
            event,
            timestep,
            favor_big_decimal,
            locals: Vec::new(),
        }
    }

    /// A child scope for recursing into another entity's resolution (e.g.
    /// when iterating a distribution of entities), sharing the same patch,
    /// simulation, `all`, external, spawner, and assertion-sink context but a
    /// fresh `locals` stack.
    pub fn for_entity(&self, entity: Arc<EntityInstance>) -> Scope {
        Scope {
            entity,
            patch: self.patch.clone(),
            simulation: self.simulation.clone(),
            all: self.all.clone(),
            external: self.external.clone(),
            spawner: self.spawner.clone(),
            rng: self.rng.clone(),
            assertions: self.assertions.clone(),
            event: self.event,
            timestep: self.timestep,
            favor_big_decimal: self.favor_big_decimal,
            locals: Vec::new(),
        }
    }

    /// Fetches `name` from the external-data collaborator at this entity's
    /// geometry and the current timestep (`external NAME`).
    pub fn fetch_external(&self, name: &str) -> Result<Distribution, EvalError> {
        let geometry = self.geometry().unwrap_or(Geometry::Point { x: 0.0, y: 0.0 });
        self.external
            .fetch(name, &geometry, self.timestep)
            .map_err(|e| EvalError::Domain(e.to_string()))
    }

    /// Draws a value from `distribution` using this patch's deterministic RNG
    /// stream.
    pub fn sample(&self, distribution: &Distribution) -> Value {
        distribution.sample(&mut *self.rng.lock(), self.favor_big_decimal)
    }

    /// Spawns a new `entity_type` child of the entity under resolution.
    pub fn spawn(&self, entity_type: &str) -> Result<EntityId, EvalError> {
        self.spawner.spawn(entity_type, &self.entity, None)
    }

    /// Reports an assertion evaluation for the entity under resolution, pass
    /// or fail, before an `AssertionFailed` error (if any) propagates.
    pub fn report_assertion(&self, attribute: &str, ok: bool, message: &str) {
        self.assertions.report(self.entity.id, attribute, self.timestep, ok, message);
    }

    pub fn entity(&self) -> &Arc<EntityInstance> {
        &self.entity
    }

    pub fn event(&self) -> Event {
        self.event
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.entity.geometry()
    }

    /// Opens a new `{ ... }` block scope for `const` bindings.
    pub fn push_block(&mut self) {
        self.locals.push(FxHashMap::default());
    }

    pub fn pop_block(&mut self) {
        self.locals.pop();
    }

    /// Binds `name` in the innermost open block scope.
    pub fn bind_local(&mut self, name: impl Into<String>, value: Value) {
        if self.locals.is_empty() {
            self.push_block();
        }
        self.locals.last_mut().unwrap().insert(name.into(), value);
    }

    fn lookup_local(&self, name: &str) -> Option<Value> {
        self.locals.iter().rev().find_map(|frame| frame.get(name).cloned())
    }

    /// Resolves `prior.X`, `here.X`, `meta.X`, and `all` without recursing
    /// into the [`crate::resolver::Resolver`] — `prior` is a frozen snapshot,
    /// and `here`/`meta` read already-settled cached values (per-entity
    /// resolution for the current attribute is handled separately by the
    /// resolver itself via [`ScopeRef::Current`]).
    pub fn resolve_static(&self, reference: &ScopeRef) -> Result<Value, EvalError> {
        match reference {
            ScopeRef::Prior(attr) => {
                let slot = self
                    .entity
                    .entity_type
                    .slot_of(*attr)
                    .ok_or_else(|| missing_attr_err(*attr))?;
                Ok(self.entity.prior_value(slot).unwrap_or(Value::Boolean(false)))
            }
            ScopeRef::Here(attr) => Ok(read_settled(&self.patch, *attr)),
            ScopeRef::Meta(attr) => Ok(read_settled(&self.simulation, *attr)),
            ScopeRef::All => Ok(Value::Distribution(self.all.all())),
            ScopeRef::Local(name) => self.lookup_local(name).ok_or_else(|| EvalError::Domain(format!(
                "undeclared free variable `{name}`"
            ))),
            ScopeRef::Current(_) => Err(EvalError::Domain(
                "ScopeRef::Current must be resolved by the Resolver, not Scope::resolve_static".to_string(),
            )),
        }
    }
}

/// Reads an entity's already-resolved cached value for `attr`, falling back
/// to its live slot and then its prior value — untouched attributes keep
/// their prior value. Used for `here`/`meta`, which must never re-enter the
/// cycle-detection guard of an entity that may be resolving concurrently on
/// another worker thread.
///
/// Mirrors [`crate::resolver::settle_from_prior`]'s ordering: the live slot
/// is checked before `prior`, since a value an earlier substep of this same
/// timestep already wrote (e.g. `init` setting `base_temp`, read via `here`
/// by a child before this entity's own cache is repopulated) must be visible
/// rather than masked by last timestep's frozen snapshot.
fn read_settled(entity: &Arc<EntityInstance>, attr: AttrId) -> Value {
    if let Some(v) = entity.cached(attr) {
        return v;
    }
    if let Some(slot) = entity.entity_type.slot_of(attr) {
        if let Some(v) = entity.slot_value(slot) {
            return v;
        }
        if let Some(v) = entity.prior_value(slot) {
            return v;
        }
    }
    Value::Boolean(false)
}

fn missing_attr_err(attr: AttrId) -> EvalError {
    EvalError::Domain(format!("attribute {attr:?} is not declared on this entity type"))
}
