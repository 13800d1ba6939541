//! The timestep phase machine: drives `init`/`start`/`step`/`end` across the
//! simulation entity and every patch, fanning patches out over a worker pool.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use patchsim_core::entity::{EntityAllocator, EntityId, EntityInstance, EntityType};
use patchsim_core::error::EngineError;
use patchsim_core::external::ExternalDataSource;
use patchsim_core::geometry::Geometry;
use patchsim_core::handler::Event;
use patchsim_core::model::Model;
use patchsim_core::resolver::Resolver;
use patchsim_core::scope::{AllEntities, AssertionReporter, EntitySpawner, Scope};
use patchsim_core::value::{Distribution, Value};
use rand::RngCore;
use tracing::{debug, info, trace};

use crate::concurrency::{CancellationToken, RngStream};
use crate::config::SimConfig;
use crate::error::{RunError, RunReport, StepperError};
use crate::external::{AssertionSink, ExportSink};
use crate::patchset::{Extent, PatchCoord, PatchSet};

/// Every live entity the stepper has allocated, keyed by id, so attribute
/// slots holding `EntityRef`/`Distribution<EntityRef>` values can be turned
/// back into `Arc<EntityInstance>` during discovery.
#[derive(Default)]
struct EntityRegistry {
    entities: RwLock<FxHashMap<EntityId, Arc<EntityInstance>>>,
}

impl EntityRegistry {
    fn insert(&self, entity: Arc<EntityInstance>) {
        self.entities.write().insert(entity.id, entity);
    }

    fn get(&self, id: EntityId) -> Option<Arc<EntityInstance>> {
        self.entities.read().get(&id).cloned()
    }

    fn all(&self) -> Vec<Arc<EntityInstance>> {
        self.entities.read().values().cloned().collect()
    }
}

/// `all` scope resolution: the unrestricted distribution of every entity the
/// stepper currently knows about.
struct RegistryAllEntities {
    registry: Arc<EntityRegistry>,
}

impl AllEntities for RegistryAllEntities {
    fn all(&self) -> Distribution {
        let values = self.registry.all().into_iter().map(|e| Value::EntityRef(e.id)).collect();
        Distribution::Realized(Arc::new(values), patchsim_core::units::Units::dimensionless())
    }
}

/// Creates children on behalf of handler callables, registering each new
/// instance so later discovery passes can find it.
struct StepperSpawner {
    model: Arc<Model>,
    registry: Arc<EntityRegistry>,
    allocator: EntityAllocator,
}

impl EntitySpawner for StepperSpawner {
    fn spawn(
        &self,
        entity_type: &str,
        parent: &Arc<EntityInstance>,
        geometry: Option<Geometry>,
    ) -> Result<EntityId, EngineError> {
        let ty = self.model.entity_type(entity_type)?.clone();
        let id = self.allocator.local().create();
        let child = EntityInstance::new(id, ty, None, Some(Arc::downgrade(parent)), geometry);
        self.registry.insert(child);
        Ok(id)
    }
}

/// Bridges the resolver's `AssertionReporter` seam to the stepper's own
/// `AssertionSink` collaborator, so every assertion evaluation reaches the
/// sink the same way a fatal `AssertionFailed` error already reaches
/// `RunReport`.
struct AssertionBridge {
    sink: Arc<dyn AssertionSink>,
}

impl AssertionReporter for AssertionBridge {
    fn report(&self, entity: EntityId, attribute: &str, timestep: u64, ok: bool, message: &str) {
        self.sink.assertion_result(entity, attribute, timestep, ok, message);
    }
}

/// Scans an entity's resolved slots for child references, the stepper's
/// half of discovery.
struct DiscoveryWalker;

impl DiscoveryWalker {
    fn children_of(entity: &Arc<EntityInstance>, registry: &EntityRegistry) -> Vec<Arc<EntityInstance>> {
        let mut children = Vec::new();
        for slot in 0..entity.entity_type.slot_count() {
            let Some(value) = entity.slot_value(slot) else { continue };
            if !value.language_type().is_entity_bearing() {
                continue;
            }
            Self::collect_refs(&value, registry, &mut children);
        }
        children
    }

    fn collect_refs(value: &Value, registry: &EntityRegistry, out: &mut Vec<Arc<EntityInstance>>) {
        match value {
            Value::EntityRef(id) => {
                if let Some(child) = registry.get(*id) {
                    out.push(child);
                }
            }
            Value::Distribution(Distribution::Realized(values, _)) => {
                for v in values.iter() {
                    Self::collect_refs(v, registry, out);
                }
            }
            _ => {}
        }
    }
}

/// Drives a model through its configured timestep range, fanning each
/// substep's patch work out over a worker pool.
pub struct Stepper {
    model: Arc<Model>,
    config: SimConfig,
    patches: PatchSet,
    simulation: Arc<EntityInstance>,
    registry: Arc<EntityRegistry>,
    allocator: EntityAllocator,
    /// One independent, reproducible RNG per patch coordinate, seeded once at
    /// construction and shared across every substep of every timestep that
    /// patch runs (DESIGN.md Open Question 2). Built once, not re-derived per
    /// call, so samples advance across a patch's own lifetime instead of
    /// resetting to the same draw every substep.
    patch_rngs: FxHashMap<PatchCoord, Arc<Mutex<dyn RngCore + Send>>>,
    simulation_rng: Arc<Mutex<dyn RngCore + Send>>,
    all: Arc<dyn AllEntities>,
    external: Arc<dyn ExternalDataSource>,
    spawner: Arc<dyn EntitySpawner>,
    assertions: Arc<dyn AssertionReporter>,
    export_sink: Arc<dyn ExportSink>,
    assertion_sink: Arc<dyn AssertionSink>,
    cancellation: CancellationToken,
    /// Children spawned during an `end` substep, paired with the root patch
    /// their subtree belongs to. Their `init` is deferred rather than run on
    /// the spot, since `end` is the last substep of the timestep they were
    /// created in; drained at the start of the next timestep, before `start`.
    pending_init: Mutex<Vec<(Arc<EntityInstance>, Arc<EntityInstance>)>>,
    #[cfg(feature = "par-iter")]
    pool: rayon::ThreadPool,
}

impl Stepper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<Model>,
        config: SimConfig,
        simulation_type: Arc<EntityType>,
        external: Arc<dyn ExternalDataSource>,
        export_sink: Arc<dyn ExportSink>,
        assertion_sink: Arc<dyn AssertionSink>,
    ) -> Result<Stepper, StepperError> {
        config.validate()?;

        let patch_type = model
            .entity_type(&config.grid_patch)
            .map_err(|e| StepperError::InvalidConfig(e.to_string()))?
            .clone();

        let allocator = EntityAllocator::new();
        let extent = Extent { low: config.grid_low, high: config.grid_high };
        let patches = PatchSet::build(extent, config.grid_size, patch_type, &allocator);

        let registry = Arc::new(EntityRegistry::default());
        for patch in patches.patches() {
            registry.insert(patch.clone());
        }

        let simulation_id = allocator.local().create();
        let simulation = EntityInstance::new(simulation_id, simulation_type, None, None, None);
        registry.insert(simulation.clone());

        let spawner: Arc<dyn EntitySpawner> =
            Arc::new(StepperSpawner { model: model.clone(), registry: registry.clone(), allocator: allocator.clone() });

        #[cfg(feature = "par-iter")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|e| StepperError::InvalidConfig(e.to_string()))?;

        let rng_stream = RngStream::new(config.rand_seed);
        let patch_rngs: FxHashMap<PatchCoord, Arc<Mutex<dyn RngCore + Send>>> = patches
            .patches()
            .iter()
            .filter_map(|patch| patches.coord_of(patch.id))
            .map(|coord| {
                let rng: Arc<Mutex<dyn RngCore + Send>> = Arc::new(Mutex::new(rng_stream.rng_for(coord)));
                (coord, rng)
            })
            .collect();
        let simulation_rng: Arc<Mutex<dyn RngCore + Send>> = Arc::new(Mutex::new(rng_stream.simulation_rng()));
        let assertions: Arc<dyn AssertionReporter> = Arc::new(AssertionBridge { sink: assertion_sink.clone() });

        info!(workers = config.workers, patches = patches.len(), "stepper constructed");

        Ok(Stepper {
            model,
            config,
            patches,
            simulation,
            all: Arc::new(RegistryAllEntities { registry: registry.clone() }),
            registry,
            allocator,
            patch_rngs,
            simulation_rng,
            external,
            spawner,
            assertions,
            export_sink,
            assertion_sink,
            cancellation: CancellationToken::new(),
            pending_init: Mutex::new(Vec::new()),
            #[cfg(feature = "par-iter")]
            pool,
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn patches(&self) -> &PatchSet {
        &self.patches
    }

    /// A handle a caller can hold onto and `cancel()` from another thread
    /// while `run` is executing on this one; checked at every substep
    /// barrier (spec.md §5).
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Runs every timestep in `self.config.steps`, publishing and exporting
    /// after each one, and stopping at the first resolution failure or at the
    /// first substep barrier after `cancellation_handle().cancel()` is
    /// called. In-flight handler evaluations never observe cancellation
    /// themselves (spec.md §5) — only the boundary between substeps does.
    pub fn run(&mut self) -> RunReport {
        let steps = self.config.steps.clone();
        let first = *steps.start();
        let mut last_good = first.saturating_sub(1);

        for timestep in steps {
            info!(timestep, "starting timestep");

            if let Err(err) = self.run_pending_inits(timestep) {
                return RunReport::failed(last_good, err);
            }

            if timestep == first {
                if let Err(err) = self.run_substep_everywhere(Event::Init, timestep) {
                    return RunReport::failed(last_good, err);
                }
                if self.cancellation.is_cancelled() {
                    info!(timestep, "run cancelled at substep barrier");
                    return RunReport::cancelled(last_good);
                }
            }

            for event in [Event::Start, Event::Step, Event::End] {
                if let Err(err) = self.run_substep_everywhere(event, timestep) {
                    return RunReport::failed(last_good, err);
                }
                if self.cancellation.is_cancelled() {
                    info!(timestep, ?event, "run cancelled at substep barrier");
                    // `end` already ran, so this timestep's prior is safe to
                    // publish before stopping; any earlier substep leaves
                    // last_good at the previous timestep instead.
                    if event == Event::End {
                        self.publish_and_export(timestep);
                        last_good = timestep;
                    }
                    return RunReport::cancelled(last_good);
                }
            }

            self.publish_and_export(timestep);
            last_good = timestep;
        }

        RunReport::success(last_good)
    }

    /// Runs one substep across the simulation entity, then every patch in
    /// parallel. The simulation entity is resolved first and on this thread
    /// so `meta.X` reads from patch workers never race its cycle-detection
    /// guard (see `patchsim-core::scope`'s `Meta` resolution notes).
    fn run_substep_everywhere(&self, event: Event, timestep: u64) -> Result<(), RunError> {
        debug!(?event, timestep, "substep: simulation");
        self.run_substep_tree(&self.simulation.clone(), &self.simulation, event, timestep)?;

        debug!(?event, timestep, patches = self.patches.len(), "substep: patches");

        #[cfg(feature = "par-iter")]
        {
            use rayon::prelude::*;
            let result: Result<(), RunError> = self.pool.install(|| {
                self.patches
                    .patches()
                    .par_iter()
                    .try_for_each(|patch| self.run_substep_tree(patch, patch, event, timestep))
            });
            result
        }
        #[cfg(not(feature = "par-iter"))]
        {
            for patch in self.patches.patches() {
                self.run_substep_tree(patch, patch, event, timestep)?;
            }
            Ok(())
        }
    }

    /// Resolves every declared attribute of `entity` for `event`, recursing
    /// into already-known children before its own resolution and into
    /// newly-spawned children after (two discovery passes, so a child
    /// spawned this substep is observed starting from the moment it is
    /// spawned).
    ///
    /// A child discovered only in the second pass has never run `init`:
    /// unless `event` is itself `Init` (already its first event), `init`
    /// runs first, then — unless `event` is `End` — the current substep's
    /// event runs right after, in the same timestep. A child spawned during
    /// `end` gets neither here: it is queued in `pending_init` and picked up
    /// at the very start of the next timestep instead.
    fn run_substep_tree(
        &self,
        entity: &Arc<EntityInstance>,
        patch: &Arc<EntityInstance>,
        event: Event,
        timestep: u64,
    ) -> Result<(), RunError> {
        let _guard = entity.begin_substep(event);

        let known_before: Vec<EntityId> =
            DiscoveryWalker::children_of(entity, &self.registry).iter().map(|c| c.id).collect();
        for child in DiscoveryWalker::children_of(entity, &self.registry) {
            self.run_substep_tree(&child, patch, event, timestep)?;
        }

        let mut scope = self.scope_for(entity.clone(), patch.clone(), event, timestep);
        for attr in entity.entity_type.attributes.clone() {
            trace!(?event, timestep, attribute = ?attr, entity = ?entity.id, "resolving attribute");
            Resolver::resolve(entity, attr, event, &mut scope)
                .map_err(|source| RunError::Model { timestep, event, entity: entity.id, source })?;
        }

        for child in DiscoveryWalker::children_of(entity, &self.registry) {
            if known_before.contains(&child.id) {
                continue;
            }
            if event == Event::End {
                self.pending_init.lock().push((child.clone(), patch.clone()));
                continue;
            }
            if event != Event::Init {
                self.run_substep_tree(&child, patch, Event::Init, timestep)?;
            }
            self.run_substep_tree(&child, patch, event, timestep)?;
        }

        entity.end_substep();
        Ok(())
    }

    /// Runs `init` for every child spawned during the previous timestep's
    /// `end` substep, before this timestep's own substeps begin. Their
    /// `start`/`step`/`end` follow normally once discovered as known
    /// children of their parent.
    fn run_pending_inits(&self, timestep: u64) -> Result<(), RunError> {
        let pending: Vec<(Arc<EntityInstance>, Arc<EntityInstance>)> = std::mem::take(&mut *self.pending_init.lock());
        for (child, patch) in pending {
            self.run_substep_tree(&child, &patch, Event::Init, timestep)?;
        }
        Ok(())
    }

    /// Looks up the RNG shared by every substep of `patch`'s own lifetime
    /// (the simulation entity gets its own stream, never a patch's).
    fn rng_for(&self, patch: &Arc<EntityInstance>) -> Arc<Mutex<dyn RngCore + Send>> {
        if patch.id == self.simulation.id {
            return self.simulation_rng.clone();
        }
        self.patches
            .coord_of(patch.id)
            .and_then(|coord| self.patch_rngs.get(&coord).cloned())
            .unwrap_or_else(|| self.simulation_rng.clone())
    }

    fn scope_for(&self, entity: Arc<EntityInstance>, patch: Arc<EntityInstance>, event: Event, timestep: u64) -> Scope {
        let rng = self.rng_for(&patch);
        Scope::full(
            entity,
            patch,
            self.simulation.clone(),
            self.all.clone(),
            self.external.clone(),
            self.spawner.clone(),
            rng,
            self.assertions.clone(),
            event,
            timestep,
            self.model.params.favor_big_decimal,
        )
    }

    /// Freezes every live entity's slots into the new `prior`, then emits
    /// every `export.`-prefixed attribute in patch-coordinate then
    /// attribute-name order for determinism.
    fn publish_and_export(&self, timestep: u64) {
        self.simulation.publish();
        for patch in self.patches.patches() {
            self.publish_tree(patch, timestep, None);
        }
    }

    fn publish_tree(&self, entity: &Arc<EntityInstance>, timestep: u64, coord: Option<PatchCoord>) {
        let coord = coord.or_else(|| self.patches.coord_of(entity.id));
        for child in DiscoveryWalker::children_of(entity, &self.registry) {
            self.publish_tree(&child, timestep, coord);
        }

        for (slot, attr) in entity.entity_type.attributes.iter().enumerate() {
            let Some(value) = entity.slot_value(slot) else { continue };
            if self.model.is_export_attribute(*attr) {
                self.export_sink.emit(coord.unwrap_or((0, 0)), timestep, &format!("{attr:?}"), &value);
            }
        }
        entity.publish();
    }
}
