//! Entity identity, per-instance attribute slots, and the entity-type record.
//!
//! `EntityId` is a generational index allocated in blocks by
//! `EntityAllocator`/`BlockAllocator` (see DESIGN.md for the grounding);
//! everything below the allocator — slots, state, cache, cycle set — is the
//! per-entity resolution state.

use std::fmt;
use std::num::Wrapping;
use std::sync::{Arc, Weak};

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::{Mutex, RwLock};

use crate::handler::{AttrId, Event, HandlerTable, StateId};
use crate::value::Value;

pub type EntityIndex = u32;
pub type EntityGeneration = Wrapping<u32>;

/// A stable, generational entity identity assigned at construction.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityId {
    index: EntityIndex,
    generation: EntityGeneration,
}

impl EntityId {
    pub fn new(index: EntityIndex, generation: EntityGeneration) -> Self {
        EntityId { index, generation }
    }

    pub fn index(&self) -> EntityIndex {
        self.index
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}#{})", self.index, self.generation)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Block-based entity id allocator: a shared pool hands out disjoint index
/// ranges to independently-running patches without contending on a single
/// counter per allocation.
#[derive(Debug)]
struct IndexBlock {
    start: EntityIndex,
    len: u32,
    generations: Vec<EntityGeneration>,
    free: Vec<EntityIndex>,
}

impl IndexBlock {
    fn new(start: EntityIndex, len: u32) -> Self {
        IndexBlock { start, len, generations: Vec::new(), free: Vec::new() }
    }

    fn local(&self, index: EntityIndex) -> usize {
        (index - self.start) as usize
    }

    fn allocate(&mut self) -> Option<EntityId> {
        if let Some(index) = self.free.pop() {
            let i = self.local(index);
            Some(EntityId::new(index, self.generations[i]))
        } else if (self.generations.len() as u32) < self.len {
            let index = self.start + self.generations.len() as u32;
            self.generations.push(Wrapping(1));
            Some(EntityId::new(index, Wrapping(1)))
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct BlockPool {
    allocated: u32,
    free_blocks: Vec<IndexBlock>,
}

impl BlockPool {
    const BLOCK_SIZE: u32 = 1024;

    fn new() -> Self {
        BlockPool { allocated: 0, free_blocks: Vec::new() }
    }

    fn acquire(&mut self) -> IndexBlock {
        if let Some(block) = self.free_blocks.pop() {
            block
        } else {
            let block = IndexBlock::new(self.allocated, BlockPool::BLOCK_SIZE);
            self.allocated += BlockPool::BLOCK_SIZE;
            block
        }
    }
}

/// Process-wide entity id allocator. One `EntityAllocator` is typically
/// shared (behind an `Arc<Mutex<_>>`) across every patch's local sub-allocator
/// so ids stay globally unique even though patches run concurrently.
#[derive(Debug, Clone)]
pub struct EntityAllocator {
    pool: Arc<Mutex<BlockPool>>,
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityAllocator {
    pub fn new() -> Self {
        EntityAllocator { pool: Arc::new(Mutex::new(BlockPool::new())) }
    }

    /// Creates a thread-local sub-allocator that draws blocks from this pool.
    pub fn local(&self) -> LocalEntityAllocator {
        LocalEntityAllocator { pool: self.pool.clone(), blocks: Vec::new() }
    }
}

/// A single thread/patch's view into a shared [`EntityAllocator`].
#[derive(Debug)]
pub struct LocalEntityAllocator {
    pool: Arc<Mutex<BlockPool>>,
    blocks: Vec<IndexBlock>,
}

impl LocalEntityAllocator {
    pub fn create(&mut self) -> EntityId {
        if let Some(id) = self.blocks.iter_mut().rev().find_map(|b| b.allocate()) {
            return id;
        }
        let mut block = self.pool.lock().acquire();
        let id = block.allocate().expect("freshly acquired block has capacity");
        self.blocks.push(block);
        id
    }
}

/// Compile-time shared record per model-declared entity type.
#[derive(Debug)]
pub struct EntityType {
    pub name: String,
    /// Declaration order, using the model-wide interned [`AttrId`] (shared
    /// across every entity type so [`HandlerTable`]'s acceleration bitset
    /// indexes consistently regardless of which type declared the
    /// attribute).
    pub attributes: Vec<AttrId>,
    slot_of: FxHashMap<AttrId, usize>,
    pub handlers: HandlerTable,
    /// The interned id of the reserved `state` attribute, if this entity type
    /// declares a state machine; it selects which state-scoped handler group
    /// applies. `None` for entity types with no `state` stanzas.
    pub state_attr: Option<AttrId>,
}

impl EntityType {
    pub fn new(
        name: String,
        attributes: Vec<AttrId>,
        handlers: HandlerTable,
        state_attr: Option<AttrId>,
    ) -> Arc<Self> {
        let slot_of = attributes.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        Arc::new(EntityType { name, attributes, slot_of, handlers, state_attr })
    }

    pub fn slot_of(&self, attr: AttrId) -> Option<usize> {
        self.slot_of.get(&attr).copied()
    }

    pub fn attribute_at(&self, slot: usize) -> Option<AttrId> {
        self.attributes.get(slot).copied()
    }

    pub fn slot_count(&self) -> usize {
        self.attributes.len()
    }
}

/// Attribute values frozen at the end of a timestep and exposed read-only as
/// `prior` for the duration of the next timestep.
#[derive(Debug, Clone, Default)]
pub struct PriorSnapshot {
    slots: Vec<Option<Value>>,
}

impl PriorSnapshot {
    pub fn get(&self, slot: usize) -> Option<&Value> {
        self.slots.get(slot).and_then(|v| v.as_ref())
    }
}

#[derive(Debug)]
struct StateCell {
    current: Option<StateId>,
    pending: Option<StateId>,
}

/// A single spawned or statically-declared entity: a fixed-length array of
/// attribute slots, current state, lock, cache, and cycle-detection set.
#[derive(Debug)]
pub struct EntityInstance {
    pub id: EntityId,
    pub entity_type: Arc<EntityType>,
    slots: Vec<RwLock<Option<Value>>>,
    state: Mutex<StateCell>,
    parent: RwLock<Option<Weak<EntityInstance>>>,
    geometry: RwLock<Option<crate::geometry::Geometry>>,
    prior: RwLock<Arc<PriorSnapshot>>,
    cache: Mutex<FxHashMap<AttrId, Value>>,
    cycle_guard: Mutex<FxHashSet<AttrId>>,
    /// Acquired on substep entry, released on substep exit.
    substep_lock: RwLock<()>,
}

impl EntityInstance {
    pub fn new(
        id: EntityId,
        entity_type: Arc<EntityType>,
        initial_state: Option<StateId>,
        parent: Option<Weak<EntityInstance>>,
        geometry: Option<crate::geometry::Geometry>,
    ) -> Arc<Self> {
        let slot_count = entity_type.slot_count();
        Arc::new(EntityInstance {
            id,
            entity_type,
            slots: (0..slot_count).map(|_| RwLock::new(None)).collect(),
            state: Mutex::new(StateCell { current: initial_state, pending: None }),
            parent: RwLock::new(parent),
            geometry: RwLock::new(geometry),
            prior: RwLock::new(Arc::new(PriorSnapshot::default())),
            cache: Mutex::new(FxHashMap::default()),
            cycle_guard: Mutex::new(FxHashSet::default()),
            substep_lock: RwLock::new(()),
        })
    }

    pub fn state(&self) -> Option<StateId> {
        self.state.lock().current
    }

    /// Schedules a transition to take effect at the next `end_substep` call —
    /// state transitions take effect only at substep boundaries.
    pub fn schedule_state(&self, new_state: StateId) {
        self.state.lock().pending = Some(new_state);
    }

    pub fn parent(&self) -> Option<Arc<EntityInstance>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_parent(&self, parent: Weak<EntityInstance>) {
        *self.parent.write() = Some(parent);
    }

    /// This entity's own geometry, or its parent's when none was assigned
    /// directly.
    pub fn geometry(&self) -> Option<crate::geometry::Geometry> {
        if let Some(g) = self.geometry.read().clone() {
            return Some(g);
        }
        self.parent().and_then(|p| p.geometry())
    }

    pub fn set_geometry(&self, geometry: crate::geometry::Geometry) {
        *self.geometry.write() = Some(geometry);
    }

    pub fn prior(&self) -> Arc<PriorSnapshot> {
        self.prior.read().clone()
    }

    /// Read-through fast path used when no handler exists at all for
    /// `(attribute, event)` on this entity's type. Callers must have already
    /// checked
    /// [`HandlerTable::has_any_handler`] and the absence of a state-scoped
    /// override before calling this.
    pub fn prior_value(&self, slot: usize) -> Option<Value> {
        self.prior.read().get(slot).cloned()
    }

    /// Returns the cached/live value for `slot` if already resolved this
    /// substep, without triggering resolution. The [`crate::resolver::Resolver`]
    /// is responsible for populating the cache on miss.
    pub fn cached(&self, attr: AttrId) -> Option<Value> {
        self.cache.lock().get(&attr).cloned()
    }

    pub fn cache_value(&self, attr: AttrId, value: Value) {
        self.cache.lock().insert(attr, value);
    }

    pub fn slot_value(&self, slot: usize) -> Option<Value> {
        self.slots.get(slot).and_then(|s| s.read().clone())
    }

    /// Writes `value` into `slot`. Writing the `state`
    /// attribute does not itself change `state()`; the resolver is
    /// responsible for calling [`EntityInstance::schedule_state`] separately
    /// when `slot` corresponds to the reserved `state` attribute.
    pub fn set_slot(&self, slot: usize, value: Value) {
        if let Some(cell) = self.slots.get(slot) {
            *cell.write() = Some(value);
        }
    }

    pub fn enter_cycle(&self, attr: AttrId) -> bool {
        self.cycle_guard.lock().insert(attr)
    }

    pub fn exit_cycle(&self, attr: AttrId) {
        self.cycle_guard.lock().remove(&attr);
    }

    pub fn in_cycle(&self, attr: AttrId) -> bool {
        self.cycle_guard.lock().contains(&attr)
    }

    /// Snapshots current state, clears the per-substep resolution cache, and
    /// acquires the substep lock. The returned guard releases the lock on
    /// drop.
    pub fn begin_substep(self: &Arc<Self>, _event: Event) -> SubstepGuard<'_> {
        let guard = self.substep_lock.write();
        self.cache.lock().clear();
        debug_assert!(self.cycle_guard.lock().is_empty(), "cycle guard must be empty between substeps");
        SubstepGuard { _lock: guard, entity: self }
    }

    /// Applies any pending state transition.
    pub fn end_substep(&self) {
        let mut cell = self.state.lock();
        if let Some(pending) = cell.pending.take() {
            cell.current = Some(pending);
        }
    }

    /// Freezes the live slot array into an immutable snapshot and publishes
    /// it as the new `prior`: at the end of the `end` substep, live becomes
    /// the new prior atomically.
    pub fn publish(&self) {
        let slots = self.slots.iter().map(|s| s.read().clone()).collect();
        *self.prior.write() = Arc::new(PriorSnapshot { slots });
    }
}

/// RAII guard returned by [`EntityInstance::begin_substep`]; releasing it
/// (by dropping) is the "released on substep exit" half of the per-entity
/// lock discipline.
pub struct SubstepGuard<'a> {
    _lock: parking_lot::RwLockWriteGuard<'a, ()>,
    entity: &'a Arc<EntityInstance>,
}

impl<'a> SubstepGuard<'a> {
    pub fn entity(&self) -> &Arc<EntityInstance> {
        self.entity
    }
}
