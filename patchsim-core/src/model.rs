//! The compiled, immutable record a (out-of-scope) DSL compiler produces:
//! entity types, the unit registry, and model-wide parameters.

use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};

use crate::entity::EntityType;
use crate::error::CompileError;
use crate::handler::{AttrId, KeyInterner};
use crate::units::UnitRegistry;

/// Model-wide parameters that are not per-entity state: whether arithmetic
/// prefers `Decimal` over `f64` when both are legal widenings.
#[derive(Clone, Debug)]
pub struct SimParams {
    pub favor_big_decimal: bool,
}

impl Default for SimParams {
    fn default() -> Self {
        SimParams { favor_big_decimal: true }
    }
}

/// The compiled model: every declared entity type, the shared attribute/state
/// interner, the unit registry, and model parameters. Immutable once built —
/// this is the seam a DSL compiler targets; constructing one from DSL source
/// is out of scope here.
#[derive(Debug)]
pub struct Model {
    pub entity_types: FxHashMap<String, Arc<EntityType>>,
    pub units: Arc<UnitRegistry>,
    pub params: SimParams,
    /// The reserved `state` identifier's interned id, shared across every
    /// entity type that declares a state machine.
    pub state_attr: AttrId,
    /// Every attribute whose declared name begins with `export.`. The prefix
    /// is a property of the interned name, so — like
    /// `state_attr` — one set serves every entity type: an `AttrId` means the
    /// same declared name everywhere it appears.
    pub export_attrs: FxHashSet<AttrId>,
}

impl Model {
    pub fn entity_type(&self, name: &str) -> Result<&Arc<EntityType>, CompileError> {
        self.entity_types.get(name).ok_or_else(|| CompileError::UndefinedIdentifier(name.to_string()))
    }

    /// True iff `attr`'s declared name begins with `export.`.
    pub fn is_export_attribute(&self, attr: AttrId) -> bool {
        self.export_attrs.contains(&attr)
    }
}

/// Builds a [`Model`] from entity types produced elsewhere (by a DSL compiler
/// or, in tests, by hand), interning the reserved `state` name once so every
/// entity type shares the same [`AttrId`] for it.
pub struct ModelBuilder {
    interner: KeyInterner,
    entity_types: FxHashMap<String, Arc<EntityType>>,
    units: Arc<UnitRegistry>,
    params: SimParams,
    export_attrs: FxHashSet<AttrId>,
}

impl ModelBuilder {
    pub fn new(units: Arc<UnitRegistry>) -> Self {
        let mut interner = KeyInterner::new();
        interner.intern_attr("state");
        ModelBuilder {
            interner,
            entity_types: FxHashMap::default(),
            units,
            params: SimParams::default(),
            export_attrs: FxHashSet::default(),
        }
    }

    pub fn interner_mut(&mut self) -> &mut KeyInterner {
        &mut self.interner
    }

    pub fn with_params(mut self, params: SimParams) -> Self {
        self.params = params;
        self
    }

    pub fn add_entity_type(mut self, entity_type: Arc<EntityType>) -> Self {
        self.entity_types.insert(entity_type.name.clone(), entity_type);
        self
    }

    /// Marks `attr` as an `export.`-prefixed attribute.
    pub fn mark_export(mut self, attr: AttrId) -> Self {
        self.export_attrs.insert(attr);
        self
    }

    pub fn build(self) -> Model {
        // `new` always interns "state" first, so its id is stable at 0.
        Model {
            entity_types: self.entity_types,
            units: self.units,
            params: self.params,
            state_attr: AttrId(0),
            export_attrs: self.export_attrs,
        }
    }
}
