//! The data model half of the engine: values, units, handler tables, entity
//! instances, scope-based name resolution, and the resolver that ties them
//! together. The timestep phase machine and patch-parallel scheduling live in
//! `patchsim-stepper`, one layer up.

pub mod entity;
pub mod error;
pub mod external;
pub mod geometry;
pub mod handler;
pub mod model;
pub mod resolver;
pub mod scope;
pub mod units;
pub mod value;

pub mod prelude {
    pub use crate::entity::{EntityAllocator, EntityId, EntityInstance, EntityType, PriorSnapshot};
    pub use crate::error::{CompileError, EngineError, EvalError, TypeError};
    pub use crate::external::{ExternalDataSource, ExternalError, NoExternalData};
    pub use crate::geometry::Geometry;
    pub use crate::handler::{
        AttrId, Callable, Event, EventHandler, EventHandlerGroup, EventKey, HandlerDecl, HandlerTable,
        HandlerTableBuilder, KeyInterner, Selector, StateId,
    };
    pub use crate::model::{Model, ModelBuilder, SimParams};
    pub use crate::resolver::Resolver;
    pub use crate::scope::{
        AllEntities, AssertionReporter, EmptyAllEntities, EntitySpawner, NoAssertionReporting, NoSpawning, Scope,
        ScopeRef,
    };
    pub use crate::units::{UnitDef, UnitId, UnitRegistry, Units};
    pub use crate::value::{AnalyticDistribution, Distribution, LanguageType, Value};
}
