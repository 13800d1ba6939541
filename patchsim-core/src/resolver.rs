//! The `Resolve` algorithm: turns a request for `(entity, attribute, event)`
//! into a value, running handler dispatch, the fast path, and cycle
//! detection.

use std::sync::Arc;

use tracing::trace;

use crate::entity::EntityInstance;
use crate::error::EngineError;
use crate::handler::{AttrId, Event, EventHandlerGroup};
use crate::scope::Scope;
use crate::value::Value;

/// Stateless dispatcher — every call takes the entity, scope, and handler
/// table it needs as arguments rather than holding any of its own.
pub struct Resolver;

impl Resolver {
    /// Resolves `attr` on `entity` for the current `event`, using `scope` to
    /// evaluate any selector/callable the matching handler group requires.
    ///
    /// `scope.entity()` must already equal `entity` — callers construct the
    /// scope for the entity under resolution before calling in.
    pub fn resolve(
        entity: &Arc<EntityInstance>,
        attr: AttrId,
        event: Event,
        scope: &mut Scope,
    ) -> Result<Value, EngineError> {
        if let Some(cached) = entity.cached(attr) {
            trace!(entity = ?entity.id, attribute = ?attr, ?event, "resolve: cache hit");
            return Ok(cached);
        }

        if !entity.enter_cycle(attr) {
            return Err(EngineError::CircularDependency {
                attribute: attribute_label(entity, attr),
                path: vec![attribute_label(entity, attr)],
            });
        }
        let result = Self::resolve_uncached(entity, attr, event, scope);
        entity.exit_cycle(attr);
        result
    }

    fn resolve_uncached(
        entity: &Arc<EntityInstance>,
        attr: AttrId,
        event: Event,
        scope: &mut Scope,
    ) -> Result<Value, EngineError> {
        let handlers = &entity.entity_type.handlers;
        let current_state = entity.state();

        // The fast path only applies when *no* group at all could fire for
        // this (attribute, event) — including a state-scoped one. Deriving
        // `has_any_handler` from unconditional handlers only would let a
        // conditional-only group go unnoticed here.
        let state_scoped_applies = current_state
            .map(|state| handlers.groups_for(attr, event, Some(state)).is_some())
            .unwrap_or(false);

        if !handlers.has_any_handler(attr, event) && !state_scoped_applies {
            trace!(entity = ?entity.id, attribute = ?attr, ?event, "resolve: fast path, no handler registered");
            return Ok(Self::settle_from_prior(entity, attr));
        }

        let group = match handlers.groups_for(attr, event, current_state) {
            Some(group) => group.clone(),
            None => return Ok(Self::settle_from_prior(entity, attr)),
        };

        for (i, handler) in group.handlers.iter().enumerate() {
            let fires = match &handler.selector {
                Some(selector) => selector(scope)?,
                None => true,
            };
            if !fires {
                continue;
            }
            trace!(entity = ?entity.id, attribute = ?attr, ?event, branch = i, "resolve: dispatching handler");
            let value = (handler.callable)(scope)?;
            return Self::apply(entity, attr, scope, &group, value);
        }

        // Every branch's selector was false (an `if/elif` chain with no
        // matching arm and no trailing `else`).
        Ok(Self::settle_from_prior(entity, attr))
    }

    /// Writes a resolved value to its slot (or schedules a state transition,
    /// for the reserved `state` attribute) and caches it; assertion groups
    /// instead report the outcome through `scope`'s assertion sink and turn a
    /// `false` result into an `AssertionFailed` error without ever writing a
    /// slot.
    fn apply(
        entity: &Arc<EntityInstance>,
        attr: AttrId,
        scope: &Scope,
        group: &EventHandlerGroup,
        value: Value,
    ) -> Result<Value, EngineError> {
        if group.is_assertion {
            let ok = matches!(value, Value::Boolean(true));
            entity.cache_value(attr, value.clone());
            let label = attribute_label(entity, attr);
            let message = if ok { "assertion passed" } else { "assertion evaluated to false" };
            scope.report_assertion(&label, ok, message);
            if !ok {
                return Err(EngineError::AssertionFailed {
                    entity: entity.id,
                    attribute: label,
                    timestep: scope.timestep(),
                    message: message.to_string(),
                });
            }
            return Ok(value);
        }

        entity.cache_value(attr, value.clone());
        if entity.entity_type.state_attr == Some(attr) {
            if let Value::Integer(state_id, _) = &value {
                entity.schedule_state(crate::handler::StateId(*state_id as u32));
            }
        } else if let Some(slot) = entity.entity_type.slot_of(attr) {
            entity.set_slot(slot, value.clone());
        }
        Ok(value)
    }

    /// The fallback used by the fast path and by "no branch matched": when no
    /// handler touches an attribute, its slot must read the same at the end
    /// of a substep as it did at the start.
    ///
    /// Reads the *live* slot first, not `prior`: a value an earlier substep
    /// of this same timestep wrote (e.g. `init` setting `age = 0`, read again
    /// at `start` where `age` has no handler) must survive unchanged, and the
    /// live slot already holds exactly that value since nothing clears it
    /// between substeps. Only a slot that has never been written at all
    /// (there is no handler for this attribute under any event yet reached,
    /// e.g. before an entity's own `init` has run) falls through to the
    /// frozen `prior` snapshot, and then to `false`.
    fn settle_from_prior(entity: &Arc<EntityInstance>, attr: AttrId) -> Value {
        let slot = entity.entity_type.slot_of(attr);
        let value = slot
            .and_then(|slot| entity.slot_value(slot))
            .or_else(|| slot.and_then(|slot| entity.prior_value(slot)))
            .unwrap_or(Value::Boolean(false));
        entity.cache_value(attr, value.clone());
        value
    }
}

fn attribute_label(entity: &Arc<EntityInstance>, attr: AttrId) -> String {
    format!("{}::{:?}", entity.entity_type.name, attr)
}
