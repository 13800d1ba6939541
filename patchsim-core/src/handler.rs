//! EventKey/EventHandler/EventHandlerGroup and the compiled handler table,
//! with its precomputed acceleration tables.
//!
//! Attribute and state names are interned into small `u32` ids instead of
//! compared as strings on every lookup.

use std::fmt;
use std::sync::Arc;

use bit_set::BitSet;
use fxhash::FxHashMap;

use crate::error::EvalError;
use crate::scope::Scope;
use crate::value::Value;

/// An interned attribute name.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AttrId(pub u32);

impl fmt::Debug for AttrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttrId({})", self.0)
    }
}

/// An interned state name.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateId({})", self.0)
    }
}

/// The four lifecycle substeps, in scheduling order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Event {
    Init,
    Start,
    Step,
    End,
}

impl Event {
    pub const ORDER: [Event; 4] = [Event::Init, Event::Start, Event::Step, Event::End];
}

/// Interns attribute and state names into small integer ids so [`EventKey`]
/// comparisons and `BitSet` indexing are O(1).
#[derive(Debug, Default)]
pub struct KeyInterner {
    attrs: FxHashMap<String, AttrId>,
    attr_names: Vec<String>,
    states: FxHashMap<String, StateId>,
    state_names: Vec<String>,
}

impl KeyInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_attr(&mut self, name: &str) -> AttrId {
        if let Some(id) = self.attrs.get(name) {
            return *id;
        }
        let id = AttrId(self.attr_names.len() as u32);
        self.attr_names.push(name.to_string());
        self.attrs.insert(name.to_string(), id);
        id
    }

    pub fn intern_state(&mut self, name: &str) -> StateId {
        if let Some(id) = self.states.get(name) {
            return *id;
        }
        let id = StateId(self.state_names.len() as u32);
        self.state_names.push(name.to_string());
        self.states.insert(name.to_string(), id);
        id
    }

    pub fn attr_name(&self, id: AttrId) -> &str {
        &self.attr_names[id.0 as usize]
    }

    pub fn state_name(&self, id: StateId) -> &str {
        &self.state_names[id.0 as usize]
    }

    pub fn attr_count(&self) -> usize {
        self.attr_names.len()
    }
}

/// The composite identity of a handler binding. `state = None` means
/// "applies in every state".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EventKey {
    pub state: Option<StateId>,
    pub attribute: AttrId,
    pub event: Event,
}

/// The callable a handler invokes to compute a new attribute value, and the
/// boolean selector that gates it. Both are produced by the (out-of-scope)
/// DSL compiler; `patchsim-core` only invokes them through a [`Scope`].
pub type Callable = Arc<dyn Fn(&mut Scope) -> Result<Value, EvalError> + Send + Sync>;
pub type Selector = Arc<dyn Fn(&mut Scope) -> Result<bool, EvalError> + Send + Sync>;

/// `(callable, optional selector)` bound to an [`EventKey`].
#[derive(Clone)]
pub struct EventHandler {
    pub callable: Callable,
    pub selector: Option<Selector>,
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("conditional", &self.selector.is_some())
            .finish()
    }
}

/// An ordered `if/elif/else` chain of handlers sharing an [`EventKey`]; at
/// most one fires per resolution.
#[derive(Clone, Debug)]
pub struct EventHandlerGroup {
    pub key: EventKey,
    pub handlers: Vec<EventHandler>,
    /// True iff this group's attribute name begins with `assert.` — an
    /// assertion group produces pass/fail diagnostics instead of writing a
    /// slot.
    pub is_assertion: bool,
}

/// Compiled, per-`EntityType` dispatch table plus its two acceleration
/// structures.
#[derive(Debug)]
pub struct HandlerTable {
    /// Keyed by `(attribute, event, state)`; `state = None` is the
    /// default-state group.
    groups: FxHashMap<EventKey, EventHandlerGroup>,
    /// `attributes_with_handlers[event]` is a bitset over attribute ids: true
    /// iff *any* handler (conditional or not, in any state) is registered for
    /// that attribute under that event. Static after construction — never
    /// re-derived from only the unconditional handlers.
    attributes_with_handlers: [BitSet; 4],
    /// Union of every group touching an attribute, across all states and
    /// events, for the mid-substep state-change lookup.
    common_handler_cache: FxHashMap<AttrId, Vec<EventHandlerGroup>>,
    any_state_scoped: bool,
}

impl HandlerTable {
    fn event_index(event: Event) -> usize {
        match event {
            Event::Init => 0,
            Event::Start => 1,
            Event::Step => 2,
            Event::End => 3,
        }
    }

    /// Returns the single applicable group for `(attribute, event,
    /// current_state)`, preferring a state-scoped group over the
    /// default-state one.
    pub fn groups_for(
        &self,
        attribute: AttrId,
        event: Event,
        current_state: Option<StateId>,
    ) -> Option<&EventHandlerGroup> {
        if let Some(state) = current_state {
            let scoped_key = EventKey { state: Some(state), attribute, event };
            if let Some(group) = self.groups.get(&scoped_key) {
                return Some(group);
            }
        }
        let default_key = EventKey { state: None, attribute, event };
        self.groups.get(&default_key)
    }

    /// O(1) bitset lookup: is there any handler at all for `(attribute,
    /// event)`, in any state?
    pub fn has_any_handler(&self, attribute: AttrId, event: Event) -> bool {
        self.attributes_with_handlers[Self::event_index(event)].contains(attribute.0 as usize)
    }

    /// True iff any `state` stanza appears anywhere in this table.
    pub fn requires_state(&self) -> bool {
        self.any_state_scoped
    }

    pub fn common_handler_cache(&self, attribute: AttrId) -> &[EventHandlerGroup] {
        self.common_handler_cache.get(&attribute).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// A single declared binding fed into [`HandlerTableBuilder`].
pub struct HandlerDecl {
    pub attribute: AttrId,
    pub event: Event,
    pub state: Option<StateId>,
    pub selector: Option<Selector>,
    pub callable: Callable,
}

/// Builds a [`HandlerTable`] from an ordered list of declarations, merging
/// declarations that share an [`EventKey`] into a single ordered group.
#[derive(Default)]
pub struct HandlerTableBuilder {
    decls: Vec<HandlerDecl>,
    assertion_attrs: fxhash::FxHashSet<AttrId>,
}

impl HandlerTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `attribute` as an assertion attribute (its name begins with
    /// `assert.`); the compiler calls this once per declared assertion
    /// attribute before pushing handlers for it.
    pub fn mark_assertion(mut self, attribute: AttrId) -> Self {
        self.assertion_attrs.insert(attribute);
        self
    }

    pub fn push(mut self, decl: HandlerDecl) -> Self {
        self.decls.push(decl);
        self
    }

    pub fn build(self) -> HandlerTable {
        let mut groups: FxHashMap<EventKey, EventHandlerGroup> = FxHashMap::default();
        let mut any_state_scoped = false;
        let mut max_attr = 0u32;

        for decl in self.decls {
            max_attr = max_attr.max(decl.attribute.0 + 1);
            if decl.state.is_some() {
                any_state_scoped = true;
            }
            let key = EventKey { state: decl.state, attribute: decl.attribute, event: decl.event };
            let is_assertion = self.assertion_attrs.contains(&decl.attribute);
            groups
                .entry(key)
                .or_insert_with(|| EventHandlerGroup { key, handlers: Vec::new(), is_assertion })
                .handlers
                .push(EventHandler { callable: decl.callable, selector: decl.selector });
        }

        let mut attributes_with_handlers = [BitSet::new(), BitSet::new(), BitSet::new(), BitSet::new()];
        for key in groups.keys() {
            attributes_with_handlers[HandlerTable::event_index(key.event)].insert(key.attribute.0 as usize);
        }

        let mut common_handler_cache: FxHashMap<AttrId, Vec<EventHandlerGroup>> = FxHashMap::default();
        for (key, group) in &groups {
            common_handler_cache.entry(key.attribute).or_default().push(group.clone());
        }

        HandlerTable {
            groups,
            attributes_with_handlers,
            common_handler_cache,
            any_state_scoped,
        }
    }
}
