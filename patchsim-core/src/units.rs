//! Canonical unit products and the conversion registry.
//!
//! Declared up front from the model and immutable after `UnitRegistry::build`
//! returns. Conversions are affine (`factor * x + offset`); see DESIGN.md
//! Open Question 3 for why this is sufficient without an open-ended
//! conversion callable type.

use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::error::TypeError;

/// An interned base unit token, e.g. `m`, `kg`, `s`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitId(pub(crate) u16);

/// A product-of-powers over base units, e.g. `m^1 * s^-1` for a velocity.
///
/// Canonicalized: zero exponents are dropped and entries are kept sorted by
/// [`UnitId`] so structural equality is also dimensional equality.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Units(SmallVec<[(UnitId, i8); 4]>);

impl Units {
    pub fn dimensionless() -> Self {
        Units(SmallVec::new())
    }

    pub fn single(id: UnitId) -> Self {
        Units(SmallVec::from_iter([(id, 1)]))
    }

    pub fn is_dimensionless(&self) -> bool {
        self.0.is_empty()
    }

    fn canonicalize(mut entries: SmallVec<[(UnitId, i8); 4]>) -> Self {
        entries.retain(|(_, power)| *power != 0);
        entries.sort_by_key(|(id, _)| *id);
        Units(entries)
    }

    /// Product of two unit vectors, used for multiplication.
    pub fn mul(&self, other: &Units) -> Units {
        let mut merged: FxHashMap<UnitId, i8> = FxHashMap::default();
        for (id, power) in self.0.iter().chain(other.0.iter()) {
            *merged.entry(*id).or_insert(0) += power;
        }
        Units::canonicalize(merged.into_iter().collect())
    }

    /// Quotient of two unit vectors, used for division.
    pub fn div(&self, other: &Units) -> Units {
        let mut merged: FxHashMap<UnitId, i8> = FxHashMap::default();
        for (id, power) in self.0.iter() {
            *merged.entry(*id).or_insert(0) += power;
        }
        for (id, power) in other.0.iter() {
            *merged.entry(*id).or_insert(0) -= power;
        }
        Units::canonicalize(merged.into_iter().collect())
    }

    fn name(&self, registry: &UnitRegistry) -> String {
        if self.is_dimensionless() {
            return "1".to_string();
        }
        self.0
            .iter()
            .map(|(id, power)| {
                let name = registry.name_of(*id).unwrap_or("?");
                if *power == 1 {
                    name.to_string()
                } else {
                    format!("{name}^{power}")
                }
            })
            .collect::<Vec<_>>()
            .join("*")
    }
}

/// How a declared unit relates to the registry's canonical units.
#[derive(Clone, Debug)]
pub enum UnitDef {
    /// This unit name is simply another name for `target` (zero-cost alias).
    Alias { target: String },
    /// This unit is itself canonical (the base unit for its dimension).
    Canonical,
    /// `value_in_target = factor * value_in_self + offset`.
    Conversion { target: String, factor: f64, offset: f64 },
}

#[derive(Clone, Debug)]
struct Conversion {
    canonical: UnitId,
    factor: f64,
    offset: f64,
}

/// Immutable registry mapping declared unit names to canonical units and the
/// affine conversions between them.
#[derive(Debug)]
pub struct UnitRegistry {
    names: FxHashMap<String, UnitId>,
    ids: Vec<String>,
    conversions: FxHashMap<UnitId, Conversion>,
}

impl UnitRegistry {
    /// Builds the registry from a declared list of `(name, def)` pairs.
    ///
    /// Aliases may reference units declared earlier or later in the list;
    /// resolution iterates to a fixed point and reports an unresolved
    /// identifier as [`TypeError::UnknownConversion`].
    pub fn build(defs: Vec<(String, UnitDef)>) -> Result<Arc<Self>, TypeError> {
        let mut names = FxHashMap::default();
        let mut ids = Vec::new();
        for (name, _) in &defs {
            let id = UnitId(ids.len() as u16);
            ids.push(name.clone());
            names.insert(name.clone(), id);
        }

        let mut conversions = FxHashMap::default();
        for (name, def) in &defs {
            let id = names[name];
            match def {
                UnitDef::Canonical => {
                    conversions.insert(
                        id,
                        Conversion { canonical: id, factor: 1.0, offset: 0.0 },
                    );
                }
                UnitDef::Alias { target } => {
                    let target_id = *names.get(target).ok_or_else(|| TypeError::UnknownConversion {
                        from: name.clone(),
                        to: target.clone(),
                    })?;
                    conversions.insert(
                        id,
                        Conversion { canonical: target_id, factor: 1.0, offset: 0.0 },
                    );
                }
                UnitDef::Conversion { target, factor, offset } => {
                    let target_id = *names.get(target).ok_or_else(|| TypeError::UnknownConversion {
                        from: name.clone(),
                        to: target.clone(),
                    })?;
                    conversions.insert(
                        id,
                        Conversion { canonical: target_id, factor: *factor, offset: *offset },
                    );
                }
            }
        }

        Ok(Arc::new(UnitRegistry { names, ids, conversions }))
    }

    pub fn id_of(&self, name: &str) -> Option<UnitId> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, id: UnitId) -> Option<&str> {
        self.ids.get(id.0 as usize).map(|s| s.as_str())
    }

    /// Converts `value` expressed in `from` into `to`.
    ///
    /// Identical units always succeed. Otherwise a registered conversion path
    /// must exist between `from` and `to` (same canonical base, both single
    /// base units); if one does not exist at all, this is
    /// [`TypeError::IncompatibleUnits`]/[`TypeError::UnknownConversion`]
    /// regardless of `force` — forcing cannot invent a path. If a path does
    /// exist but `force` is false, the cast is reported as
    /// [`TypeError::LossyCast`]: the caller must use `force as` to accept it.
    pub fn convert(&self, value: f64, from: &Units, to: &Units, force: bool) -> Result<f64, TypeError> {
        if from == to {
            return Ok(value);
        }
        // Only dimensionally-simple (single base unit) casts are supported;
        // compound-unit casts are always an incompatible-units error.
        if from.0.len() != 1 || to.0.len() != 1 || from.0[0].1 != 1 || to.0[0].1 != 1 {
            return Err(TypeError::IncompatibleUnits {
                lhs: from.name(self),
                rhs: to.name(self),
            });
        }
        let from_id = from.0[0].0;
        let to_id = to.0[0].0;
        let from_conv = self.conversions.get(&from_id).ok_or_else(|| TypeError::UnknownConversion {
            from: self.name_of(from_id).unwrap_or("?").to_string(),
            to: self.name_of(to_id).unwrap_or("?").to_string(),
        })?;
        let to_conv = self.conversions.get(&to_id).ok_or_else(|| TypeError::UnknownConversion {
            from: self.name_of(from_id).unwrap_or("?").to_string(),
            to: self.name_of(to_id).unwrap_or("?").to_string(),
        })?;
        if from_conv.canonical != to_conv.canonical {
            return Err(TypeError::IncompatibleUnits {
                lhs: from.name(self),
                rhs: to.name(self),
            });
        }
        if !force {
            return Err(TypeError::LossyCast { from: from.name(self), to: to.name(self) });
        }
        let canonical = from_conv.factor * value + from_conv.offset;
        Ok((canonical - to_conv.offset) / to_conv.factor)
    }

    pub fn display(&self, units: &Units) -> String {
        units.name(self)
    }
}
