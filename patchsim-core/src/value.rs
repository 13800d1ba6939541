//! The tagged scalar/distribution value type, its unit and language-type
//! tags, and arithmetic/casting/sampling over it.

use std::sync::Arc;

use rand::Rng;
use rust_decimal::Decimal;

use crate::entity::EntityId;
use crate::error::TypeError;
use crate::units::{UnitRegistry, Units};

/// Introspection tag used by the discovery pass to decide whether a slot
/// needs to be walked for child entities.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LanguageType {
    Boolean,
    Integer,
    Decimal,
    Double,
    String,
    Entity,
    DistributionOf(Box<LanguageType>),
}

impl LanguageType {
    /// True for `Entity` and any distribution whose element type is
    /// entity-bearing; these are exactly the slots the stepper's discovery
    /// pass must walk.
    pub fn is_entity_bearing(&self) -> bool {
        match self {
            LanguageType::Entity => true,
            LanguageType::DistributionOf(inner) => inner.is_entity_bearing(),
            _ => false,
        }
    }
}

/// A closed-form distribution that can be sampled without being realized
/// into a concrete sequence.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnalyticDistribution {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, stddev: f64 },
    Bernoulli { p: f64 },
    Categorical { weights: Vec<(Value, f64)> },
}

impl AnalyticDistribution {
    /// `favor_big_decimal` governs only the numeric representation freshly
    /// synthesized here (`Uniform`/`Normal` draw a raw `f64` from the RNG and
    /// must then pick a `Value` variant for it); it never revisits a value
    /// that already carries a type, which is what `widen`/`numeric_op` do.
    pub fn sample(&self, rng: &mut dyn rand::RngCore, units: &Units, favor_big_decimal: bool) -> Value {
        match self {
            AnalyticDistribution::Uniform { low, high } => {
                numeric_sample(rng.gen_range(*low..*high), units, favor_big_decimal)
            }
            AnalyticDistribution::Normal { mean, stddev } => {
                // Box-Muller; avoids pulling in `rand_distr` for a single shape.
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen_range(0.0..1.0);
                let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                numeric_sample(mean + stddev * z0, units, favor_big_decimal)
            }
            AnalyticDistribution::Bernoulli { p } => Value::Boolean(rng.gen_bool((*p).clamp(0.0, 1.0))),
            AnalyticDistribution::Categorical { weights } => {
                let total: f64 = weights.iter().map(|(_, w)| w).sum();
                let mut roll = rng.gen_range(0.0..total);
                for (value, weight) in weights {
                    if roll < *weight {
                        return value.clone();
                    }
                    roll -= weight;
                }
                weights.last().map(|(v, _)| v.clone()).unwrap_or(Value::Boolean(false))
            }
        }
    }

    /// `None` for distributions with unbounded or undefined size (analytic
    /// distributions may be infinite).
    pub fn len(&self) -> Option<usize> {
        match self {
            AnalyticDistribution::Categorical { weights } => Some(weights.len()),
            _ => None,
        }
    }
}

/// Picks the representation for a value drawn fresh from an RNG: `Decimal`
/// when `favor_big_decimal` is set, `Double` otherwise. Only the sampling
/// path needs this — every other numeric operation propagates a
/// representation an operand already carries rather than inventing one.
fn numeric_sample(v: f64, units: &Units, favor_big_decimal: bool) -> Value {
    if favor_big_decimal {
        Value::Decimal(Decimal::try_from(v).unwrap_or_default(), units.clone())
    } else {
        Value::Double(v, units.clone())
    }
}

/// A collection-valued [`Value`]: either analytic (closed-form, sampled
/// on demand) or realized (a finite, concretely materialized sequence).
#[derive(Clone, Debug)]
pub enum Distribution {
    Analytic(Arc<AnalyticDistribution>, Units),
    Realized(Arc<Vec<Value>>, Units),
}

impl Distribution {
    pub fn units(&self) -> &Units {
        match self {
            Distribution::Analytic(_, units) => units,
            Distribution::Realized(_, units) => units,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Distribution::Analytic(dist, _) => dist.len(),
            Distribution::Realized(values, _) => Some(values.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }

    pub fn sample(&self, rng: &mut dyn rand::RngCore, favor_big_decimal: bool) -> Value {
        match self {
            Distribution::Analytic(dist, units) => dist.sample(rng, units, favor_big_decimal),
            Distribution::Realized(values, _) => {
                if values.is_empty() {
                    Value::Boolean(false)
                } else {
                    let i = rng.gen_range(0..values.len());
                    values[i].clone()
                }
            }
        }
    }

    /// Finite realized contents, materializing an analytic distribution is
    /// not attempted here — operations that need per-element access must
    /// already hold a [`Distribution::Realized`] value.
    pub fn contents(&self) -> Option<&[Value]> {
        match self {
            Distribution::Realized(values, _) => Some(values.as_slice()),
            Distribution::Analytic(..) => None,
        }
    }

    /// Filters this (realized) distribution by a parallel boolean mask
    /// distribution, yielding a filtered sequence.
    pub fn filter_by(&self, mask: &Distribution) -> Result<Distribution, TypeError> {
        let values = self.contents().ok_or(TypeError::Mismatch {
            expected: "realized distribution",
            found: "analytic distribution",
        })?;
        let mask_values = mask.contents().ok_or(TypeError::Mismatch {
            expected: "realized distribution",
            found: "analytic distribution",
        })?;
        if values.len() != mask_values.len() {
            return Err(TypeError::Mismatch { expected: "equal-length mask", found: "mismatched length" });
        }
        let filtered: Vec<Value> = values
            .iter()
            .zip(mask_values.iter())
            .filter_map(|(v, m)| match m {
                Value::Boolean(true) => Some(v.clone()),
                _ => None,
            })
            .collect();
        Ok(Distribution::Realized(Arc::new(filtered), self.units().clone()))
    }

    /// The pipe-concatenation operator `|`.
    pub fn concat(&self, other: &Distribution) -> Result<Distribution, TypeError> {
        let a = self.contents().ok_or(TypeError::Mismatch {
            expected: "realized distribution",
            found: "analytic distribution",
        })?;
        let b = other.contents().ok_or(TypeError::Mismatch {
            expected: "realized distribution",
            found: "analytic distribution",
        })?;
        let mut merged = Vec::with_capacity(a.len() + b.len());
        merged.extend_from_slice(a);
        merged.extend_from_slice(b);
        Ok(Distribution::Realized(Arc::new(merged), self.units().clone()))
    }

    pub fn count(&self) -> usize {
        self.contents().map(|c| c.len()).unwrap_or(0)
    }

    /// Arithmetic mean over realized numeric contents.
    pub fn mean(&self) -> Result<f64, TypeError> {
        let values = self.contents().ok_or(TypeError::Mismatch {
            expected: "realized distribution",
            found: "analytic distribution",
        })?;
        if values.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for v in values {
            total += v.as_f64().ok_or(TypeError::Mismatch { expected: "numeric value", found: "non-numeric" })?;
        }
        Ok(total / values.len() as f64)
    }
}

/// The tagged value type every attribute slot holds.
#[derive(Clone, Debug)]
pub enum Value {
    Boolean(bool),
    Integer(i64, Units),
    Decimal(Decimal, Units),
    Double(f64, Units),
    Str(String),
    EntityRef(EntityId),
    Distribution(Distribution),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v, Units::dimensionless())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v, Units::dimensionless())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a, ua), Value::Integer(b, ub)) => a == b && ua == ub,
            (Value::Decimal(a, ua), Value::Decimal(b, ub)) => a == b && ua == ub,
            (Value::Double(a, ua), Value::Double(b, ub)) => a == b && ua == ub,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::EntityRef(a), Value::EntityRef(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn units(&self) -> Units {
        match self {
            Value::Integer(_, u) | Value::Decimal(_, u) | Value::Double(_, u) => u.clone(),
            _ => Units::dimensionless(),
        }
    }

    pub fn language_type(&self) -> LanguageType {
        match self {
            Value::Boolean(_) => LanguageType::Boolean,
            Value::Integer(..) => LanguageType::Integer,
            Value::Decimal(..) => LanguageType::Decimal,
            Value::Double(..) => LanguageType::Double,
            Value::Str(_) => LanguageType::String,
            Value::EntityRef(_) => LanguageType::Entity,
            Value::Distribution(dist) => {
                let inner = dist
                    .contents()
                    .and_then(|c| c.first())
                    .map(|v| v.language_type())
                    .unwrap_or(LanguageType::Double);
                LanguageType::DistributionOf(Box::new(inner))
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i, _) => Some(*i as f64),
            Value::Decimal(d, _) => d.to_string().parse().ok(),
            Value::Double(d, _) => Some(*d),
            _ => None,
        }
    }

    fn numeric_rank(&self) -> Option<u8> {
        match self {
            Value::Boolean(_) => Some(0),
            Value::Integer(..) => Some(1),
            Value::Decimal(..) => Some(2),
            Value::Double(..) => Some(3),
            _ => None,
        }
    }

    /// Widens `self` and `other` to the lossier of the two numeric types.
    fn widen(&self, other: &Value) -> Option<u8> {
        Some(self.numeric_rank()?.max(other.numeric_rank()?))
    }

    fn to_rank(&self, rank: u8) -> Option<(f64, Decimal, i64, bool)> {
        match (self, rank) {
            (Value::Boolean(b), 0) => Some((if *b { 1.0 } else { 0.0 }, Decimal::from(*b as i64), *b as i64, *b)),
            (v, _) => {
                let f = v.as_f64()?;
                Some((f, Decimal::try_from(f).unwrap_or_default(), f as i64, f != 0.0))
            }
        }
    }

    fn require_equal_units(&self, other: &Value) -> Result<Units, TypeError> {
        let (a, b) = (self.units(), other.units());
        if a == b {
            Ok(a)
        } else {
            Err(TypeError::IncompatibleUnits { lhs: format!("{a:?}"), rhs: format!("{b:?}") })
        }
    }

    /// `self + other`; requires equal units.
    pub fn add(&self, other: &Value) -> Result<Value, TypeError> {
        let units = self.require_equal_units(other)?;
        self.numeric_op(other, units, |a, b| a + b, |a, b| a + b)
    }

    pub fn sub(&self, other: &Value) -> Result<Value, TypeError> {
        let units = self.require_equal_units(other)?;
        self.numeric_op(other, units, |a, b| a - b, |a, b| a - b)
    }

    /// `self * other`; units multiply to produce derived units.
    pub fn mul(&self, other: &Value) -> Result<Value, TypeError> {
        let units = self.units().mul(&other.units());
        self.numeric_op(other, units, |a, b| a * b, |a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Result<Value, TypeError> {
        let units = self.units().div(&other.units());
        self.numeric_op(other, units, |a, b| a / b, |a, b| a / b)
    }

    /// Unary negation; units pass through unchanged.
    pub fn neg(&self) -> Result<Value, TypeError> {
        match self {
            Value::Integer(i, u) => Ok(Value::Integer(-i, u.clone())),
            Value::Decimal(d, u) => Ok(Value::Decimal(-d, u.clone())),
            Value::Double(d, u) => Ok(Value::Double(-d, u.clone())),
            _ => Err(TypeError::Mismatch { expected: "numeric value", found: "non-numeric value" }),
        }
    }

    /// Orders `self` against `other`, widening the same way arithmetic does
    /// and requiring equal units for numeric comparisons. Strings compare
    /// lexicographically and booleans order `false < true`; neither carries
    /// units, so no unit check applies to them.
    pub fn compare(&self, other: &Value) -> Result<std::cmp::Ordering, TypeError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
            _ => {
                self.require_equal_units(other)?;
                let rank = self.widen(other).ok_or(TypeError::Mismatch {
                    expected: "comparable value",
                    found: "non-numeric value",
                })?;
                if rank == 2 {
                    let a = self.as_decimal().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                    let b = other.as_decimal().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                    Ok(a.cmp(&b))
                } else {
                    let a = self.as_f64().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                    let b = other.as_f64().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                    a.partial_cmp(&b)
                        .ok_or(TypeError::Mismatch { expected: "comparable value", found: "NaN" })
                }
            }
        }
    }

    pub fn lt(&self, other: &Value) -> Result<bool, TypeError> {
        Ok(self.compare(other)? == std::cmp::Ordering::Less)
    }

    pub fn le(&self, other: &Value) -> Result<bool, TypeError> {
        Ok(self.compare(other)? != std::cmp::Ordering::Greater)
    }

    pub fn gt(&self, other: &Value) -> Result<bool, TypeError> {
        Ok(self.compare(other)? == std::cmp::Ordering::Greater)
    }

    pub fn ge(&self, other: &Value) -> Result<bool, TypeError> {
        Ok(self.compare(other)? != std::cmp::Ordering::Less)
    }

    fn numeric_op(
        &self,
        other: &Value,
        units: Units,
        f64_op: impl Fn(f64, f64) -> f64,
        decimal_op: impl Fn(Decimal, Decimal) -> Decimal,
    ) -> Result<Value, TypeError> {
        let rank = self.widen(other).ok_or(TypeError::Mismatch {
            expected: "numeric value",
            found: "non-numeric value",
        })?;
        match rank {
            0 | 1 => {
                let a = self.as_f64().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                let b = other.as_f64().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                Ok(Value::Integer(f64_op(a, b) as i64, units))
            }
            2 => {
                let a = self.as_decimal().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                let b = other.as_decimal().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                Ok(Value::Decimal(decimal_op(a, b), units))
            }
            _ => {
                let a = self.as_f64().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                let b = other.as_f64().ok_or(TypeError::Mismatch { expected: "numeric", found: "non-numeric" })?;
                Ok(Value::Double(f64_op(a, b), units))
            }
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d, _) => Some(*d),
            Value::Integer(i, _) => Some(Decimal::from(*i)),
            Value::Boolean(b) => Some(Decimal::from(*b as i64)),
            Value::Double(d, _) => Decimal::try_from(*d).ok(),
            _ => None,
        }
    }

    /// Casts to `target` units, requiring an exact (non-lossy) registered
    /// conversion unless `force` is set via [`Value::force_as`].
    pub fn as_units(&self, registry: &UnitRegistry, target: Units) -> Result<Value, TypeError> {
        self.cast_units(registry, target, false)
    }

    pub fn force_as(&self, registry: &UnitRegistry, target: Units) -> Result<Value, TypeError> {
        self.cast_units(registry, target, true)
    }

    fn cast_units(&self, registry: &UnitRegistry, target: Units, force: bool) -> Result<Value, TypeError> {
        let current = self.units();
        let value = self
            .as_f64()
            .ok_or(TypeError::Mismatch { expected: "numeric value", found: "non-numeric value" })?;
        let converted = registry.convert(value, &current, &target, force)?;
        match self {
            Value::Integer(..) => Ok(Value::Integer(converted as i64, target)),
            Value::Decimal(..) => Ok(Value::Decimal(Decimal::try_from(converted).unwrap_or_default(), target)),
            _ => Ok(Value::Double(converted, target)),
        }
    }
}
