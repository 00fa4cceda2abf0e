//! Typed parameter sets and search-space descriptors
//!
//! A `ParamSpace` is an ordered list of `name → domain` entries, validated once
//! when an optimizer or walk-forward run starts. A `ParamSet` is one concrete
//! assignment of values; strategies and the engine read their settings from it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Upper bound on the size of a cartesian grid
pub const MAX_GRID_SIZE: usize = 1_000_000;

/// A single parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    /// Numeric view; `None` for booleans and text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ParamValue::Int(_) | ParamValue::Float(_))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:.4}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// One concrete assignment of parameter values, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet(BTreeMap<String, ParamValue>);

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    /// Integer view, rounding floats; negative values yield `None`
    pub fn get_usize(&self, name: &str) -> Option<usize> {
        self.get_f64(name)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.round() as usize)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ParamValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric parameters as `(name, value)` pairs
    pub fn numeric(&self) -> impl Iterator<Item = (&String, f64)> {
        self.0.iter().filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
    }

    /// Deterministic key used for caching and hashing
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v:?}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Copy with every numeric parameter scaled by an independent uniform
    /// factor in `[1 - range, 1 + range]`. Integers are rounded back.
    pub fn perturbed(&self, range: f64, rng: &mut impl Rng) -> ParamSet {
        let range = range.abs();
        let mut out = self.clone();
        for value in out.0.values_mut() {
            let factor = if range > 0.0 {
                1.0 + rng.gen_range(-range..=range)
            } else {
                1.0
            };
            match value {
                ParamValue::Int(v) => *v = ((*v as f64) * factor).round() as i64,
                ParamValue::Float(v) => *v *= factor,
                _ => {}
            }
        }
        out
    }

    /// Merge `other` on top of `self`
    pub fn merged(&self, other: &ParamSet) -> ParamSet {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl FromIterator<(String, ParamValue)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        ParamSet(iter.into_iter().collect())
    }
}

/// Domain of a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamDomain {
    Int {
        min: i64,
        max: i64,
        #[serde(default = "default_int_step")]
        step: i64,
    },
    Float {
        min: f64,
        max: f64,
        /// Required for grid search
        #[serde(default)]
        step: Option<f64>,
    },
    Choice {
        options: Vec<String>,
    },
    Bool,
}

fn default_int_step() -> i64 {
    1
}

impl ParamDomain {
    fn validate(&self, name: &str) -> Result<()> {
        let bad = |msg: String| Err(EngineError::Config(format!("parameter '{name}': {msg}")));
        match self {
            ParamDomain::Int { min, max, step } => {
                if min > max {
                    return bad(format!("min {min} > max {max}"));
                }
                if *step <= 0 {
                    return bad(format!("step must be positive, got {step}"));
                }
            }
            ParamDomain::Float { min, max, step } => {
                if !(min.is_finite() && max.is_finite()) {
                    return bad("bounds must be finite".to_string());
                }
                if min > max {
                    return bad(format!("min {min} > max {max}"));
                }
                if let Some(s) = step {
                    if !(s.is_finite() && *s > 0.0) {
                        return bad(format!("step must be positive, got {s}"));
                    }
                }
            }
            ParamDomain::Choice { options } => {
                if options.is_empty() {
                    return bad("choice list is empty".to_string());
                }
            }
            ParamDomain::Bool => {}
        }
        Ok(())
    }

    /// Every grid point of this domain, in ascending order
    pub fn grid_values(&self, name: &str) -> Result<Vec<ParamValue>> {
        Ok(match self {
            ParamDomain::Int { min, max, step } => {
                let mut values = Vec::new();
                let mut v = *min;
                while v <= *max {
                    values.push(ParamValue::Int(v));
                    v += step;
                }
                values
            }
            ParamDomain::Float { min, max, step } => {
                let step = step.ok_or_else(|| {
                    EngineError::Config(format!(
                        "parameter '{name}': float domain needs a step for grid search"
                    ))
                })?;
                let n = ((max - min) / step + 1e-9).floor() as usize;
                (0..=n).map(|i| ParamValue::Float(min + step * i as f64)).collect()
            }
            ParamDomain::Choice { options } => {
                options.iter().map(|o| ParamValue::Text(o.clone())).collect()
            }
            ParamDomain::Bool => vec![ParamValue::Bool(false), ParamValue::Bool(true)],
        })
    }

    /// Uniform draw from the domain (snapped to the step when one is set)
    pub fn sample(&self, rng: &mut impl Rng) -> ParamValue {
        match self {
            ParamDomain::Int { min, max, step } => {
                let slots = (max - min) / step;
                ParamValue::Int(min + rng.gen_range(0..=slots) * step)
            }
            ParamDomain::Float { min, max, step } => match step {
                Some(s) => {
                    let slots = ((max - min) / s + 1e-9).floor() as i64;
                    ParamValue::Float(min + s * rng.gen_range(0..=slots) as f64)
                }
                None if max > min => ParamValue::Float(rng.gen_range(*min..=*max)),
                None => ParamValue::Float(*min),
            },
            ParamDomain::Choice { options } => {
                ParamValue::Text(options[rng.gen_range(0..options.len())].clone())
            }
            ParamDomain::Bool => ParamValue::Bool(rng.gen_bool(0.5)),
        }
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamDomain::Int { min, max, .. }, ParamValue::Int(v)) => v >= min && v <= max,
            (ParamDomain::Float { min, max, .. }, ParamValue::Float(v)) => {
                *v >= min - 1e-12 && *v <= max + 1e-12
            }
            (ParamDomain::Choice { options }, ParamValue::Text(v)) => options.contains(v),
            (ParamDomain::Bool, ParamValue::Bool(_)) => true,
            _ => false,
        }
    }
}

/// A named parameter and its domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub domain: ParamDomain,
}

/// Ordered search space. Order defines grid enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSpace {
    params: Vec<ParamSpec>,
}

impl ParamSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, domain: ParamDomain) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            domain,
        });
        self
    }

    pub fn int(self, name: &str, min: i64, max: i64, step: i64) -> Self {
        self.with(name, ParamDomain::Int { min, max, step })
    }

    pub fn float(self, name: &str, min: f64, max: f64, step: Option<f64>) -> Self {
        self.with(name, ParamDomain::Float { min, max, step })
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Validate once at optimizer entry
    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(EngineError::EmptySearchSpace);
        }
        let mut seen = HashSet::new();
        for spec in &self.params {
            if spec.name.is_empty() {
                return Err(EngineError::Config("parameter name is empty".to_string()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate parameter '{}'",
                    spec.name
                )));
            }
            spec.domain.validate(&spec.name)?;
        }
        Ok(())
    }

    /// Number of grid points, saturating
    pub fn grid_size(&self) -> Result<usize> {
        let mut total: usize = 1;
        for spec in &self.params {
            let n = spec.domain.grid_values(&spec.name)?.len();
            total = total.saturating_mul(n);
        }
        Ok(total)
    }

    /// Deterministic cartesian product; the first parameter varies slowest
    pub fn grid(&self) -> Result<Vec<ParamSet>> {
        self.validate()?;
        let size = self.grid_size()?;
        if size > MAX_GRID_SIZE {
            return Err(EngineError::Config(format!(
                "grid has {size} points, limit is {MAX_GRID_SIZE}"
            )));
        }

        let mut grid = vec![ParamSet::new()];
        for spec in &self.params {
            let values = spec.domain.grid_values(&spec.name)?;
            let mut next = Vec::with_capacity(grid.len() * values.len());
            for partial in &grid {
                for value in &values {
                    let mut set = partial.clone();
                    set.insert(&spec.name, value.clone());
                    next.push(set);
                }
            }
            grid = next;
        }
        Ok(grid)
    }

    /// Uniform random draw of every parameter
    pub fn sample(&self, rng: &mut impl Rng) -> ParamSet {
        self.params
            .iter()
            .map(|spec| (spec.name.clone(), spec.domain.sample(rng)))
            .collect()
    }

    /// True when every parameter is present and inside its domain
    pub fn contains(&self, set: &ParamSet) -> bool {
        self.params.iter().all(|spec| {
            set.get(&spec.name)
                .map(|v| spec.domain.contains(v))
                .unwrap_or(false)
        })
    }

    /// Uniform crossover: each gene comes from either parent with equal odds
    pub fn crossover(&self, a: &ParamSet, b: &ParamSet, rng: &mut impl Rng) -> ParamSet {
        self.params
            .iter()
            .map(|spec| {
                let pick = if rng.gen_bool(0.5) { a } else { b };
                let value = pick
                    .get(&spec.name)
                    .cloned()
                    .unwrap_or_else(|| spec.domain.sample(rng));
                (spec.name.clone(), value)
            })
            .collect()
    }

    /// Resample each gene from its domain with probability `rate`
    pub fn mutate(&self, set: &ParamSet, rate: f64, rng: &mut impl Rng) -> ParamSet {
        let rate = rate.clamp(0.0, 1.0);
        self.params
            .iter()
            .map(|spec| {
                let value = match set.get(&spec.name) {
                    Some(v) if !rng.gen_bool(rate) => v.clone(),
                    _ => spec.domain.sample(rng),
                };
                (spec.name.clone(), value)
            })
            .collect()
    }
}
