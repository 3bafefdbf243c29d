//! Named, bounded, optionally constrained model parameters.
//!
//! Every peak model contributes its parameters to one shared [`Parameters`] set,
//! with names made unique by the peak's prefix (`p0_center`, `p1_sigma`, ...).
//! A [`Parameter`] is either free (`vary`), fixed, or tied to other parameters
//! through an [`Expression`].
//!
//! Bounds are enforced for the optimizer by mapping each bounded parameter onto an
//! unbounded internal coordinate, see [`Parameter::to_internal`].
use std::collections::HashMap;
use std::fmt;

use log::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

use crate::expression::{Expression, ExpressionError};

/// All the ways manipulating a [`Parameters`] set can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Parameter \"{0}\" not found")]
    NotFound(String),
    #[error("Invalid expression for parameter \"{name}\": {source}")]
    InvalidExpression {
        name: String,
        #[source]
        source: ExpressionError,
    },
    #[error("Expression for parameter \"{name}\" references unknown parameter \"{reference}\"")]
    UnknownReference { name: String, reference: String },
    #[error("Parameter \"{0}\" depends on itself through its expression")]
    CircularReference(String),
}

/// A partial update to a [`Parameter`].
///
/// Fields left as `None` are not touched. An empty `expr` removes the
/// parameter's expression.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParameterUpdate {
    pub value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub vary: Option<bool>,
    pub expr: Option<String>,
}

impl ParameterUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn vary(mut self, vary: bool) -> Self {
        self.vary = Some(vary);
        self
    }

    pub fn expr<S: Into<String>>(mut self, expr: S) -> Self {
        self.expr = Some(expr.into());
        self
    }

    /// Layer `other` on top of `self`, `other`'s fields winning where set
    pub fn merge(self, other: ParameterUpdate) -> Self {
        Self {
            value: other.value.or(self.value),
            min: other.min.or(self.min),
            max: other.max.or(self.max),
            vary: other.vary.or(self.vary),
            expr: other.expr.or(self.expr),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.vary.is_none()
            && self.expr.is_none()
    }
}

/// Infinite bounds are stored as `null`, which formats like JSON can represent
#[cfg(feature = "serde")]
mod bounds {
    use serde::{Deserialize, Deserializer, Serializer};

    fn serialize<S: Serializer>(bound: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if bound.is_infinite() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(bound)
        }
    }

    pub mod lower {
        use super::*;

        pub fn serialize<S: Serializer>(bound: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            super::serialize(bound, serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
        }
    }

    pub mod upper {
        use super::*;

        pub fn serialize<S: Serializer>(bound: &f64, serializer: S) -> Result<S::Ok, S::Error> {
            super::serialize(bound, serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
            Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
        }
    }
}

/// A single model parameter
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Parameter {
    pub name: String,
    value: f64,
    #[cfg_attr(feature = "serde", serde(with = "bounds::lower"))]
    pub min: f64,
    #[cfg_attr(feature = "serde", serde(with = "bounds::upper"))]
    pub max: f64,
    pub vary: bool,
    expr: Option<Expression>,
    /// The standard error estimated by the last fit, if any
    pub stderr: Option<f64>,
}

impl Parameter {
    pub fn new<S: Into<String>>(name: S, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            vary: true,
            expr: None,
            stderr: None,
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = min.min(max);
        self.max = max.max(min);
        self
    }

    pub fn with_vary(mut self, vary: bool) -> Self {
        self.vary = vary;
        self
    }

    /// The parameter value, clipped into `[min, max]`
    pub fn value(&self) -> f64 {
        self.clip(self.value)
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = self.clip(value);
    }

    pub fn expr(&self) -> Option<&Expression> {
        self.expr.as_ref()
    }

    /// Whether the optimizer should move this parameter
    pub fn is_free(&self) -> bool {
        self.vary && self.expr.is_none()
    }

    fn clip(&self, value: f64) -> f64 {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// Apply a [`ParameterUpdate`].
    ///
    /// Setting `vary = true` drops any expression, setting an expression
    /// fixes the parameter.
    pub fn apply(&mut self, update: &ParameterUpdate) -> Result<(), ParameterError> {
        let expr = match update.expr.as_deref().map(str::trim) {
            Some("") => Some(None),
            Some(source) => Some(Some(Expression::parse(source).map_err(|source| {
                ParameterError::InvalidExpression {
                    name: self.name.clone(),
                    source,
                }
            })?)),
            None => None,
        };

        if let Some(vary) = update.vary {
            self.vary = vary;
            if vary {
                self.expr = None;
            }
        }
        if let Some(min) = update.min {
            self.min = min;
        }
        if let Some(max) = update.max {
            self.max = max;
        }
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        if let Some(value) = update.value {
            self.value = value;
        }
        self.value = self.clip(self.value);
        if let Some(expr) = expr {
            if expr.is_some() {
                self.vary = false;
            }
            self.expr = expr;
        }
        Ok(())
    }

    fn has_lower(&self) -> bool {
        self.min.is_finite()
    }

    fn has_upper(&self) -> bool {
        self.max.is_finite()
    }

    /// Map the current value onto the unbounded coordinate seen by the optimizer.
    ///
    /// Two-sided bounds use `asin`, one-sided bounds the `sqrt` transform.
    pub fn to_internal(&self) -> f64 {
        let value = self.value();
        match (self.has_lower(), self.has_upper()) {
            (false, false) => value,
            (true, false) => ((value - self.min + 1.0).powi(2) - 1.0).sqrt(),
            (false, true) => ((self.max - value + 1.0).powi(2) - 1.0).sqrt(),
            (true, true) => {
                let scaled = 2.0 * (value - self.min) / (self.max - self.min) - 1.0;
                scaled.clamp(-1.0, 1.0).asin()
            }
        }
    }

    /// The inverse of [`Parameter::to_internal`]
    pub fn from_internal(&self, internal: f64) -> f64 {
        match (self.has_lower(), self.has_upper()) {
            (false, false) => internal,
            (true, false) => self.min - 1.0 + (internal.powi(2) + 1.0).sqrt(),
            (false, true) => self.max + 1.0 - (internal.powi(2) + 1.0).sqrt(),
            (true, true) => self.min + (internal.sin() + 1.0) * (self.max - self.min) / 2.0,
        }
    }

    /// The derivative of [`Parameter::from_internal`] at `internal`, used to
    /// carry uncertainties from the internal coordinate back out.
    pub fn internal_derivative(&self, internal: f64) -> f64 {
        match (self.has_lower(), self.has_upper()) {
            (false, false) => 1.0,
            (true, false) => internal / (internal.powi(2) + 1.0).sqrt(),
            (false, true) => -internal / (internal.powi(2) + 1.0).sqrt(),
            (true, true) => internal.cos() * (self.max - self.min) / 2.0,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Parameter '{}', value={}", self.name, self.value())?;
        if let Some(stderr) = self.stderr {
            write!(f, " +/- {stderr:.3e}")?;
        }
        if let Some(expr) = &self.expr {
            write!(f, ", expr='{expr}'")?;
        } else if !self.vary {
            write!(f, " (fixed)")?;
        }
        write!(f, ", bounds=[{}:{}]>", self.min, self.max)
    }
}

/// An insertion-ordered collection of uniquely named [`Parameter`]s
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Parameters {
    params: Vec<Parameter>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Parameter> {
        self.params.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    /// The clipped value of `name`
    pub fn value(&self, name: &str) -> Result<f64, ParameterError> {
        self.get(name)
            .map(|p| p.value())
            .ok_or_else(|| ParameterError::NotFound(name.to_string()))
    }

    /// Add `param`, replacing and returning any parameter of the same name.
    ///
    /// A replaced parameter keeps its position.
    pub fn insert(&mut self, param: Parameter) -> Option<Parameter> {
        match self.position(&param.name) {
            Some(i) => Some(std::mem::replace(&mut self.params[i], param)),
            None => {
                self.params.push(param);
                None
            }
        }
    }

    /// Insert every parameter of `other`, overwriting same-named entries, then
    /// recompute the expressions that depend on them
    pub fn merge(&mut self, other: Parameters) {
        for param in other.params {
            self.insert(param);
        }
        self.refresh();
    }

    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        self.position(name).map(|i| self.params.remove(i))
    }

    /// Remove every parameter whose name starts with `prefix`
    pub fn remove_prefixed(&mut self, prefix: &str) -> Vec<Parameter> {
        let (removed, kept) = std::mem::take(&mut self.params)
            .into_iter()
            .partition(|p| p.name.starts_with(prefix));
        self.params = kept;
        removed
    }

    /// Apply `update` to the parameter called `name`, then recompute every
    /// expression-bound parameter.
    ///
    /// If the update leaves `name` with an expression that cannot be evaluated
    /// against this set, the parameter is restored and the error returned. Only
    /// the expression of `name` is checked.
    pub fn set(&mut self, name: &str, update: &ParameterUpdate) -> Result<(), ParameterError> {
        let i = self
            .position(name)
            .ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        let previous = self.params[i].clone();
        self.params[i].apply(update)?;
        if self.params[i].expr.is_some() {
            if let Err(err) = self.resolve(name, &mut HashMap::new(), &mut Vec::new()) {
                self.params[i] = previous;
                return Err(err);
            }
        }
        self.refresh();
        Ok(())
    }

    /// Clear every expression that refers to one of `names`, returning the
    /// names of the parameters that were released.
    ///
    /// A released parameter keeps its last value and stays fixed.
    pub fn release_references(&mut self, names: &[&str]) -> Vec<String> {
        let mut released = Vec::new();
        for param in self.params.iter_mut() {
            let refers = param
                .expr
                .as_ref()
                .is_some_and(|expr| expr.names().iter().any(|n| names.contains(n)));
            if refers {
                param.expr = None;
                released.push(param.name.clone());
            }
        }
        released
    }

    fn resolve(
        &self,
        name: &str,
        cache: &mut HashMap<String, f64>,
        stack: &mut Vec<String>,
    ) -> Result<f64, ParameterError> {
        if let Some(value) = cache.get(name) {
            return Ok(*value);
        }
        let param = self
            .get(name)
            .ok_or_else(|| ParameterError::NotFound(name.to_string()))?;
        let Some(expr) = param.expr.as_ref() else {
            return Ok(param.value());
        };
        if stack.iter().any(|s| s == name) {
            return Err(ParameterError::CircularReference(name.to_string()));
        }
        stack.push(name.to_string());
        let raw = expr.evaluate(|dep| {
            self.resolve(dep, cache, stack).map_err(|err| match err {
                ParameterError::NotFound(reference) => ParameterError::UnknownReference {
                    name: param.name.clone(),
                    reference,
                },
                err => err,
            })
        })?;
        stack.pop();
        let value = param.clip(raw);
        cache.insert(name.to_string(), value);
        Ok(value)
    }

    /// Recompute every expression-bound parameter from the current values.
    ///
    /// Nothing is modified unless every expression evaluates.
    pub fn update_constraints(&mut self) -> Result<(), ParameterError> {
        let mut cache = HashMap::new();
        let mut stack = Vec::new();
        let mut computed = Vec::new();
        for (i, param) in self.params.iter().enumerate() {
            if param.expr.is_some() {
                let value = self.resolve(&param.name, &mut cache, &mut stack)?;
                computed.push((i, value));
            }
        }
        for (i, value) in computed {
            self.params[i].value = value;
        }
        Ok(())
    }

    /// Recompute every expression-bound parameter that can be evaluated.
    ///
    /// Unlike [`Parameters::update_constraints`] an expression that fails to
    /// evaluate keeps its last value rather than blocking the others.
    pub fn refresh(&mut self) {
        let mut cache = HashMap::new();
        let mut computed = Vec::new();
        for (i, param) in self.params.iter().enumerate() {
            if param.expr.is_none() {
                continue;
            }
            match self.resolve(&param.name, &mut cache, &mut Vec::new()) {
                Ok(value) => computed.push((i, value)),
                Err(err) => debug!("Leaving {} at {}: {err}", param.name, param.value),
            }
        }
        for (i, value) in computed {
            self.params[i].value = value;
        }
    }

    /// The parameters the optimizer is free to move
    pub fn varying(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(|p| p.is_free())
    }

    /// The indices of the parameters the optimizer is free to move
    pub(crate) fn free_indices(&self) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_free())
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn at(&self, index: usize) -> &Parameter {
        &self.params[index]
    }

    pub(crate) fn at_mut(&mut self, index: usize) -> &mut Parameter {
        &mut self.params[index]
    }
}

impl<'a> IntoIterator for &'a Parameters {
    type Item = &'a Parameter;

    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

impl Extend<Parameter> for Parameters {
    fn extend<T: IntoIterator<Item = Parameter>>(&mut self, iter: T) {
        for param in iter {
            self.insert(param);
        }
    }
}

impl FromIterator<Parameter> for Parameters {
    fn from_iter<T: IntoIterator<Item = Parameter>>(iter: T) -> Self {
        let mut params = Parameters::new();
        params.extend(iter);
        params
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in self.iter() {
            writeln!(f, "{param}")?;
        }
        Ok(())
    }
}
