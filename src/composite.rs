//! Per-peak models and their sum.
//!
//! A [`PeakModel`] is a [`PeakShapeKind`] bound to a parameter name prefix plus
//! a set of parameter hints (initial values, bounds, vary flags) used whenever
//! fresh parameters are made for it. A [`CompositeModel`] evaluates to the sum of
//! its components against one shared [`Parameters`] set.
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::arrayops::add_in_place;
use crate::parameters::{Parameter, ParameterError, ParameterUpdate, Parameters};
use crate::shapes::PeakShapeKind;

/// A single peak shape with prefixed parameter names
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeakModel {
    prefix: String,
    kind: PeakShapeKind,
    hints: Vec<(String, ParameterUpdate)>,
    /// Prefixed names of the evaluated parameters, in evaluation order
    full_names: Vec<String>,
}

impl PeakModel {
    pub fn new<S: Into<String>>(prefix: S, kind: PeakShapeKind) -> Self {
        let prefix = prefix.into();
        let full_names = kind
            .param_names()
            .iter()
            .map(|name| format!("{prefix}{name}"))
            .collect();
        Self {
            prefix,
            kind,
            hints: Vec::new(),
            full_names,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn kind(&self) -> PeakShapeKind {
        self.kind
    }

    /// The prefixed name of parameter `name`
    pub fn param_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// All prefixed parameter names this model creates, derived ones included
    pub fn param_names(&self) -> Vec<String> {
        let mut names = self.full_names.clone();
        names.extend(
            self.kind
                .derived_params(&self.prefix)
                .into_iter()
                .map(|(name, _)| self.param_name(name)),
        );
        names
    }

    /// Record a hint for the unprefixed parameter `name`, layered over any
    /// previous hint for it
    pub fn set_param_hint(&mut self, name: &str, update: ParameterUpdate) {
        match self.hints.iter_mut().find(|(n, _)| n == name) {
            Some((_, hint)) => {
                *hint = std::mem::take(hint).merge(update);
            }
            None => self.hints.push((name.to_string(), update)),
        }
    }

    pub fn param_hint(&self, name: &str) -> Option<&ParameterUpdate> {
        self.hints.iter().find(|(n, _)| n == name).map(|(_, h)| h)
    }

    /// Build a fresh parameter set from the profile defaults and the hints
    pub fn make_params(&self) -> Result<Parameters, ParameterError> {
        let mut params = Parameters::new();
        for (name, default) in self.kind.default_hints() {
            let update = match self.param_hint(name) {
                Some(hint) => default.merge(hint.clone()),
                None => default,
            };
            let mut param = Parameter::new(self.param_name(name), 0.0);
            param.apply(&update)?;
            params.insert(param);
        }
        for (name, expr) in self.kind.derived_params(&self.prefix) {
            let mut param = Parameter::new(self.param_name(name), 0.0);
            param.apply(&ParameterUpdate::new().expr(expr))?;
            params.insert(param);
        }
        params.update_constraints()?;
        Ok(params)
    }

    /// Estimate parameters for this peak alone from `y` over `x`
    pub fn guess(&self, y: &[f64], x: &[f64]) -> Result<Parameters, ParameterError> {
        let mut params = self.make_params()?;
        for (name, update) in self.kind.guess(y, x) {
            params.set(&self.param_name(name), &update)?;
        }
        params.update_constraints()?;
        Ok(params)
    }

    /// Evaluate this peak over `x` with values taken from `params`
    pub fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ParameterError> {
        let mut values = Vec::with_capacity(self.full_names.len());
        for name in self.full_names.iter() {
            values.push(params.value(name)?);
        }
        // values holds one entry per name in `full_names`, which always covers the profile
        Ok(self
            .kind
            .evaluate(&values, x)
            .unwrap_or_else(|| vec![f64::NAN; x.len()]))
    }
}

impl fmt::Display for PeakModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Model({}, prefix='{}')>", self.kind, self.prefix)
    }
}

/// The sum of several [`PeakModel`]s
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompositeModel {
    pub components: Vec<PeakModel>,
}

impl CompositeModel {
    pub fn new(components: Vec<PeakModel>) -> Self {
        Self { components }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PeakModel> {
        self.components.iter()
    }

    pub fn push(&mut self, model: PeakModel) {
        self.components.push(model);
    }

    /// Evaluate every component over `x` and sum them
    pub fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ParameterError> {
        let mut total = vec![0.0; x.len()];
        for component in self.iter() {
            let y = component.eval(params, x)?;
            add_in_place(&mut total, &y);
        }
        Ok(total)
    }

    /// Evaluate each component separately, keyed by prefix
    pub fn eval_components<'a>(
        &'a self,
        params: &Parameters,
        x: &[f64],
    ) -> Result<Vec<(&'a str, Vec<f64>)>, ParameterError> {
        self.iter()
            .map(|c| c.eval(params, x).map(|y| (c.prefix(), y)))
            .collect()
    }
}

impl From<PeakModel> for CompositeModel {
    fn from(value: PeakModel) -> Self {
        Self::new(vec![value])
    }
}

impl FromIterator<PeakModel> for CompositeModel {
    fn from_iter<T: IntoIterator<Item = PeakModel>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for CompositeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for component in self.iter() {
            if !first {
                f.write_str(" + ")?;
            }
            write!(f, "{component}")?;
            first = false;
        }
        Ok(())
    }
}
