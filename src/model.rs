//! The peak model bookkeeping for one [`Region`].
//!
//! [`RegionFitModel`] keeps one [`PeakModel`] per peak, keyed by the peak's
//! prefix, and a single shared [`Parameters`] set holding every peak's
//! parameters. The [`CompositeModel`] summing all peaks is built lazily on first
//! use and discarded whenever a peak is added or removed.
//!
//! Callers speak in physical peak quantities ([`PeakAttribute`]: area, FWHM and
//! center). These are translated to and from the underlying model parameters,
//! e.g. a pseudo-Voigt FWHM is twice its `sigma` parameter, so a FWHM bound of
//! `[1, 3]` is stored as a `sigma` bound of `[0.5, 1.5]`.
use std::cell::OnceCell;
use std::fmt;
use std::str::FromStr;

use log::{debug, error, warn};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::arrayops::subtract_in_place;
use crate::composite::{CompositeModel, PeakModel};
use crate::fitter::{fit, FitConfig, FitError, ModelFitResult};
use crate::parameters::{ParameterError, ParameterUpdate, Parameters};
use crate::region::{Peak, PeakId, Region, RegionId};
use crate::shapes::{ParameterMapping, PeakAttribute, PeakShapeKind};

/// All the ways region model bookkeeping can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegionFitError {
    #[error("Peak {peak} does not belong to region {region}")]
    PeakNotInRegion { peak: PeakId, region: RegionId },
    #[error("Peak {peak} is not in the model of region {region}")]
    PeakNotInModel { peak: PeakId, region: RegionId },
    #[error("Model of region {expected} was given region {found}")]
    RegionMismatch { expected: RegionId, found: RegionId },
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// The physical quantities describing a peak
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeakValues {
    pub area: f64,
    pub fwhm: f64,
    pub center: f64,
}

impl PeakValues {
    pub fn new(area: f64, fwhm: f64, center: f64) -> Self {
        Self { area, fwhm, center }
    }

    pub fn get(&self, attribute: PeakAttribute) -> f64 {
        match attribute {
            PeakAttribute::Area => self.area,
            PeakAttribute::Fwhm => self.fwhm,
            PeakAttribute::Center => self.center,
        }
    }
}

/// Which part of a constraint to read back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintField {
    Min,
    Max,
    Vary,
    Expr,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown constraint field \"{0}\"")]
pub struct UnknownConstraintFieldError(pub String);

impl FromStr for ConstraintField {
    type Err = UnknownConstraintFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "vary" => Ok(Self::Vary),
            "expr" => Ok(Self::Expr),
            "value" => Ok(Self::Value),
            _ => Err(UnknownConstraintFieldError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintValue {
    Number(f64),
    Flag(bool),
    Expr(String),
}

impl fmt::Display for ConstraintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Flag(v) => write!(f, "{v}"),
            Self::Expr(v) => f.write_str(v),
        }
    }
}

/// The constraints on one peak attribute, in physical units
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeakConstraints {
    pub min: f64,
    pub max: f64,
    pub vary: bool,
    /// The constraint expression, empty when there is none
    pub expr: String,
    pub value: f64,
}

impl PeakConstraints {
    pub fn get(&self, field: ConstraintField) -> ConstraintValue {
        match field {
            ConstraintField::Min => ConstraintValue::Number(self.min),
            ConstraintField::Max => ConstraintValue::Number(self.max),
            ConstraintField::Vary => ConstraintValue::Flag(self.vary),
            ConstraintField::Expr => ConstraintValue::Expr(self.expr.clone()),
            ConstraintField::Value => ConstraintValue::Number(self.value),
        }
    }
}

/// Translate an update given in attribute units into parameter units
fn scale_update(update: ParameterUpdate, mapping: ParameterMapping) -> ParameterUpdate {
    if mapping.is_identity() {
        return update;
    }
    ParameterUpdate {
        value: update.value.map(|v| mapping.to_parameter(v)),
        min: update.min.map(|v| mapping.to_parameter(v)),
        max: update.max.map(|v| mapping.to_parameter(v)),
        vary: update.vary,
        expr: update.expr.map(|expr| {
            if expr.trim().is_empty() {
                expr
            } else {
                format!("({}) / {}", expr.trim(), mapping.scale)
            }
        }),
    }
}

/// Undo the expression wrapping done by [`scale_update`]
fn unscale_expression(source: &str, mapping: ParameterMapping) -> String {
    if mapping.is_identity() {
        return source.to_string();
    }
    let suffix = format!(") / {}", mapping.scale);
    source
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(suffix.as_str()))
        .unwrap_or(source)
        .to_string()
}

/// Manages the peak models of a region and fits them jointly
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionFitModel {
    region_id: RegionId,
    models: Vec<PeakModel>,
    params: Parameters,
    #[cfg_attr(feature = "serde", serde(skip))]
    total_model: OnceCell<Option<CompositeModel>>,
}

impl RegionFitModel {
    pub fn new(region_id: RegionId) -> Self {
        Self {
            region_id,
            models: Vec::new(),
            params: Parameters::new(),
            total_model: OnceCell::new(),
        }
    }

    pub fn for_region(region: &Region) -> Self {
        Self::new(region.id)
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    /// The shared parameter set of all peaks
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn models(&self) -> std::slice::Iter<'_, PeakModel> {
        self.models.iter()
    }

    pub fn contains(&self, peak: &Peak) -> bool {
        self.position(&peak.prefix).is_some()
    }

    fn position(&self, prefix: &str) -> Option<usize> {
        self.models.iter().position(|m| m.prefix() == prefix)
    }

    pub fn peak_model(&self, peak: &Peak) -> Option<&PeakModel> {
        self.position(&peak.prefix).map(|i| &self.models[i])
    }

    fn require_model(&self, peak: &Peak) -> Result<&PeakModel, RegionFitError> {
        self.peak_model(peak).ok_or_else(|| {
            error!(
                "peak {} not in model of region {}",
                peak.id, self.region_id
            );
            RegionFitError::PeakNotInModel {
                peak: peak.id,
                region: self.region_id,
            }
        })
    }

    fn require_model_mut(&mut self, peak: &Peak) -> Result<&mut PeakModel, RegionFitError> {
        match self.position(&peak.prefix) {
            Some(i) => Ok(&mut self.models[i]),
            None => {
                error!(
                    "peak {} not in model of region {}",
                    peak.id, self.region_id
                );
                Err(RegionFitError::PeakNotInModel {
                    peak: peak.id,
                    region: self.region_id,
                })
            }
        }
    }

    fn check_region(&self, region: &Region) -> Result<(), RegionFitError> {
        if region.id != self.region_id {
            error!(
                "model of region {} was given region {}",
                self.region_id, region.id
            );
            return Err(RegionFitError::RegionMismatch {
                expected: self.region_id,
                found: region.id,
            });
        }
        Ok(())
    }

    /// The sum of all peak models, or `None` when there are no peaks.
    ///
    /// Built on first access after any add or remove.
    pub fn total_model(&self) -> Option<&CompositeModel> {
        self.total_model
            .get_or_init(|| {
                if self.models.is_empty() {
                    None
                } else {
                    debug!("Rebuilding composite model of region {}", self.region_id);
                    Some(self.models.iter().cloned().collect())
                }
            })
            .as_ref()
    }

    fn invalidate(&mut self) {
        self.total_model = OnceCell::new();
    }

    /// Add a model for `peak`, replacing any model it already had.
    ///
    /// The peak must belong to this model's region.
    pub fn add_peak(&mut self, peak: &Peak) -> Result<(), RegionFitError> {
        if peak.region_id != self.region_id {
            error!(
                "peak with ID {} does not belong to region ID {}",
                peak.id, self.region_id
            );
            return Err(RegionFitError::PeakNotInRegion {
                peak: peak.id,
                region: self.region_id,
            });
        }

        let model = match peak.model_name {
            PeakShapeKind::PseudoVoigt => {
                let mut model = PeakModel::new(peak.prefix.as_str(), peak.model_name);
                model.set_param_hint(
                    "sigma",
                    ParameterUpdate::new().value(2.0).min(1e-5).max(5.0),
                );
                model.set_param_hint("amplitude", ParameterUpdate::new().value(2000.0).min(0.0));
                model.set_param_hint("fraction", ParameterUpdate::new().vary(false));
                model
            }
        };

        match self.position(&peak.prefix) {
            Some(i) => self.models[i] = model,
            None => self.models.push(model),
        }
        debug!("Added {} model for peak {}", peak.model_name, peak.id);
        self.invalidate();
        Ok(())
    }

    /// Drop the model of `peak` and every parameter carrying its prefix
    pub fn remove_peak(&mut self, peak: &Peak) -> Result<(), RegionFitError> {
        let Some(i) = self.position(&peak.prefix) else {
            error!(
                "peak {} not in model of region {}",
                peak.id, self.region_id
            );
            return Err(RegionFitError::PeakNotInModel {
                peak: peak.id,
                region: self.region_id,
            });
        };
        self.models.remove(i);
        let removed = self.params.remove_prefixed(&peak.prefix);
        let removed_names: Vec<&str> = removed.iter().map(|p| p.name.as_str()).collect();
        for name in self.params.release_references(&removed_names) {
            warn!(
                "{name} was tied to removed peak {}, its expression was cleared",
                peak.id
            );
        }
        debug!(
            "Removed peak {} and {} parameters",
            peak.id,
            removed.len()
        );
        self.invalidate();
        Ok(())
    }

    /// Seed the parameters of `peak` from user chosen physical values,
    /// adding the peak first if needed
    pub fn init_params(&mut self, peak: &Peak, values: PeakValues) -> Result<(), RegionFitError> {
        if !self.contains(peak) {
            self.add_peak(peak)?;
        }
        let kind = peak.model_name;
        let model = self.require_model_mut(peak)?;
        for attribute in [PeakAttribute::Area, PeakAttribute::Fwhm, PeakAttribute::Center] {
            let mapping = kind.parameter_for(attribute);
            model.set_param_hint(
                mapping.name,
                ParameterUpdate::new().value(mapping.to_parameter(values.get(attribute))),
            );
        }
        let params = model.make_params()?;
        self.params.merge(params);
        Ok(())
    }

    /// Estimate the parameters of `peak` from what the other peaks leave of the
    /// region's signal, adding the peak first if needed.
    ///
    /// Other peaks without parameters yet are ignored.
    pub fn guess_params(&mut self, region: &Region, peak: &Peak) -> Result<(), RegionFitError> {
        self.check_region(region)?;
        if !self.contains(peak) {
            self.add_peak(peak)?;
        }

        let mut remainder = region.signal();
        for other in region.peaks.iter() {
            if other.id == peak.id {
                continue;
            }
            let Some(other_model) = self.peak_model(other) else {
                continue;
            };
            match other_model.eval(&self.params, &region.energy) {
                Ok(cps) => subtract_in_place(&mut remainder, &cps),
                Err(err) => debug!("Skipping peak {} while guessing: {err}", other.id),
            }
        }

        let params = self.require_model(peak)?.guess(&remainder, &region.energy)?;
        self.params.merge(params);
        Ok(())
    }

    /// Fit with the default [`FitConfig`]
    pub fn fit(&mut self, region: &mut Region) -> Result<Option<ModelFitResult>, RegionFitError> {
        self.fit_with(region, FitConfig::default())
    }

    /// Fit all peaks jointly to the background-subtracted signal and write the
    /// fitted area, FWHM and center back into the region's peaks.
    ///
    /// Returns `None` without doing anything when there are no peaks.
    pub fn fit_with(
        &mut self,
        region: &mut Region,
        config: FitConfig,
    ) -> Result<Option<ModelFitResult>, RegionFitError> {
        self.check_region(region)?;
        let Some(model) = self.total_model() else {
            return Ok(None);
        };
        let signal = region.signal();
        let mut params = self.params.clone();
        let result = fit(model, &mut params, &region.energy, &signal, config)?;
        self.params = params;

        for peak in region.peaks.iter_mut() {
            if !self.contains(peak) {
                warn!("peak {} has no model, leaving it untouched", peak.id);
                continue;
            }
            let values = self.peak_values(peak)?;
            peak.set_params_from_model(values.area, values.fwhm, values.center);
        }
        Ok(Some(result))
    }

    /// The current physical values of `peak` according to the parameters
    pub fn peak_values(&self, peak: &Peak) -> Result<PeakValues, RegionFitError> {
        let model = self.require_model(peak)?;
        let kind = model.kind();
        let read = |attribute: PeakAttribute| -> Result<f64, RegionFitError> {
            let mapping = kind.parameter_for(attribute);
            let value = self.params.value(&model.param_name(mapping.name))?;
            Ok(mapping.to_attribute(value))
        };
        Ok(PeakValues::new(
            read(PeakAttribute::Area)?,
            read(PeakAttribute::Fwhm)?,
            read(PeakAttribute::Center)?,
        ))
    }

    /// Evaluate the model of a single peak over the region's energy axis
    pub fn get_peak_cps(&self, region: &Region, peak: &Peak) -> Result<Vec<f64>, RegionFitError> {
        self.check_region(region)?;
        let model = self.require_model(peak)?;
        Ok(model.eval(&self.params, &region.energy)?)
    }

    /// Evaluate the sum of all peaks over the region's energy axis, zeros when
    /// there are no peaks
    pub fn get_cps(&self, region: &Region) -> Result<Vec<f64>, RegionFitError> {
        self.check_region(region)?;
        match self.total_model() {
            Some(model) => Ok(model.eval(&self.params, &region.energy)?),
            None => Ok(vec![0.0; region.energy.len()]),
        }
    }

    /// Constrain a physical attribute of `peak`.
    ///
    /// `update` is given in attribute units, e.g. FWHM bounds for
    /// [`PeakAttribute::Fwhm`], and converted to the parameter's units.
    pub fn add_constraint(
        &mut self,
        peak: &Peak,
        attribute: PeakAttribute,
        update: ParameterUpdate,
    ) -> Result<(), RegionFitError> {
        let model = self.require_model(peak)?;
        let mapping = model.kind().parameter_for(attribute);
        let name = model.param_name(mapping.name);
        let update = scale_update(update, mapping);
        debug!("Constraining {name} with {update:?}");
        self.params.set(&name, &update)?;
        Ok(())
    }

    /// Read back every constraint of a physical attribute of `peak`, in
    /// attribute units
    pub fn get_constraints(
        &self,
        peak: &Peak,
        attribute: PeakAttribute,
    ) -> Result<PeakConstraints, RegionFitError> {
        let model = self.require_model(peak)?;
        let mapping = model.kind().parameter_for(attribute);
        let name = model.param_name(mapping.name);
        let param = self
            .params
            .get(&name)
            .ok_or(ParameterError::NotFound(name))?;
        Ok(PeakConstraints {
            min: mapping.to_attribute(param.min),
            max: mapping.to_attribute(param.max),
            vary: param.vary,
            expr: param
                .expr()
                .map(|expr| unscale_expression(expr.source(), mapping))
                .unwrap_or_default(),
            value: mapping.to_attribute(param.value()),
        })
    }

    /// Read back one constraint field of a physical attribute of `peak`
    pub fn get_constraint(
        &self,
        peak: &Peak,
        attribute: PeakAttribute,
        field: ConstraintField,
    ) -> Result<ConstraintValue, RegionFitError> {
        Ok(self.get_constraints(peak, attribute)?.get(field))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data::{synthetic_region, TRUE_PEAKS};

    fn seeded() -> (Region, RegionFitModel) {
        let region = synthetic_region();
        let mut model = RegionFitModel::for_region(&region);
        for (peak, truth) in region.peaks.iter().zip(TRUE_PEAKS.iter()) {
            model
                .init_params(
                    peak,
                    PeakValues::new(truth.area * 0.7, truth.fwhm * 1.3, truth.center + 0.2),
                )
                .unwrap();
        }
        (region, model)
    }

    #[test_log::test]
    fn test_fit_region() {
        let (mut region, mut model) = seeded();
        let result = model.fit(&mut region).unwrap().unwrap();
        log::info!("{result:?}");
        assert!(result.success);
        assert!(result.score > 0.99, "score {}", result.score);

        for (peak, truth) in region.peaks.iter().zip(TRUE_PEAKS.iter()) {
            assert!(
                (peak.center - truth.center).abs() < 0.05,
                "{peak} vs {truth:?}"
            );
            assert!(
                (peak.fwhm - truth.fwhm).abs() / truth.fwhm < 0.05,
                "{peak} vs {truth:?}"
            );
            assert!(
                (peak.area - truth.area).abs() / truth.area < 0.05,
                "{peak} vs {truth:?}"
            );
        }

        let total = model.get_cps(&region).unwrap();
        let first = model.get_peak_cps(&region, &region.peaks[0]).unwrap();
        let second = model.get_peak_cps(&region, &region.peaks[1]).unwrap();
        for i in 0..total.len() {
            assert!((total[i] - first[i] - second[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fit_without_peaks() {
        let mut region = synthetic_region();
        let mut model = RegionFitModel::for_region(&region);
        assert!(model.fit(&mut region).unwrap().is_none());
        assert!(model.total_model().is_none());
        assert_eq!(model.get_cps(&region).unwrap(), vec![0.0; region.len()]);
    }

    #[test]
    fn test_add_peak_hints() {
        let region = synthetic_region();
        let mut model = RegionFitModel::for_region(&region);
        let peak = &region.peaks[0];
        model.add_peak(peak).unwrap();
        assert!(model.contains(peak));
        // no parameters until they are initialized or guessed
        assert!(model.params().is_empty());

        let sigma = model.peak_model(peak).unwrap().param_hint("sigma").unwrap();
        assert_eq!(sigma.value, Some(2.0));
        assert_eq!((sigma.min, sigma.max), (Some(1e-5), Some(5.0)));

        // adding again replaces the model, it does not duplicate it
        model.add_peak(peak).unwrap();
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_peak_from_other_region() {
        let region = synthetic_region();
        let mut other = Region::new(region.id + 1, vec![0.0], vec![0.0]).unwrap();
        let id = other.add_peak(PeakShapeKind::PseudoVoigt);
        let mut model = RegionFitModel::for_region(&region);
        let err = model.add_peak(other.peak(id).unwrap()).unwrap_err();
        assert_eq!(
            err,
            RegionFitError::PeakNotInRegion {
                peak: id,
                region: region.id
            }
        );
        let err = model.get_cps(&other).unwrap_err();
        assert!(matches!(err, RegionFitError::RegionMismatch { .. }));
    }

    #[test]
    fn test_remove_peak() {
        let (region, mut model) = seeded();
        assert_eq!(model.total_model().map(|m| m.len()), Some(2));
        let peak = &region.peaks[0];
        model.remove_peak(peak).unwrap();
        assert!(!model.contains(peak));
        assert!(model.params().names().all(|n| !n.starts_with(&peak.prefix)));
        assert!(model.params().contains("p1_center"));
        assert_eq!(model.total_model().map(|m| m.len()), Some(1));

        let err = model.remove_peak(peak).unwrap_err();
        assert_eq!(
            err,
            RegionFitError::PeakNotInModel {
                peak: peak.id,
                region: region.id
            }
        );
        assert!(model.get_peak_cps(&region, peak).is_err());
    }

    #[test]
    fn test_init_params_mapping() {
        let region = synthetic_region();
        let mut model = RegionFitModel::for_region(&region);
        let peak = &region.peaks[1];
        model
            .init_params(peak, PeakValues::new(1234.0, 1.6, 286.4))
            .unwrap();
        let params = model.params();
        assert_eq!(params.value("p1_amplitude").unwrap(), 1234.0);
        assert_eq!(params.value("p1_sigma").unwrap(), 0.8);
        assert_eq!(params.value("p1_center").unwrap(), 286.4);
        assert!(!params.get("p1_fraction").unwrap().vary);
        let varying: Vec<_> = params.varying().map(|p| p.name.as_str()).collect();
        assert_eq!(varying, vec!["p1_amplitude", "p1_center", "p1_sigma"]);
        assert_eq!(
            model.peak_values(peak).unwrap(),
            PeakValues::new(1234.0, 1.6, 286.4)
        );
    }

    #[test]
    fn test_guess_params() {
        let (mut region, mut model) = seeded();
        model.fit(&mut region).unwrap();
        let peak = &region.peaks[1];
        model.guess_params(&region, peak).unwrap();
        let center = model.peak_values(peak).unwrap().center;
        assert!(
            (center - TRUE_PEAKS[1].center).abs() < 0.5,
            "guessed center {center}"
        );

        // a fresh model guesses without any other peak parameters present
        let mut fresh = RegionFitModel::for_region(&region);
        fresh.guess_params(&region, &region.peaks[0]).unwrap();
        assert!(fresh.contains(&region.peaks[0]));
        assert!(fresh.params().contains("p0_sigma"));
    }

    #[test]
    fn test_fwhm_constraints() {
        let (region, mut model) = seeded();
        let peak = &region.peaks[0];
        model
            .add_constraint(
                peak,
                PeakAttribute::Fwhm,
                ParameterUpdate::new().min(0.5).max(3.0),
            )
            .unwrap();
        let sigma = model.params().get("p0_sigma").unwrap();
        assert_eq!((sigma.min, sigma.max), (0.25, 1.5));

        let constraints = model.get_constraints(peak, PeakAttribute::Fwhm).unwrap();
        assert_eq!((constraints.min, constraints.max), (0.5, 3.0));
        assert_eq!(constraints.expr, "");
        assert_eq!(
            model
                .get_constraint(peak, PeakAttribute::Fwhm, ConstraintField::Max)
                .unwrap(),
            ConstraintValue::Number(3.0)
        );

        let other = &region.peaks[1];
        model
            .add_constraint(
                other,
                PeakAttribute::Fwhm,
                ParameterUpdate::new().expr("p0_fwhm * 1.5"),
            )
            .unwrap();
        let sigma = model.params().get("p1_sigma").unwrap();
        assert_eq!(sigma.expr().unwrap().source(), "(p0_fwhm * 1.5) / 2");
        assert!(
            (sigma.value() - model.params().value("p0_sigma").unwrap() * 1.5).abs() < 1e-12
        );
        assert_eq!(
            model
                .get_constraint(other, PeakAttribute::Fwhm, ConstraintField::Expr)
                .unwrap(),
            ConstraintValue::Expr("p0_fwhm * 1.5".to_string())
        );
        assert_eq!(
            model
                .get_constraint(other, PeakAttribute::Fwhm, ConstraintField::Vary)
                .unwrap(),
            ConstraintValue::Flag(false)
        );
    }

    #[test]
    fn test_center_and_area_constraints() {
        let (mut region, mut model) = seeded();
        let (first, second) = (region.peaks[0].clone(), region.peaks[1].clone());
        model
            .add_constraint(
                &second,
                PeakAttribute::Center,
                ParameterUpdate::new().expr("p0_center + 1.7"),
            )
            .unwrap();
        model
            .add_constraint(&first, PeakAttribute::Area, ParameterUpdate::new().min(0.0).max(1e5))
            .unwrap();
        let constraints = model.get_constraints(&second, PeakAttribute::Center).unwrap();
        assert_eq!(constraints.expr, "p0_center + 1.7");
        assert_eq!(constraints.min, f64::NEG_INFINITY);

        model.fit(&mut region).unwrap();
        let (c0, c1) = (region.peaks[0].center, region.peaks[1].center);
        assert!((c1 - c0 - 1.7).abs() < 1e-9);
        assert!(region.peaks[0].area <= 1e5);

        // vary=true releases the expression again
        model
            .add_constraint(&second, PeakAttribute::Center, ParameterUpdate::new().vary(true))
            .unwrap();
        assert_eq!(
            model
                .get_constraint(&second, PeakAttribute::Center, ConstraintField::Expr)
                .unwrap()
                .to_string(),
            ""
        );
    }

    #[test]
    fn test_bad_constraints() {
        let (region, mut model) = seeded();
        let peak = &region.peaks[0];
        let err = model
            .add_constraint(peak, PeakAttribute::Center, ParameterUpdate::new().expr("p9_center"))
            .unwrap_err();
        assert!(matches!(
            err,
            RegionFitError::Parameter(ParameterError::UnknownReference { .. })
        ));
        assert!(model
            .get_constraints(peak, PeakAttribute::Center)
            .unwrap()
            .expr
            .is_empty());

        let mut untracked = region.clone();
        let id = untracked.add_peak(PeakShapeKind::PseudoVoigt);
        let err = model
            .add_constraint(untracked.peak(id).unwrap(), PeakAttribute::Area, ParameterUpdate::new().min(0.0))
            .unwrap_err();
        assert!(matches!(err, RegionFitError::PeakNotInModel { .. }));

        // added but never initialized
        let lonely = untracked.peak(id).unwrap().clone();
        model.add_peak(&lonely).unwrap();
        let err = model
            .get_constraints(&lonely, PeakAttribute::Area)
            .unwrap_err();
        assert_eq!(
            err,
            RegionFitError::Parameter(ParameterError::NotFound("p2_amplitude".to_string()))
        );
    }

    #[test]
    fn test_tied_values_follow_base_changes() {
        let (region, mut model) = seeded();
        let (first, second) = (&region.peaks[0], &region.peaks[1]);
        model
            .add_constraint(
                second,
                PeakAttribute::Center,
                ParameterUpdate::new().expr("p0_center + 1.7"),
            )
            .unwrap();
        model
            .add_constraint(first, PeakAttribute::Center, ParameterUpdate::new().value(290.0))
            .unwrap();
        assert!((model.params().value("p1_center").unwrap() - 291.7).abs() < 1e-9);
        assert_eq!(
            model
                .get_constraint(second, PeakAttribute::Center, ConstraintField::Value)
                .unwrap(),
            ConstraintValue::Number(model.params().value("p1_center").unwrap())
        );

        // the second peak's profile is now centered on the tied value
        let cps = model.get_peak_cps(&region, second).unwrap();
        let (apex, _) = cps
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, y)| if *y > acc.1 { (i, *y) } else { acc });
        assert!((region.energy[apex] - 291.7).abs() < 0.05);

        // derived parameters follow a width change
        model
            .add_constraint(first, PeakAttribute::Fwhm, ParameterUpdate::new().value(2.2))
            .unwrap();
        assert!((model.params().value("p0_fwhm").unwrap() - 2.2).abs() < 1e-9);

        // re-seeding a peak moves everything tied to it
        model
            .init_params(first, PeakValues::new(4000.0, 1.0, 283.0))
            .unwrap();
        assert!((model.params().value("p1_center").unwrap() - 284.7).abs() < 1e-9);
    }

    #[test]
    fn test_constrain_after_removing_tied_peak() {
        let (mut region, mut model) = seeded();
        let (first, second) = (region.peaks[0].clone(), region.peaks[1].clone());
        model
            .add_constraint(&second, PeakAttribute::Fwhm, ParameterUpdate::new().expr("p0_fwhm"))
            .unwrap();
        let width = model.params().value("p1_sigma").unwrap();
        model.remove_peak(&first).unwrap();

        let constraints = model.get_constraints(&second, PeakAttribute::Fwhm).unwrap();
        assert_eq!(constraints.expr, "");
        assert_eq!(model.params().value("p1_sigma").unwrap(), width);

        model
            .add_constraint(
                &second,
                PeakAttribute::Center,
                ParameterUpdate::new().expr("286 + 0.4"),
            )
            .unwrap();
        assert!((model.params().value("p1_center").unwrap() - 286.4).abs() < 1e-9);
        region.remove_peak(first.id);
        assert!(model.fit(&mut region).unwrap().is_some());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_keeps_constraints() {
        let (region, mut model) = seeded();
        model
            .add_constraint(
                &region.peaks[1],
                PeakAttribute::Fwhm,
                ParameterUpdate::new().expr("p0_fwhm"),
            )
            .unwrap();
        let text = serde_json::to_string(&model).unwrap();
        let restored: RegionFitModel = serde_json::from_str(&text).unwrap();
        assert!(restored.params().names().eq(model.params().names()));
        assert_eq!(
            restored
                .get_constraint(&region.peaks[1], PeakAttribute::Fwhm, ConstraintField::Expr)
                .unwrap(),
            ConstraintValue::Expr("p0_fwhm".to_string())
        );
        assert_eq!(
            restored.params().get("p0_center").unwrap().max,
            f64::INFINITY
        );
        assert_eq!(restored.total_model().map(|m| m.len()), Some(2));
        let expected = model.get_cps(&region).unwrap();
        let found = restored.get_cps(&region).unwrap();
        for (a, b) in expected.iter().zip(found.iter()) {
            assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0));
        }
    }

    #[rstest::rstest]
    #[case("min", ConstraintField::Min)]
    #[case("max", ConstraintField::Max)]
    #[case("expr", ConstraintField::Expr)]
    #[case("vary", ConstraintField::Vary)]
    #[case("value", ConstraintField::Value)]
    fn test_constraint_field_names(#[case] name: &str, #[case] field: ConstraintField) {
        assert_eq!(name.parse::<ConstraintField>().unwrap(), field);
    }

    #[test]
    fn test_unknown_constraint_field() {
        let err = "bounds".parse::<ConstraintField>().unwrap_err();
        assert_eq!(err, UnknownConstraintFieldError("bounds".to_string()));
        assert_eq!(err.to_string(), "Unknown constraint field \"bounds\"");
    }
}
