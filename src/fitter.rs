//! Least-squares fitting of a [`CompositeModel`] against observed data.
//!
//! The optimization itself is delegated to the [`levenberg_marquardt`] crate.
//! This module adapts a [`Parameters`] set to it: only free parameters are
//! exposed to the optimizer, each mapped onto an unbounded internal coordinate
//! (see [`Parameter::to_internal`](crate::Parameter::to_internal)), and every
//! expression-bound parameter is recomputed whenever the free ones move. The
//! Jacobian is estimated by forward differences, one column per free parameter,
//! in parallel when the `parallelism` feature is enabled.
use cfg_if::cfg_if;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, trace, warn};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use thiserror::Error;

#[cfg(feature = "parallelism")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::composite::CompositeModel;
use crate::parameters::{ParameterError, Parameters};

/// Settings for the least-squares optimizer
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitConfig {
    /// The optimizer may evaluate the model at most `max_evaluations * (n + 1)` times
    /// for `n` free parameters
    pub max_evaluations: usize,
    /// Relative reduction of the sum of squares below which the fit is converged
    pub ftol: f64,
    /// Relative change of the parameters below which the fit is converged
    pub xtol: f64,
    /// Orthogonality between residuals and Jacobian columns below which the fit is converged
    pub gtol: f64,
    /// Relative step used for the finite difference Jacobian
    pub step_size: f64,
}

impl FitConfig {
    pub fn max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations.max(1);
        self
    }

    pub fn ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    pub fn xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }

    pub fn gtol(mut self, gtol: f64) -> Self {
        self.gtol = gtol;
        self
    }

    pub fn step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_evaluations: 200,
            ftol: 1.5e-8,
            xtol: 1.5e-8,
            gtol: 1e-10,
            step_size: f64::EPSILON.sqrt(),
        }
    }
}

/// Describe a model fitting procedure's output
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelFitResult {
    /// The sum of squared residuals at the end of the optimization run
    pub loss: f64,
    /// The number of model evaluations the optimizer requested
    pub evaluations: usize,
    /// Whether or not the optimizer reported convergence
    pub converged: bool,
    /// Whether or not the model was able to fit *at all*
    pub success: bool,
    /// Number of data points
    pub ndata: usize,
    /// Number of free parameters
    pub nvarys: usize,
    pub chi_square: f64,
    /// `chi_square / (ndata - nvarys)`
    pub reduced_chi_square: f64,
    /// The coefficient of determination, clamped to `[0, 1]`
    pub score: f64,
    /// The optimizer's reason for stopping
    pub message: String,
}

/// All the ways a fit can fail before the optimizer gets to run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("The x ({x}) and y ({y}) arrays do not match in length")]
    LengthMismatch { x: usize, y: usize },
    #[error("At least as many data points ({ndata}) as free parameters ({nvarys}) are required")]
    TooFewPoints { ndata: usize, nvarys: usize },
    #[error("The model produced non-finite values for the initial parameters")]
    NonFiniteModel,
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

/// The [`LeastSquaresProblem`] seen by the optimizer
struct ParameterProblem<'a> {
    model: &'a CompositeModel,
    x: &'a [f64],
    y: &'a [f64],
    params: Parameters,
    free: Vec<usize>,
    internal: DVector<f64>,
    residuals: Option<DVector<f64>>,
    step_size: f64,
}

impl<'a> ParameterProblem<'a> {
    fn new(
        model: &'a CompositeModel,
        x: &'a [f64],
        y: &'a [f64],
        params: Parameters,
        step_size: f64,
    ) -> Self {
        let free = params.free_indices();
        let internal = DVector::from_iterator(
            free.len(),
            free.iter().map(|i| params.at(*i).to_internal()),
        );
        let mut this = Self {
            model,
            x,
            y,
            params,
            free,
            internal,
            residuals: None,
            step_size,
        };
        this.residuals = this.compute_residuals(&this.params);
        this
    }

    fn apply_internal(
        params: &mut Parameters,
        free: &[usize],
        internal: &DVector<f64>,
    ) -> Result<(), ParameterError> {
        for (k, i) in free.iter().copied().enumerate() {
            let param = params.at_mut(i);
            let value = param.from_internal(internal[k]);
            param.set_value(value);
        }
        params.update_constraints()
    }

    fn compute_residuals(&self, params: &Parameters) -> Option<DVector<f64>> {
        match self.model.eval(params, self.x) {
            Ok(yhat) => {
                let residuals = DVector::from_iterator(
                    yhat.len(),
                    yhat.iter().zip(self.y.iter()).map(|(yhat, y)| yhat - y),
                );
                if residuals.iter().all(|r| r.is_finite()) {
                    Some(residuals)
                } else {
                    None
                }
            }
            Err(err) => {
                trace!("Model evaluation failed: {err}");
                None
            }
        }
    }

    fn jacobian_column(&self, k: usize, base: &DVector<f64>) -> Option<DVector<f64>> {
        let mut internal = self.internal.clone();
        let h = self.step_size * internal[k].abs().max(1.0);
        internal[k] += h;
        let mut params = self.params.clone();
        Self::apply_internal(&mut params, &self.free, &internal).ok()?;
        let shifted = self.compute_residuals(&params)?;
        Some((shifted - base) / h)
    }

    fn jacobian_columns(&self, base: &DVector<f64>) -> Vec<Option<DVector<f64>>> {
        cfg_if! {
            if #[cfg(feature = "parallelism")] {
                return (0..self.free.len())
                    .into_par_iter()
                    .map(|k| self.jacobian_column(k, base))
                    .collect();
            } else {
                return (0..self.free.len())
                    .map(|k| self.jacobian_column(k, base))
                    .collect();
            }
        }
    }

    /// Standard errors of the free parameters in external coordinates, from
    /// the covariance `(JᵀJ)⁻¹ · χ²ᵣ`
    fn standard_errors(&self, reduced_chi_square: f64) -> Option<Vec<f64>> {
        let jacobian = self.jacobian()?;
        let covariance = (jacobian.transpose() * &jacobian).try_inverse()? * reduced_chi_square;
        let errors = self
            .free
            .iter()
            .enumerate()
            .map(|(k, i)| {
                let scale = self.params.at(*i).internal_derivative(self.internal[k]);
                covariance[(k, k)].abs().sqrt() * scale.abs()
            })
            .collect();
        Some(errors)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for ParameterProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.internal.copy_from(x);
        self.residuals = match Self::apply_internal(&mut self.params, &self.free, x) {
            Ok(()) => self.compute_residuals(&self.params),
            Err(err) => {
                trace!("Constraint evaluation failed: {err}");
                None
            }
        };
    }

    fn params(&self) -> DVector<f64> {
        self.internal.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residuals.clone()
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let base = self.residuals.as_ref()?;
        let columns: Option<Vec<DVector<f64>>> =
            self.jacobian_columns(base).into_iter().collect();
        Some(DMatrix::from_columns(&columns?))
    }
}

fn total_sum_of_squares(y: &[f64]) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    let mean = y.iter().sum::<f64>() / y.len() as f64;
    y.iter().map(|y| (y - mean).powi(2)).sum()
}

/// Fit a [`CompositeModel`] to one observed signal
#[derive(Debug, Clone)]
pub struct LeastSquaresFitter<'a> {
    pub model: &'a CompositeModel,
    pub x: &'a [f64],
    pub y: &'a [f64],
}

impl<'a> LeastSquaresFitter<'a> {
    pub fn new(model: &'a CompositeModel, x: &'a [f64], y: &'a [f64]) -> Result<Self, FitError> {
        if x.len() != y.len() {
            return Err(FitError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }
        Ok(Self { model, x, y })
    }

    /// The model minus the observed signal
    pub fn residuals(&self, params: &Parameters) -> Result<Vec<f64>, FitError> {
        let yhat = self.model.eval(params, self.x)?;
        Ok(yhat.iter().zip(self.y).map(|(yhat, y)| yhat - y).collect())
    }

    /// Fit using the default [`FitConfig`] settings
    pub fn fit(&self, params: &mut Parameters) -> Result<ModelFitResult, FitError> {
        self.fit_with(params, FitConfig::default())
    }

    /// Optimize the free parameters of `params` in place.
    ///
    /// When nothing is free to move the model is evaluated once and the
    /// statistics of that evaluation returned.
    pub fn fit_with(
        &self,
        params: &mut Parameters,
        config: FitConfig,
    ) -> Result<ModelFitResult, FitError> {
        params.update_constraints()?;
        let ndata = self.y.len();
        let problem =
            ParameterProblem::new(self.model, self.x, self.y, params.clone(), config.step_size);
        let nvarys = problem.free.len();
        if problem.residuals.is_none() {
            // Re-evaluate to surface a missing parameter rather than a generic failure
            self.model.eval(params, self.x)?;
            return Err(FitError::NonFiniteModel);
        }
        if ndata < nvarys {
            return Err(FitError::TooFewPoints { ndata, nvarys });
        }
        debug!(
            "Fitting {} with {nvarys} free parameters over {ndata} points",
            self.model
        );

        let (problem, evaluations, converged, message) = if nvarys == 0 {
            (problem, 1, true, "No free parameters".to_string())
        } else {
            let (problem, report) = LevenbergMarquardt::new()
                .with_ftol(config.ftol)
                .with_xtol(config.xtol)
                .with_gtol(config.gtol)
                .with_patience(config.max_evaluations.max(1))
                .minimize(problem);
            trace!(
                "Optimizer stopped with {:?}, objective {}",
                report.termination,
                report.objective_function
            );
            let converged = report.termination.was_successful();
            (
                problem,
                report.number_of_evaluations,
                converged,
                format!("{:?}", report.termination),
            )
        };

        Ok(self.summarize(problem, params, evaluations, converged, message))
    }

    /// Build the fit statistics from the optimizer's final state and copy its
    /// parameters into `params`.
    ///
    /// If the final residuals are not finite `params` is left as it was.
    fn summarize(
        &self,
        problem: ParameterProblem<'_>,
        params: &mut Parameters,
        evaluations: usize,
        converged: bool,
        message: String,
    ) -> ModelFitResult {
        let ndata = self.y.len();
        let nvarys = problem.free.len();
        let Some(residuals) = problem.residuals.as_ref() else {
            warn!("Fit of {} ended on non-finite residuals", self.model);
            return ModelFitResult {
                evaluations,
                ndata,
                nvarys,
                loss: f64::INFINITY,
                chi_square: f64::INFINITY,
                reduced_chi_square: f64::INFINITY,
                message,
                ..Default::default()
            };
        };

        let chi_square = residuals.norm_squared();
        let nfree = ndata.saturating_sub(nvarys).max(1);
        let reduced_chi_square = chi_square / nfree as f64;
        let sst = total_sum_of_squares(self.y);
        let score = if sst > 0.0 {
            (1.0 - chi_square / sst).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let errors = if nvarys > 0 {
            problem.standard_errors(reduced_chi_square)
        } else {
            None
        };

        let mut fitted = problem.params;
        for param in fitted.iter_mut() {
            param.stderr = None;
        }
        if let Some(errors) = errors {
            for (i, err) in problem.free.iter().zip(errors) {
                fitted.at_mut(*i).stderr = Some(err);
            }
        }
        *params = fitted;

        debug!(
            "Fit finished after {evaluations} evaluations: chi-square {chi_square:0.3}, reduced {reduced_chi_square:0.3} ({message})"
        );
        ModelFitResult {
            loss: chi_square,
            evaluations,
            converged,
            success: true,
            ndata,
            nvarys,
            chi_square,
            reduced_chi_square,
            score,
            message,
        }
    }
}

/// Fit `model` to `y` over `x`, updating `params` in place
pub fn fit(
    model: &CompositeModel,
    params: &mut Parameters,
    x: &[f64],
    y: &[f64],
    config: FitConfig,
) -> Result<ModelFitResult, FitError> {
    LeastSquaresFitter::new(model, x, y)?.fit_with(params, config)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arrayops::gridspace;
    use crate::composite::PeakModel;
    use crate::parameters::ParameterUpdate;
    use crate::shapes::{PeakShapeKind, PseudoVoigtShape};

    fn two_peaks() -> (Vec<f64>, Vec<f64>) {
        let x = gridspace(280.0, 292.0, 0.05);
        let a = PseudoVoigtShape::new(4000.0, 284.8, 0.6, 0.5);
        let b = PseudoVoigtShape::new(1500.0, 286.5, 0.7, 0.5);
        let y = x
            .iter()
            .enumerate()
            .map(|(i, x)| a.density(*x) + b.density(*x) + 3.0 * ((i as f64) * 0.7).sin())
            .collect();
        (x, y)
    }

    fn model_and_params() -> (CompositeModel, Parameters) {
        let mut params = Parameters::new();
        let mut composite = CompositeModel::default();
        for (prefix, center) in [("p0_", 284.6), ("p1_", 286.8)] {
            let mut model = PeakModel::new(prefix, PeakShapeKind::PseudoVoigt);
            model.set_param_hint("sigma", ParameterUpdate::new().value(1.0).min(1e-5).max(5.0));
            model.set_param_hint("amplitude", ParameterUpdate::new().value(2000.0).min(0.0));
            model.set_param_hint("center", ParameterUpdate::new().value(center));
            model.set_param_hint("fraction", ParameterUpdate::new().vary(false));
            params.merge(model.make_params().unwrap());
            composite.push(model);
        }
        (composite, params)
    }

    #[test_log::test]
    fn test_fit_two_peaks() {
        let (x, y) = two_peaks();
        let (model, mut params) = model_and_params();
        let result = fit(&model, &mut params, &x, &y, FitConfig::default()).unwrap();
        log::info!("{result:?}\n{params}");

        assert!(result.success);
        assert_eq!(result.nvarys, 6);
        assert!(result.score > 0.99, "score {}", result.score);

        let c0 = params.value("p0_center").unwrap();
        let c1 = params.value("p1_center").unwrap();
        assert!((c0 - 284.8).abs() < 0.02, "p0_center {c0}");
        assert!((c1 - 286.5).abs() < 0.05, "p1_center {c1}");
        let a0 = params.value("p0_amplitude").unwrap();
        assert!((a0 - 4000.0).abs() / 4000.0 < 0.05, "p0_amplitude {a0}");
        // derived parameters follow the fitted ones
        let fwhm = params.value("p0_fwhm").unwrap();
        assert!((fwhm - 2.0 * params.value("p0_sigma").unwrap()).abs() < 1e-12);
        // fixed parameters stay put and carry no error estimate
        let fraction = params.get("p0_fraction").unwrap();
        assert_eq!(fraction.value(), 0.5);
        assert!(fraction.stderr.is_none());
        assert!(params.get("p0_center").unwrap().stderr.is_some());
    }

    #[test]
    fn test_fit_with_expression() {
        let (x, y) = two_peaks();
        let (model, mut params) = model_and_params();
        params
            .set("p1_sigma", &ParameterUpdate::new().expr("p0_sigma"))
            .unwrap();
        let result = fit(&model, &mut params, &x, &y, FitConfig::default()).unwrap();
        assert_eq!(result.nvarys, 5);
        assert_eq!(
            params.value("p1_sigma").unwrap(),
            params.value("p0_sigma").unwrap()
        );
    }

    #[test]
    fn test_bounds_respected() {
        let (x, y) = two_peaks();
        let (model, mut params) = model_and_params();
        params
            .set("p0_sigma", &ParameterUpdate::new().max(0.5))
            .unwrap();
        fit(&model, &mut params, &x, &y, FitConfig::default()).unwrap();
        assert!(params.value("p0_sigma").unwrap() <= 0.5);
    }

    #[test]
    fn test_nothing_free() {
        let (x, y) = two_peaks();
        let (model, mut params) = model_and_params();
        let names: Vec<String> = params.names().map(String::from).collect();
        for name in names {
            params.get_mut(&name).unwrap().vary = false;
        }
        let before = params.clone();
        let result = fit(&model, &mut params, &x, &y, FitConfig::default()).unwrap();
        assert_eq!(result.nvarys, 0);
        assert_eq!(result.evaluations, 1);
        assert_eq!(
            params.value("p0_center").unwrap(),
            before.value("p0_center").unwrap()
        );
    }

    #[test]
    fn test_evaluation_limit() {
        let (x, y) = two_peaks();
        let (model, mut params) = model_and_params();
        let result = fit(
            &model,
            &mut params,
            &x,
            &y,
            FitConfig::default().max_evaluations(1),
        )
        .unwrap();
        assert!(!result.converged);
        assert!(result.success);
        assert!(!result.message.is_empty());
        assert!(result.chi_square.is_finite());
        assert!(params.iter().all(|p| p.value().is_finite()));
    }

    #[test]
    fn test_non_finite_final_state() {
        let (x, y) = two_peaks();
        let (model, mut params) = model_and_params();
        let fitter = LeastSquaresFitter::new(&model, &x, &y).unwrap();
        let mut problem =
            ParameterProblem::new(&model, &x, &y, params.clone(), FitConfig::default().step_size);
        assert!(problem.residuals.is_some());
        let nan = DVector::from_element(problem.free.len(), f64::NAN);
        problem.set_params(&nan);
        assert!(problem.residuals.is_none());

        let before = params.clone();
        let result = fitter.summarize(problem, &mut params, 12, false, "diverged".to_string());
        assert!(!result.success);
        assert!(!result.converged);
        assert_eq!(result.evaluations, 12);
        assert_eq!(result.nvarys, 6);
        assert!(result.chi_square.is_infinite());
        assert_eq!(params, before);

        // non-finite data is refused before the optimizer runs
        let mut bad = y.clone();
        bad[3] = f64::NAN;
        let err = fit(&model, &mut params, &x, &bad, FitConfig::default()).unwrap_err();
        assert_eq!(err, FitError::NonFiniteModel);
    }

    #[test]
    fn test_fit_errors() {
        let (model, mut params) = model_and_params();
        let err = fit(&model, &mut params, &[1.0, 2.0], &[1.0], FitConfig::default()).unwrap_err();
        assert_eq!(err, FitError::LengthMismatch { x: 2, y: 1 });

        let err = fit(
            &model,
            &mut params,
            &[284.0, 285.0],
            &[1.0, 2.0],
            FitConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, FitError::TooFewPoints { ndata: 2, nvarys: 6 });

        let mut empty = Parameters::new();
        let err = fit(&model, &mut empty, &[1.0], &[1.0], FitConfig::default()).unwrap_err();
        assert_eq!(
            err,
            FitError::Parameter(ParameterError::NotFound("p0_amplitude".to_string()))
        );
    }
}
