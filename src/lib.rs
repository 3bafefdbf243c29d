//! `xpsfit` fits overlapping peak shapes jointly against a measured spectrum
//! region, energy against counts per second, as done when analysing
//! photoelectron spectra.
//!
//! A [`Region`] holds the measured data, its background and the [`Peak`]s placed
//! on it. A [`RegionFitModel`] keeps one pseudo-Voigt model per peak over one
//! shared [`Parameters`] set, lets callers seed, guess and constrain peaks in
//! physical units (area, FWHM and center), and runs a Levenberg-Marquardt fit of
//! all peaks at once against the background-subtracted signal.
//!
//! # Usage
//! ```
//! use xpsfit::{PeakShapeKind, PeakValues, Region, RegionFitModel, ParameterUpdate, PeakAttribute};
//! use xpsfit::arrayops::gridspace;
//! use xpsfit::shapes::PseudoVoigtShape;
//!
//! let energy = gridspace(528.0, 536.0, 0.05);
//! let truth = PseudoVoigtShape::new(2500.0, 531.2, 0.6, 0.5);
//! let cps = truth.predict(&energy);
//!
//! let mut region = Region::new(0, energy, cps).unwrap();
//! let peak_id = region.add_peak(PeakShapeKind::PseudoVoigt);
//!
//! let mut model = RegionFitModel::for_region(&region);
//! let peak = region.peak(peak_id).unwrap().clone();
//! model.init_params(&peak, PeakValues::new(2000.0, 1.5, 531.0)).unwrap();
//! model
//!     .add_constraint(&peak, PeakAttribute::Fwhm, ParameterUpdate::new().min(0.5).max(3.0))
//!     .unwrap();
//!
//! let result = model.fit(&mut region).unwrap().unwrap();
//! assert!(result.success);
//! let peak = region.peak(peak_id).unwrap();
//! assert!((peak.center - 531.2).abs() < 0.01);
//! assert!((peak.fwhm - 1.2).abs() < 0.01);
//! ```
//!
//! ## Features
//! - `parallelism` (default) evaluates the finite difference Jacobian columns
//!   in parallel with `rayon`.
//! - `serde` derives `Serialize` and `Deserialize` for the data types.

pub mod arrayops;
pub mod composite;
pub mod expression;
pub mod fitter;
pub mod model;
pub mod parameters;
pub mod region;
pub mod shapes;
pub mod text;

pub mod prelude;

#[cfg(test)]
mod test_data;

pub use crate::composite::{CompositeModel, PeakModel};
pub use crate::expression::{Expression, ExpressionError};
pub use crate::fitter::{FitConfig, FitError, LeastSquaresFitter, ModelFitResult};
pub use crate::model::{
    ConstraintField, ConstraintValue, PeakConstraints, PeakValues, RegionFitError, RegionFitModel,
    UnknownConstraintFieldError,
};
pub use crate::parameters::{Parameter, ParameterError, ParameterUpdate, Parameters};
pub use crate::region::{Peak, PeakId, Region, RegionError, RegionId};
pub use crate::shapes::{PeakAttribute, PeakShapeKind, UnsupportedModelError};
