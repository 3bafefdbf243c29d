//! Peak shape profiles and the mapping between physical peak quantities and
//! model parameters.
//!
//! Only the pseudo-Voigt profile is supported, see [`PseudoVoigtShape`].
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

use crate::parameters::ParameterUpdate;

mod pseudo_voigt;

pub use pseudo_voigt::PseudoVoigtShape;

/// Raised when a peak asks for a model this crate cannot build
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Only PseudoVoigt models supported, got \"{0}\"")]
pub struct UnsupportedModelError(pub String);

/// Raised when a physical peak attribute name is not recognized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown peak attribute \"{0}\", expected one of area, fwhm, center")]
pub struct UnknownAttributeError(pub String);

/// The peak shape a [`Peak`](crate::Peak) is modelled with
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PeakShapeKind {
    #[default]
    PseudoVoigt,
}

/// A physical quantity of a peak, as opposed to a raw model parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PeakAttribute {
    Area,
    Fwhm,
    Center,
}

impl PeakAttribute {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Area => "area",
            Self::Fwhm => "fwhm",
            Self::Center => "center",
        }
    }
}

impl FromStr for PeakAttribute {
    type Err = UnknownAttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "area" => Ok(Self::Area),
            "fwhm" => Ok(Self::Fwhm),
            "center" => Ok(Self::Center),
            _ => Err(UnknownAttributeError(s.to_string())),
        }
    }
}

impl fmt::Display for PeakAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a [`PeakAttribute`] is stored in the model: the parameter name without
/// prefix, and the factor with `attribute = scale * parameter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterMapping {
    pub name: &'static str,
    pub scale: f64,
}

impl ParameterMapping {
    pub const fn new(name: &'static str, scale: f64) -> Self {
        Self { name, scale }
    }

    pub fn to_parameter(&self, attribute_value: f64) -> f64 {
        attribute_value / self.scale
    }

    pub fn to_attribute(&self, parameter_value: f64) -> f64 {
        parameter_value * self.scale
    }

    pub fn is_identity(&self) -> bool {
        self.scale == 1.0
    }
}

impl PeakShapeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PseudoVoigt => "PseudoVoigt",
        }
    }

    /// The parameters the profile is evaluated from, in evaluation order
    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            Self::PseudoVoigt => PseudoVoigtShape::PARAM_NAMES,
        }
    }

    /// The profile's own defaults, before any caller hints
    pub fn default_hints(&self) -> Vec<(&'static str, ParameterUpdate)> {
        match self {
            Self::PseudoVoigt => vec![
                ("amplitude", ParameterUpdate::new().value(1.0)),
                ("center", ParameterUpdate::new().value(0.0)),
                ("sigma", ParameterUpdate::new().value(1.0).min(0.0)),
                ("fraction", ParameterUpdate::new().value(0.5)),
            ],
        }
    }

    /// Parameters computed from the others, as expression templates over `prefix`
    pub fn derived_params(&self, prefix: &str) -> Vec<(&'static str, String)> {
        match self {
            Self::PseudoVoigt => PseudoVoigtShape::derived_expressions(prefix),
        }
    }

    pub fn parameter_for(&self, attribute: PeakAttribute) -> ParameterMapping {
        match self {
            Self::PseudoVoigt => match attribute {
                PeakAttribute::Area => ParameterMapping::new("amplitude", 1.0),
                PeakAttribute::Fwhm => ParameterMapping::new("sigma", 2.0),
                PeakAttribute::Center => ParameterMapping::new("center", 1.0),
            },
        }
    }

    /// Evaluate the profile over `x` given parameter values in
    /// [`PeakShapeKind::param_names`] order, `None` if values are missing
    pub fn evaluate(&self, values: &[f64], x: &[f64]) -> Option<Vec<f64>> {
        match self {
            Self::PseudoVoigt => PseudoVoigtShape::from_values(values).map(|s| s.predict(x)),
        }
    }

    /// Heuristic starting values for a single peak in `y` over `x`
    pub fn guess(&self, y: &[f64], x: &[f64]) -> Vec<(&'static str, ParameterUpdate)> {
        match self {
            Self::PseudoVoigt => {
                let shape = PseudoVoigtShape::guess(y, x);
                vec![
                    ("amplitude", ParameterUpdate::new().value(shape.amplitude)),
                    ("center", ParameterUpdate::new().value(shape.center)),
                    ("sigma", ParameterUpdate::new().value(shape.sigma).min(0.0)),
                    (
                        "fraction",
                        ParameterUpdate::new()
                            .value(shape.fraction)
                            .min(0.0)
                            .max(1.0),
                    ),
                ]
            }
        }
    }
}

impl FromStr for PeakShapeKind {
    type Err = UnsupportedModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PseudoVoigt" => Ok(Self::PseudoVoigt),
            _ => Err(UnsupportedModelError(s.to_string())),
        }
    }
}

impl fmt::Display for PeakShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
