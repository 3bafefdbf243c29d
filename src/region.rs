//! Spectrum regions and the peaks placed in them.
//!
//! A [`Region`] is a slice of a measured spectrum: an energy axis, the measured
//! counts per second and a background underneath them. Peaks are created through
//! [`Region::add_peak`], which hands out ids and the parameter name prefix the
//! peak's model will use.
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

use crate::arrayops::subtract_in_place;
use crate::shapes::PeakShapeKind;

pub type RegionId = u32;
pub type PeakId = u32;

/// All the ways building a region can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("The energy ({energy}) and {name} ({other}) arrays do not match in length")]
    LengthMismatch {
        name: &'static str,
        energy: usize,
        other: usize,
    },
}

/// A single peak in a [`Region`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Peak {
    pub id: PeakId,
    pub region_id: RegionId,
    /// The prefix naming this peak's model parameters, unique within its region
    pub prefix: String,
    pub model_name: PeakShapeKind,
    pub area: f64,
    /// The full width at half maximum
    pub fwhm: f64,
    pub center: f64,
}

impl Peak {
    pub fn new(id: PeakId, region_id: RegionId, model_name: PeakShapeKind) -> Self {
        Self {
            id,
            region_id,
            prefix: format!("p{id}_"),
            model_name,
            area: 0.0,
            fwhm: 0.0,
            center: 0.0,
        }
    }

    /// Store the physical quantities produced by a fit
    pub fn set_params_from_model(&mut self, area: f64, fwhm: f64, center: f64) {
        self.area = area;
        self.fwhm = fwhm;
        self.center = center;
    }
}

impl fmt::Display for Peak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Peak({}, {}, area={}, fwhm={}, center={})",
            self.id, self.model_name, self.area, self.fwhm, self.center
        )
    }
}

/// A section of a spectrum, energy against counts per second
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Region {
    pub id: RegionId,
    pub energy: Vec<f64>,
    pub cps: Vec<f64>,
    pub background: Vec<f64>,
    pub peaks: Vec<Peak>,
    next_peak_id: PeakId,
}

impl Region {
    /// Create a region with a zero background
    pub fn new(id: RegionId, energy: Vec<f64>, cps: Vec<f64>) -> Result<Self, RegionError> {
        if energy.len() != cps.len() {
            return Err(RegionError::LengthMismatch {
                name: "cps",
                energy: energy.len(),
                other: cps.len(),
            });
        }
        let background = vec![0.0; energy.len()];
        Ok(Self {
            id,
            energy,
            cps,
            background,
            peaks: Vec::new(),
            next_peak_id: 0,
        })
    }

    pub fn with_background(mut self, background: Vec<f64>) -> Result<Self, RegionError> {
        self.set_background(background)?;
        Ok(self)
    }

    pub fn set_background(&mut self, background: Vec<f64>) -> Result<(), RegionError> {
        if background.len() != self.energy.len() {
            return Err(RegionError::LengthMismatch {
                name: "background",
                energy: self.energy.len(),
                other: background.len(),
            });
        }
        self.background = background;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.energy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.energy.is_empty()
    }

    /// The measured counts with the background removed
    pub fn signal(&self) -> Vec<f64> {
        let mut signal = self.cps.clone();
        subtract_in_place(&mut signal, &self.background);
        signal
    }

    /// Create a new peak in this region and return its id
    pub fn add_peak(&mut self, model_name: PeakShapeKind) -> PeakId {
        let id = self.next_peak_id;
        self.next_peak_id += 1;
        self.peaks.push(Peak::new(id, self.id, model_name));
        id
    }

    pub fn remove_peak(&mut self, id: PeakId) -> Option<Peak> {
        let i = self.peaks.iter().position(|p| p.id == id)?;
        Some(self.peaks.remove(i))
    }

    pub fn peak(&self, id: PeakId) -> Option<&Peak> {
        self.peaks.iter().find(|p| p.id == id)
    }

    pub fn peak_mut(&mut self, id: PeakId) -> Option<&mut Peak> {
        self.peaks.iter_mut().find(|p| p.id == id)
    }
}
