use crate::arrayops::gridspace;
use crate::region::Region;
use crate::shapes::{PeakShapeKind, PseudoVoigtShape};

#[derive(Debug, Clone, Copy)]
pub struct TruePeak {
    pub area: f64,
    pub fwhm: f64,
    pub center: f64,
}

pub const TRUE_PEAKS: [TruePeak; 2] = [
    TruePeak {
        area: 5000.0,
        fwhm: 1.2,
        center: 284.8,
    },
    TruePeak {
        area: 2000.0,
        fwhm: 1.4,
        center: 286.4,
    },
];

pub const REGION_ID: u32 = 3;

/// Two pseudo-Voigt peaks with `fraction = 0.5` on a sloped background with a
/// little deterministic ripple, with both peaks already added to the region
pub fn synthetic_region() -> Region {
    let energy = gridspace(280.0, 292.0, 0.05);
    let background: Vec<f64> = energy.iter().map(|e| 100.0 + 2.0 * (e - 280.0)).collect();
    let shapes: Vec<_> = TRUE_PEAKS
        .iter()
        .map(|p| PseudoVoigtShape::new(p.area, p.center, p.fwhm / 2.0, 0.5))
        .collect();
    let cps = energy
        .iter()
        .zip(background.iter())
        .enumerate()
        .map(|(i, (e, b))| {
            b + shapes.iter().map(|s| s.density(*e)).sum::<f64>() + 2.0 * (i as f64 * 0.7).sin()
        })
        .collect();

    let mut region = Region::new(REGION_ID, energy, cps)
        .and_then(|r| r.with_background(background))
        .unwrap();
    for _ in TRUE_PEAKS.iter() {
        region.add_peak(PeakShapeKind::PseudoVoigt);
    }
    region
}
