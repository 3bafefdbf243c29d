use std::f64::consts::{LN_2, PI};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Area-normalised pseudo-Voigt peak shape model
///
/// ```math
/// y = (1 - f)\frac{a}{\sigma_g\sqrt{2\pi}}\exp\left(\frac{-(x - \mu)^2}{2\sigma_g^2}\right)
///     + f\frac{a}{\pi\sigma}\frac{\sigma^2}{(x - \mu)^2 + \sigma^2}
/// ```
///
/// where $`\sigma_g = \sigma / \sqrt{2\ln 2}`$, so that both components share
/// the full width at half max $`2\sigma`$ and $`a`$ is the peak area.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PseudoVoigtShape {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
    pub fraction: f64,
}

const TINY: f64 = 1e-15;

impl Default for PseudoVoigtShape {
    fn default() -> Self {
        Self::new(1.0, 0.0, 1.0, 0.5)
    }
}

impl PseudoVoigtShape {
    pub const PARAM_NAMES: &'static [&'static str] = &["amplitude", "center", "sigma", "fraction"];

    pub fn new(amplitude: f64, center: f64, sigma: f64, fraction: f64) -> Self {
        Self {
            amplitude,
            center,
            sigma,
            fraction,
        }
    }

    /// Build from values ordered like [`PseudoVoigtShape::PARAM_NAMES`],
    /// `None` if there are too few
    pub fn from_values(values: &[f64]) -> Option<Self> {
        match values {
            [amplitude, center, sigma, fraction, ..] => {
                Some(Self::new(*amplitude, *center, *sigma, *fraction))
            }
            _ => None,
        }
    }

    pub fn density(&self, x: f64) -> f64 {
        let sigma = self.sigma.max(TINY);
        let sigma_g = sigma / (2.0 * LN_2).sqrt();
        let delta = x - self.center;

        let gaussian = self.amplitude / (sigma_g * (2.0 * PI).sqrt())
            * (-delta.powi(2) / (2.0 * sigma_g.powi(2))).exp();
        let lorentzian = self.amplitude / (PI * sigma) / (1.0 + (delta / sigma).powi(2));

        (1.0 - self.fraction) * gaussian + self.fraction * lorentzian
    }

    pub fn predict(&self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|x| self.density(*x)).collect()
    }

    pub fn fwhm(&self) -> f64 {
        2.0 * self.sigma
    }

    /// The maximum of the profile, at `center`
    pub fn height(&self) -> f64 {
        (1.0 - self.fraction) * self.amplitude / (self.sigma * (PI / LN_2).sqrt()).max(TINY)
            + self.fraction * self.amplitude / (PI * self.sigma).max(TINY)
    }

    pub(crate) fn derived_expressions(prefix: &str) -> Vec<(&'static str, String)> {
        vec![
            ("fwhm", format!("2 * {prefix}sigma")),
            (
                "height",
                format!(
                    "(1 - {p}fraction) * {p}amplitude / max({tiny}, {p}sigma * sqrt(pi / log(2))) \
                     + {p}fraction * {p}amplitude / max({tiny}, pi * {p}sigma)",
                    p = prefix,
                    tiny = TINY
                ),
            ),
        ]
    }

    /// Given observed data, compute some initial parameters.
    ///
    /// The center and half width come from the points above half maximum when
    /// there are enough of them, otherwise from the apex and a sixth of the span.
    pub fn guess(y: &[f64], x: &[f64]) -> Self {
        let n = y.len().min(x.len());
        if n == 0 {
            return Self::default();
        }
        let (y, x) = (&y[..n], &x[..n]);

        let (mut imax, mut maxy, mut miny) = (0, f64::NEG_INFINITY, f64::INFINITY);
        for (i, v) in y.iter().copied().enumerate() {
            if v > maxy {
                maxy = v;
                imax = i;
            }
            miny = miny.min(v);
        }
        let minx = x.iter().copied().fold(f64::INFINITY, f64::min);
        let maxx = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut center = x[imax];
        let height = (maxy - miny) * 3.0;
        let mut sigma = (maxx - minx) / 6.0;

        let half_max = (maxy + miny) / 2.0;
        let above: Vec<f64> = x
            .iter()
            .zip(y.iter())
            .filter(|(_, y)| **y > half_max)
            .map(|(x, _)| *x)
            .collect();
        if above.len() > 2 {
            let lo = above.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = above.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            sigma = (hi - lo) / 2.0;
            center = above.iter().sum::<f64>() / above.len() as f64;
        }
        let amplitude = height * sigma * 1.25;
        Self::new(amplitude, center, sigma, 0.5)
    }
}
