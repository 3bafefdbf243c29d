pub use crate::fitter::FitConfig;
pub use crate::model::{PeakValues, RegionFitModel};
pub use crate::parameters::ParameterUpdate;
pub use crate::region::{Peak, Region};
pub use crate::shapes::{PeakAttribute, PeakShapeKind};
