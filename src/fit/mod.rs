//! Curve fitting: the 4PL model, a bounded least-squares solver, the
//! two-stage dose-response fit and numeric integration of fitted curves.

pub mod curve;
pub mod integrate;
pub mod lm;
pub mod model;

pub use curve::{InitialFit, RefinedFit, initial_fit, refine_fit};
pub use integrate::integrate;
pub use model::{Bounds, FourPl};
