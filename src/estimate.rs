//! Stand-attribute estimators: the BA/TPH/QMD identity and the empirical
//! curve evaluations the engine reconciles supplied data against.

use crate::control::SiteCurve;
use crate::math;

/// `basal_area = K * trees_per_hectare * qmd²` with BA in m²/ha, QMD in cm.
pub const K: f64 = std::f64::consts::PI / 40_000.0;

/// Trees per hectare implied by a basal area and quadratic mean diameter.
/// Zero when either input is non-positive.
pub fn trees_per_hectare(basal_area: f64, qmd: f64) -> f64 {
    if basal_area <= 0.0 || qmd <= 0.0 {
        return 0.0;
    }
    basal_area / (K * qmd * qmd)
}

/// Quadratic mean diameter implied by a basal area and stem density.
/// Zero when either input is non-positive.
pub fn quad_mean_diameter(basal_area: f64, trees_per_hectare: f64) -> f64 {
    if basal_area <= 0.0 || trees_per_hectare <= 0.0 {
        return 0.0;
    }
    (basal_area / (K * trees_per_hectare)).sqrt()
}

/// Basal area implied by a stem density and quadratic mean diameter.
pub fn basal_area(trees_per_hectare: f64, qmd: f64) -> f64 {
    if trees_per_hectare <= 0.0 || qmd <= 0.0 {
        return 0.0;
    }
    K * trees_per_hectare * qmd * qmd
}

/// Whole-stem volume of the mean tree (m³) from a volume-equation-group
/// coefficient vector: `ln(v) = c0 + c1 ln(qmd) + c2 ln(lorey_height)`.
pub fn whole_stem_volume_per_tree(coefficients: &[f64], lorey_height: f64, qmd: f64) -> f64 {
    if qmd <= 0.0 || lorey_height <= 0.0 || coefficients.len() < 3 {
        return 0.0;
    }
    (coefficients[0] + coefficients[1] * qmd.ln() + coefficients[2] * lorey_height.ln()).exp()
}

/// Whole-stem volume per hectare for a species component.
pub fn whole_stem_volume(
    coefficients: &[f64],
    lorey_height: f64,
    qmd: f64,
    trees_per_hectare: f64,
) -> f64 {
    whole_stem_volume_per_tree(coefficients, lorey_height, qmd) * trees_per_hectare
}

/// Fraction of a layer-level quantity falling in one utilization class,
/// from a `[b0, b1]` logit curve evaluated at the layer QMD.
pub fn class_fraction(coefficients: [f64; 2], layer_qmd: f64) -> f64 {
    math::ratio(coefficients[0] + coefficients[1] * layer_qmd, math::MAX_LOGIT)
}

/// Dominant height at a breast-height age from a site curve and site index.
pub fn dominant_height(curve: SiteCurve, site_index: f64, age_at_breast_height: f64) -> f64 {
    if age_at_breast_height <= 0.0 || site_index <= 1.3 {
        return 1.3;
    }
    1.3 + (site_index - 1.3) * (1.0 - (-curve.b1 * age_at_breast_height).exp()).powf(curve.b2)
}
