//! Multivariate Newton–Raphson with a finite-difference Jacobian, and the
//! diameter-distribution calibration system solved with it.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::error::ProcessingError;
use crate::estimate;
use crate::math;

/// Relative perturbation used for the finite-difference Jacobian.
pub const JACOBIAN_DELTA: f64 = 1.0e-6;

/// Iteration cap; exceeding it is a processing failure, never a silent
/// return of the last guess.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Estimate the Jacobian of `residuals` at `x` by forward differences.
/// `fx` must be the residual vector already evaluated at `x`.
pub fn estimate_jacobian<F>(
    residuals: &mut F,
    x: &DVector<f64>,
    fx: &DVector<f64>,
) -> Result<DMatrix<f64>, ProcessingError>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, ProcessingError>,
{
    let n = x.len();
    let m = fx.len();
    let mut jacobian = DMatrix::zeros(m, n);

    for j in 0..n {
        let h = JACOBIAN_DELTA * x[j].abs().max(1.0);
        let mut perturbed = x.clone();
        perturbed[j] += h;
        let fp = residuals(&perturbed)?;
        for i in 0..m {
            jacobian[(i, j)] = (fp[i] - fx[i]) / h;
        }
    }

    Ok(jacobian)
}

/// Find `x` such that `residuals(x) ≈ 0`, starting from `initial`.
///
/// Each iteration solves `J · Δx = -f(x)` by LU decomposition and steps
/// `x ← x + Δx`, until the residual's largest component is below
/// `tolerance` or `max_iterations` is exhausted.
pub fn find_root<F>(
    mut residuals: F,
    initial: DVector<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<DVector<f64>, ProcessingError>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, ProcessingError>,
{
    let mut x = initial;
    let mut fx = residuals(&x)?;

    for iteration in 0..max_iterations {
        if fx.amax() < tolerance {
            debug!(iteration, residual = fx.amax(), "root finder converged");
            return Ok(x);
        }

        let jacobian = estimate_jacobian(&mut residuals, &x, &fx)?;
        let delta = jacobian.lu().solve(&(-&fx)).ok_or_else(|| {
            ProcessingError::Other("singular Jacobian in root finder".to_string())
        })?;
        x += delta;
        fx = residuals(&x)?;
        trace!(iteration, residual = fx.amax(), "root finder step");
    }

    if fx.amax() < tolerance {
        return Ok(x);
    }
    Err(ProcessingError::RootFinderDidNotConverge {
        iterations: max_iterations,
        residual: fx.amax(),
    })
}

/// Per-species inputs to the diameter-distribution calibration.
#[derive(Debug, Clone)]
pub struct SpeciesCalibration {
    /// Starting per-species quadratic mean diameter (cm)
    pub diameter_base: f64,
    /// Lorey height used by the volume estimator (m)
    pub lorey_height: f64,
    /// Whole-stem volume coefficients of the species' equation group
    pub volume_coefficients: Vec<f64>,
}

/// The 5-parameter (for five species) system relating per-species
/// diameter-distribution adjustments to layer-wide aggregates.
///
/// Parameters: one basal-area percentage per species except the last (which
/// is implied as the remainder to 100), plus a final log-space scale applied
/// to every diameter base. Residuals: the volume-implied percentage of each
/// non-implied species, and the layer quadratic mean diameter, each less its
/// goal.
#[derive(Debug, Clone)]
pub struct DiameterDistributionSystem {
    pub species: Vec<SpeciesCalibration>,
    /// Layer basal area at the ALL utilization class (m²/ha)
    pub layer_basal_area: f64,
    /// Goal vector: `n - 1` species percentages then the layer QMD
    pub goal: DVector<f64>,
}

impl DiameterDistributionSystem {
    /// Residual vector at parameter guess `x`.
    pub fn residuals(&self, x: &DVector<f64>) -> Result<DVector<f64>, ProcessingError> {
        let n = self.species.len();
        debug_assert_eq!(x.len(), n);
        debug_assert_eq!(self.goal.len(), n);

        let mut percentages = vec![0.0; n];
        let mut implied = 100.0;
        for i in 0..n - 1 {
            percentages[i] = x[i];
            implied -= x[i];
        }
        percentages[n - 1] = implied;

        let scale = math::safe_exponent(x[n - 1])?;

        let mut volumes = vec![0.0; n];
        let mut total_volume = 0.0;
        let mut total_tph = 0.0;
        for (i, species) in self.species.iter().enumerate() {
            let basal_area = self.layer_basal_area * percentages[i] / 100.0;
            let qmd = species.diameter_base * scale;
            let tph = estimate::trees_per_hectare(basal_area, qmd);
            volumes[i] = estimate::whole_stem_volume(
                &species.volume_coefficients,
                species.lorey_height,
                qmd,
                tph,
            );
            total_volume += volumes[i];
            total_tph += tph;
        }

        if total_volume <= 0.0 {
            return Err(ProcessingError::Other(
                "diameter calibration produced no volume".to_string(),
            ));
        }

        let mut residual = DVector::zeros(n);
        for i in 0..n - 1 {
            residual[i] = 100.0 * volumes[i] / total_volume - self.goal[i];
        }
        residual[n - 1] =
            estimate::quad_mean_diameter(self.layer_basal_area, total_tph) - self.goal[n - 1];
        Ok(residual)
    }
}
