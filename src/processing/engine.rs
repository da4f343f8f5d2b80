//! The ordered step pipeline that drives a polygon from supplied stand data
//! to calibrated, growth-projected output.

use nalgebra::DVector;
use tracing::{debug, trace};

use crate::control::{ControlMap, GrowthCoefficients, RatioKind};
use crate::error::{ProcessingError, StateError};
use crate::estimate;
use crate::math;
use crate::models::{
    CompatibilityVariables, LayerType, Polygon, SmallVariable, SpeciesRecord, UtilizationClass,
    UtilizationVector, VolumeVariable,
};

use super::reconcile::reconcile;
use super::root_finder::{self, DiameterDistributionSystem, SpeciesCalibration};
use super::state::{LayerState, PrimarySpeciesDetails, ProcessingState, SpeciesRanking, MISSING_GROUP};

/// Species below this basal area at the ALL class are dropped from the bank.
pub const MIN_RETAINED_BASAL_AREA: f64 = 0.001;

/// Base volumes at or below this never produce a volume adjustment.
pub const MIN_BASE_VOLUME: f64 = 0.1;

/// Basal areas / diameters at or below this never produce an adjustment.
pub const MIN_BASAL_AREA: f64 = 0.01;

/// Convergence tolerance for the diameter-distribution calibration.
pub const ROOT_TOLERANCE: f64 = 2.0e-3;

pub const ROOT_MAX_ITERATIONS: usize = 100;

/// Basal-area share above which a stand counts as pure and the primary
/// species keeps its own inventory type group.
const PURE_STAND_SHARE: f64 = 0.8;

/// Inventory-type-group offset applied to mixed stands.
const MIXED_STAND_GROUP_OFFSET: usize = 30;

/// The engine's execution steps, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessingStep {
    RankSpecies,
    AssignSiteCurves,
    SetPrimaryDetails,
    FitDiameterDistribution,
    ComputeCompatibilityVariables,
    GrowForward,
}

impl ProcessingStep {
    pub const ALL: [ProcessingStep; 6] = [
        ProcessingStep::RankSpecies,
        ProcessingStep::AssignSiteCurves,
        ProcessingStep::SetPrimaryDetails,
        ProcessingStep::FitDiameterDistribution,
        ProcessingStep::ComputeCompatibilityVariables,
        ProcessingStep::GrowForward,
    ];

    pub fn first() -> Self {
        ProcessingStep::RankSpecies
    }

    pub fn last() -> Self {
        ProcessingStep::GrowForward
    }

    pub fn predecessor(self) -> Result<Self, StateError> {
        let ordinal = self as usize;
        if ordinal == 0 {
            return Err(StateError::NoSuchStep("before", "first"));
        }
        Ok(Self::ALL[ordinal - 1])
    }

    pub fn successor(self) -> Result<Self, StateError> {
        let ordinal = self as usize;
        if ordinal + 1 == Self::ALL.len() {
            return Err(StateError::NoSuchStep("after", "last"));
        }
        Ok(Self::ALL[ordinal + 1])
    }
}

/// Drives polygons through the processing steps against a resolved control
/// map. One engine serves any number of polygons; each polygon gets its own
/// [`ProcessingState`] and failures never leak across polygons.
pub struct ProcessingEngine<'a, C: ControlMap> {
    controls: &'a C,
}

impl<'a, C: ControlMap> ProcessingEngine<'a, C> {
    pub fn new(controls: &'a C) -> Self {
        ProcessingEngine { controls }
    }

    /// Run every step against the polygon's primary layer.
    pub fn process_polygon(&self, polygon: Polygon) -> Result<Polygon, ProcessingError> {
        self.process_polygon_to(polygon, ProcessingStep::last())
    }

    /// Run every step from the first through `last_step` inclusive; no step
    /// beyond `last_step` executes.
    pub fn process_polygon_to(
        &self,
        polygon: Polygon,
        last_step: ProcessingStep,
    ) -> Result<Polygon, ProcessingError> {
        debug!(polygon = %polygon.id, ?last_step, "processing polygon");

        let mut state = ProcessingState::try_new(polygon, self.controls, |s: &SpeciesRecord| {
            s.utilization.basal_area.get(UtilizationClass::All) >= MIN_RETAINED_BASAL_AREA
        })?;

        for step in ProcessingStep::ALL {
            if step > last_step {
                break;
            }
            trace!(?step, "executing step");
            match step {
                ProcessingStep::RankSpecies => self.rank_species(&mut state)?,
                ProcessingStep::AssignSiteCurves => self.assign_site_curves(&mut state)?,
                ProcessingStep::SetPrimaryDetails => self.set_primary_details(&mut state)?,
                ProcessingStep::FitDiameterDistribution => {
                    self.fit_diameter_distribution(&mut state)?
                }
                ProcessingStep::ComputeCompatibilityVariables => {
                    self.compute_compatibility_variables(&mut state)?
                }
                ProcessingStep::GrowForward => self.grow_forward(&mut state)?,
            }
        }

        Ok(state.into_polygon())
    }

    /// Pick the primary (largest basal area) and secondary species and derive
    /// the layer's group numbers from them.
    fn rank_species(&self, state: &mut ProcessingState<'a, C>) -> Result<(), ProcessingError> {
        let layer = state.primary_mut();
        if layer.n_species() == 0 {
            return Err(ProcessingError::MalformedLayer(
                "no species retained in primary layer".to_string(),
            ));
        }

        let ranking = {
            let bank = layer.bank();
            let ba_at = |i: usize| bank.basal_areas[i].get(UtilizationClass::All);

            let mut order: Vec<usize> = bank.indices().collect();
            order.sort_by(|&a, &b| {
                ba_at(b)
                    .partial_cmp(&ba_at(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });

            let primary_index = order[0];
            let secondary_index = order.get(1).copied().filter(|&i| ba_at(i) > 0.0);

            let total: f64 = bank.indices().map(ba_at).sum();
            let share = if total > 0.0 { ba_at(primary_index) / total } else { 1.0 };
            let genus = bank.species_indices[primary_index];
            let inventory_type_group = if share >= PURE_STAND_SHARE {
                genus as i32
            } else {
                (MIXED_STAND_GROUP_OFFSET + genus) as i32
            };

            SpeciesRanking {
                primary_index,
                secondary_index,
                inventory_type_group,
                basal_area_group: layer.volume_equation_group(primary_index),
                stratum_group: layer.decay_equation_group(primary_index),
            }
        };

        debug!(?ranking, "species ranked");
        layer.set_ranking(ranking)?;
        Ok(())
    }

    /// Assign every retained species a site curve number: the supplied one,
    /// or the control map's default for the species.
    fn assign_site_curves(&self, state: &mut ProcessingState<'a, C>) -> Result<(), ProcessingError> {
        let layer = state.primary_mut();
        let mut numbers = vec![MISSING_GROUP; layer.n_species() + 1];
        for i in layer.indices() {
            numbers[i] = layer.bank().site_curve_numbers[i].unwrap_or_else(|| {
                self.controls
                    .default_site_curve_number(&layer.bank().species_names[i])
            });
        }
        layer.set_site_curve_numbers(numbers)?;
        Ok(())
    }

    /// Resolve the primary species' site details from whatever subset of the
    /// age/height fields the input supplied, estimating dominant height from
    /// the site curve when it was not given.
    fn set_primary_details(&self, state: &mut ProcessingState<'a, C>) -> Result<(), ProcessingError> {
        let layer = state.primary_mut();
        let p = layer.primary_species_index()?;

        let details = {
            let bank = layer.bank();
            let alias = bank.species_names[p].as_str();

            let site_index = positive(bank.site_indices[p]).ok_or_else(|| {
                ProcessingError::MalformedLayer(format!(
                    "primary species '{alias}' has no site index"
                ))
            })?;

            let total = positive(bank.age_totals[p]);
            let at_bh = positive(bank.years_at_breast_height[p]);
            let to_bh = bank.years_to_breast_height[p].filter(|v| *v >= 0.0);
            let (total_age, age_at_breast_height, age_to_breast_height) = match (total, at_bh, to_bh)
            {
                (t, Some(a), Some(y)) => (t.unwrap_or(a + y), a, y),
                (Some(t), Some(a), None) => (t, a, t - a),
                (Some(t), None, Some(y)) => (t, t - y, y),
                _ => {
                    return Err(ProcessingError::MalformedLayer(format!(
                        "primary species '{alias}' has insufficient age information"
                    )))
                }
            };

            let curve = self.controls.site_curve(layer.site_curve_number(p)?)?;
            let dominant_height = match positive(bank.dominant_heights[p]) {
                Some(h) => h,
                None => estimate::dominant_height(curve, site_index, age_at_breast_height),
            };

            PrimarySpeciesDetails {
                dominant_height,
                site_index,
                total_age,
                age_at_breast_height,
                age_to_breast_height,
            }
        };

        debug!(?details, "primary species details resolved");
        layer.set_primary_details(details, false)?;
        Ok(())
    }

    /// Calibrate per-species diameters and percentages against the layer
    /// aggregates by solving the n-parameter system with the root finder.
    ///
    /// The calibration runs on a clone of the bank; the clone is committed
    /// only after the solver converges. Non-convergence is terminal for the
    /// polygon.
    fn fit_diameter_distribution(
        &self,
        state: &mut ProcessingState<'a, C>,
    ) -> Result<(), ProcessingError> {
        let (system, n) = {
            let layer = state.primary();
            let n = layer.n_species();
            if n < 2 {
                debug!("skipping diameter calibration: single-species layer");
                return Ok(());
            }

            let bank = layer.bank();
            let layer_basal_area = bank.basal_areas[0].get(UtilizationClass::All);
            let goal_qmd = bank.quad_mean_diameters[0].get(UtilizationClass::All);
            if layer_basal_area <= 0.0 || goal_qmd <= 0.0 {
                debug!("skipping diameter calibration: no layer aggregates");
                return Ok(());
            }

            let mut species = Vec::with_capacity(n);
            for i in layer.indices() {
                let diameter_base = bank.quad_mean_diameters[i].get(UtilizationClass::All);
                let lorey_height = bank.lorey_heights[i].get(UtilizationClass::All);
                if diameter_base <= 0.0 || lorey_height <= 0.0 {
                    debug!(
                        species = bank.species_names[i].as_str(),
                        "skipping diameter calibration: species lacks diameter or height"
                    );
                    return Ok(());
                }
                let coefficients = self
                    .controls
                    .volume_coefficients(layer.volume_equation_group(i))?
                    .to_vec();
                species.push(SpeciesCalibration {
                    diameter_base,
                    lorey_height,
                    volume_coefficients: coefficients,
                });
            }

            let mut goal = DVector::zeros(n);
            for k in 0..n - 1 {
                goal[k] = bank.percentages[k + 1];
            }
            goal[n - 1] = goal_qmd;

            (
                DiameterDistributionSystem {
                    species,
                    layer_basal_area,
                    goal,
                },
                n,
            )
        };

        let mut initial = system.goal.clone();
        initial[n - 1] = 0.0;
        let root = root_finder::find_root(
            |x| system.residuals(x),
            initial,
            ROOT_TOLERANCE,
            ROOT_MAX_ITERATIONS,
        )?;
        debug!(root = ?root.as_slice(), "diameter calibration converged");

        let mut bank = state.primary().bank().clone();
        let scale = math::safe_exponent(root[n - 1])?;
        let layer_basal_area = system.layer_basal_area;
        let mut implied = 100.0;
        for k in 0..n - 1 {
            implied -= root[k];
        }

        for i in 1..=n {
            let percent = if i < n { root[i - 1] } else { implied };
            let qmd = bank.quad_mean_diameters[i].get(UtilizationClass::All) * scale;
            let basal_area = layer_basal_area * percent / 100.0;
            bank.percentages[i] = percent;
            bank.basal_areas[i].set(UtilizationClass::All, basal_area);
            bank.quad_mean_diameters[i].set(UtilizationClass::All, qmd);
            bank.trees_per_hectare[i].set(
                UtilizationClass::All,
                estimate::trees_per_hectare(basal_area, qmd),
            );
        }

        let total_tph: f64 = (1..=n)
            .map(|i| bank.trees_per_hectare[i].get(UtilizationClass::All))
            .sum();
        bank.trees_per_hectare[0].set(UtilizationClass::All, total_tph);
        bank.quad_mean_diameters[0].set(
            UtilizationClass::All,
            estimate::quad_mean_diameter(layer_basal_area, total_tph),
        );

        state.primary_mut().commit_bank(bank);
        Ok(())
    }

    /// Reconcile the supplied data, recompute every per-class attribute from
    /// the fitted curves, and store the per-species adjustment tables.
    fn compute_compatibility_variables(
        &self,
        state: &mut ProcessingState<'a, C>,
    ) -> Result<(), ProcessingError> {
        {
            let layer = state.primary_mut();
            let n = layer.n_species();
            let bank = layer.bank_mut();
            for slot in 0..=n {
                reconcile(
                    &mut bank.basal_areas[slot],
                    &mut bank.trees_per_hectare[slot],
                    &mut bank.quad_mean_diameters[slot],
                );
            }
        }

        let variables = {
            let layer = state.primary();
            let layer_type = layer.bank().layer_type();
            let mut variables =
                vec![CompatibilityVariables::zeroed(); layer.n_species() + 1];
            for i in layer.indices() {
                variables[i] = self.species_compatibility(layer, i, layer_type)?;
            }
            variables
        };

        state.primary_mut().set_compatibility_variables(variables)?;
        Ok(())
    }

    /// One species' full adjustment table: volume pairs in logit space,
    /// basal area and diameter as plain differences against the reconciled
    /// recomputed values, and the small-component entries.
    fn species_compatibility(
        &self,
        layer: &LayerState,
        i: usize,
        layer_type: LayerType,
    ) -> Result<CompatibilityVariables, ProcessingError> {
        let bank = layer.bank();
        let volume_group = layer.volume_equation_group(i);
        let decay_group = layer.decay_equation_group(i);
        let breakage_group = layer.breakage_equation_group(i);
        let volume_coefficients = self.controls.volume_coefficients(volume_group)?;

        let ba = bank.basal_areas[i];
        let qmd = bank.quad_mean_diameters[i];
        let lorey = bank.lorey_heights[i];
        let ws = bank.whole_stem_volumes[i];
        let cu = bank.close_util_volumes[i];
        let nd = bank.close_util_volumes_net_decay[i];
        let ndw = bank.close_util_volumes_net_decay_waste[i];

        let species_qmd = qmd.get(UtilizationClass::All);
        let lorey_all = lorey.get(UtilizationClass::All);

        // fitted per-class basal area and diameter from the ratio curves,
        // reconciled before any adjustment is taken against them
        let mut ba_fit = UtilizationVector::new();
        let mut tph_fit = UtilizationVector::new();
        let mut qmd_fit = UtilizationVector::new();
        ba_fit.set(UtilizationClass::All, ba.get(UtilizationClass::All));
        qmd_fit.set(UtilizationClass::All, species_qmd);
        for uc in UtilizationClass::THRESHOLD_CLASSES {
            let ba_fraction = estimate::class_fraction(
                self.controls
                    .class_ratio_coefficients(RatioKind::BasalArea, volume_group, uc),
                species_qmd,
            );
            ba_fit.set(uc, ba.get(UtilizationClass::All) * ba_fraction);
            let qmd_fraction = estimate::class_fraction(
                self.controls
                    .class_ratio_coefficients(RatioKind::QuadMeanDiameter, volume_group, uc),
                species_qmd,
            );
            // the diameter curve gives half the class-to-layer multiplier, so
            // the missing-curve default of 0.5 is the identity
            qmd_fit.set(uc, species_qmd * 2.0 * qmd_fraction);
        }
        reconcile(&mut ba_fit, &mut tph_fit, &mut qmd_fit);

        // fitted volumes chained down from whole-stem
        let mut ws_fit = UtilizationVector::new();
        let mut cu_fit = UtilizationVector::new();
        let mut nd_fit = UtilizationVector::new();
        let mut ndw_fit = UtilizationVector::new();
        for uc in UtilizationClass::ALL_CLASSES {
            if uc == UtilizationClass::Small {
                continue;
            }
            ws_fit.set(
                uc,
                estimate::whole_stem_volume(
                    volume_coefficients,
                    lorey_all,
                    qmd_fit.get(uc),
                    tph_fit.get(uc),
                ),
            );
        }
        for uc in UtilizationClass::MERCHANTABLE_CLASSES {
            let class_qmd = qmd_fit.get(uc);
            let cu_value = ws_fit.get(uc)
                * estimate::class_fraction(
                    self.controls
                        .class_ratio_coefficients(RatioKind::CloseUtil, volume_group, uc),
                    class_qmd,
                );
            cu_fit.set(uc, cu_value);
            let nd_value = cu_value
                * estimate::class_fraction(
                    self.controls
                        .class_ratio_coefficients(RatioKind::NetDecay, decay_group, uc),
                    class_qmd,
                );
            nd_fit.set(uc, nd_value);
            ndw_fit.set(
                uc,
                nd_value
                    * estimate::class_fraction(
                        self.controls.class_ratio_coefficients(
                            RatioKind::NetDecayWaste,
                            breakage_group,
                            uc,
                        ),
                        class_qmd,
                    ),
            );
        }

        let mut cv = CompatibilityVariables::zeroed();
        let ws_all = ws.get(UtilizationClass::All);
        for uc in UtilizationClass::MERCHANTABLE_CLASSES {
            cv.set_volume(
                uc,
                VolumeVariable::CloseUtilNetDecayWaste,
                layer_type,
                paired_logit_adjustment(ndw.get(uc), ndw_fit.get(uc), nd.get(uc)),
            );
            cv.set_volume(
                uc,
                VolumeVariable::CloseUtilNetDecay,
                layer_type,
                paired_logit_adjustment(nd.get(uc), nd_fit.get(uc), cu.get(uc)),
            );
            cv.set_volume(
                uc,
                VolumeVariable::CloseUtil,
                layer_type,
                paired_logit_adjustment(cu.get(uc), cu_fit.get(uc), ws.get(uc)),
            );
            // whole-stem is adjusted as a share of the species total
            cv.set_volume(
                uc,
                VolumeVariable::WholeStem,
                layer_type,
                paired_logit_adjustment(ws.get(uc), ws_fit.get(uc), ws_all),
            );

            let ba_cv = if ba.get(uc) > MIN_BASAL_AREA {
                ba.get(uc) - ba_fit.get(uc)
            } else {
                0.0
            };
            cv.set_basal_area(uc, layer_type, ba_cv);

            // only the originally supplied diameter is checked here
            let qmd_cv = if qmd.get(uc) < MIN_BASAL_AREA {
                0.0
            } else {
                qmd.get(uc) - qmd_fit.get(uc)
            };
            cv.set_quad_mean_diameter(uc, layer_type, qmd_cv);
        }

        // sub-merchantable component
        let small = UtilizationClass::Small;
        let small_ba_fit = ba.get(UtilizationClass::All)
            * estimate::class_fraction(
                self.controls
                    .class_ratio_coefficients(RatioKind::BasalArea, volume_group, small),
                species_qmd,
            );
        let small_qmd_fit = species_qmd
            * 2.0
            * estimate::class_fraction(
                self.controls
                    .class_ratio_coefficients(RatioKind::QuadMeanDiameter, volume_group, small),
                species_qmd,
            );
        let small_ws_fit = estimate::whole_stem_volume(
            volume_coefficients,
            lorey_all,
            small_qmd_fit,
            estimate::trees_per_hectare(small_ba_fit, small_qmd_fit),
        );

        cv.set_small(
            SmallVariable::BasalArea,
            if ba.get(small) > MIN_BASAL_AREA {
                ba.get(small) - small_ba_fit
            } else {
                0.0
            },
        );
        cv.set_small(
            SmallVariable::QuadMeanDiameter,
            if qmd.get(small) < MIN_BASAL_AREA {
                0.0
            } else {
                qmd.get(small) - small_qmd_fit
            },
        );
        cv.set_small(
            SmallVariable::LoreyHeight,
            if lorey.get(small) > 0.0 {
                lorey.get(small) - lorey_all
            } else {
                0.0
            },
        );
        cv.set_small(
            SmallVariable::WholeStemVolume,
            if ws.get(small) > MIN_BASE_VOLUME {
                ws.get(small) - small_ws_fit
            } else {
                0.0
            },
        );

        Ok(cv)
    }

    /// Project the primary layer forward one year at a time until the
    /// polygon's target year. A polygon with no target year (or a target at
    /// or before the reference year) passes through unchanged.
    fn grow_forward(&self, state: &mut ProcessingState<'a, C>) -> Result<(), ProcessingError> {
        let Some(target_year) = state.polygon().target_year else {
            debug!("no target year; skipping growth");
            return Ok(());
        };
        let reference_year = state.polygon().reference_year;
        if target_year <= reference_year {
            debug!(target_year, reference_year, "target not ahead of reference; skipping growth");
            return Ok(());
        }

        let growth = *self.controls.growth();
        for year in reference_year..target_year {
            trace!(year, "growing one year");
            self.grow_one_year(state, &growth)?;
        }

        state.polygon_mut().reference_year = target_year;
        Ok(())
    }

    fn grow_one_year(
        &self,
        state: &mut ProcessingState<'a, C>,
        growth: &GrowthCoefficients,
    ) -> Result<(), ProcessingError> {
        let layer = state.primary_mut();
        let details = *layer.primary_details()?;
        let curve = self.controls.site_curve(layer.site_curve_number(0)?)?;

        let new_age_at_breast_height = details.age_at_breast_height + 1.0;
        let new_height =
            estimate::dominant_height(curve, details.site_index, new_age_at_breast_height);

        let ba_all = layer.bank().basal_areas[0].get(UtilizationClass::All);
        let ba_factor = if ba_all > 0.0 {
            let increment =
                growth.annual_rate * ba_all * (1.0 - ba_all / growth.basal_area_limit);
            (ba_all + increment.max(0.0)) / ba_all
        } else {
            1.0
        };
        let tph_factor = 1.0 - growth.mortality_rate;
        let height_factor = if details.dominant_height > 1.3 {
            new_height / details.dominant_height
        } else {
            1.0
        };
        let volume_factor = ba_factor * height_factor;

        {
            let n = layer.n_species();
            let bank = layer.bank_mut();
            for slot in 0..=n {
                for uc in UtilizationClass::ALL_CLASSES {
                    bank.basal_areas[slot][uc] *= ba_factor;
                    bank.trees_per_hectare[slot][uc] *= tph_factor;
                    bank.lorey_heights[slot][uc] *= height_factor;
                    bank.whole_stem_volumes[slot][uc] *= volume_factor;
                    bank.close_util_volumes[slot][uc] *= volume_factor;
                    bank.close_util_volumes_net_decay[slot][uc] *= volume_factor;
                    bank.close_util_volumes_net_decay_waste[slot][uc] *= volume_factor;
                    // diameters re-derive from the grown basal area and density
                    bank.quad_mean_diameters[slot][uc] = 0.0;
                }
                reconcile(
                    &mut bank.basal_areas[slot],
                    &mut bank.trees_per_hectare[slot],
                    &mut bank.quad_mean_diameters[slot],
                );
                if slot >= 1 {
                    if let Some(age) = bank.age_totals[slot] {
                        bank.age_totals[slot] = Some(age + 1.0);
                    }
                    if let Some(age) = bank.years_at_breast_height[slot] {
                        bank.years_at_breast_height[slot] = Some(age + 1.0);
                    }
                }
            }
        }

        layer.scale_compatibility_variables(self.controls.compatibility_adjustments())?;

        if self.controls.update_during_growth() {
            layer.set_primary_details(
                PrimarySpeciesDetails {
                    dominant_height: new_height,
                    site_index: details.site_index,
                    total_age: details.total_age + 1.0,
                    age_at_breast_height: new_age_at_breast_height,
                    age_to_breast_height: details.age_to_breast_height,
                },
                true,
            )?;
        } else {
            layer.update_primary_details_after_growth(new_height)?;
        }

        Ok(())
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

/// Logit-space adjustment of an actual value against a fitted value, both as
/// ratios over the same supplied base. Zero when the base is negligible.
fn paired_logit_adjustment(actual: f64, fitted: f64, base: f64) -> f64 {
    if base <= MIN_BASE_VOLUME {
        return 0.0;
    }
    math::clamped_logit(actual / base) - math::clamped_logit(fitted / base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{EquationGroupKind, StandControlMap};
    use crate::models::Layer;
    use assert_approx_eq::assert_approx_eq;
    use proptest::prelude::*;

    fn controls_for(species: &[&str]) -> StandControlMap {
        let mut map = StandControlMap::new();
        for (k, alias) in species.iter().enumerate() {
            let base = 20 + k as i32;
            map.insert_equation_group(EquationGroupKind::Volume, *alias, "CDF", base);
            map.insert_equation_group(EquationGroupKind::Decay, *alias, "CDF", base + 20);
            map.insert_equation_group(EquationGroupKind::Breakage, *alias, "CDF", base + 40);
            map.insert_volume_coefficients(base, vec![-9.0, 1.8, 1.0]);
        }
        map
    }

    fn sited_species(alias: &str, genus: usize, ba_all: f64) -> SpeciesRecord {
        let mut s = SpeciesRecord::new(alias, genus);
        s.percent = 100.0;
        s.utilization.basal_area.set(UtilizationClass::All, ba_all);
        s.site.site_index = Some(18.0);
        s.site.total_age = Some(60.0);
        s.site.years_at_breast_height = Some(55.0);
        s
    }

    fn single_species_polygon(ba_all: f64) -> Polygon {
        let mut polygon = Polygon::new("P1", 2020, "CDF");
        let mut layer = Layer::new(LayerType::Primary);
        layer.utilization.basal_area.set(UtilizationClass::All, ba_all);
        layer.species.push(sited_species("S", 5, ba_all));
        polygon.layers.insert(LayerType::Primary, layer);
        polygon
    }

    #[test]
    fn test_step_order_and_boundaries() {
        assert_eq!(ProcessingStep::first(), ProcessingStep::RankSpecies);
        assert_eq!(ProcessingStep::last(), ProcessingStep::GrowForward);
        assert!(ProcessingStep::RankSpecies < ProcessingStep::GrowForward);

        let mut step = ProcessingStep::first();
        let mut visited = vec![step];
        while let Ok(next) = step.successor() {
            step = next;
            visited.push(step);
        }
        assert_eq!(visited, ProcessingStep::ALL.to_vec());

        assert!(matches!(
            ProcessingStep::first().predecessor(),
            Err(StateError::NoSuchStep("before", "first"))
        ));
        assert!(matches!(
            ProcessingStep::last().successor(),
            Err(StateError::NoSuchStep("after", "last"))
        ));
        assert_eq!(
            ProcessingStep::GrowForward.predecessor().unwrap(),
            ProcessingStep::ComputeCompatibilityVariables
        );
    }

    #[test]
    fn test_retention_drops_negligible_species() {
        let controls = controls_for(&["S", "T"]);
        let mut polygon = single_species_polygon(10.0);
        let mut tiny = SpeciesRecord::new("T", 6);
        tiny.utilization
            .basal_area
            .set(UtilizationClass::All, 0.0005);
        polygon
            .layers
            .get_mut(&LayerType::Primary)
            .unwrap()
            .species
            .push(tiny);

        let engine = ProcessingEngine::new(&controls);
        let result = engine
            .process_polygon_to(polygon, ProcessingStep::RankSpecies)
            .unwrap();
        assert_eq!(result.primary_layer().unwrap().species.len(), 1);
    }

    #[test]
    fn test_rank_species_requires_a_species() {
        let controls = controls_for(&[]);
        let mut polygon = Polygon::new("Empty", 2020, "CDF");
        polygon
            .layers
            .insert(LayerType::Primary, Layer::new(LayerType::Primary));
        let engine = ProcessingEngine::new(&controls);
        let err = engine
            .process_polygon_to(polygon, ProcessingStep::RankSpecies)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedLayer(_)));
    }

    #[test]
    fn test_mixed_stand_inventory_type_group_is_offset() {
        let controls = controls_for(&["S", "T"]);
        let mut polygon = single_species_polygon(10.0);
        {
            let layer = polygon.layers.get_mut(&LayerType::Primary).unwrap();
            let mut other = SpeciesRecord::new("T", 6);
            other.utilization.basal_area.set(UtilizationClass::All, 9.0);
            layer.species.push(other);
            layer.utilization.basal_area.set(UtilizationClass::All, 19.0);
        }

        // 10 / 19 is below the pure-stand share, so the group is offset
        let mut state = ProcessingState::try_new(polygon, &controls, |_| true).unwrap();
        let engine = ProcessingEngine::new(&controls);
        engine.rank_species(&mut state).unwrap();
        let ranking = state.primary().ranking().unwrap();
        assert_eq!(ranking.primary_index, 1);
        assert_eq!(ranking.secondary_index, Some(2));
        assert_eq!(ranking.inventory_type_group, 35);
        assert_eq!(ranking.basal_area_group, 20);
        assert_eq!(ranking.stratum_group, 40);
    }

    #[test]
    fn test_missing_site_index_is_terminal() {
        let controls = controls_for(&["S"]);
        let mut polygon = single_species_polygon(10.0);
        polygon
            .layers
            .get_mut(&LayerType::Primary)
            .unwrap()
            .species[0]
            .site
            .site_index = None;

        let engine = ProcessingEngine::new(&controls);
        let err = engine
            .process_polygon_to(polygon, ProcessingStep::SetPrimaryDetails)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedLayer(msg) if msg.contains("site index")));
    }

    #[test]
    fn test_primary_details_derive_missing_ages_and_height() {
        let controls = controls_for(&["S"]);
        let polygon = single_species_polygon(10.0);
        let engine = ProcessingEngine::new(&controls);

        let mut state = ProcessingState::try_new(polygon, &controls, |_| true).unwrap();
        engine.rank_species(&mut state).unwrap();
        engine.assign_site_curves(&mut state).unwrap();
        engine.set_primary_details(&mut state).unwrap();

        let details = state.primary().primary_details().unwrap();
        assert_eq!(details.total_age, 60.0);
        assert_eq!(details.age_at_breast_height, 55.0);
        assert_eq!(details.age_to_breast_height, 5.0);
        // height came from the default site curve
        let expected = estimate::dominant_height(
            controls.site_curve(0).unwrap(),
            18.0,
            55.0,
        );
        assert_approx_eq!(details.dominant_height, expected, 1e-12);
    }

    #[test]
    fn test_fit_skipped_for_single_species() {
        let controls = controls_for(&["S"]);
        let polygon = single_species_polygon(10.0);
        let engine = ProcessingEngine::new(&controls);
        // would fail on missing layer QMD if it ran; skipping leaves data alone
        let result = engine
            .process_polygon_to(polygon, ProcessingStep::FitDiameterDistribution)
            .unwrap();
        let species = &result.primary_layer().unwrap().species[0];
        assert_eq!(species.utilization.basal_area.get(UtilizationClass::All), 10.0);
    }

    #[test]
    fn test_fit_calibrates_percentages_and_diameters() {
        let controls = controls_for(&["S", "T"]);
        let mut polygon = Polygon::new("Fit", 2020, "CDF");
        let mut layer = Layer::new(LayerType::Primary);
        layer.utilization.basal_area.set(UtilizationClass::All, 30.0);
        layer
            .utilization
            .quad_mean_diameter
            .set(UtilizationClass::All, 28.0);
        for (alias, genus, pct, d, h) in
            [("S", 5, 60.0, 30.0, 30.0), ("T", 6, 40.0, 25.0, 28.0)]
        {
            let mut s = sited_species(alias, genus, 30.0 * pct / 100.0);
            s.percent = pct;
            s.utilization.quad_mean_diameter.set(UtilizationClass::All, d);
            s.utilization.lorey_height.set(UtilizationClass::All, h);
            layer.species.push(s);
        }
        polygon.layers.insert(LayerType::Primary, layer);

        let engine = ProcessingEngine::new(&controls);
        let result = engine
            .process_polygon_to(polygon, ProcessingStep::FitDiameterDistribution)
            .unwrap();
        let layer = result.primary_layer().unwrap();

        // percentages still partition the layer
        let total: f64 = layer.species.iter().map(|s| s.percent).sum();
        assert_approx_eq!(total, 100.0, 1e-9);

        // the layer QMD goal is met by the calibrated per-species diameters
        let total_tph: f64 = layer
            .species
            .iter()
            .map(|s| s.utilization.trees_per_hectare.get(UtilizationClass::All))
            .sum();
        let layer_qmd = estimate::quad_mean_diameter(30.0, total_tph);
        assert_approx_eq!(layer_qmd, 28.0, 0.05);
    }

    #[test]
    fn test_compatibility_variables_from_known_curves() {
        let mut controls = controls_for(&["S"]);
        // basal-area curve: everything reaches U0, half reaches each later class
        controls.insert_class_ratio(
            RatioKind::BasalArea,
            20,
            UtilizationClass::U0,
            [100.0, 0.0],
        );
        controls.set_default_class_ratio(RatioKind::BasalArea, [0.0, 0.0]);
        controls.set_default_class_ratio(RatioKind::QuadMeanDiameter, [0.0, 0.0]);

        let mut polygon = single_species_polygon(8.0);
        {
            let layer = polygon.layers.get_mut(&LayerType::Primary).unwrap();
            layer
                .utilization
                .quad_mean_diameter
                .set(UtilizationClass::All, 20.0);
            let u = &mut layer.species[0].utilization;
            u.quad_mean_diameter.set(UtilizationClass::All, 20.0);
            u.basal_area.set(UtilizationClass::U0, 8.0);
            u.quad_mean_diameter.set(UtilizationClass::U0, 20.0);
            u.basal_area.set(UtilizationClass::U75, 6.0);
            u.quad_mean_diameter.set(UtilizationClass::U75, 22.0);
        }

        let engine = ProcessingEngine::new(&controls);
        let result = engine
            .process_polygon_to(polygon, ProcessingStep::ComputeCompatibilityVariables)
            .unwrap();
        let cv = result.primary_layer().unwrap().species[0]
            .compatibility
            .clone()
            .unwrap();

        // fitted U75 basal area is 8 * 0.5 = 4 against a supplied 6
        assert_approx_eq!(
            cv.basal_area(UtilizationClass::U75, LayerType::Primary),
            2.0,
            1e-9
        );
        // fitted U75 diameter is the layer value 20 against a supplied 22
        assert_approx_eq!(
            cv.quad_mean_diameter(UtilizationClass::U75, LayerType::Primary),
            2.0,
            1e-9
        );
        // nothing supplied at U125: both adjustments gate to zero
        assert_eq!(cv.basal_area(UtilizationClass::U125, LayerType::Primary), 0.0);
        assert_eq!(
            cv.quad_mean_diameter(UtilizationClass::U125, LayerType::Primary),
            0.0
        );
        // no volumes supplied anywhere: every volume adjustment gates to zero
        for uc in UtilizationClass::MERCHANTABLE_CLASSES {
            for vv in VolumeVariable::ALL {
                assert_eq!(cv.volume(uc, vv, LayerType::Primary), 0.0);
            }
        }
    }

    #[test]
    fn test_qmd_gate_checks_only_the_supplied_diameter() {
        // A class can carry a supplied diameter while the fitted curve
        // produces none; the adjustment is still taken, it does not gate on
        // the recomputed side.
        let mut controls = controls_for(&["S"]);
        // fitted basal area vanishes in every threshold class
        controls.set_default_class_ratio(RatioKind::BasalArea, [-100.0, 0.0]);
        controls.set_default_class_ratio(RatioKind::QuadMeanDiameter, [0.0, 0.0]);

        let mut polygon = single_species_polygon(8.0);
        {
            let layer = polygon.layers.get_mut(&LayerType::Primary).unwrap();
            layer
                .utilization
                .quad_mean_diameter
                .set(UtilizationClass::All, 20.0);
            let u = &mut layer.species[0].utilization;
            u.quad_mean_diameter.set(UtilizationClass::All, 20.0);
            u.basal_area.set(UtilizationClass::U0, 8.0);
            u.quad_mean_diameter.set(UtilizationClass::U0, 20.0);
            u.basal_area.set(UtilizationClass::U75, 6.0);
            u.quad_mean_diameter.set(UtilizationClass::U75, 22.0);
        }

        let engine = ProcessingEngine::new(&controls);
        let result = engine
            .process_polygon_to(polygon, ProcessingStep::ComputeCompatibilityVariables)
            .unwrap();
        let cv = result.primary_layer().unwrap().species[0]
            .compatibility
            .clone()
            .unwrap();

        // fitted diameter reconciled to zero, so the full supplied diameter
        // comes through as the adjustment
        assert_approx_eq!(
            cv.quad_mean_diameter(UtilizationClass::U75, LayerType::Primary),
            22.0,
            1e-9
        );
        assert_approx_eq!(
            cv.basal_area(UtilizationClass::U75, LayerType::Primary),
            6.0,
            1e-9
        );
    }

    #[test]
    fn test_grow_forward_advances_to_target_year() {
        let controls = controls_for(&["S"]);
        let mut polygon = single_species_polygon(20.0);
        polygon.target_year = Some(2025);
        {
            let layer = polygon.layers.get_mut(&LayerType::Primary).unwrap();
            layer.species[0]
                .utilization
                .trees_per_hectare
                .set(UtilizationClass::All, 800.0);
            layer
                .utilization
                .trees_per_hectare
                .set(UtilizationClass::All, 800.0);
        }

        let engine = ProcessingEngine::new(&controls);
        let result = engine.process_polygon(polygon).unwrap();
        assert_eq!(result.reference_year, 2025);

        let species = &result.primary_layer().unwrap().species[0];
        let grown_ba = species.utilization.basal_area.get(UtilizationClass::All);
        assert!(grown_ba > 20.0);
        // mortality thins the stand each year
        let grown_tph = species
            .utilization
            .trees_per_hectare
            .get(UtilizationClass::All);
        assert!(grown_tph < 800.0 && grown_tph > 0.0);
        // ages advanced five years
        assert_eq!(species.site.total_age, Some(65.0));
        assert_eq!(species.site.years_at_breast_height, Some(60.0));
        // identity still holds after growth
        assert_approx_eq!(
            grown_ba,
            estimate::K
                * grown_tph
                * species
                    .utilization
                    .quad_mean_diameter
                    .get(UtilizationClass::All)
                    .powi(2),
            1e-9
        );
    }

    #[test]
    fn test_volume_adjustment_gates_on_negligible_base() {
        // a negligible base yields exactly zero no matter how large the
        // actual or fitted values are
        assert_eq!(paired_logit_adjustment(5.0, 1.0, 0.05), 0.0);
        assert_eq!(paired_logit_adjustment(5.0, 1.0, MIN_BASE_VOLUME), 0.0);
        assert_eq!(paired_logit_adjustment(0.0, 100.0, 0.0), 0.0);
        // just past the threshold the adjustment is live
        let live = paired_logit_adjustment(0.15, 0.05, 0.2);
        assert!(live != 0.0);
        assert_approx_eq!(
            live,
            math::clamped_logit(0.75) - math::clamped_logit(0.25),
            1e-12
        );
    }

    #[test]
    fn test_supplied_volume_over_negligible_base_stores_zero_adjustment() {
        let controls = controls_for(&["S"]);
        let mut polygon = single_species_polygon(8.0);
        {
            let layer = polygon.layers.get_mut(&LayerType::Primary).unwrap();
            layer
                .utilization
                .quad_mean_diameter
                .set(UtilizationClass::All, 20.0);
            let u = &mut layer.species[0].utilization;
            u.quad_mean_diameter.set(UtilizationClass::All, 20.0);
            u.basal_area.set(UtilizationClass::U0, 8.0);
            u.quad_mean_diameter.set(UtilizationClass::U0, 20.0);
            u.basal_area.set(UtilizationClass::U75, 6.0);
            u.quad_mean_diameter.set(UtilizationClass::U75, 22.0);
            // close-utilization volume present, but its whole-stem base is
            // below the 0.1 minimum
            u.whole_stem_volume.set(UtilizationClass::U75, 0.05);
            u.close_util_volume.set(UtilizationClass::U75, 5.0);
        }

        let engine = ProcessingEngine::new(&controls);
        let result = engine
            .process_polygon_to(polygon, ProcessingStep::ComputeCompatibilityVariables)
            .unwrap();
        let cv = result.primary_layer().unwrap().species[0]
            .compatibility
            .clone()
            .unwrap();
        assert_eq!(
            cv.volume(
                UtilizationClass::U75,
                VolumeVariable::CloseUtil,
                LayerType::Primary
            ),
            0.0
        );
    }

    proptest! {
        #[test]
        fn prop_negligible_base_always_gates_to_zero(
            actual in 0.0f64..1000.0,
            fitted in 0.0f64..1000.0,
            base in 0.0f64..=MIN_BASE_VOLUME,
        ) {
            prop_assert_eq!(paired_logit_adjustment(actual, fitted, base), 0.0);
        }
    }

    #[test]
    fn test_grow_forward_skipped_without_target_year() {
        let controls = controls_for(&["S"]);
        let polygon = single_species_polygon(20.0);
        let engine = ProcessingEngine::new(&controls);
        let result = engine.process_polygon(polygon).unwrap();
        assert_eq!(result.reference_year, 2020);
        let species = &result.primary_layer().unwrap().species[0];
        assert_eq!(species.site.total_age, Some(60.0));
    }
}
