//! Read-only access to the resolved control map.
//!
//! Configuration loading is out of scope for this crate; the engine sees the
//! already-resolved tables through the [`ControlMap`] trait only. All lookup
//! results are opaque data to the engine: which equation group applies to
//! which species/zone, and what the coefficients mean, is decided upstream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;
use crate::models::{SmallVariable, UtilizationClass, VolumeVariable};

/// Which equation-group table a lookup is against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EquationGroupKind {
    Volume,
    Decay,
    Breakage,
}

impl EquationGroupKind {
    pub fn label(self) -> &'static str {
        match self {
            EquationGroupKind::Volume => "volume",
            EquationGroupKind::Decay => "decay",
            EquationGroupKind::Breakage => "breakage",
        }
    }
}

/// Which per-utilization-class ratio curve a lookup is against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RatioKind {
    BasalArea,
    QuadMeanDiameter,
    CloseUtil,
    NetDecay,
    NetDecayWaste,
}

/// Coefficients of a breast-height ageing curve:
/// `height = 1.3 + (site_index - 1.3) * (1 - e^(-b1 * age))^b2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteCurve {
    pub b1: f64,
    pub b2: f64,
}

impl Default for SiteCurve {
    fn default() -> Self {
        SiteCurve { b1: 0.025, b2: 1.3 }
    }
}

/// Layer-level logistic growth coefficients for the forward grow cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthCoefficients {
    /// Annual basal-area growth rate
    pub annual_rate: f64,
    /// Basal-area carrying capacity (m²/ha)
    pub basal_area_limit: f64,
    /// Annual stem mortality as a proportion of trees per hectare
    pub mortality_rate: f64,
}

impl Default for GrowthCoefficients {
    fn default() -> Self {
        GrowthCoefficients {
            annual_rate: 0.02,
            basal_area_limit: 60.0,
            mortality_rate: 0.002,
        }
    }
}

/// Multiplicative per-class adjustments applied to the compatibility
/// variables after each year of growth. All factors default to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityAdjustments {
    volume: [[f64; VolumeVariable::COUNT]; UtilizationClass::COUNT],
    basal_area: [f64; UtilizationClass::COUNT],
    quad_mean_diameter: [f64; UtilizationClass::COUNT],
    small: [f64; SmallVariable::COUNT],
}

impl Default for CompatibilityAdjustments {
    fn default() -> Self {
        CompatibilityAdjustments {
            volume: [[1.0; VolumeVariable::COUNT]; UtilizationClass::COUNT],
            basal_area: [1.0; UtilizationClass::COUNT],
            quad_mean_diameter: [1.0; UtilizationClass::COUNT],
            small: [1.0; SmallVariable::COUNT],
        }
    }
}

impl CompatibilityAdjustments {
    pub fn volume_factor(&self, uc: UtilizationClass, vv: VolumeVariable) -> f64 {
        self.volume[uc.index()][vv.index()]
    }

    pub fn set_volume_factor(&mut self, uc: UtilizationClass, vv: VolumeVariable, f: f64) {
        self.volume[uc.index()][vv.index()] = f;
    }

    pub fn basal_area_factor(&self, uc: UtilizationClass) -> f64 {
        self.basal_area[uc.index()]
    }

    pub fn set_basal_area_factor(&mut self, uc: UtilizationClass, f: f64) {
        self.basal_area[uc.index()] = f;
    }

    pub fn quad_mean_diameter_factor(&self, uc: UtilizationClass) -> f64 {
        self.quad_mean_diameter[uc.index()]
    }

    pub fn set_quad_mean_diameter_factor(&mut self, uc: UtilizationClass, f: f64) {
        self.quad_mean_diameter[uc.index()] = f;
    }

    pub fn small_factor(&self, sv: SmallVariable) -> f64 {
        self.small[sv.index()]
    }

    pub fn set_small_factor(&mut self, sv: SmallVariable, f: f64) {
        self.small[sv.index()] = f;
    }
}

/// Resolved-control-map lookup service consumed by the engine.
///
/// Immutable for the duration of a run.
pub trait ControlMap {
    /// Equation-group id for a (species alias, BEC zone alias) pair.
    fn equation_group(
        &self,
        kind: EquationGroupKind,
        species_alias: &str,
        bec_alias: &str,
    ) -> Result<i32, ProcessingError>;

    /// Whole-stem volume coefficients for a volume equation group:
    /// `ln(v) = c0 + c1 ln(qmd) + c2 ln(lorey_height)`.
    fn volume_coefficients(&self, group: i32) -> Result<&[f64], ProcessingError>;

    /// `[b0, b1]` of the logit curve giving the fraction of a layer-level
    /// quantity attributed to one utilization class.
    fn class_ratio_coefficients(
        &self,
        kind: RatioKind,
        group: i32,
        uc: UtilizationClass,
    ) -> [f64; 2];

    fn site_curve(&self, curve_number: i32) -> Result<SiteCurve, ProcessingError>;

    /// Site curve number used for a species that did not supply one.
    fn default_site_curve_number(&self, species_alias: &str) -> i32;

    fn growth(&self) -> &GrowthCoefficients;

    fn compatibility_adjustments(&self) -> &CompatibilityAdjustments;

    /// When on, primary-species details may be recomputed mid-growth-cycle.
    /// The single deliberate exception to the write-once rules.
    fn update_during_growth(&self) -> bool;
}

/// In-memory [`ControlMap`] backed by hash maps, populated by the caller's
/// configuration layer (or directly by tests).
#[derive(Debug, Clone, Default)]
pub struct StandControlMap {
    equation_groups: HashMap<(EquationGroupKind, String, String), i32>,
    volume_coefficients: HashMap<i32, Vec<f64>>,
    class_ratios: HashMap<(RatioKind, i32, UtilizationClass), [f64; 2]>,
    default_class_ratios: HashMap<RatioKind, [f64; 2]>,
    site_curves: HashMap<i32, SiteCurve>,
    default_site_curve_numbers: HashMap<String, i32>,
    growth: GrowthCoefficients,
    adjustments: CompatibilityAdjustments,
    update_during_growth: bool,
}

impl StandControlMap {
    pub fn new() -> Self {
        let mut map = StandControlMap::default();
        map.site_curves.insert(0, SiteCurve::default());
        map
    }

    pub fn insert_equation_group(
        &mut self,
        kind: EquationGroupKind,
        species_alias: impl Into<String>,
        bec_alias: impl Into<String>,
        group: i32,
    ) {
        self.equation_groups
            .insert((kind, species_alias.into(), bec_alias.into()), group);
    }

    pub fn insert_volume_coefficients(&mut self, group: i32, coefficients: Vec<f64>) {
        self.volume_coefficients.insert(group, coefficients);
    }

    pub fn insert_class_ratio(
        &mut self,
        kind: RatioKind,
        group: i32,
        uc: UtilizationClass,
        coefficients: [f64; 2],
    ) {
        self.class_ratios.insert((kind, group, uc), coefficients);
    }

    pub fn set_default_class_ratio(&mut self, kind: RatioKind, coefficients: [f64; 2]) {
        self.default_class_ratios.insert(kind, coefficients);
    }

    pub fn insert_site_curve(&mut self, curve_number: i32, curve: SiteCurve) {
        self.site_curves.insert(curve_number, curve);
    }

    pub fn insert_default_site_curve_number(&mut self, species_alias: impl Into<String>, curve_number: i32) {
        self.default_site_curve_numbers
            .insert(species_alias.into(), curve_number);
    }

    pub fn set_growth(&mut self, growth: GrowthCoefficients) {
        self.growth = growth;
    }

    pub fn adjustments_mut(&mut self) -> &mut CompatibilityAdjustments {
        &mut self.adjustments
    }

    pub fn set_update_during_growth(&mut self, on: bool) {
        self.update_during_growth = on;
    }
}

impl ControlMap for StandControlMap {
    fn equation_group(
        &self,
        kind: EquationGroupKind,
        species_alias: &str,
        bec_alias: &str,
    ) -> Result<i32, ProcessingError> {
        self.equation_groups
            .get(&(kind, species_alias.to_string(), bec_alias.to_string()))
            .copied()
            .ok_or_else(|| ProcessingError::MissingEquationGroup {
                kind: kind.label(),
                species: species_alias.to_string(),
                bec: bec_alias.to_string(),
            })
    }

    fn volume_coefficients(&self, group: i32) -> Result<&[f64], ProcessingError> {
        self.volume_coefficients
            .get(&group)
            .map(Vec::as_slice)
            .ok_or(ProcessingError::MissingCoefficients {
                kind: "volume",
                group,
            })
    }

    fn class_ratio_coefficients(
        &self,
        kind: RatioKind,
        group: i32,
        uc: UtilizationClass,
    ) -> [f64; 2] {
        self.class_ratios
            .get(&(kind, group, uc))
            .or_else(|| self.default_class_ratios.get(&kind))
            .copied()
            .unwrap_or([0.0, 0.0])
    }

    fn site_curve(&self, curve_number: i32) -> Result<SiteCurve, ProcessingError> {
        self.site_curves
            .get(&curve_number)
            .copied()
            .ok_or(ProcessingError::MissingCoefficients {
                kind: "site curve",
                group: curve_number,
            })
    }

    fn default_site_curve_number(&self, species_alias: &str) -> i32 {
        self.default_site_curve_numbers
            .get(species_alias)
            .copied()
            .unwrap_or(0)
    }

    fn growth(&self) -> &GrowthCoefficients {
        &self.growth
    }

    fn compatibility_adjustments(&self) -> &CompatibilityAdjustments {
        &self.adjustments
    }

    fn update_during_growth(&self) -> bool {
        self.update_during_growth
    }
}
