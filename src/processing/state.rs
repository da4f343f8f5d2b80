//! Per-polygon processing state: one bank per layer plus the facts derived
//! from it during processing.
//!
//! Most derived facts are write-once: a setter may run exactly once per layer
//! state, and reading before it has run is a [`StateError::Unset`] contract
//! violation. The single exception is the primary-species details, which may
//! be overwritten mid-growth-cycle when the control map's
//! `update_during_growth` flag is on.

use tracing::debug;

use crate::control::{CompatibilityAdjustments, ControlMap, EquationGroupKind};
use crate::error::{ProcessingError, StateError};
use crate::models::{
    CompatibilityVariables, Layer, LayerType, Polygon, SmallVariable, SpeciesRecord,
    UtilizationClass, VolumeVariable,
};

use super::bank::Bank;

/// Equation-group value for the aggregate slot, which has no species.
pub const MISSING_GROUP: i32 = -9;

/// Species ranking computed once per layer and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeciesRanking {
    pub primary_index: usize,
    pub secondary_index: Option<usize>,
    pub inventory_type_group: i32,
    pub basal_area_group: i32,
    pub stratum_group: i32,
}

/// Site details of the layer's primary species.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimarySpeciesDetails {
    pub dominant_height: f64,
    pub site_index: f64,
    pub total_age: f64,
    pub age_at_breast_height: f64,
    pub age_to_breast_height: f64,
}

/// Processing state of one layer of one polygon.
#[derive(Debug)]
pub struct LayerState {
    layer_type: LayerType,
    bank: Bank,

    volume_equation_groups: Vec<i32>,
    decay_equation_groups: Vec<i32>,
    breakage_equation_groups: Vec<i32>,

    ranking: Option<SpeciesRanking>,
    site_curve_numbers: Option<Vec<i32>>,
    primary_details: Option<PrimarySpeciesDetails>,
    compatibility: Option<Vec<CompatibilityVariables>>,
}

impl LayerState {
    /// Build a bank from the layer and resolve the volume/decay/breakage
    /// equation groups of every retained species.
    pub fn try_new<C: ControlMap>(
        layer: &Layer,
        bec_alias: &str,
        controls: &C,
        retention: impl Fn(&SpeciesRecord) -> bool,
    ) -> Result<Self, ProcessingError> {
        let bank = Bank::try_new(layer, bec_alias, retention)?;
        let n = bank.n_species();

        let mut volume_equation_groups = vec![MISSING_GROUP; n + 1];
        let mut decay_equation_groups = vec![MISSING_GROUP; n + 1];
        let mut breakage_equation_groups = vec![MISSING_GROUP; n + 1];

        for i in bank.indices() {
            let alias = bank.species_names[i].as_str();
            let mut volume_group =
                controls.equation_group(EquationGroupKind::Volume, alias, bec_alias)?;
            // Legacy remapping from VGRPFIND: group 10 is treated as 11.
            if volume_group == 10 {
                volume_group = 11;
            }
            volume_equation_groups[i] = volume_group;
            decay_equation_groups[i] =
                controls.equation_group(EquationGroupKind::Decay, alias, bec_alias)?;
            breakage_equation_groups[i] =
                controls.equation_group(EquationGroupKind::Breakage, alias, bec_alias)?;
        }

        debug!(
            layer = ?layer.layer_type,
            species = n,
            "layer state constructed"
        );

        Ok(LayerState {
            layer_type: layer.layer_type,
            bank,
            volume_equation_groups,
            decay_equation_groups,
            breakage_equation_groups,
            ranking: None,
            site_curve_numbers: None,
            primary_details: None,
            compatibility: None,
        })
    }

    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut Bank {
        &mut self.bank
    }

    /// Replace the bank wholesale, after a successful speculative
    /// calibration on a clone.
    pub fn commit_bank(&mut self, bank: Bank) {
        self.bank = bank;
    }

    pub fn n_species(&self) -> usize {
        self.bank.n_species()
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.bank.indices()
    }

    pub fn volume_equation_group(&self, i: usize) -> i32 {
        self.volume_equation_groups[i]
    }

    pub fn decay_equation_group(&self, i: usize) -> i32 {
        self.decay_equation_groups[i]
    }

    pub fn breakage_equation_group(&self, i: usize) -> i32 {
        self.breakage_equation_groups[i]
    }

    // ---- species ranking -------------------------------------------------

    pub fn set_ranking(&mut self, ranking: SpeciesRanking) -> Result<(), StateError> {
        if self.ranking.is_some() {
            return Err(StateError::AlreadySet("speciesRankingDetails"));
        }
        self.ranking = Some(ranking);
        Ok(())
    }

    pub fn ranking(&self) -> Result<&SpeciesRanking, StateError> {
        self.ranking.as_ref().ok_or(StateError::Unset("rankingDetails"))
    }

    pub fn primary_species_index(&self) -> Result<usize, StateError> {
        Ok(self.ranking()?.primary_index)
    }

    pub fn primary_species_alias(&self) -> Result<&str, StateError> {
        Ok(self.bank.species_names[self.primary_species_index()?].as_str())
    }

    pub fn secondary_species_index(&self) -> Result<usize, StateError> {
        self.ranking()?
            .secondary_index
            .ok_or(StateError::Unset("secondarySpeciesIndex"))
    }

    pub fn inventory_type_group(&self) -> Result<i32, StateError> {
        Ok(self.ranking()?.inventory_type_group)
    }

    // ---- site curve numbers ----------------------------------------------

    pub fn set_site_curve_numbers(&mut self, numbers: Vec<i32>) -> Result<(), StateError> {
        if self.site_curve_numbers.is_some() {
            return Err(StateError::AlreadySet("siteCurveNumbers"));
        }
        self.site_curve_numbers = Some(numbers);
        Ok(())
    }

    /// Site curve number of species `i`. Slot 0 mirrors the primary species,
    /// so it additionally requires the ranking to have been computed.
    pub fn site_curve_number(&self, i: usize) -> Result<i32, StateError> {
        let numbers = self
            .site_curve_numbers
            .as_ref()
            .ok_or(StateError::Unset("siteCurveNumbers"))?;
        if i == 0 {
            return Ok(numbers[self.primary_species_index()?]);
        }
        Ok(numbers[i])
    }

    // ---- primary species details -------------------------------------------

    /// Set the primary-species details. Allowed once; re-setting is only
    /// permitted when `allow_update` (the `update_during_growth` control
    /// flag) is on. Backfills any missing bank site fields for the primary
    /// species.
    pub fn set_primary_details(
        &mut self,
        details: PrimarySpeciesDetails,
        allow_update: bool,
    ) -> Result<(), StateError> {
        if self.primary_details.is_some() && !allow_update {
            return Err(StateError::AlreadySet("primarySpeciesDetails"));
        }
        let p = self.primary_species_index()?;

        if self.bank.dominant_heights[p].unwrap_or(0.0) <= 0.0 {
            self.bank.dominant_heights[p] = Some(details.dominant_height);
        }
        if self.bank.site_indices[p].unwrap_or(0.0) <= 0.0 {
            self.bank.site_indices[p] = Some(details.site_index);
        }
        if self.bank.age_totals[p].unwrap_or(0.0) <= 0.0 {
            self.bank.age_totals[p] = Some(details.total_age);
        }
        if self.bank.years_at_breast_height[p].unwrap_or(0.0) <= 0.0 {
            self.bank.years_at_breast_height[p] = Some(details.age_at_breast_height);
        }
        if self.bank.years_to_breast_height[p].unwrap_or(0.0) <= 0.0 {
            self.bank.years_to_breast_height[p] = Some(details.age_to_breast_height);
        }

        self.primary_details = Some(details);
        Ok(())
    }

    pub fn primary_details(&self) -> Result<&PrimarySpeciesDetails, StateError> {
        self.primary_details
            .as_ref()
            .ok_or(StateError::Unset("primarySpeciesDetails"))
    }

    pub fn primary_species_dominant_height(&self) -> Result<f64, StateError> {
        Ok(self.primary_details()?.dominant_height)
    }

    pub fn primary_species_site_index(&self) -> Result<f64, StateError> {
        Ok(self.primary_details()?.site_index)
    }

    pub fn primary_species_total_age(&self) -> Result<f64, StateError> {
        Ok(self.primary_details()?.total_age)
    }

    pub fn primary_species_age_at_breast_height(&self) -> Result<f64, StateError> {
        Ok(self.primary_details()?.age_at_breast_height)
    }

    pub fn primary_species_age_to_breast_height(&self) -> Result<f64, StateError> {
        Ok(self.primary_details()?.age_to_breast_height)
    }

    /// Age the cached primary-species details by one growth year. Only the
    /// cached values change here; the bank is updated through
    /// [`Self::set_primary_details`] when the update-during-growth flag is on.
    pub fn update_primary_details_after_growth(
        &mut self,
        new_dominant_height: f64,
    ) -> Result<(), StateError> {
        let details = self
            .primary_details
            .as_mut()
            .ok_or(StateError::Unset("primarySpeciesDetails"))?;
        details.dominant_height = new_dominant_height;
        details.total_age += 1.0;
        details.age_at_breast_height += 1.0;
        Ok(())
    }

    // ---- compatibility variables -------------------------------------------

    /// Store the per-species compatibility-variable tables, slot-aligned
    /// with the bank (slot 0 zeroed). Write-once.
    pub fn set_compatibility_variables(
        &mut self,
        variables: Vec<CompatibilityVariables>,
    ) -> Result<(), StateError> {
        if self.compatibility.is_some() {
            return Err(StateError::AlreadySet("compatibilityVariables"));
        }
        debug_assert_eq!(variables.len(), self.n_species() + 1);
        self.compatibility = Some(variables);
        Ok(())
    }

    fn compatibility(&self) -> Result<&Vec<CompatibilityVariables>, StateError> {
        self.compatibility
            .as_ref()
            .ok_or(StateError::Unset("compatibilityVariables"))
    }

    pub fn cv_volume(
        &self,
        species: usize,
        uc: UtilizationClass,
        vv: VolumeVariable,
        lt: LayerType,
    ) -> Result<f64, StateError> {
        Ok(self.compatibility()?[species].volume(uc, vv, lt))
    }

    pub fn cv_basal_area(
        &self,
        species: usize,
        uc: UtilizationClass,
        lt: LayerType,
    ) -> Result<f64, StateError> {
        Ok(self.compatibility()?[species].basal_area(uc, lt))
    }

    pub fn cv_quad_mean_diameter(
        &self,
        species: usize,
        uc: UtilizationClass,
        lt: LayerType,
    ) -> Result<f64, StateError> {
        Ok(self.compatibility()?[species].quad_mean_diameter(uc, lt))
    }

    pub fn cv_small(&self, species: usize, sv: SmallVariable) -> Result<f64, StateError> {
        Ok(self.compatibility()?[species].small(sv))
    }

    /// Age the stored compatibility variables by one growth year using the
    /// control map's multiplicative adjustments. Mutates the stored tables
    /// in place; this is not a re-set.
    pub fn scale_compatibility_variables(
        &mut self,
        adjustments: &CompatibilityAdjustments,
    ) -> Result<(), StateError> {
        let variables = self
            .compatibility
            .as_mut()
            .ok_or(StateError::Unset("compatibilityVariables"))?;
        for cv in variables.iter_mut() {
            cv.scale(
                |uc, vv| adjustments.volume_factor(uc, vv),
                |uc| adjustments.basal_area_factor(uc),
                |uc| adjustments.quad_mean_diameter_factor(uc),
                |sv| adjustments.small_factor(sv),
            );
        }
        Ok(())
    }

    /// Rebuild the domain layer from the bank, attaching the compatibility
    /// variables to primary-layer species when they have been computed.
    pub fn build_layer(&self) -> Layer {
        let mut layer = self.bank.build_layer();
        if self.layer_type == LayerType::Primary {
            if let Some(variables) = &self.compatibility {
                for (slot, species) in layer.species.iter_mut().enumerate() {
                    species.compatibility = Some(variables[slot + 1].clone());
                }
            }
        }
        layer
    }
}

/// Processing state for a whole polygon: the primary layer (mandatory) and
/// the veteran layer when present.
#[derive(Debug)]
pub struct ProcessingState<'a, C: ControlMap> {
    controls: &'a C,
    polygon: Polygon,
    primary: LayerState,
    veteran: Option<LayerState>,
}

impl<'a, C: ControlMap> ProcessingState<'a, C> {
    pub fn try_new(
        polygon: Polygon,
        controls: &'a C,
        retention: impl Fn(&SpeciesRecord) -> bool + Copy,
    ) -> Result<Self, ProcessingError> {
        let primary_layer = polygon
            .layer(LayerType::Primary)
            .ok_or_else(|| ProcessingError::NoPrimaryLayer(polygon.id.clone()))?;

        let primary = LayerState::try_new(primary_layer, &polygon.bec_alias, controls, retention)?;
        let veteran = polygon
            .layer(LayerType::Veteran)
            .map(|layer| LayerState::try_new(layer, &polygon.bec_alias, controls, retention))
            .transpose()?;

        Ok(ProcessingState {
            controls,
            polygon,
            primary,
            veteran,
        })
    }

    pub fn controls(&self) -> &'a C {
        self.controls
    }

    pub fn polygon(&self) -> &Polygon {
        &self.polygon
    }

    pub fn polygon_mut(&mut self) -> &mut Polygon {
        &mut self.polygon
    }

    pub fn bec_alias(&self) -> &str {
        &self.polygon.bec_alias
    }

    pub fn primary(&self) -> &LayerState {
        &self.primary
    }

    pub fn primary_mut(&mut self) -> &mut LayerState {
        &mut self.primary
    }

    pub fn veteran(&self) -> Option<&LayerState> {
        self.veteran.as_ref()
    }

    /// Rebuild every layer from its bank and hand the updated polygon back.
    pub fn into_polygon(mut self) -> Polygon {
        self.polygon
            .layers
            .insert(LayerType::Primary, self.primary.build_layer());
        if let Some(veteran) = &self.veteran {
            self.polygon
                .layers
                .insert(LayerType::Veteran, veteran.build_layer());
        }
        self.polygon
    }
}
