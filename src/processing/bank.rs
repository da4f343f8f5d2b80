//! Columnar per-layer snapshot of species and utilization-class attributes.

use crate::error::ProcessingError;
use crate::models::{
    Layer, LayerType, Sp64Entry, SpeciesRecord, UtilizationRecord, UtilizationVector,
};

/// Dense, mutable working copy of one stand layer.
///
/// Slot 0 is the layer-level aggregate row; slots `1..=n` hold the retained
/// species in their input order. Every array has length `n + 1`. The bank is
/// exclusively owned by one engine invocation; speculative calibration clones
/// it and discards the clone on failure.
#[derive(Debug, Clone)]
pub struct Bank {
    layer_type: LayerType,
    bec_alias: String,
    n_species: usize,

    // indexed [species]
    pub species_names: Vec<String>,
    pub species_indices: Vec<usize>,
    pub percentages: Vec<f64>,
    pub sp64_distributions: Vec<Vec<Sp64Entry>>,
    pub age_totals: Vec<Option<f64>>,
    pub years_to_breast_height: Vec<Option<f64>>,
    pub years_at_breast_height: Vec<Option<f64>>,
    pub dominant_heights: Vec<Option<f64>>,
    pub site_indices: Vec<Option<f64>>,
    pub site_curve_numbers: Vec<Option<i32>>,

    // indexed [species][utilization class]
    pub basal_areas: Vec<UtilizationVector>,
    pub trees_per_hectare: Vec<UtilizationVector>,
    pub quad_mean_diameters: Vec<UtilizationVector>,
    pub lorey_heights: Vec<UtilizationVector>,
    pub whole_stem_volumes: Vec<UtilizationVector>,
    pub close_util_volumes: Vec<UtilizationVector>,
    pub close_util_volumes_net_decay: Vec<UtilizationVector>,
    pub close_util_volumes_net_decay_waste: Vec<UtilizationVector>,
}

impl Bank {
    /// Copy a layer into dense arrays, retaining only the species the
    /// predicate accepts. Zero retained species is valid and yields a bank
    /// with just the aggregate slot.
    pub fn try_new(
        layer: &Layer,
        bec_alias: &str,
        retention: impl Fn(&SpeciesRecord) -> bool,
    ) -> Result<Self, ProcessingError> {
        for (i, s) in layer.species.iter().enumerate() {
            if layer.species[..i].iter().any(|t| t.alias == s.alias) {
                return Err(ProcessingError::MalformedLayer(format!(
                    "duplicate species alias '{}'",
                    s.alias
                )));
            }
        }

        let retained: Vec<&SpeciesRecord> =
            layer.species.iter().filter(|s| retention(s)).collect();
        let n = retained.len();

        let mut bank = Bank {
            layer_type: layer.layer_type,
            bec_alias: bec_alias.to_string(),
            n_species: n,
            species_names: vec![String::new(); n + 1],
            species_indices: vec![0; n + 1],
            percentages: vec![0.0; n + 1],
            sp64_distributions: vec![Vec::new(); n + 1],
            age_totals: vec![None; n + 1],
            years_to_breast_height: vec![None; n + 1],
            years_at_breast_height: vec![None; n + 1],
            dominant_heights: vec![None; n + 1],
            site_indices: vec![None; n + 1],
            site_curve_numbers: vec![None; n + 1],
            basal_areas: vec![UtilizationVector::new(); n + 1],
            trees_per_hectare: vec![UtilizationVector::new(); n + 1],
            quad_mean_diameters: vec![UtilizationVector::new(); n + 1],
            lorey_heights: vec![UtilizationVector::new(); n + 1],
            whole_stem_volumes: vec![UtilizationVector::new(); n + 1],
            close_util_volumes: vec![UtilizationVector::new(); n + 1],
            close_util_volumes_net_decay: vec![UtilizationVector::new(); n + 1],
            close_util_volumes_net_decay_waste: vec![UtilizationVector::new(); n + 1],
        };

        bank.copy_utilization(0, &layer.utilization);
        for (slot, species) in retained.iter().enumerate() {
            bank.copy_species(slot + 1, species);
        }

        Ok(bank)
    }

    /// Re-copy values from a layer that already agrees with this bank on
    /// species identity and order (after an external mutation of the domain
    /// object). Does not change `n`.
    pub fn refresh_from(&mut self, layer: &Layer) -> Result<(), ProcessingError> {
        let mut slot = 1;
        for species in &layer.species {
            if slot <= self.n_species && self.species_names[slot] == species.alias {
                self.copy_species(slot, species);
                slot += 1;
            }
        }
        if slot != self.n_species + 1 {
            return Err(ProcessingError::MalformedLayer(format!(
                "layer species do not match bank: expected {} retained species, matched {}",
                self.n_species,
                slot - 1
            )));
        }
        self.copy_utilization(0, &layer.utilization);
        Ok(())
    }

    /// The inverse of construction: a fresh layer reflecting the current
    /// array contents.
    pub fn build_layer(&self) -> Layer {
        let mut layer = Layer::new(self.layer_type);
        layer.utilization = self.utilization_record(0);

        for i in self.indices() {
            let mut species = SpeciesRecord::new(&self.species_names[i], self.species_indices[i]);
            species.percent = self.percentages[i];
            species.sp64_distribution = self.sp64_distributions[i].clone();
            species.site.total_age = self.age_totals[i];
            species.site.years_to_breast_height = self.years_to_breast_height[i];
            species.site.years_at_breast_height = self.years_at_breast_height[i];
            species.site.dominant_height = self.dominant_heights[i];
            species.site.site_index = self.site_indices[i];
            species.site.site_curve_number = self.site_curve_numbers[i];
            species.utilization = self.utilization_record(i);
            layer.species.push(species);
        }

        layer
    }

    /// Species slot numbers `1..=n`, the iteration basis for everything
    /// above the bank.
    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        1..=self.n_species
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }

    pub fn bec_alias(&self) -> &str {
        &self.bec_alias
    }

    fn copy_species(&mut self, slot: usize, species: &SpeciesRecord) {
        self.species_names[slot] = species.alias.clone();
        self.species_indices[slot] = species.genus_index;
        self.percentages[slot] = species.percent;
        self.sp64_distributions[slot] = species.sp64_distribution.clone();
        self.age_totals[slot] = species.site.total_age;
        self.years_to_breast_height[slot] = species.site.years_to_breast_height;
        self.years_at_breast_height[slot] = species.site.years_at_breast_height;
        self.dominant_heights[slot] = species.site.dominant_height;
        self.site_indices[slot] = species.site.site_index;
        self.site_curve_numbers[slot] = species.site.site_curve_number;
        self.copy_utilization(slot, &species.utilization);
    }

    fn copy_utilization(&mut self, slot: usize, u: &UtilizationRecord) {
        self.basal_areas[slot] = u.basal_area;
        self.trees_per_hectare[slot] = u.trees_per_hectare;
        self.quad_mean_diameters[slot] = u.quad_mean_diameter;
        self.lorey_heights[slot] = u.lorey_height;
        self.whole_stem_volumes[slot] = u.whole_stem_volume;
        self.close_util_volumes[slot] = u.close_util_volume;
        self.close_util_volumes_net_decay[slot] = u.close_util_volume_net_decay;
        self.close_util_volumes_net_decay_waste[slot] = u.close_util_volume_net_decay_waste;
    }

    fn utilization_record(&self, slot: usize) -> UtilizationRecord {
        UtilizationRecord {
            basal_area: self.basal_areas[slot],
            trees_per_hectare: self.trees_per_hectare[slot],
            quad_mean_diameter: self.quad_mean_diameters[slot],
            lorey_height: self.lorey_heights[slot],
            whole_stem_volume: self.whole_stem_volumes[slot],
            close_util_volume: self.close_util_volumes[slot],
            close_util_volume_net_decay: self.close_util_volumes_net_decay[slot],
            close_util_volume_net_decay_waste: self.close_util_volumes_net_decay_waste[slot],
        }
    }
}
