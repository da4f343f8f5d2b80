use serde::{Deserialize, Serialize};

use super::compatibility::CompatibilityVariables;
use super::utilization::UtilizationVector;

/// One fine-grained species code and its share of the parent genus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sp64Entry {
    /// Fine-grained species code (e.g. "PLI")
    pub code: String,
    /// Percent of the genus this code represents
    pub percent: f64,
}

/// Optional site attributes attached to a species record.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SiteInfo {
    pub total_age: Option<f64>,
    pub years_to_breast_height: Option<f64>,
    pub years_at_breast_height: Option<f64>,
    pub dominant_height: Option<f64>,
    pub site_index: Option<f64>,
    pub site_curve_number: Option<i32>,
}

/// The per-utilization-class attributes shared by a layer aggregate and each
/// of its species.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UtilizationRecord {
    pub basal_area: UtilizationVector,
    pub trees_per_hectare: UtilizationVector,
    pub quad_mean_diameter: UtilizationVector,
    pub lorey_height: UtilizationVector,
    pub whole_stem_volume: UtilizationVector,
    pub close_util_volume: UtilizationVector,
    pub close_util_volume_net_decay: UtilizationVector,
    pub close_util_volume_net_decay_waste: UtilizationVector,
}

/// One species (genus) within a stand layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRecord {
    /// Coarse species-group alias (Sp0 code, e.g. "PL")
    pub alias: String,
    /// Numeric genus index from the input data model
    pub genus_index: usize,
    /// Percent of forested land occupied by this species
    pub percent: f64,
    /// Fine-grained (Sp64) composition of this genus
    #[serde(default)]
    pub sp64_distribution: Vec<Sp64Entry>,
    #[serde(default)]
    pub site: SiteInfo,
    pub utilization: UtilizationRecord,
    /// Attached after processing; absent on input records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<CompatibilityVariables>,
}

impl SpeciesRecord {
    /// A record with the given alias/index and zeroed attributes.
    pub fn new(alias: impl Into<String>, genus_index: usize) -> Self {
        SpeciesRecord {
            alias: alias.into(),
            genus_index,
            percent: 0.0,
            sp64_distribution: Vec::new(),
            site: SiteInfo::default(),
            utilization: UtilizationRecord::default(),
            compatibility: None,
        }
    }
}
