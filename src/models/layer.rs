use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::species::{SpeciesRecord, UtilizationRecord};
use super::utilization::LayerType;

/// A vertical stratum of a forest stand: layer-level aggregate attributes
/// plus one record per species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub layer_type: LayerType,
    /// Aggregate ("all species") attributes of the layer
    pub utilization: UtilizationRecord,
    pub species: Vec<SpeciesRecord>,
}

impl Layer {
    pub fn new(layer_type: LayerType) -> Self {
        Layer {
            layer_type,
            utilization: UtilizationRecord::default(),
            species: Vec::new(),
        }
    }

    /// The species record with the given Sp0 alias, if present.
    pub fn species_by_alias(&self, alias: &str) -> Option<&SpeciesRecord> {
        self.species.iter().find(|s| s.alias == alias)
    }

    pub fn species_by_alias_mut(&mut self, alias: &str) -> Option<&mut SpeciesRecord> {
        self.species.iter_mut().find(|s| s.alias == alias)
    }
}

/// A forest polygon at a reference point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    /// Mapsheet/polygon identifier
    pub id: String,
    /// Year the supplied measurements describe
    pub reference_year: i32,
    /// Year the forward projection should stop at, when growing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_year: Option<i32>,
    /// Biogeoclimatic zone alias (e.g. "CDF")
    pub bec_alias: String,
    /// Percent of the polygon that is forested land
    pub percent_forested: f64,
    pub layers: BTreeMap<LayerType, Layer>,
}

impl Polygon {
    pub fn new(id: impl Into<String>, reference_year: i32, bec_alias: impl Into<String>) -> Self {
        Polygon {
            id: id.into(),
            reference_year,
            target_year: None,
            bec_alias: bec_alias.into(),
            percent_forested: 100.0,
            layers: BTreeMap::new(),
        }
    }

    pub fn layer(&self, layer_type: LayerType) -> Option<&Layer> {
        self.layers.get(&layer_type)
    }

    pub fn primary_layer(&self) -> Option<&Layer> {
        self.layer(LayerType::Primary)
    }
}
