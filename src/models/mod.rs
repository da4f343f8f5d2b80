//! Domain records consumed and produced by the processing engine.

pub mod compatibility;
pub mod layer;
pub mod species;
pub mod utilization;

pub use compatibility::{CompatibilityVariables, SmallVariable, VolumeVariable};
pub use layer::{Layer, Polygon};
pub use species::{SiteInfo, Sp64Entry, SpeciesRecord, UtilizationRecord};
pub use utilization::{LayerType, UtilizationClass, UtilizationVector};
